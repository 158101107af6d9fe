use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fraud_graphrag::{
    api,
    app_state::AppState,
    config::{AppConfig, GraphBackend},
    features::FeatureExtractor,
    gnn::FraudGnn,
    graphrag::GraphRag,
    memory_store::InMemoryGraphStore,
    neo4j_client::{self, Neo4jStore},
    sample_data,
    store::GraphStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Graph store (Neo4j o memoria)
    let store: Arc<dyn GraphStore> = match cfg.graph_backend {
        GraphBackend::Neo4j => {
            let graph = neo4j_client::connect_from_config(&cfg)
                .await
                .context("Error conectando a Neo4j")?;
            neo4j_client::ensure_schema(&graph)
                .await
                .context("Error asegurando el esquema de Neo4j")?;
            Arc::new(Neo4jStore::new(Arc::new(graph)))
        }
        GraphBackend::Memory => {
            info!("Usando el graph store en memoria");
            Arc::new(InMemoryGraphStore::new())
        }
    };

    if let Some((users, transactions)) = cfg.seed_sample_data {
        let mut rng = StdRng::seed_from_u64(cfg.training_seed);
        sample_data::seed(store.as_ref(), users, transactions, &mut rng)
            .await
            .context("Error sembrando datos de ejemplo")?;
    }

    // 4. Modelo: pesos guardados si existen, si no uno nuevo sin entrenar
    let extractor = FeatureExtractor::default();
    let model = if cfg.model_path.exists() {
        FraudGnn::load(&cfg.model_path)
            .with_context(|| format!("Error cargando {}", cfg.model_path.display()))?
    } else {
        warn!(
            "No existe {}: el modelo arranca sin entrenar (puntuaciones de respaldo)",
            cfg.model_path.display()
        );
        FraudGnn::new(cfg.gnn_config(extractor.dim()), cfg.training_seed)?
    };
    let rag = GraphRag::new(store, model, extractor, cfg.scoring_settings())?;

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Estado compartido y router
    let app_state = AppState::new(cfg.clone(), rag, shutdown_tx);
    let app = Router::new()
        .merge(api::create_router(app_state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
