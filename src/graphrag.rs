//! Orquestador GraphRAG: recupera el vecindario de una transacción, lo
//! convierte en tensor, lo puntúa con la GNN y adjunta el contexto directo
//! que sirve de explicación.
//!
//! Flujo de `score`:
//!   1. `fetch_subgraph` desde la transacción raíz (1..=depth saltos).
//!   2. Construcción del `GraphTensor` con el extractor de features.
//!   3. Forward de la GNN bajo el read lock del modelo.
//!   4. Consulta del contexto directo (usuario dueño + transacciones conectadas).
//!
//! El modelo vive en un `Arc<RwLock<FraudGnn>>`: muchas puntuaciones
//! concurrentes, un único entrenamiento o recarga a la vez. El estado
//! "entrenado" se replica en un `AtomicBool` para consultarlo sin esperar
//! al lock mientras se entrena.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{FraudError, FraudResult};
use crate::features::FeatureExtractor;
use crate::gnn::{FraudGnn, GnnConfig};
use crate::models::{DirectContext, Relationship, ScoreOrigin, ScoringResult, Subgraph, Transaction};
use crate::store::{EdgeDedup, GraphStore};
use crate::tensor::GraphTensor;
use crate::trainer::{self, EvaluationReport, TrainingConfig, TrainingReport};

/// Parámetros de recuperación y decisión por defecto.
#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub depth: usize,
    pub threshold: f64,
    /// Probabilidad devuelta cuando no hay subgrafo o el modelo no está entrenado.
    pub fallback_probability: f64,
    pub dedup: EdgeDedup,
    /// Destino de los pesos tras un entrenamiento correcto (`None` = no guardar).
    pub model_path: Option<PathBuf>,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            depth: 2,
            threshold: 0.5,
            fallback_probability: 0.0,
            dedup: EdgeDedup::Typed,
            model_path: None,
        }
    }
}

pub struct GraphRag {
    store: Arc<dyn GraphStore>,
    model: Arc<RwLock<FraudGnn>>,
    trained: Arc<AtomicBool>,
    extractor: FeatureExtractor,
    settings: ScoringSettings,
}

impl GraphRag {
    pub fn new(
        store: Arc<dyn GraphStore>,
        model: FraudGnn,
        extractor: FeatureExtractor,
        settings: ScoringSettings,
    ) -> FraudResult<Self> {
        check_input_dim(&model, &extractor)?;
        Ok(Self {
            store,
            trained: Arc::new(AtomicBool::new(model.is_trained())),
            model: Arc::new(RwLock::new(model)),
            extractor,
            settings,
        })
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn settings(&self) -> &ScoringSettings {
        &self.settings
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// No espera al lock del modelo.
    pub fn model_is_trained(&self) -> bool {
        self.trained.load(Ordering::Acquire)
    }

    /// Configuración del modelo activo, o `None` si hay un entrenamiento o
    /// una recarga en curso.
    pub fn try_model_config(&self) -> Option<GnnConfig> {
        self.model.try_read().ok().map(|model| model.config().clone())
    }

    /// Subgrafo alrededor de `root_id`. Raíz desconocida => subgrafo vacío.
    pub async fn retrieve_context(&self, root_id: &str, depth: usize) -> FraudResult<Subgraph> {
        if depth == 0 {
            return Err(FraudError::InvalidArgument(
                "La profundidad de recuperación debe ser >= 1".to_string(),
            ));
        }
        let subgraph = self
            .store
            .fetch_subgraph(root_id, depth, self.settings.dedup)
            .await?;
        debug!(
            "Subgrafo de {root_id} (depth={depth}): {} nodos, {} aristas",
            subgraph.nodes.len(),
            subgraph.edges.len()
        );
        Ok(subgraph)
    }

    pub fn build_tensor(&self, subgraph: &Subgraph, labels: Option<&[f32]>) -> FraudResult<GraphTensor> {
        GraphTensor::build(&self.extractor, &subgraph.nodes, &subgraph.edges, labels)
    }

    /// Puntuación con los parámetros por defecto de la configuración.
    pub async fn predict_fraud(&self, transaction_id: &str) -> FraudResult<ScoringResult> {
        self.score(transaction_id, self.settings.depth, self.settings.threshold)
            .await
    }

    pub async fn score(
        &self,
        transaction_id: &str,
        depth: usize,
        threshold: f64,
    ) -> FraudResult<ScoringResult> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FraudError::InvalidArgument(format!(
                "El umbral debe estar en [0, 1], recibido {threshold}"
            )));
        }

        let subgraph = self.retrieve_context(transaction_id, depth).await?;
        if subgraph.is_empty() {
            warn!("Sin subgrafo para {transaction_id}: se devuelve la puntuación de respaldo");
            return Ok(self.fallback(transaction_id, threshold, None));
        }

        let tensor = self.build_tensor(&subgraph, None)?;
        let probability = {
            let model = self.model.read().await;
            if model.is_trained() {
                let (p, _) = model.predict(&tensor, threshold as f32)?;
                Some(f64::from(p))
            } else {
                None
            }
        };

        let context = self.store.fetch_direct_context(transaction_id).await?;
        let Some(probability) = probability else {
            warn!("Modelo sin entrenar: puntuación de respaldo para {transaction_id}");
            return Ok(self.fallback(transaction_id, threshold, context));
        };

        info!("Transacción {transaction_id}: probabilidad de fraude {probability:.4}");
        Ok(ScoringResult {
            transaction_id: transaction_id.to_string(),
            fraud_probability: probability,
            is_fraudulent: probability > threshold,
            origin: ScoreOrigin::Model,
            context,
        })
    }

    fn fallback(
        &self,
        transaction_id: &str,
        threshold: f64,
        context: Option<DirectContext>,
    ) -> ScoringResult {
        let probability = self.settings.fallback_probability;
        ScoringResult {
            transaction_id: transaction_id.to_string(),
            fraud_probability: probability,
            is_fraudulent: probability > threshold,
            origin: ScoreOrigin::Fallback,
            context,
        }
    }

    /// Escribe la transacción y sus relaciones de forma atómica. Una
    /// transacción sin vector de features válido no llega al store.
    pub async fn update_graph(
        &self,
        transaction: &Transaction,
        relationships: &[Relationship],
    ) -> FraudResult<()> {
        self.extractor.check_transaction(transaction)?;
        self.store
            .write_node_and_edges(transaction, relationships)
            .await?;
        info!(
            "Transacción {} añadida con {} relaciones",
            transaction.id,
            relationships.len()
        );
        Ok(())
    }

    /// Alta de una transacción nueva (con su `BELONGS_TO` al usuario dueño),
    /// puntuación inmediata y registro de la probabilidad si la dio el modelo.
    pub async fn predict_and_record(
        &self,
        transaction: &Transaction,
        related: &[String],
    ) -> FraudResult<ScoringResult> {
        let mut relationships = vec![Relationship::belongs_to(transaction.user_id.clone())];
        for id in related {
            if id != &transaction.id {
                relationships.push(Relationship::connected_to(id.clone()));
            }
        }
        self.update_graph(transaction, &relationships).await?;

        let result = self.predict_fraud(&transaction.id).await?;
        if result.origin == ScoreOrigin::Model {
            self.store
                .set_fraud_probability(&transaction.id, result.fraud_probability)
                .await?;
        }
        Ok(result)
    }

    /// Un ejemplo por transacción etiquetada: su subgrafo con la etiqueta
    /// de la raíz como etiqueta de grafo.
    pub async fn build_training_set(&self, limit: Option<usize>) -> FraudResult<Vec<GraphTensor>> {
        let labeled = self.store.labeled_transactions(limit).await?;
        let mut examples = Vec::with_capacity(labeled.len());
        for transaction in labeled {
            let Some(label) = transaction.label else { continue };
            let subgraph = self
                .retrieve_context(&transaction.id, self.settings.depth)
                .await?;
            if subgraph.is_empty() {
                continue;
            }
            examples.push(self.build_tensor(&subgraph, None)?.with_graph_label(f32::from(label)));
        }
        info!("Conjunto de entrenamiento: {} ejemplos", examples.len());
        Ok(examples)
    }

    /// Entrena sobre las transacciones etiquetadas del store.
    ///
    /// Mantiene el write lock del modelo durante todo el entrenamiento; las
    /// puntuaciones concurrentes esperan y ven el modelo anterior o el nuevo,
    /// nunca uno a medias. Si hay `model_path`, guarda los pesos al terminar.
    pub async fn train(&self, cfg: TrainingConfig) -> FraudResult<TrainingReport> {
        let examples = self.build_training_set(None).await?;
        let mut model = self.model.clone().write_owned().await;
        let model_path = self.settings.model_path.clone();
        let trained = self.trained.clone();

        tokio::task::spawn_blocking(move || -> FraudResult<TrainingReport> {
            let result = trainer::train(&mut model, &examples, &cfg);
            trained.store(model.is_trained(), Ordering::Release);
            let report = result?;
            if let Some(path) = model_path {
                model.save(&path)?;
            }
            Ok(report)
        })
        .await
        .map_err(|e| FraudError::Internal(e.to_string()))?
    }

    pub async fn evaluate(&self, limit: Option<usize>) -> FraudResult<EvaluationReport> {
        let examples = self.build_training_set(limit).await?;
        let model = self.model.clone().read_owned().await;
        tokio::task::spawn_blocking(move || trainer::evaluate(&model, &examples))
            .await
            .map_err(|e| FraudError::Internal(e.to_string()))?
    }

    pub async fn save_model(&self, path: &Path) -> FraudResult<()> {
        self.model.read().await.save(path)
    }

    /// Sustituye el modelo activo por el guardado en `path`.
    pub async fn load_model(&self, path: &Path) -> FraudResult<()> {
        let loaded = FraudGnn::load(path)?;
        check_input_dim(&loaded, &self.extractor)?;
        let mut model = self.model.write().await;
        self.trained.store(loaded.is_trained(), Ordering::Release);
        *model = loaded;
        Ok(())
    }
}

fn check_input_dim(model: &FraudGnn, extractor: &FeatureExtractor) -> FraudResult<()> {
    if model.config().input_dim != extractor.dim() {
        return Err(FraudError::DimensionMismatch {
            expected: model.config().input_dim,
            found: extractor.dim(),
        });
    }
    Ok(())
}
