use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{config::AppConfig, graphrag::GraphRag};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub rag: Arc<GraphRag>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, rag: GraphRag, shutdown_tx: oneshot::Sender<()>) -> Self {
        Self {
            config,
            rag: Arc::new(rag),
            status: Arc::new(Mutex::new(Status {
                is_busy: false,
                message: "Servidor listo.".to_string(),
                progress: 0.0,
            })),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
        }
    }
}

/// Estado del trabajo en segundo plano (entrenamiento).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
