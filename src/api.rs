use std::sync::MutexGuard;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::spawn;
use tracing::{error, info, warn};

use crate::{
    app_state::{AppState, Status},
    error::FraudError,
    gnn::GnnConfig,
    models::{ScoringResult, Transaction},
    trainer::EvaluationReport,
};

type ApiError = (StatusCode, Json<Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct PredictPayload {
    #[serde(flatten)]
    transaction: Transaction,
    /// Transacciones previas a enlazar con `CONNECTED_TO`.
    #[serde(default)]
    related: Vec<String>,
}

#[derive(Deserialize)]
pub struct ScoreParams {
    depth: Option<usize>,
    threshold: Option<f64>,
}

#[derive(Deserialize)]
pub struct AlertsParams {
    threshold: Option<f64>,
}

#[derive(Deserialize)]
pub struct TrainParams {
    epochs: Option<usize>,
}

#[derive(Serialize)]
pub struct ModelStatus {
    trained: bool,
    /// `true` mientras un entrenamiento o una recarga tienen el modelo.
    busy: bool,
    config: Option<GnnConfig>,
    evaluation: Option<EvaluationReport>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/predict", post(predict_handler))
        .route("/api/transaction/:id", get(transaction_handler))
        .route("/api/user/:id/transactions", get(user_transactions_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/train", post(train_handler))
        .route("/api/status", get(status_handler))
        .route("/api/model/status", get(model_status_handler))
        .route("/api/health", get(health_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Traduce un error del núcleo a `(status, {"error", "kind"})`.
pub fn error_response(err: FraudError) -> ApiError {
    let status = match &err {
        FraudError::DanglingReference { .. } => StatusCode::NOT_FOUND,
        FraudError::ConstraintViolation { .. } => StatusCode::CONFLICT,
        FraudError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        FraudError::TrainingDiverged { .. }
        | FraudError::Persistence(_)
        | FraudError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    if status.is_server_error() {
        error!("Error en la API: {err}");
    }
    (status, Json(json!({ "error": err.to_string(), "kind": err.kind() })))
}

fn lock_status(state: &AppState) -> MutexGuard<'_, Status> {
    state.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- Handlers ---

#[axum::debug_handler]
async fn predict_handler(
    State(state): State<AppState>,
    Json(payload): Json<PredictPayload>,
) -> Result<(StatusCode, Json<ScoringResult>), ApiError> {
    let result = state
        .rag
        .predict_and_record(&payload.transaction, &payload.related)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[axum::debug_handler]
async fn transaction_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ScoreParams>,
) -> Result<Json<ScoringResult>, ApiError> {
    let settings = state.rag.settings();
    let depth = params.depth.unwrap_or(settings.depth);
    let threshold = params.threshold.unwrap_or(settings.threshold);

    let result = state
        .rag
        .score(&id, depth, threshold)
        .await
        .map_err(error_response)?;
    if result.context.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Transacción {id} no encontrada"), "kind": "not_found" })),
        ));
    }
    Ok(Json(result))
}

#[axum::debug_handler]
async fn user_transactions_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let transactions = state
        .rag
        .store()
        .user_transactions(&user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(transactions))
}

#[axum::debug_handler]
async fn alerts_handler(
    State(state): State<AppState>,
    Query(params): Query<AlertsParams>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let threshold = params.threshold.unwrap_or(state.config.alert_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(error_response(FraudError::InvalidArgument(format!(
            "El umbral debe estar en [0, 1], recibido {threshold}"
        ))));
    }
    let alerts = state
        .rag
        .store()
        .high_risk_transactions(threshold)
        .await
        .map_err(error_response)?;
    Ok(Json(alerts))
}

/// Lanza el entrenamiento en segundo plano; el progreso se consulta en `/api/status`.
#[axum::debug_handler]
async fn train_handler(
    State(state): State<AppState>,
    Query(params): Query<TrainParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cfg = state.config.training_config();
    if let Some(epochs) = params.epochs {
        cfg.epochs = epochs;
    }

    {
        let mut status = lock_status(&state);
        if status.is_busy {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "error": "Ya hay un entrenamiento en curso.", "kind": "busy" })),
            ));
        }
        status.is_busy = true;
        status.message = format!("Entrenando ({} épocas)...", cfg.epochs);
        status.progress = 0.0;
    }

    spawn(async move {
        let result = state.rag.train(cfg).await;

        let mut status = lock_status(&state);
        status.is_busy = false;
        match result {
            Ok(report) => {
                status.progress = 1.0;
                status.message = format!(
                    "¡Entrenamiento completado! {} ejemplos, pérdida final {:.4}",
                    report.examples,
                    report.final_loss().unwrap_or(f32::NAN)
                );
            }
            Err(err) => {
                status.progress = 0.0;
                status.message = format!("Error en el entrenamiento: {err}");
                error!("Error de entrenamiento: {err}");
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(lock_status(&state).clone())
}

#[axum::debug_handler]
async fn model_status_handler(State(state): State<AppState>) -> Json<ModelStatus> {
    let trained = state.rag.model_is_trained();
    let config = state.rag.try_model_config();
    let busy = config.is_none() || lock_status(&state).is_busy;
    let evaluation = if trained && !busy {
        match state.rag.evaluate(Some(100)).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("No se pudo evaluar el modelo: {err}");
                None
            }
        }
    } else {
        None
    };
    Json(ModelStatus {
        trained,
        busy,
        config,
        evaluation,
    })
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.rag.store().ping().await.map_err(error_response)?;
    Ok(Json(json!({
        "status": "ok",
        "backend": format!("{:?}", state.config.graph_backend).to_lowercase(),
        "model_trained": state.rag.model_is_trained(),
    })))
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}
