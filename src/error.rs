//! Taxonomía de errores del núcleo de scoring.
//!
//! Cada variante lleva el identificador de la entidad implicada para que la
//! capa de orquestación pueda traducirla a una respuesta útil.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FraudError {
    // --- Validación ---
    #[error("El nodo {node_id} produce {found} features, se esperaban {expected}")]
    FeatureLength {
        node_id: String,
        expected: usize,
        found: usize,
    },

    #[error("Una arista referencia el nodo {node_id}, ausente del subgrafo")]
    MissingNode { node_id: String },

    #[error("Se recibieron {labels} etiquetas para {nodes} nodos")]
    LabelMismatch { labels: usize, nodes: usize },

    #[error("Dimensión de entrada {found} incompatible con el modelo ({expected})")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("El conjunto de ejemplos está vacío")]
    EmptyDataset,

    #[error("Argumento inválido: {0}")]
    InvalidArgument(String),

    // --- Transporte ---
    #[error("Graph store no disponible: {0}")]
    StoreUnavailable(String),

    // --- Restricciones ---
    #[error("La relación desde {node_id} apunta a {target_id}, que no existe")]
    DanglingReference { node_id: String, target_id: String },

    #[error("Ya existe un nodo con id {node_id}")]
    ConstraintViolation { node_id: String },

    // --- Entrenamiento ---
    #[error("Pérdida no finita en la época {epoch}, ejemplo {example}")]
    TrainingDiverged { epoch: usize, example: usize },

    // --- Persistencia del modelo ---
    #[error("Error de persistencia del modelo: {0}")]
    Persistence(String),

    #[error("Error interno: {0}")]
    Internal(String),
}

pub type FraudResult<T> = Result<T, FraudError>;

impl FraudError {
    /// Etiqueta estable del tipo de error (se expone en la API).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FeatureLength { .. }
            | Self::MissingNode { .. }
            | Self::LabelMismatch { .. }
            | Self::DimensionMismatch { .. }
            | Self::EmptyDataset
            | Self::InvalidArgument(_) => "validation",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DanglingReference { .. } => "dangling_reference",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::TrainingDiverged { .. } => "training_diverged",
            Self::Persistence(_) => "persistence",
            Self::Internal(_) => "internal",
        }
    }

    /// Sólo los fallos de transporte pueden reintentarse tal cual; el núcleo
    /// nunca reintenta por su cuenta.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<neo4rs::Error> for FraudError {
    fn from(err: neo4rs::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for FraudError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<bincode::Error> for FraudError {
    fn from(err: bincode::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
