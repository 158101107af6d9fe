//! Núcleo de detección de fraude: contexto de grafo (Graph-RAG) + GNN.

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod features;
pub mod gnn;
pub mod graphrag;
pub mod memory_store;
pub mod models;
pub mod neo4j_client;
pub mod optim;
pub mod sample_data;
pub mod store;
pub mod tensor;
pub mod trainer;

pub use error::{FraudError, FraudResult};
pub use graphrag::{GraphRag, ScoringSettings};
