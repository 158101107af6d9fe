//! Carga y gestión de configuración de la aplicación (graph store + modelo).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::gnn::GnnConfig;
use crate::graphrag::ScoringSettings;
use crate::store::EdgeDedup;
use crate::trainer::{ExampleOrder, TrainingConfig, TrainingMode};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphBackend {
    Neo4j,
    Memory,
}

impl GraphBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" | "in_memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de grafo no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub graph_backend: GraphBackend,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub model_path: PathBuf,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub dropout: f32,

    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub training_mode: TrainingMode,
    pub training_order: ExampleOrder,
    pub training_seed: u64,

    pub retrieval_depth: usize,
    pub fraud_threshold: f64,
    pub alert_threshold: f64,
    pub fallback_probability: f64,
    pub edge_dedup: EdgeDedup,

    /// Nº de (usuarios, transacciones) sintéticos a sembrar al arrancar.
    pub seed_sample_data: Option<(usize, usize)>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let graph_backend =
            GraphBackend::from_str(&env::var("GRAPH_BACKEND").unwrap_or_else(|_| "neo4j".to_string()))?;

        // Las credenciales sólo son obligatorias con Neo4j.
        let (neo4j_uri, neo4j_user, neo4j_password) = if graph_backend == GraphBackend::Neo4j {
            (
                env::var("NEO4J_URI").map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                env::var("NEO4J_USER").map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            )
        } else {
            (String::new(), String::new(), String::new())
        };

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let model_path = PathBuf::from(
            env::var("MODEL_PATH")
                .unwrap_or_else(|_| "./models/fraud_detection_model.bin".to_string()),
        );

        let training_mode = TrainingMode::from_str(
            &env::var("TRAINING_MODE").unwrap_or_else(|_| "per_example".to_string()),
        )
        .map_err(|e| anyhow!("TRAINING_MODE inválido: {e}"))?;
        let training_order = ExampleOrder::from_str(
            &env::var("TRAINING_ORDER").unwrap_or_else(|_| "fixed".to_string()),
        )
        .map_err(|e| anyhow!("TRAINING_ORDER inválido: {e}"))?;
        let edge_dedup = EdgeDedup::from_str(
            &env::var("EDGE_DEDUP").unwrap_or_else(|_| "typed".to_string()),
        )
        .map_err(|e| anyhow!("EDGE_DEDUP inválido: {e}"))?;

        let seed_sample_data = match env::var("SEED_SAMPLE_DATA") {
            Ok(raw) => Some(parse_seed_counts(&raw)?),
            Err(_) => None,
        };

        let cfg = Self {
            graph_backend,
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            model_path,
            hidden_dim: var_or("GNN_HIDDEN_DIM", 64)?,
            num_layers: var_or("GNN_NUM_LAYERS", 3)?,
            dropout: var_or("GNN_DROPOUT", 0.2)?,
            learning_rate: var_or("LEARNING_RATE", 0.001)?,
            batch_size: var_or("BATCH_SIZE", 32)?,
            epochs: var_or("EPOCHS", 100)?,
            training_mode,
            training_order,
            training_seed: var_or("TRAINING_SEED", 42)?,
            retrieval_depth: var_or("RETRIEVAL_DEPTH", 2)?,
            fraud_threshold: var_or("FRAUD_THRESHOLD", 0.5)?,
            alert_threshold: var_or("ALERT_THRESHOLD", 0.7)?,
            fallback_probability: var_or("FALLBACK_PROBABILITY", 0.0)?,
            edge_dedup,
            seed_sample_data,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.retrieval_depth == 0 {
            return Err(anyhow!("RETRIEVAL_DEPTH debe ser >= 1"));
        }
        for (name, value) in [
            ("FRAUD_THRESHOLD", self.fraud_threshold),
            ("ALERT_THRESHOLD", self.alert_threshold),
            ("FALLBACK_PROBABILITY", self.fallback_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} debe estar en [0, 1], recibido {value}"));
            }
        }
        Ok(())
    }

    pub fn gnn_config(&self, input_dim: usize) -> GnnConfig {
        GnnConfig {
            input_dim,
            hidden_dim: self.hidden_dim,
            num_layers: self.num_layers,
            dropout: self.dropout,
        }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            mode: self.training_mode,
            order: self.training_order,
            seed: self.training_seed,
        }
    }

    pub fn scoring_settings(&self) -> ScoringSettings {
        ScoringSettings {
            depth: self.retrieval_depth,
            threshold: self.fraud_threshold,
            fallback_probability: self.fallback_probability,
            dedup: self.edge_dedup,
            model_path: Some(self.model_path.clone()),
        }
    }
}

/// Lee `name` del entorno y lo parsea; si no está definida usa `default`.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Valor inválido para {name} ({raw}): {e}")),
        Err(_) => Ok(default),
    }
}

/// `"usuarios,transacciones"`, p. ej. `"100,1000"`.
fn parse_seed_counts(raw: &str) -> Result<(usize, usize)> {
    let (users, transactions) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("SEED_SAMPLE_DATA debe tener el formato usuarios,transacciones"))?;
    let users = users
        .trim()
        .parse()
        .map_err(|e| anyhow!("SEED_SAMPLE_DATA: nº de usuarios inválido: {e}"))?;
    let transactions = transactions
        .trim()
        .parse()
        .map_err(|e| anyhow!("SEED_SAMPLE_DATA: nº de transacciones inválido: {e}"))?;
    Ok((users, transactions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_are_case_insensitive() {
        assert_eq!(GraphBackend::from_str("Neo4j").unwrap(), GraphBackend::Neo4j);
        assert_eq!(GraphBackend::from_str("MEMORY").unwrap(), GraphBackend::Memory);
        assert!(GraphBackend::from_str("sqlite").is_err());
    }

    #[test]
    fn seed_counts_parse() {
        assert_eq!(parse_seed_counts("10, 200").unwrap(), (10, 200));
        assert!(parse_seed_counts("10").is_err());
        assert!(parse_seed_counts("a,b").is_err());
    }

    #[test]
    fn unset_variables_take_defaults() {
        let depth: usize = var_or("FRAUD_GRAPHRAG_TEST_UNSET_VAR", 2).unwrap();
        assert_eq!(depth, 2);
    }
}
