//! Modelos de dominio (transacciones, usuarios y registros del grafo Neo4j).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FraudError;

/// Representa un nodo (:Transaction) en Neo4j.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub amount: f64,
    /// ISO-8601; sólo se usa para ordenar y mostrar.
    pub timestamp: String,
    pub user_id: String,
    /// Vector de features crudo, de dimensión fija.
    #[serde(default)]
    pub features: Vec<f64>,
    /// 0 = legítima, 1 = fraudulenta; ausente en tráfico en vivo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud_probability: Option<f64>,
}

/// Representa un nodo (:User) en Neo4j.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub risk_score: f64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Registro de nodo tal y como lo devuelve el graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeRecord {
    Transaction(Transaction),
    User(User),
}

impl NodeRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Transaction(t) => &t.id,
            Self::User(u) => &u.id,
        }
    }

    /// Etiqueta Neo4j del nodo.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "Transaction",
            Self::User(_) => "User",
        }
    }

    /// Atributo numérico con nombre, si el nodo lo tiene.
    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        match (self, name) {
            (Self::Transaction(t), "amount") => Some(t.amount),
            (Self::User(u), "risk_score") => Some(u.risk_score),
            _ => None,
        }
    }
}

/// Tipos de relación conocidos en el grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelType {
    /// (:Transaction)-[:BELONGS_TO]->(:User)
    BelongsTo,
    /// (:Transaction)-[:CONNECTED_TO]->(:Transaction)
    ConnectedTo,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelongsTo => "BELONGS_TO",
            Self::ConnectedTo => "CONNECTED_TO",
        }
    }
}

impl fmt::Display for RelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelType {
    type Err = FraudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BELONGS_TO" => Ok(Self::BelongsTo),
            "CONNECTED_TO" => Ok(Self::ConnectedTo),
            other => Err(FraudError::InvalidArgument(format!(
                "Tipo de relación no soportado: {other}"
            ))),
        }
    }
}

/// Arista dirigida y tipada entre dos nodos, por id de negocio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub source: String,
    pub target: String,
    pub rel_type: RelType,
}

impl EdgeRecord {
    pub fn new(source: impl Into<String>, target: impl Into<String>, rel_type: RelType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type,
        }
    }
}

/// Relación declarada al escribir una transacción nueva.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub target_id: String,
    pub rel_type: RelType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Relationship {
    pub fn belongs_to(user_id: impl Into<String>) -> Self {
        Self {
            target_id: user_id.into(),
            rel_type: RelType::BelongsTo,
            properties: BTreeMap::new(),
        }
    }

    pub fn connected_to(transaction_id: impl Into<String>) -> Self {
        Self {
            target_id: transaction_id.into(),
            rel_type: RelType::ConnectedTo,
            properties: BTreeMap::new(),
        }
    }
}

/// Resultado de una recuperación de subgrafo: nodos y aristas sin duplicados,
/// en orden de primera aparición.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(NodeRecord::id).collect()
    }
}

/// Contexto de explicación a 1 salto: propietario y transacciones conectadas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectContext {
    pub transaction: Transaction,
    pub owner: Option<User>,
    pub related: Vec<Transaction>,
}

/// Origen de la probabilidad devuelta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOrigin {
    Model,
    /// Subgrafo vacío o modelo sin entrenar.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringResult {
    pub transaction_id: String,
    pub fraud_probability: f64,
    pub is_fraudulent: bool,
    pub origin: ScoreOrigin,
    pub context: Option<DirectContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_type_round_trips_through_neo4j_names() {
        for rel in [RelType::BelongsTo, RelType::ConnectedTo] {
            assert_eq!(rel.as_str().parse::<RelType>().unwrap(), rel);
        }
        assert!("KNOWS".parse::<RelType>().is_err());
    }

    #[test]
    fn node_record_exposes_only_schema_attributes() {
        let user = NodeRecord::User(User {
            id: "U1".into(),
            risk_score: 0.4,
            created_at: "2024-01-01T00:00:00Z".into(),
            name: None,
        });
        assert_eq!(user.id(), "U1");
        assert_eq!(user.label(), "User");
        assert_eq!(user.numeric_attribute("risk_score"), Some(0.4));
        assert_eq!(user.numeric_attribute("amount"), None);
    }

    #[test]
    fn transaction_payload_accepts_missing_optional_fields() {
        let tx: Transaction = serde_json::from_str(
            r#"{"id":"T1","amount":12.5,"timestamp":"2024-01-01T00:00:00Z","user_id":"U1"}"#,
        )
        .unwrap();
        assert!(tx.features.is_empty());
        assert_eq!(tx.label, None);
    }
}
