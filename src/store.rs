//! Contrato del graph store y deduplicación compartida de subgrafos.
//!
//! Dos implementaciones:
//!   - `neo4j_client::Neo4jStore` (Cypher sobre neo4rs).
//!   - `memory_store::InMemoryGraphStore` (en proceso; tests y modo local).
//!
//! Ambas construyen el resultado con `SubgraphCollector`, de modo que la
//! semántica de deduplicación es idéntica.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{FraudError, FraudResult};
use crate::models::{
    DirectContext, EdgeRecord, NodeRecord, RelType, Relationship, Subgraph, Transaction, User,
};

/// Clave de deduplicación de aristas durante la recuperación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeDedup {
    /// (origen, destino, tipo): relaciones distintas entre el mismo par se conservan.
    #[default]
    Typed,
    /// (origen, destino): una sola arista por par; gana la primera vista.
    Pair,
}

impl FromStr for EdgeDedup {
    type Err = FraudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "typed" => Ok(Self::Typed),
            "pair" => Ok(Self::Pair),
            other => Err(FraudError::InvalidArgument(format!(
                "Modo de deduplicación no soportado: {other}"
            ))),
        }
    }
}

/// Acumula nodos y aristas en orden de primera aparición, sin duplicados.
#[derive(Debug)]
pub struct SubgraphCollector {
    dedup: EdgeDedup,
    nodes: Vec<NodeRecord>,
    seen_nodes: HashSet<String>,
    edges: Vec<EdgeRecord>,
    seen_edges: HashSet<(String, String, Option<RelType>)>,
}

impl SubgraphCollector {
    pub fn new(dedup: EdgeDedup) -> Self {
        Self {
            dedup,
            nodes: Vec::new(),
            seen_nodes: HashSet::new(),
            edges: Vec::new(),
            seen_edges: HashSet::new(),
        }
    }

    /// Devuelve `true` si el nodo no se había visto.
    pub fn add_node(&mut self, node: NodeRecord) -> bool {
        if self.seen_nodes.contains(node.id()) {
            return false;
        }
        self.seen_nodes.insert(node.id().to_string());
        self.nodes.push(node);
        true
    }

    pub fn add_edge(&mut self, edge: EdgeRecord) -> bool {
        let rel = match self.dedup {
            EdgeDedup::Typed => Some(edge.rel_type),
            EdgeDedup::Pair => None,
        };
        let key = (edge.source.clone(), edge.target.clone(), rel);
        if !self.seen_edges.insert(key) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    /// Cierra la recogida comprobando que todo extremo de arista esté en el
    /// conjunto de nodos.
    pub fn finish(self) -> FraudResult<Subgraph> {
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !self.seen_nodes.contains(endpoint) {
                    return Err(FraudError::MissingNode {
                        node_id: endpoint.clone(),
                    });
                }
            }
        }
        Ok(Subgraph {
            nodes: self.nodes,
            edges: self.edges,
        })
    }
}

/// Interfaz única que el núcleo consume del graph store externo.
///
/// Un `root_id` desconocido nunca es un error: produce un subgrafo vacío o
/// `None`. Los fallos de conectividad se devuelven como
/// `FraudError::StoreUnavailable`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Recorrido acotado (1..=depth saltos, sin dirección) desde una transacción.
    async fn fetch_subgraph(
        &self,
        root_id: &str,
        depth: usize,
        dedup: EdgeDedup,
    ) -> FraudResult<Subgraph>;

    /// Propietario y transacciones conectadas directamente (1 salto).
    async fn fetch_direct_context(&self, id: &str) -> FraudResult<Option<DirectContext>>;

    /// Escribe la transacción y sus relaciones de forma atómica.
    async fn write_node_and_edges(
        &self,
        transaction: &Transaction,
        relationships: &[Relationship],
    ) -> FraudResult<()>;

    async fn upsert_user(&self, user: &User) -> FraudResult<()>;

    /// Añade `(source)-[:CONNECTED_TO]->(target)` entre transacciones existentes.
    async fn connect_transactions(
        &self,
        source: &str,
        target: &str,
        properties: &HashMap<String, String>,
    ) -> FraudResult<()>;

    /// Transacciones con etiqueta, ordenadas por id ascendente en todos los
    /// backends; `limit` toma las primeras de ese orden.
    async fn labeled_transactions(&self, limit: Option<usize>) -> FraudResult<Vec<Transaction>>;

    /// Transacciones del usuario, de la más reciente a la más antigua.
    async fn user_transactions(&self, user_id: &str) -> FraudResult<Vec<Transaction>>;

    /// Transacciones con `fraud_probability >= threshold`, en orden descendente.
    async fn high_risk_transactions(&self, threshold: f64) -> FraudResult<Vec<Transaction>>;

    async fn set_fraud_probability(&self, id: &str, probability: f64) -> FraudResult<()>;

    async fn ping(&self) -> FraudResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn user(id: &str) -> NodeRecord {
        NodeRecord::User(User {
            id: id.into(),
            risk_score: 0.1,
            created_at: String::new(),
            name: None,
        })
    }

    #[test]
    fn collector_keeps_first_seen_order() {
        let mut c = SubgraphCollector::new(EdgeDedup::Typed);
        assert!(c.add_node(user("B")));
        assert!(c.add_node(user("A")));
        assert!(!c.add_node(user("B")));
        let sg = c.finish().unwrap();
        assert_eq!(sg.node_ids(), vec!["B", "A"]);
    }

    #[test]
    fn typed_dedup_keeps_parallel_relationships() {
        let mut c = SubgraphCollector::new(EdgeDedup::Typed);
        c.add_node(user("A"));
        c.add_node(user("B"));
        assert!(c.add_edge(EdgeRecord::new("A", "B", RelType::BelongsTo)));
        assert!(c.add_edge(EdgeRecord::new("A", "B", RelType::ConnectedTo)));
        assert!(!c.add_edge(EdgeRecord::new("A", "B", RelType::BelongsTo)));
        assert_eq!(c.finish().unwrap().edges.len(), 2);
    }

    #[test]
    fn pair_dedup_collapses_to_first_relationship() {
        let mut c = SubgraphCollector::new(EdgeDedup::Pair);
        c.add_node(user("A"));
        c.add_node(user("B"));
        c.add_edge(EdgeRecord::new("A", "B", RelType::BelongsTo));
        assert!(!c.add_edge(EdgeRecord::new("A", "B", RelType::ConnectedTo)));
        let sg = c.finish().unwrap();
        assert_eq!(sg.edges, vec![EdgeRecord::new("A", "B", RelType::BelongsTo)]);
    }

    #[test]
    fn finish_rejects_edges_with_unknown_endpoints() {
        let mut c = SubgraphCollector::new(EdgeDedup::Typed);
        c.add_node(user("A"));
        c.add_edge(EdgeRecord::new("A", "Z", RelType::ConnectedTo));
        assert!(matches!(
            c.finish(),
            Err(FraudError::MissingNode { node_id }) if node_id == "Z"
        ));
    }

    #[test]
    fn edge_dedup_parses_config_values() {
        assert_eq!("TYPED".parse::<EdgeDedup>().unwrap(), EdgeDedup::Typed);
        assert_eq!("pair".parse::<EdgeDedup>().unwrap(), EdgeDedup::Pair);
        assert!("none".parse::<EdgeDedup>().is_err());
    }
}
