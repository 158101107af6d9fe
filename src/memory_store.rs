//! Graph store en memoria.
//!
//! Replica la semántica del adaptador Neo4j (recorrido sin dirección por
//! caminos de 1..=depth saltos, escritura atómica con comprobación de
//! referencias) sobre listas de adyacencia protegidas con `tokio::sync::RwLock`.
//! Se usa en los tests y con `GRAPH_BACKEND=memory`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FraudError, FraudResult};
use crate::models::{
    DirectContext, EdgeRecord, NodeRecord, RelType, Relationship, Subgraph, Transaction, User,
};
use crate::store::{EdgeDedup, GraphStore, SubgraphCollector};

#[derive(Debug, Default)]
struct GraphData {
    /// Ordenadas por id, para listados deterministas.
    transactions: BTreeMap<String, Transaction>,
    users: HashMap<String, User>,
    edges: Vec<EdgeRecord>,
    /// id de nodo -> índices en `edges` (entrantes y salientes).
    adjacency: HashMap<String, Vec<usize>>,
}

impl GraphData {
    fn node(&self, id: &str) -> Option<NodeRecord> {
        if let Some(t) = self.transactions.get(id) {
            return Some(NodeRecord::Transaction(t.clone()));
        }
        self.users.get(id).cloned().map(NodeRecord::User)
    }

    fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id) || self.users.contains_key(id)
    }

    fn push_edge(&mut self, edge: EdgeRecord) {
        let idx = self.edges.len();
        self.adjacency.entry(edge.source.clone()).or_default().push(idx);
        if edge.target != edge.source {
            self.adjacency.entry(edge.target.clone()).or_default().push(idx);
        }
        self.edges.push(edge);
    }

    fn outgoing<'a>(&'a self, id: &str, rel: RelType) -> impl Iterator<Item = &'a EdgeRecord> + 'a {
        let source = id.to_string();
        self.adjacency
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx])
            .filter(move |e| e.source == source && e.rel_type == rel)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    data: RwLock<GraphData>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains_node(&self, id: &str) -> bool {
        self.data.read().await.contains(id)
    }

    pub async fn node_count(&self) -> usize {
        let data = self.data.read().await;
        data.transactions.len() + data.users.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.data.read().await.edges.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn fetch_subgraph(
        &self,
        root_id: &str,
        depth: usize,
        dedup: EdgeDedup,
    ) -> FraudResult<Subgraph> {
        if depth == 0 {
            return Err(FraudError::InvalidArgument(
                "La profundidad de recuperación debe ser >= 1".to_string(),
            ));
        }

        let data = self.data.read().await;
        let mut collector = SubgraphCollector::new(dedup);

        // Igual que `MATCH (start:Transaction {id: $id})`: sólo transacciones como raíz.
        let Some(root) = data.transactions.get(root_id) else {
            debug!("Raíz {root_id} desconocida: subgrafo vacío");
            return collector.finish();
        };
        collector.add_node(NodeRecord::Transaction(root.clone()));

        // Una arista está en algún camino de longitud <= depth desde la raíz
        // si y sólo si uno de sus extremos está a distancia <= depth - 1.
        let mut distance: HashMap<&str, usize> = HashMap::from([(root_id, 0)]);
        let mut queue = VecDeque::from([root_id]);

        while let Some(current) = queue.pop_front() {
            let d = distance[current];
            if d >= depth {
                continue;
            }
            for &idx in data.adjacency.get(current).into_iter().flatten() {
                let edge = &data.edges[idx];
                let other = if edge.source == current {
                    edge.target.as_str()
                } else {
                    edge.source.as_str()
                };
                if !distance.contains_key(other) {
                    distance.insert(other, d + 1);
                    queue.push_back(other);
                }
                if let Some(node) = data.node(other) {
                    collector.add_node(node);
                }
                collector.add_edge(edge.clone());
            }
        }

        collector.finish()
    }

    async fn fetch_direct_context(&self, id: &str) -> FraudResult<Option<DirectContext>> {
        let data = self.data.read().await;
        let Some(transaction) = data.transactions.get(id) else {
            return Ok(None);
        };

        let owner = data
            .outgoing(id, RelType::BelongsTo)
            .find_map(|e| data.users.get(&e.target).cloned());
        let related = data
            .outgoing(id, RelType::ConnectedTo)
            .filter_map(|e| data.transactions.get(&e.target).cloned())
            .collect();

        Ok(Some(DirectContext {
            transaction: transaction.clone(),
            owner,
            related,
        }))
    }

    async fn write_node_and_edges(
        &self,
        transaction: &Transaction,
        relationships: &[Relationship],
    ) -> FraudResult<()> {
        // El write lock cubre validación y escritura: todo o nada.
        let mut data = self.data.write().await;

        if data.contains(&transaction.id) {
            return Err(FraudError::ConstraintViolation {
                node_id: transaction.id.clone(),
            });
        }
        if let Some(missing) = relationships.iter().find(|r| !data.contains(&r.target_id)) {
            return Err(FraudError::DanglingReference {
                node_id: transaction.id.clone(),
                target_id: missing.target_id.clone(),
            });
        }

        data.transactions
            .insert(transaction.id.clone(), transaction.clone());
        for rel in relationships {
            data.push_edge(EdgeRecord::new(
                transaction.id.clone(),
                rel.target_id.clone(),
                rel.rel_type,
            ));
        }
        Ok(())
    }

    async fn upsert_user(&self, user: &User) -> FraudResult<()> {
        let mut data = self.data.write().await;
        if data.transactions.contains_key(&user.id) {
            return Err(FraudError::ConstraintViolation {
                node_id: user.id.clone(),
            });
        }
        data.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn connect_transactions(
        &self,
        source: &str,
        target: &str,
        _properties: &HashMap<String, String>,
    ) -> FraudResult<()> {
        let mut data = self.data.write().await;
        for id in [source, target] {
            if !data.transactions.contains_key(id) {
                return Err(FraudError::DanglingReference {
                    node_id: source.to_string(),
                    target_id: id.to_string(),
                });
            }
        }
        data.push_edge(EdgeRecord::new(source, target, RelType::ConnectedTo));
        Ok(())
    }

    async fn labeled_transactions(&self, limit: Option<usize>) -> FraudResult<Vec<Transaction>> {
        let data = self.data.read().await;
        Ok(data
            .transactions
            .values()
            .filter(|t| t.label.is_some())
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn user_transactions(&self, user_id: &str) -> FraudResult<Vec<Transaction>> {
        let data = self.data.read().await;
        let mut result: Vec<Transaction> = data
            .adjacency
            .get(user_id)
            .into_iter()
            .flatten()
            .map(|&idx| &data.edges[idx])
            .filter(|e| e.target == user_id && e.rel_type == RelType::BelongsTo)
            .filter_map(|e| data.transactions.get(&e.source).cloned())
            .collect();
        result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(result)
    }

    async fn high_risk_transactions(&self, threshold: f64) -> FraudResult<Vec<Transaction>> {
        let data = self.data.read().await;
        let mut result: Vec<Transaction> = data
            .transactions
            .values()
            .filter(|t| t.fraud_probability.is_some_and(|p| p >= threshold))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.fraud_probability
                .partial_cmp(&a.fraud_probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(result)
    }

    async fn set_fraud_probability(&self, id: &str, probability: f64) -> FraudResult<()> {
        let mut data = self.data.write().await;
        match data.transactions.get_mut(id) {
            Some(t) => t.fraud_probability = Some(probability),
            None => warn!("No se guarda la probabilidad: transacción {id} inexistente"),
        }
        Ok(())
    }

    async fn ping(&self) -> FraudResult<()> {
        Ok(())
    }
}
