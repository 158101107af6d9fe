//! Adaptador Neo4j del graph store.
//!
//! Esquema:
//!   (:Transaction {id, amount, timestamp, user_id, features, label?, fraud_probability?})
//!   (:User {id, risk_score, created_at, name?})
//!   (:Transaction)-[:BELONGS_TO]->(:User)
//!   (:Transaction)-[:CONNECTED_TO]->(:Transaction)

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{query, Graph, Node, Query, Txn};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{FraudError, FraudResult};
use crate::models::{
    DirectContext, EdgeRecord, NodeRecord, Relationship, Subgraph, Transaction, User,
};
use crate::store::{EdgeDedup, GraphStore, SubgraphCollector};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea los constraints de unicidad de :Transaction y :User.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT transaction_id IF NOT EXISTS
         FOR (t:Transaction)
         REQUIRE t.id IS UNIQUE",
        "CREATE CONSTRAINT user_id IF NOT EXISTS
         FOR (u:User)
         REQUIRE u.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints de unicidad).");
    Ok(())
}

pub struct Neo4jStore {
    graph: Arc<Graph>,
}

impl Neo4jStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
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

        // La longitud de un patrón variable no admite parámetros.
        let cypher = format!(
            "MATCH (start:Transaction {{id: $id}})
             OPTIONAL MATCH path = (start)-[:BELONGS_TO|CONNECTED_TO*1..{depth}]-()
             RETURN start,
                    CASE WHEN path IS NULL THEN [] ELSE nodes(path) END AS path_nodes,
                    CASE WHEN path IS NULL THEN []
                         ELSE [r IN relationships(path) | [startNode(r).id, endNode(r).id, type(r)]]
                    END AS path_rels"
        );
        let mut rows = self
            .graph
            .execute(query(&cypher).param("id", root_id))
            .await?;

        let mut collector = SubgraphCollector::new(dedup);
        let mut paths = 0usize;
        while let Some(row) = rows.next().await? {
            if let Some(start) = row.get::<Node>("start") {
                add_node(&mut collector, &start);
            }
            for node in row.get::<Vec<Node>>("path_nodes").unwrap_or_default() {
                add_node(&mut collector, &node);
            }
            for triple in row.get::<Vec<Vec<String>>>("path_rels").unwrap_or_default() {
                let [source, target, rel_type] = triple.as_slice() else {
                    warn!("Relación con formato inesperado en el subgrafo de {root_id}");
                    continue;
                };
                collector.add_edge(EdgeRecord::new(
                    source.clone(),
                    target.clone(),
                    rel_type.parse()?,
                ));
            }
            paths += 1;
        }
        debug!("fetch_subgraph({root_id}, {depth}): {paths} filas");
        collector.finish()
    }

    async fn fetch_direct_context(&self, id: &str) -> FraudResult<Option<DirectContext>> {
        let q = query(
            "MATCH (t:Transaction {id: $id})
             OPTIONAL MATCH (t)-[:BELONGS_TO]->(u:User)
             OPTIONAL MATCH (t)-[:CONNECTED_TO]->(r:Transaction)
             RETURN t, collect(DISTINCT u) AS owners, collect(DISTINCT r) AS related",
        )
        .param("id", id);
        let mut rows = self.graph.execute(q).await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let Some(transaction) = row.get::<Node>("t").and_then(|n| node_to_transaction(&n)) else {
            return Ok(None);
        };
        let owner = row
            .get::<Vec<Node>>("owners")
            .unwrap_or_default()
            .iter()
            .find_map(node_to_user);
        let related = row
            .get::<Vec<Node>>("related")
            .unwrap_or_default()
            .iter()
            .filter_map(node_to_transaction)
            .collect();

        Ok(Some(DirectContext {
            transaction,
            owner,
            related,
        }))
    }

    async fn write_node_and_edges(
        &self,
        transaction: &Transaction,
        relationships: &[Relationship],
    ) -> FraudResult<()> {
        let tx = self.graph.start_txn().await?;
        match write_in_txn(&tx, transaction, relationships).await {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| map_write_error(e, &transaction.id)),
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback fallido para {}: {rollback}", transaction.id);
                }
                Err(err)
            }
        }
    }

    async fn upsert_user(&self, user: &User) -> FraudResult<()> {
        let name_clause = if user.name.is_some() { ", u.name = $name" } else { "" };
        let cypher = format!(
            "MERGE (u:User {{id: $id}})
             SET u.risk_score = $risk_score, u.created_at = $created_at{name_clause}"
        );
        let mut q = query(&cypher)
            .param("id", user.id.as_str())
            .param("risk_score", user.risk_score)
            .param("created_at", user.created_at.as_str());
        if let Some(name) = &user.name {
            q = q.param("name", name.as_str());
        }
        self.graph.run(q).await?;
        Ok(())
    }

    async fn connect_transactions(
        &self,
        source: &str,
        target: &str,
        properties: &HashMap<String, String>,
    ) -> FraudResult<()> {
        let props: BTreeMap<String, String> = properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let set_clause = property_set_clause("r", &props)?;
        let cypher = format!(
            "MATCH (a:Transaction {{id: $source}}), (b:Transaction {{id: $target}})
             CREATE (a)-[r:CONNECTED_TO]->(b)
             {set_clause}
             RETURN count(r) AS created"
        );
        let q = bind_properties(
            query(&cypher).param("source", source).param("target", target),
            &props,
        );
        let mut rows = self.graph.execute(q).await?;
        let created = match rows.next().await? {
            Some(row) => row.get::<i64>("created").unwrap_or(0),
            None => 0,
        };
        if created == 0 {
            // Alguno de los extremos no existe: averiguar cuál.
            let missing = if self.transaction_exists(source).await? {
                target
            } else {
                source
            };
            return Err(FraudError::DanglingReference {
                node_id: source.to_string(),
                target_id: missing.to_string(),
            });
        }
        Ok(())
    }

    async fn labeled_transactions(&self, limit: Option<usize>) -> FraudResult<Vec<Transaction>> {
        let limit_clause = limit.map(|n| format!("LIMIT {n}")).unwrap_or_default();
        let cypher = format!(
            "MATCH (t:Transaction)
             WHERE t.label IS NOT NULL
             RETURN t
             ORDER BY t.id
             {limit_clause}"
        );
        self.collect_transactions(query(&cypher)).await
    }

    async fn user_transactions(&self, user_id: &str) -> FraudResult<Vec<Transaction>> {
        let q = query(
            "MATCH (t:Transaction)-[:BELONGS_TO]->(u:User {id: $user_id})
             RETURN t
             ORDER BY t.timestamp DESC",
        )
        .param("user_id", user_id);
        self.collect_transactions(q).await
    }

    async fn high_risk_transactions(&self, threshold: f64) -> FraudResult<Vec<Transaction>> {
        let q = query(
            "MATCH (t:Transaction)
             WHERE t.fraud_probability >= $threshold
             RETURN t
             ORDER BY t.fraud_probability DESC, t.id",
        )
        .param("threshold", threshold);
        self.collect_transactions(q).await
    }

    async fn set_fraud_probability(&self, id: &str, probability: f64) -> FraudResult<()> {
        let q = query(
            "MATCH (t:Transaction {id: $id})
             SET t.fraud_probability = $probability
             RETURN count(t) AS updated",
        )
        .param("id", id)
        .param("probability", probability);
        let mut rows = self.graph.execute(q).await?;
        let updated = match rows.next().await? {
            Some(row) => row.get::<i64>("updated").unwrap_or(0),
            None => 0,
        };
        if updated == 0 {
            warn!("No se guarda la probabilidad: transacción {id} inexistente");
        }
        Ok(())
    }

    async fn ping(&self) -> FraudResult<()> {
        self.graph.run(query("RETURN 1")).await?;
        Ok(())
    }
}

impl Neo4jStore {
    async fn collect_transactions(&self, q: Query) -> FraudResult<Vec<Transaction>> {
        let mut rows = self.graph.execute(q).await?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            if let Some(t) = row.get::<Node>("t").and_then(|n| node_to_transaction(&n)) {
                result.push(t);
            }
        }
        Ok(result)
    }

    async fn transaction_exists(&self, id: &str) -> FraudResult<bool> {
        let q = query("MATCH (t:Transaction {id: $id}) RETURN count(t) AS c").param("id", id);
        let mut rows = self.graph.execute(q).await?;
        let mut count = 0;
        while let Some(row) = rows.next().await? {
            count += row.get::<i64>("c").unwrap_or(0);
        }
        Ok(count > 0)
    }
}

/// Comprobaciones y escrituras dentro de la transacción abierta. Cualquier
/// error deja la decisión de rollback al llamador.
async fn write_in_txn(
    tx: &Txn,
    transaction: &Transaction,
    relationships: &[Relationship],
) -> FraudResult<()> {
    let id = transaction.id.as_str();

    let mut rows = tx
        .execute(query("MATCH (n) WHERE n.id = $id RETURN count(n) AS c").param("id", id))
        .await?;
    let mut existing = 0;
    while let Some(row) = rows.next().await? {
        existing += row.get::<i64>("c").unwrap_or(0);
    }
    if existing > 0 {
        return Err(FraudError::ConstraintViolation {
            node_id: id.to_string(),
        });
    }

    if !relationships.is_empty() {
        let targets: Vec<String> = relationships.iter().map(|r| r.target_id.clone()).collect();
        let mut rows = tx
            .execute(
                query(
                    "UNWIND $targets AS target_id
                     OPTIONAL MATCH (n) WHERE n.id = target_id
                     WITH target_id, count(n) AS c
                     WHERE c = 0
                     RETURN target_id",
                )
                .param("targets", targets),
            )
            .await?;
        let mut missing = Vec::new();
        while let Some(row) = rows.next().await? {
            if let Some(target) = row.get::<String>("target_id") {
                missing.push(target);
            }
        }
        if let Some(target_id) = missing.into_iter().next() {
            return Err(FraudError::DanglingReference {
                node_id: id.to_string(),
                target_id,
            });
        }
    }

    tx.run(
        query(
            "CREATE (t:Transaction {
                id: $id, amount: $amount, timestamp: $timestamp,
                user_id: $user_id, features: $features
             })",
        )
        .param("id", id)
        .param("amount", transaction.amount)
        .param("timestamp", transaction.timestamp.as_str())
        .param("user_id", transaction.user_id.as_str())
        .param("features", transaction.features.clone()),
    )
    .await?;
    if let Some(label) = transaction.label {
        tx.run(
            query("MATCH (t:Transaction {id: $id}) SET t.label = $label")
                .param("id", id)
                .param("label", i64::from(label)),
        )
        .await?;
    }
    if let Some(probability) = transaction.fraud_probability {
        tx.run(
            query("MATCH (t:Transaction {id: $id}) SET t.fraud_probability = $p")
                .param("id", id)
                .param("p", probability),
        )
        .await?;
    }

    for rel in relationships {
        // El tipo sale de `RelType`, nunca de la entrada del usuario.
        let set_clause = property_set_clause("r", &rel.properties)?;
        let cypher = format!(
            "MATCH (t:Transaction {{id: $id}}), (target {{id: $target}})
             CREATE (t)-[r:{rel_type}]->(target)
             {set_clause}",
            rel_type = rel.rel_type.as_str(),
        );
        let q = bind_properties(
            query(&cypher).param("id", id).param("target", rel.target_id.as_str()),
            &rel.properties,
        );
        tx.run(q).await?;
    }
    Ok(())
}

/// `SET r.`k0` = $p0, ...` para propiedades de relación arbitrarias.
fn property_set_clause(var: &str, props: &BTreeMap<String, String>) -> FraudResult<String> {
    if props.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(props.len());
    for (i, key) in props.keys().enumerate() {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(FraudError::InvalidArgument(format!(
                "Nombre de propiedad no válido: {key:?}"
            )));
        }
        parts.push(format!("{var}.`{key}` = $prop_{i}"));
    }
    Ok(format!("SET {}", parts.join(", ")))
}

fn bind_properties(mut q: Query, props: &BTreeMap<String, String>) -> Query {
    for (i, value) in props.values().enumerate() {
        q = q.param(&format!("prop_{i}"), value.as_str());
    }
    q
}

fn map_write_error(err: neo4rs::Error, id: &str) -> FraudError {
    if err.to_string().contains("ConstraintValidationFailed") {
        FraudError::ConstraintViolation {
            node_id: id.to_string(),
        }
    } else {
        FraudError::from(err)
    }
}

fn add_node(collector: &mut SubgraphCollector, node: &Node) {
    match node_to_record(node) {
        Some(record) => {
            collector.add_node(record);
        }
        None => warn!("Nodo fuera del esquema (labels {:?}), se ignora", node.labels()),
    }
}

fn node_to_record(node: &Node) -> Option<NodeRecord> {
    let labels = node.labels();
    if labels.iter().any(|l| l == "Transaction") {
        node_to_transaction(node).map(NodeRecord::Transaction)
    } else if labels.iter().any(|l| l == "User") {
        node_to_user(node).map(NodeRecord::User)
    } else {
        None
    }
}

fn node_to_transaction(node: &Node) -> Option<Transaction> {
    Some(Transaction {
        id: node.get::<String>("id")?,
        amount: number(node, "amount").unwrap_or(0.0),
        timestamp: node.get::<String>("timestamp").unwrap_or_default(),
        user_id: node.get::<String>("user_id").unwrap_or_default(),
        features: node.get::<Vec<f64>>("features").unwrap_or_default(),
        label: node
            .get::<i64>("label")
            .and_then(|l| u8::try_from(l).ok())
            .filter(|l| *l <= 1),
        fraud_probability: number(node, "fraud_probability"),
    })
}

fn node_to_user(node: &Node) -> Option<User> {
    Some(User {
        id: node.get::<String>("id")?,
        risk_score: number(node, "risk_score").unwrap_or(0.0),
        created_at: node.get::<String>("created_at").unwrap_or_default(),
        name: node.get::<String>("name"),
    })
}

/// Neo4j puede devolver enteros donde esperamos flotantes.
fn number(node: &Node, key: &str) -> Option<f64> {
    node.get::<f64>(key)
        .or_else(|| node.get::<i64>(key).map(|v| v as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clause_numbers_parameters_in_key_order() {
        let props = BTreeMap::from([
            ("timestamp".to_string(), "2024".to_string()),
            ("channel".to_string(), "web".to_string()),
        ]);
        assert_eq!(
            property_set_clause("r", &props).unwrap(),
            "SET r.`channel` = $prop_0, r.`timestamp` = $prop_1"
        );
        assert_eq!(property_set_clause("r", &BTreeMap::new()).unwrap(), "");
    }

    #[test]
    fn unsafe_property_names_are_rejected() {
        let props = BTreeMap::from([("x` = 1 DETACH DELETE r //".to_string(), "v".to_string())]);
        assert!(matches!(
            property_set_clause("r", &props),
            Err(FraudError::InvalidArgument(_))
        ));
    }
}
