//! Escenarios de extremo a extremo sobre el store en memoria.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use rand::rngs::StdRng;
use rand::SeedableRng;

use fraud_graphrag::api::error_response;
use fraud_graphrag::features::FeatureExtractor;
use fraud_graphrag::gnn::{FraudGnn, GnnConfig};
use fraud_graphrag::memory_store::InMemoryGraphStore;
use fraud_graphrag::models::{
    DirectContext, Relationship, ScoreOrigin, Subgraph, Transaction, User,
};
use fraud_graphrag::sample_data;
use fraud_graphrag::store::{EdgeDedup, GraphStore};
use fraud_graphrag::trainer::TrainingConfig;
use fraud_graphrag::{FraudError, FraudResult, GraphRag, ScoringSettings};

fn config() -> GnnConfig {
    GnnConfig {
        input_dim: 6,
        hidden_dim: 8,
        num_layers: 2,
        dropout: 0.1,
    }
}

fn transaction(id: &str, user_id: &str) -> Transaction {
    Transaction {
        id: id.into(),
        amount: 250.0,
        timestamp: "2024-03-01T12:00:00Z".into(),
        user_id: user_id.into(),
        features: vec![0.025, 0.5, 0.3, 0.2, 0.1, 0.4],
        label: None,
        fraud_probability: None,
    }
}

fn user(id: &str) -> User {
    User {
        id: id.into(),
        risk_score: 0.4,
        created_at: "2023-01-01T00:00:00Z".into(),
        name: None,
    }
}

/// Store cuyo backend no responde: toda operación falla con `StoreUnavailable`.
struct UnreachableStore;

fn refused<T>() -> FraudResult<T> {
    Err(FraudError::StoreUnavailable("connection refused".into()))
}

#[async_trait]
impl GraphStore for UnreachableStore {
    async fn fetch_subgraph(&self, _: &str, _: usize, _: EdgeDedup) -> FraudResult<Subgraph> {
        refused()
    }

    async fn fetch_direct_context(&self, _: &str) -> FraudResult<Option<DirectContext>> {
        refused()
    }

    async fn write_node_and_edges(&self, _: &Transaction, _: &[Relationship]) -> FraudResult<()> {
        refused()
    }

    async fn upsert_user(&self, _: &User) -> FraudResult<()> {
        refused()
    }

    async fn connect_transactions(
        &self,
        _: &str,
        _: &str,
        _: &HashMap<String, String>,
    ) -> FraudResult<()> {
        refused()
    }

    async fn labeled_transactions(&self, _: Option<usize>) -> FraudResult<Vec<Transaction>> {
        refused()
    }

    async fn user_transactions(&self, _: &str) -> FraudResult<Vec<Transaction>> {
        refused()
    }

    async fn high_risk_transactions(&self, _: f64) -> FraudResult<Vec<Transaction>> {
        refused()
    }

    async fn set_fraud_probability(&self, _: &str, _: f64) -> FraudResult<()> {
        refused()
    }

    async fn ping(&self) -> FraudResult<()> {
        refused()
    }
}

fn orchestrator(store: Arc<InMemoryGraphStore>, settings: ScoringSettings) -> GraphRag {
    GraphRag::new(
        store,
        FraudGnn::new(config(), 42).unwrap(),
        FeatureExtractor::default(),
        settings,
    )
    .unwrap()
}

#[tokio::test]
async fn isolated_transaction_gets_the_fallback_score() {
    let store = Arc::new(InMemoryGraphStore::new());
    let rag = orchestrator(store, ScoringSettings::default());
    rag.update_graph(&transaction("T1", "U1"), &[]).await.unwrap();

    let subgraph = rag.retrieve_context("T1", 2).await.unwrap();
    assert_eq!(subgraph.node_ids(), vec!["T1"]);
    assert!(subgraph.edges.is_empty());

    let result = rag.score("T1", 2, 0.5).await.unwrap();
    assert_eq!(result.origin, ScoreOrigin::Fallback);
    assert_eq!(result.fraud_probability, 0.0);
    assert!(!result.is_fraudulent);
}

#[tokio::test]
async fn two_hop_neighbourhood_covers_every_relationship_once() {
    let store = Arc::new(InMemoryGraphStore::new());
    store.upsert_user(&user("U1")).await.unwrap();
    store.upsert_user(&user("U2")).await.unwrap();
    let rag = orchestrator(store, ScoringSettings::default());

    rag.update_graph(&transaction("T2", "U2"), &[Relationship::belongs_to("U2")])
        .await
        .unwrap();
    rag.update_graph(
        &transaction("T1", "U1"),
        &[Relationship::belongs_to("U1"), Relationship::connected_to("T2")],
    )
    .await
    .unwrap();

    let subgraph = rag.retrieve_context("T1", 2).await.unwrap();
    let nodes: BTreeSet<&str> = subgraph.node_ids().into_iter().collect();
    assert_eq!(nodes, BTreeSet::from(["T1", "U1", "T2", "U2"]));

    let edges: BTreeSet<(String, String, &str)> = subgraph
        .edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone(), e.rel_type.as_str()))
        .collect();
    assert_eq!(edges.len(), subgraph.edges.len());
    assert_eq!(
        edges,
        BTreeSet::from([
            ("T1".to_string(), "U1".to_string(), "BELONGS_TO"),
            ("T1".to_string(), "T2".to_string(), "CONNECTED_TO"),
            ("T2".to_string(), "U2".to_string(), "BELONGS_TO"),
        ])
    );
}

#[tokio::test]
async fn dangling_target_aborts_the_whole_write() {
    let store = Arc::new(InMemoryGraphStore::new());
    store.upsert_user(&user("U1")).await.unwrap();
    let rag = orchestrator(store.clone(), ScoringSettings::default());

    let err = rag
        .update_graph(
            &transaction("T1", "U1"),
            &[Relationship::belongs_to("U1"), Relationship::connected_to("T404")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FraudError::DanglingReference { ref target_id, .. } if target_id == "T404"));
    assert!(!store.contains_node("T1").await);
    assert_eq!(store.edge_count().await, 0);
    assert!(rag.retrieve_context("T1", 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_retrieval_is_stable() {
    let store = Arc::new(InMemoryGraphStore::new());
    let mut rng = StdRng::seed_from_u64(3);
    sample_data::seed(store.as_ref(), 5, 40, &mut rng).await.unwrap();

    let root = store.labeled_transactions(Some(1)).await.unwrap().remove(0);
    for dedup in [EdgeDedup::Typed, EdgeDedup::Pair] {
        let a = store.fetch_subgraph(&root.id, 2, dedup).await.unwrap();
        let b = store.fetch_subgraph(&root.id, 2, dedup).await.unwrap();
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn trained_model_survives_a_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("fraud_model.bin");

    let store = Arc::new(InMemoryGraphStore::new());
    let mut rng = StdRng::seed_from_u64(21);
    sample_data::seed(store.as_ref(), 6, 40, &mut rng).await.unwrap();

    let settings = ScoringSettings {
        model_path: Some(model_path.clone()),
        ..ScoringSettings::default()
    };
    let rag = orchestrator(store.clone(), settings.clone());
    let report = rag
        .train(TrainingConfig {
            epochs: 5,
            learning_rate: 0.01,
            ..TrainingConfig::default()
        })
        .await
        .unwrap();
    assert_eq!(report.examples, 40);
    assert!(report.epoch_losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert!(rag.model_is_trained());
    assert!(model_path.exists());

    let root = store.labeled_transactions(Some(1)).await.unwrap().remove(0);
    let before = rag.score(&root.id, 2, 0.5).await.unwrap();
    assert_eq!(before.origin, ScoreOrigin::Model);

    let reloaded = orchestrator(store, settings);
    assert_eq!(reloaded.score(&root.id, 2, 0.5).await.unwrap().origin, ScoreOrigin::Fallback);
    reloaded.load_model(&model_path).await.unwrap();
    let after = reloaded.score(&root.id, 2, 0.5).await.unwrap();
    assert!((after.fraud_probability - before.fraud_probability).abs() < 1e-6);

    let evaluation = reloaded.evaluate(None).await.unwrap();
    assert_eq!(evaluation.examples, 40);
    assert!((0.0..=1.0).contains(&evaluation.accuracy));
}

#[test]
fn negative_threshold_is_a_validation_error() {
    let store = Arc::new(InMemoryGraphStore::new());
    let rag = orchestrator(store, ScoringSettings::default());
    let err = tokio_test::block_on(rag.score("T1", 2, -0.1)).unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn unreachable_store_is_an_error_not_a_fallback() {
    let mut model = FraudGnn::new(config(), 42).unwrap();
    model.mark_trained();
    let rag = GraphRag::new(
        Arc::new(UnreachableStore),
        model,
        FeatureExtractor::default(),
        ScoringSettings::default(),
    )
    .unwrap();

    let err = rag.score("T1", 2, 0.5).await.unwrap_err();
    assert!(matches!(err, FraudError::StoreUnavailable(_)));
    assert!(err.is_retryable());

    let (status, axum::Json(body)) = error_response(err);
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "store_unavailable");

    let write = rag
        .update_graph(&transaction("T1", "U1"), &[Relationship::belongs_to("U1")])
        .await
        .unwrap_err();
    assert!(write.is_retryable());
}

#[tokio::test]
async fn unknown_root_on_a_healthy_store_falls_back() {
    let store = Arc::new(InMemoryGraphStore::new());
    let rag = orchestrator(store, ScoringSettings::default());
    let result = rag.score("T404", 2, 0.5).await.unwrap();
    assert_eq!(result.origin, ScoreOrigin::Fallback);
    assert!(result.context.is_none());
}
