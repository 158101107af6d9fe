//! Generación de datos sintéticos (usuarios y transacciones) para demos y
//! para entrenar el modelo sin datos reales.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::info;
use uuid::{Builder, Uuid};

use crate::error::FraudResult;
use crate::features::FeatureSchema;
use crate::models::{Relationship, Transaction, User};
use crate::store::GraphStore;

/// Probabilidad de enlazar una transacción con cada una de sus dos siguientes.
const CONNECT_PROBABILITY: f64 = 0.3;
const MAX_AMOUNT: f64 = 10_000.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSummary {
    pub users: usize,
    pub transactions: usize,
    pub fraudulent: usize,
    pub connections: usize,
}

fn random_id(rng: &mut impl Rng) -> Uuid {
    Builder::from_random_bytes(rng.gen()).into_uuid()
}

pub fn generate_users(count: usize, rng: &mut impl Rng) -> Vec<User> {
    let now = Utc::now();
    (0..count)
        .map(|i| User {
            id: random_id(rng).to_string(),
            risk_score: rng.gen_range(0.0..1.0),
            created_at: (now - Duration::days(rng.gen_range(1..365))).to_rfc3339(),
            name: Some(format!("user_{i}")),
        })
        .collect()
}

/// Transacciones cuyo vector se compone con `FeatureSchema::standard`:
/// `amount` escalado, hora y día normalizados, las dos desviaciones y el
/// `risk_score` del usuario dueño.
///
/// La etiqueta depende de las desviaciones y del riesgo del usuario, de modo
/// que el conjunto sea aprendible.
pub fn generate_transactions(users: &[User], count: usize, rng: &mut impl Rng) -> Vec<Transaction> {
    if users.is_empty() {
        return Vec::new();
    }
    let now = Utc::now();
    let schema = FeatureSchema::standard();
    (0..count)
        .map(|_| {
            let user = &users[rng.gen_range(0..users.len())];
            let amount = rng.gen_range(10.0..MAX_AMOUNT);
            let time_of_day = rng.gen_range(0.0..1.0);
            let day_of_week = f64::from(rng.gen_range(0u32..7)) / 6.0;
            let amount_deviation: f64 = rng.gen_range(0.0..1.0);
            let location_deviation: f64 = rng.gen_range(0.0..1.0);

            let risk = 0.5 * (amount_deviation + location_deviation) + 0.5 * user.risk_score;
            let label = u8::from(risk > 0.75);

            Transaction {
                id: random_id(rng).to_string(),
                amount,
                timestamp: (now - Duration::minutes(rng.gen_range(0..60 * 24 * 30))).to_rfc3339(),
                user_id: user.id.clone(),
                features: schema.assemble(|name| match name {
                    "amount" => Some(amount),
                    "time_of_day" => Some(time_of_day),
                    "day_of_week" => Some(day_of_week),
                    "amount_deviation" => Some(amount_deviation),
                    "location_deviation" => Some(location_deviation),
                    "risk_score" => Some(user.risk_score),
                    _ => None,
                }),
                label: Some(label),
                fraud_probability: None,
            }
        })
        .collect()
}

/// Siembra `users` usuarios y `transactions` transacciones en el store.
pub async fn seed(
    store: &dyn GraphStore,
    users: usize,
    transactions: usize,
    rng: &mut (impl Rng + Send),
) -> FraudResult<SeedSummary> {
    let user_list = generate_users(users, rng);
    let tx_list = generate_transactions(&user_list, transactions, rng);

    for user in &user_list {
        store.upsert_user(user).await?;
    }
    for t in &tx_list {
        store
            .write_node_and_edges(t, &[Relationship::belongs_to(t.user_id.clone())])
            .await?;
    }

    let mut connections = 0;
    let props = HashMap::from([("timestamp".to_string(), Utc::now().to_rfc3339())]);
    for (i, source) in tx_list.iter().enumerate() {
        for target in tx_list.iter().skip(i + 1).take(2) {
            if rng.gen_bool(CONNECT_PROBABILITY) {
                store
                    .connect_transactions(&source.id, &target.id, &props)
                    .await?;
                connections += 1;
            }
        }
    }

    let summary = SeedSummary {
        users: user_list.len(),
        transactions: tx_list.len(),
        fraudulent: tx_list.iter().filter(|t| t.label == Some(1)).count(),
        connections,
    };
    info!(
        "Datos de ejemplo: {} usuarios, {} transacciones ({} fraudulentas), {} conexiones",
        summary.users, summary.transactions, summary.fraudulent, summary.connections
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryGraphStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_transactions_match_the_feature_schema() {
        let mut rng = StdRng::seed_from_u64(7);
        let users = generate_users(3, &mut rng);
        let txs = generate_transactions(&users, 20, &mut rng);
        assert_eq!(txs.len(), 20);
        for t in &txs {
            assert_eq!(t.features.len(), 6);
            assert!(t.features.iter().all(|v| (0.0..=1.0).contains(v)));
            assert!(users.iter().any(|u| u.id == t.user_id));
        }
    }

    #[test]
    fn generated_vectors_agree_with_the_extractor_schema() {
        let mut rng = StdRng::seed_from_u64(5);
        let users = generate_users(2, &mut rng);
        let schema = FeatureSchema::standard();
        let amount_slot = schema.index_of("amount").unwrap();
        let risk_slot = schema.index_of("risk_score").unwrap();

        for t in generate_transactions(&users, 10, &mut rng) {
            let owner = users.iter().find(|u| u.id == t.user_id).unwrap();
            assert!((t.features[amount_slot] - t.amount * crate::features::AMOUNT_SCALE).abs() < 1e-12);
            assert_eq!(t.features[risk_slot], owner.risk_score);

            // El dueño aporta el mismo valor en su propia fila.
            let extractor = crate::features::FeatureExtractor::default();
            let owner_row = extractor
                .extract(&crate::models::NodeRecord::User(owner.clone()))
                .unwrap();
            assert_eq!(owner_row[risk_slot], t.features[risk_slot] as f32);
        }
    }

    #[test]
    fn no_users_means_no_transactions() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(generate_transactions(&[], 5, &mut rng).is_empty());
    }

    #[tokio::test]
    async fn seed_populates_the_store() {
        let store = InMemoryGraphStore::new();
        let mut rng = StdRng::seed_from_u64(11);
        let summary = seed(&store, 4, 30, &mut rng).await.unwrap();

        assert_eq!(store.node_count().await, 34);
        assert_eq!(store.edge_count().await, 30 + summary.connections);
        assert_eq!(store.labeled_transactions(None).await.unwrap().len(), 30);
    }
}
