//! Entrenamiento y evaluación de la GNN.
//!
//! Un ejemplo es el subgrafo recuperado de una transacción etiquetada, con su
//! etiqueta a nivel de grafo. Cada paso procesa un único grafo: no hay
//! batching estructural de grafos. `TrainingMode::GradientAccumulation` es el
//! modo con nombre propio que promedia gradientes de `batch_size` grafos antes
//! de cada paso del optimizador.

use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{FraudError, FraudResult};
use crate::gnn::{bce_loss, FraudGnn, Gradients};
use crate::optim::Adam;
use crate::tensor::GraphTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Un paso del optimizador por ejemplo.
    #[default]
    PerExample,
    /// Un paso cada `batch_size` ejemplos, con el gradiente medio.
    GradientAccumulation,
}

impl FromStr for TrainingMode {
    type Err = FraudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per_example" => Ok(Self::PerExample),
            "accumulate" | "gradient_accumulation" => Ok(Self::GradientAccumulation),
            other => Err(FraudError::InvalidArgument(format!(
                "Modo de entrenamiento no soportado: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleOrder {
    #[default]
    Fixed,
    /// Barajado por época, reproducible con la semilla.
    Shuffled,
}

impl FromStr for ExampleOrder {
    type Err = FraudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "shuffled" => Ok(Self::Shuffled),
            other => Err(FraudError::InvalidArgument(format!(
                "Orden de ejemplos no soportado: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub mode: TrainingMode,
    pub order: ExampleOrder,
    /// Semilla para el dropout y el barajado.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.001,
            batch_size: 32,
            mode: TrainingMode::PerExample,
            order: ExampleOrder::Fixed,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub epochs: usize,
    pub examples: usize,
    /// Pérdida media por época.
    pub epoch_losses: Vec<f32>,
    pub optimizer_steps: usize,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub examples: usize,
    /// Exactitud con umbral fijo 0.5.
    pub accuracy: f64,
    /// ROC AUC; `None` si el conjunto tiene una sola clase.
    pub auc: Option<f64>,
}

fn graph_label(example: &GraphTensor, index: usize) -> FraudResult<f32> {
    match example.graph_label {
        Some(label) if label == 0.0 || label == 1.0 => Ok(label),
        Some(label) => Err(FraudError::InvalidArgument(format!(
            "El ejemplo {index} tiene una etiqueta no binaria: {label}"
        ))),
        None => Err(FraudError::InvalidArgument(format!(
            "El ejemplo {index} no tiene etiqueta"
        ))),
    }
}

fn validate_examples(model: &FraudGnn, examples: &[GraphTensor]) -> FraudResult<Vec<f32>> {
    if examples.is_empty() {
        return Err(FraudError::EmptyDataset);
    }
    let input_dim = model.config().input_dim;
    examples
        .iter()
        .enumerate()
        .map(|(i, example)| {
            if example.is_empty() {
                return Err(FraudError::InvalidArgument(format!(
                    "El ejemplo {i} no tiene nodos"
                )));
            }
            if example.num_features() != input_dim {
                return Err(FraudError::DimensionMismatch {
                    expected: input_dim,
                    found: example.num_features(),
                });
            }
            graph_label(example, i)
        })
        .collect()
}

/// Entrena el modelo en sitio.
///
/// Si la pérdida (o un gradiente) deja de ser finita se restauran los pesos
/// previos al entrenamiento y se devuelve `FraudError::TrainingDiverged`.
pub fn train(
    model: &mut FraudGnn,
    examples: &[GraphTensor],
    cfg: &TrainingConfig,
) -> FraudResult<TrainingReport> {
    if cfg.learning_rate <= 0.0 || !cfg.learning_rate.is_finite() {
        return Err(FraudError::InvalidArgument(
            "learning_rate debe ser finito y > 0".into(),
        ));
    }
    if cfg.batch_size == 0 {
        return Err(FraudError::InvalidArgument("batch_size debe ser > 0".into()));
    }
    let labels = validate_examples(model, examples)?;

    let checkpoint = model.clone();
    let mut optimizer = Adam::new(model, cfg.learning_rate);
    let mut dropout_rng = StdRng::seed_from_u64(cfg.seed);
    let mut order_rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
    let mut order: Vec<usize> = (0..examples.len()).collect();
    let mut epoch_losses = Vec::with_capacity(cfg.epochs);

    info!(
        "Entrenando GNN: {} ejemplos, {} épocas, lr={}, modo={:?}, orden={:?}",
        examples.len(),
        cfg.epochs,
        cfg.learning_rate,
        cfg.mode,
        cfg.order
    );

    for epoch in 1..=cfg.epochs {
        if cfg.order == ExampleOrder::Shuffled {
            order.shuffle(&mut order_rng);
        }

        let mut total_loss = 0.0f32;
        let mut pending: Option<(Gradients, usize)> = None;

        for (position, &idx) in order.iter().enumerate() {
            let cache = model.forward(&examples[idx], Some(&mut dropout_rng))?;
            let loss = bce_loss(cache.probability, labels[idx]);
            let grads = model.backward(&cache, labels[idx]);

            if !loss.is_finite() || !grads.is_finite() {
                warn!("Pérdida no finita en la época {epoch}, ejemplo {idx}: se restauran los pesos previos");
                *model = checkpoint;
                return Err(FraudError::TrainingDiverged {
                    epoch,
                    example: idx,
                });
            }
            total_loss += loss;

            match cfg.mode {
                TrainingMode::PerExample => optimizer.step(model, &grads),
                TrainingMode::GradientAccumulation => {
                    let (acc, count) =
                        pending.get_or_insert_with(|| (Gradients::zeros_like(model), 0));
                    acc.accumulate(&grads);
                    *count += 1;
                    if *count == cfg.batch_size || position + 1 == order.len() {
                        acc.scale(1.0 / *count as f32);
                        optimizer.step(model, acc);
                        pending = None;
                    }
                }
            }
        }

        let mean_loss = total_loss / examples.len() as f32;
        epoch_losses.push(mean_loss);
        if epoch % 10 == 0 || epoch == cfg.epochs {
            info!("Época {}/{}, pérdida: {:.4}", epoch, cfg.epochs, mean_loss);
        }
    }

    model.mark_trained();
    Ok(TrainingReport {
        epochs: cfg.epochs,
        examples: examples.len(),
        epoch_losses,
        optimizer_steps: optimizer.steps() as usize,
    })
}

/// Exactitud (umbral 0.5) y AUC sobre un conjunto etiquetado reservado.
pub fn evaluate(model: &FraudGnn, examples: &[GraphTensor]) -> FraudResult<EvaluationReport> {
    let labels = validate_examples(model, examples)?;
    let scores = examples
        .iter()
        .map(|example| Ok(model.predict(example, 0.5)?.0))
        .collect::<FraudResult<Vec<f32>>>()?;

    let correct = scores
        .iter()
        .zip(&labels)
        .filter(|(p, y)| (**p > 0.5) == (**y == 1.0))
        .count();

    Ok(EvaluationReport {
        examples: examples.len(),
        accuracy: correct as f64 / examples.len() as f64,
        auc: roc_auc(&scores, &labels),
    })
}

/// ROC AUC por suma de rangos (Mann-Whitney), con rango medio en empates.
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Option<f64> {
    let positives = labels.iter().filter(|&&y| y == 1.0).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Rangos 1-based i+1..=j+1 comparten la media.
        let average = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = average;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = ranks
        .iter()
        .zip(labels)
        .filter(|(_, y)| **y == 1.0)
        .map(|(r, _)| r)
        .sum();
    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::GnnConfig;
    use rand::Rng;

    fn model(dropout: f32) -> FraudGnn {
        FraudGnn::new(
            GnnConfig {
                input_dim: 3,
                hidden_dim: 16,
                num_layers: 2,
                dropout,
            },
            5,
        )
        .unwrap()
    }

    /// 20 grafos estrella de 3 nodos; etiqueta = signo de una combinación lineal.
    fn separable_dataset(seed: u64) -> Vec<GraphTensor> {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = [1.0f32, -2.0, 0.5];
        (0..20)
            .map(|g| {
                let rows: Vec<(String, Vec<f32>)> = (0..3)
                    .map(|n| {
                        let v: Vec<f32> = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
                        (format!("g{g}n{n}"), v)
                    })
                    .collect();
                let score: f32 = rows
                    .iter()
                    .map(|(_, v)| v.iter().zip(&w).map(|(a, b)| a * b).sum::<f32>())
                    .sum();
                let ids: Vec<String> = rows.iter().map(|(id, _)| id.clone()).collect();
                let edges = [(ids[0].as_str(), ids[1].as_str()), (ids[0].as_str(), ids[2].as_str())];
                GraphTensor::from_rows(rows.clone(), &edges, None)
                    .unwrap()
                    .with_graph_label(if score > 0.0 { 1.0 } else { 0.0 })
            })
            .collect()
    }

    #[test]
    fn training_reduces_loss_on_separable_data() {
        let data = separable_dataset(3);
        let mut m = model(0.0);
        let cfg = TrainingConfig {
            epochs: 60,
            learning_rate: 0.01,
            ..TrainingConfig::default()
        };
        let report = train(&mut m, &data, &cfg).unwrap();

        assert_eq!(report.epoch_losses.len(), 60);
        assert!(report.epoch_losses.iter().all(|l| l.is_finite() && *l >= 0.0));
        assert!(report.final_loss().unwrap() < report.epoch_losses[0]);
        assert_eq!(report.optimizer_steps, 60 * 20);
        assert!(m.is_trained());

        let eval = evaluate(&m, &data).unwrap();
        assert!(eval.accuracy >= 0.7, "accuracy {}", eval.accuracy);
        assert!(eval.auc.unwrap() >= 0.7);
    }

    #[test]
    fn gradient_accumulation_steps_once_per_group() {
        let data: Vec<GraphTensor> = separable_dataset(9).into_iter().take(10).collect();
        let mut m = model(0.2);
        let cfg = TrainingConfig {
            epochs: 3,
            batch_size: 4,
            mode: TrainingMode::GradientAccumulation,
            ..TrainingConfig::default()
        };
        let report = train(&mut m, &data, &cfg).unwrap();
        assert_eq!(report.optimizer_steps, 3 * 3);
    }

    #[test]
    fn shuffled_training_is_reproducible_with_a_seed() {
        let data = separable_dataset(4);
        let cfg = TrainingConfig {
            epochs: 5,
            order: ExampleOrder::Shuffled,
            ..TrainingConfig::default()
        };
        let mut a = model(0.2);
        let mut b = model(0.2);
        train(&mut a, &data, &cfg).unwrap();
        train(&mut b, &data, &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn divergence_restores_previous_weights() {
        let mut data = separable_dataset(5);
        data[1].features[[0, 0]] = f32::NAN;
        let mut m = model(0.0);
        let before = m.clone();

        let err = train(&mut m, &data, &TrainingConfig::default()).unwrap_err();
        assert!(matches!(err, FraudError::TrainingDiverged { epoch: 1, example: 1 }));
        assert_eq!(m, before);
        assert!(!m.is_trained());
    }

    #[test]
    fn unlabeled_or_empty_sets_are_rejected() {
        let mut m = model(0.0);
        assert!(matches!(
            train(&mut m, &[], &TrainingConfig::default()),
            Err(FraudError::EmptyDataset)
        ));
        let mut data = separable_dataset(6);
        data[0].graph_label = None;
        assert!(matches!(
            evaluate(&m, &data),
            Err(FraudError::InvalidArgument(_))
        ));
    }

    #[test]
    fn auc_uses_average_ranks() {
        assert_eq!(roc_auc(&[0.1, 0.4, 0.35, 0.8], &[0.0, 0.0, 1.0, 1.0]), Some(0.75));
        assert_eq!(roc_auc(&[0.5, 0.5], &[0.0, 1.0]), Some(0.5));
        assert_eq!(roc_auc(&[0.9, 0.1], &[1.0, 0.0]), Some(1.0));
        assert_eq!(roc_auc(&[0.3, 0.6], &[1.0, 1.0]), None);
    }

    #[test]
    fn config_values_parse() {
        assert_eq!("accumulate".parse::<TrainingMode>().unwrap(), TrainingMode::GradientAccumulation);
        assert_eq!("Shuffled".parse::<ExampleOrder>().unwrap(), ExampleOrder::Shuffled);
        assert!("batched".parse::<TrainingMode>().is_err());
    }
}
