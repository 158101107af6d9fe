//! Clasificador GNN de paso de mensajes para fraude.
//!
//! Arquitectura:
//!   1. `num_layers` capas de convolución de grafo (`input_dim -> hidden`,
//!      después `hidden -> hidden`), cada una con ReLU y dropout en entrenamiento.
//!   2. Mean pooling de todas las filas (un subgrafo por llamada).
//!   3. `fc1` (hidden -> hidden/2) + ReLU + dropout, `fc2` (hidden/2 -> 1), sigmoide.
//!
//! La inferencia (`predict`) toma `&self`: no muta estado y es reentrante.
//! El entrenamiento (`trainer::train`) toma `&mut FraudGnn`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FraudError, FraudResult};
use crate::tensor::GraphTensor;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnnConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub dropout: f32,
}

impl GnnConfig {
    pub fn validate(&self) -> FraudResult<()> {
        if self.input_dim == 0 {
            return Err(FraudError::InvalidArgument("input_dim debe ser > 0".into()));
        }
        if self.hidden_dim < 2 {
            return Err(FraudError::InvalidArgument("hidden_dim debe ser >= 2".into()));
        }
        if self.num_layers < 2 {
            return Err(FraudError::InvalidArgument("num_layers debe ser >= 2".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FraudError::InvalidArgument(
                "dropout debe estar en [0, 1)".into(),
            ));
        }
        Ok(())
    }

    fn fc_dim(&self) -> usize {
        self.hidden_dim / 2
    }
}

/// Capa afín `x·W + b`; también sirve de contenedor de gradientes y momentos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    fn glorot(input: usize, output: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input + output) as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((input, output), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(output),
        }
    }

    pub fn zeros_like(other: &Dense) -> Self {
        Self {
            weight: Array2::zeros(other.weight.raw_dim()),
            bias: Array1::zeros(other.bias.raw_dim()),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    fn shape(&self) -> (usize, usize) {
        self.weight.dim()
    }
}

/// Gradientes en el mismo orden que `FraudGnn::layers`.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub layers: Vec<Dense>,
}

impl Gradients {
    pub fn zeros_like(model: &FraudGnn) -> Self {
        Self {
            layers: model.layers().map(Dense::zeros_like).collect(),
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for (acc, g) in self.layers.iter_mut().zip(&other.layers) {
            acc.weight += &g.weight;
            acc.bias += &g.bias;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for g in &mut self.layers {
            g.weight *= factor;
            g.bias *= factor;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|g| {
            g.weight.iter().all(|v| v.is_finite()) && g.bias.iter().all(|v| v.is_finite())
        })
    }
}

struct ConvCache {
    /// `Â·H` de la entrada de la capa.
    propagated: Array2<f32>,
    pre_activation: Array2<f32>,
    mask: Option<Array2<f32>>,
}

/// Activaciones guardadas durante un forward de entrenamiento.
pub struct ForwardCache {
    propagation: Array2<f32>,
    convs: Vec<ConvCache>,
    pooled: Array2<f32>,
    fc1_pre: Array2<f32>,
    fc1_mask: Option<Array2<f32>>,
    fc1_out: Array2<f32>,
    pub probability: f32,
}

/// Pesos serializados, indexados por nombre de capa.
#[derive(Debug, Serialize, Deserialize)]
struct ModelSnapshot {
    version: u32,
    config: GnnConfig,
    trained: bool,
    layers: BTreeMap<String, Dense>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FraudGnn {
    config: GnnConfig,
    convs: Vec<Dense>,
    fc1: Dense,
    fc2: Dense,
    trained: bool,
}

impl FraudGnn {
    /// Inicialización Glorot determinista a partir de `seed`.
    pub fn new(config: GnnConfig, seed: u64) -> FraudResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let convs = (0..config.num_layers)
            .map(|i| {
                let input = if i == 0 { config.input_dim } else { config.hidden_dim };
                Dense::glorot(input, config.hidden_dim, &mut rng)
            })
            .collect();
        let fc1 = Dense::glorot(config.hidden_dim, config.fc_dim(), &mut rng);
        let fc2 = Dense::glorot(config.fc_dim(), 1, &mut rng);
        Ok(Self {
            config,
            convs,
            fc1,
            fc2,
            trained: false,
        })
    }

    pub fn config(&self) -> &GnnConfig {
        &self.config
    }

    /// `false` hasta completar un entrenamiento o cargar pesos entrenados.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn mark_trained(&mut self) {
        self.trained = true;
    }

    pub fn layers(&self) -> impl Iterator<Item = &Dense> {
        self.convs.iter().chain([&self.fc1, &self.fc2])
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut Dense> {
        self.convs.iter_mut().chain([&mut self.fc1, &mut self.fc2])
    }

    fn layer_names(&self) -> Vec<String> {
        (0..self.convs.len())
            .map(|i| format!("conv_{i}"))
            .chain(["fc1".to_string(), "fc2".to_string()])
            .collect()
    }

    /// Probabilidad de fraude y bandera `probabilidad > threshold`.
    ///
    /// Modo inferencia: sin dropout y sin guardar activaciones para backprop.
    pub fn predict(&self, tensor: &GraphTensor, threshold: f32) -> FraudResult<(f32, bool)> {
        let probability = self.forward(tensor, None)?.probability;
        Ok((probability, probability > threshold))
    }

    /// Forward completo. Con `rng` se aplican máscaras de dropout (entrenamiento).
    pub fn forward(
        &self,
        tensor: &GraphTensor,
        mut rng: Option<&mut StdRng>,
    ) -> FraudResult<ForwardCache> {
        if tensor.is_empty() {
            return Err(FraudError::InvalidArgument(
                "No se puede puntuar un tensor sin nodos".into(),
            ));
        }
        if tensor.num_features() != self.config.input_dim {
            return Err(FraudError::DimensionMismatch {
                expected: self.config.input_dim,
                found: tensor.num_features(),
            });
        }

        let p = self.config.dropout;
        let propagation = tensor.propagation_matrix();
        let mut h = tensor.features.clone();
        let mut convs = Vec::with_capacity(self.convs.len());

        for layer in &self.convs {
            let propagated = propagation.dot(&h);
            let pre_activation = layer.forward(&propagated);
            let mask = dropout_mask(pre_activation.dim(), p, rng.as_deref_mut());
            h = pre_activation.mapv(relu);
            if let Some(m) = &mask {
                h *= m;
            }
            convs.push(ConvCache {
                propagated,
                pre_activation,
                mask,
            });
        }

        let pooled = h
            .mean_axis(Axis(0))
            .ok_or_else(|| FraudError::InvalidArgument("Pooling sobre 0 filas".into()))?
            .insert_axis(Axis(0));

        let fc1_pre = self.fc1.forward(&pooled);
        let fc1_mask = dropout_mask(fc1_pre.dim(), p, rng.as_deref_mut());
        let mut fc1_out = fc1_pre.mapv(relu);
        if let Some(m) = &fc1_mask {
            fc1_out *= m;
        }

        let logit = self.fc2.forward(&fc1_out)[[0, 0]];

        Ok(ForwardCache {
            propagation,
            convs,
            pooled,
            fc1_pre,
            fc1_mask,
            fc1_out,
            probability: sigmoid(logit),
        })
    }

    /// Retropropagación de la BCE respecto a la etiqueta escalar del grafo.
    pub fn backward(&self, cache: &ForwardCache, label: f32) -> Gradients {
        let n = cache.convs.first().map(|c| c.propagated.nrows()).unwrap_or(1) as f32;

        // d(BCE)/d(logit) con salida sigmoide.
        let d_logit = Array2::from_elem((1, 1), cache.probability - label);

        let fc2 = Dense {
            weight: cache.fc1_out.t().dot(&d_logit),
            bias: d_logit.row(0).to_owned(),
        };

        let mut d_fc1 = d_logit.dot(&self.fc2.weight.t());
        if let Some(m) = &cache.fc1_mask {
            d_fc1 *= m;
        }
        d_fc1 *= &cache.fc1_pre.mapv(relu_grad);
        let fc1 = Dense {
            weight: cache.pooled.t().dot(&d_fc1),
            bias: d_fc1.row(0).to_owned(),
        };

        let d_pooled = d_fc1.dot(&self.fc1.weight.t());
        let mut d_h = Array2::from_shape_fn(
            (n as usize, self.config.hidden_dim),
            |(_, j)| d_pooled[[0, j]] / n,
        );

        let mut conv_grads = Vec::with_capacity(self.convs.len());
        for (layer, cached) in self.convs.iter().zip(&cache.convs).rev() {
            if let Some(m) = &cached.mask {
                d_h *= m;
            }
            let d_pre = d_h * &cached.pre_activation.mapv(relu_grad);
            conv_grads.push(Dense {
                weight: cached.propagated.t().dot(&d_pre),
                bias: d_pre.sum_axis(Axis(0)),
            });
            // Â es simétrica: Âᵀ = Â.
            d_h = cache.propagation.dot(&d_pre.dot(&layer.weight.t()));
        }
        conv_grads.reverse();

        conv_grads.push(fc1);
        conv_grads.push(fc2);
        Gradients { layers: conv_grads }
    }

    pub fn save(&self, path: &Path) -> FraudResult<()> {
        let snapshot = ModelSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            trained: self.trained,
            layers: self.layer_names().into_iter().zip(self.layers().cloned()).collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Escritura a fichero temporal + rename: el checkpoint previo no queda a medias.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        info!("Modelo guardado en {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> FraudResult<Self> {
        let bytes = fs::read(path)?;
        let snapshot: ModelSnapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FraudError::Persistence(format!(
                "Versión de snapshot {} no soportada",
                snapshot.version
            )));
        }
        snapshot.config.validate()?;

        let mut layers = snapshot.layers;
        let mut take = |name: &str, shape: (usize, usize)| -> FraudResult<Dense> {
            let layer = layers
                .remove(name)
                .ok_or_else(|| FraudError::Persistence(format!("Falta la capa '{name}'")))?;
            if layer.shape() != shape || layer.bias.len() != shape.1 {
                return Err(FraudError::Persistence(format!(
                    "La capa '{name}' tiene forma {:?}, se esperaba {:?}",
                    layer.shape(),
                    shape
                )));
            }
            Ok(layer)
        };

        let cfg = &snapshot.config;
        let convs = (0..cfg.num_layers)
            .map(|i| {
                let input = if i == 0 { cfg.input_dim } else { cfg.hidden_dim };
                take(&format!("conv_{i}"), (input, cfg.hidden_dim))
            })
            .collect::<FraudResult<Vec<_>>>()?;
        let fc1 = take("fc1", (cfg.hidden_dim, cfg.fc_dim()))?;
        let fc2 = take("fc2", (cfg.fc_dim(), 1))?;

        info!("Modelo cargado desde {}", path.display());
        Ok(Self {
            config: snapshot.config,
            convs,
            fc1,
            fc2,
            trained: snapshot.trained,
        })
    }

    pub(crate) fn apply<F>(&mut self, grads: &Gradients, mut update: F)
    where
        F: FnMut(usize, &mut Dense, &Dense),
    {
        for (i, (param, grad)) in self.layers_mut().zip(&grads.layers).enumerate() {
            update(i, param, grad);
        }
    }
}

/// Binary cross-entropy con el recorte de log a -100 habitual.
pub fn bce_loss(probability: f32, label: f32) -> f32 {
    if probability.is_nan() {
        return f32::NAN;
    }
    let log_p = probability.ln().max(-100.0);
    let log_not_p = (1.0 - probability).ln().max(-100.0);
    -(label * log_p + (1.0 - label) * log_not_p)
}

fn dropout_mask(shape: (usize, usize), p: f32, rng: Option<&mut StdRng>) -> Option<Array2<f32>> {
    match rng {
        Some(rng) if p > 0.0 => {
            let keep = 1.0 / (1.0 - p);
            Some(Array2::from_shape_fn(shape, |_| {
                if rng.gen::<f32>() < p {
                    0.0
                } else {
                    keep
                }
            }))
        }
        _ => None,
    }
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

fn relu_grad(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Actualización elemento a elemento compartida por el optimizador.
pub(crate) fn zip_update(
    param: &mut Dense,
    grad: &Dense,
    first: &mut Dense,
    second: &mut Dense,
    mut step: impl FnMut(&mut f32, f32, &mut f32, &mut f32),
) {
    Zip::from(&mut param.weight)
        .and(&grad.weight)
        .and(&mut first.weight)
        .and(&mut second.weight)
        .for_each(|p, &g, m, v| step(p, g, m, v));
    Zip::from(&mut param.bias)
        .and(&grad.bias)
        .and(&mut first.bias)
        .and(&mut second.bias)
        .for_each(|p, &g, m, v| step(p, g, m, v));
}
