//! Optimizador Adam sobre los parámetros de `FraudGnn`.

use crate::gnn::{zip_update, Dense, FraudGnn, Gradients};

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    /// (primer momento, segundo momento) por capa.
    moments: Vec<(Dense, Dense)>,
}

impl Adam {
    pub fn new(model: &FraudGnn, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            moments: model
                .layers()
                .map(|l| (Dense::zeros_like(l), Dense::zeros_like(l)))
                .collect(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.step
    }

    pub fn step(&mut self, model: &mut FraudGnn, grads: &Gradients) {
        self.step += 1;
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let bias1 = 1.0 - b1.powi(self.step);
        let bias2 = 1.0 - b2.powi(self.step);
        let moments = &mut self.moments;

        model.apply(grads, |i, param, grad| {
            let (m, v) = &mut moments[i];
            zip_update(param, grad, m, v, |p, g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::GnnConfig;

    #[test]
    fn step_moves_parameters_against_the_gradient() {
        let mut model = FraudGnn::new(
            GnnConfig {
                input_dim: 2,
                hidden_dim: 4,
                num_layers: 2,
                dropout: 0.0,
            },
            1,
        )
        .unwrap();
        let before = model.clone();

        let mut grads = Gradients::zeros_like(&model);
        grads.layers[0].weight[[0, 0]] = 1.0;
        grads.layers[0].bias[1] = -1.0;

        let mut adam = Adam::new(&model, 0.01);
        adam.step(&mut model, &grads);

        let w_before = before.layers().next().unwrap();
        let w_after = model.layers().next().unwrap();
        // Primer paso de Adam: desplazamiento ~ lr * signo(g).
        assert!((w_before.weight[[0, 0]] - w_after.weight[[0, 0]] - 0.01).abs() < 1e-4);
        assert!((w_after.bias[1] - w_before.bias[1] - 0.01).abs() < 1e-4);
        assert_eq!(w_before.weight[[1, 1]], w_after.weight[[1, 1]]);
        assert_eq!(adam.steps(), 1);
    }
}
