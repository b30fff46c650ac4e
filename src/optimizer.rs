//! Adam optimizer with global gradient-norm clipping.
//!
//! Moments are kept outside [`Network`]; the target network carries parameters only.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnakeError};
use crate::nn::{Gradients, Network};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Gradients are rescaled when their global norm exceeds this.
    pub max_grad_norm: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_grad_norm: 1.0,
        }
    }
}

/// First and second moments for one dense layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerMoments {
    m_w: Vec<f32>,
    v_w: Vec<f32>,
    m_b: Vec<f32>,
    v_b: Vec<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    config: AdamConfig,
    t: u64,
    moments: Vec<LayerMoments>,
}

impl Adam {
    pub fn new(network: &Network, config: AdamConfig) -> Self {
        let moments = network
            .layers()
            .iter()
            .map(|l| {
                let n = l.in_size() * l.out_size();
                LayerMoments {
                    m_w: vec![0.0; n],
                    v_w: vec![0.0; n],
                    m_b: vec![0.0; l.out_size()],
                    v_b: vec![0.0; l.out_size()],
                }
            })
            .collect();

        Adam {
            config,
            t: 0,
            moments,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Clips, then applies one Adam update. Returns the gradient norm before clipping.
    pub fn step(&mut self, network: &mut Network, grads: &Gradients) -> f32 {
        debug_assert_eq!(grads.layers.len(), self.moments.len());
        self.t += 1;

        let norm = grads.norm();
        let max_norm = self.config.max_grad_norm;
        let scale = if norm > max_norm && norm > 0.0 {
            max_norm / norm
        } else {
            1.0
        };

        let (b1, b2, eps, lr) = (
            self.config.beta1,
            self.config.beta2,
            self.config.epsilon,
            self.config.lr,
        );
        let t = self.t.min(i32::MAX as u64) as i32;
        let bc1 = 1.0 - b1.powi(t);
        let bc2 = 1.0 - b2.powi(t);

        let update = |params: &mut [f32], g: &[f32], m: &mut [f32], v: &mut [f32]| {
            for i in 0..params.len() {
                let gi = g[i] * scale;
                m[i] = b1 * m[i] + (1.0 - b1) * gi;
                v[i] = b2 * v[i] + (1.0 - b2) * gi * gi;
                let mh = m[i] / bc1;
                let vh = v[i] / bc2;
                params[i] -= lr * mh / (vh.sqrt() + eps);
            }
        };

        for ((layer, g), mo) in network
            .layers_mut()
            .iter_mut()
            .zip(&grads.layers)
            .zip(self.moments.iter_mut())
        {
            update(&mut layer.weights, &g.weights, &mut mo.m_w, &mut mo.v_w);
            update(&mut layer.biases, &g.biases, &mut mo.m_b, &mut mo.v_b);
        }

        norm
    }

    /// Checks that the moment buffers line up with `network`.
    pub fn validate(&self, network: &Network) -> Result<()> {
        if self.moments.len() != network.layers().len() {
            return Err(SnakeError::ShapeMismatch {
                layer: self.moments.len(),
                expected: format!("{} optimizer layers", network.layers().len()),
                got: format!("{} optimizer layers", self.moments.len()),
            });
        }
        for (i, (mo, l)) in self.moments.iter().zip(network.layers()).enumerate() {
            let n = l.in_size() * l.out_size();
            let ok = mo.m_w.len() == n
                && mo.v_w.len() == n
                && mo.m_b.len() == l.out_size()
                && mo.v_b.len() == l.out_size();
            if !ok {
                return Err(SnakeError::ShapeMismatch {
                    layer: i,
                    expected: format!("moments for {}x{}", l.in_size(), l.out_size()),
                    got: format!("{} / {} weight moments", mo.m_w.len(), mo.v_w.len()),
                });
            }
        }
        Ok(())
    }
}
