use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::ACTION_COUNT;
use crate::error::{Result, SnakeError};
use crate::features::FEATURE_COUNT;

pub const INPUT_SIZE: usize = FEATURE_COUNT;
pub const HIDDEN_SIZES: [usize; 3] = [256, 256, 128];
pub const OUTPUT_SIZE: usize = ACTION_COUNT;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DenseLayer {
    pub(crate) weights: Vec<f32>, // [in_size × out_size], row-major: w[i * out + j]
    pub(crate) biases: Vec<f32>,
    relu: bool,
    in_size: usize,
    out_size: usize,
}

impl DenseLayer {
    fn new<R: Rng>(in_size: usize, out_size: usize, relu: bool, rng: &mut R) -> Self {
        let limit = (6.0 / (in_size + out_size) as f32).sqrt();
        let n = in_size * out_size;
        let weights: Vec<f32> = (0..n)
            .map(|_| rng.gen::<f32>() * 2.0 * limit - limit)
            .collect();

        DenseLayer {
            weights,
            biases: vec![0.0; out_size],
            relu,
            in_size,
            out_size,
        }
    }

    pub fn in_size(&self) -> usize {
        self.in_size
    }

    pub fn out_size(&self) -> usize {
        self.out_size
    }

    fn forward_single(&self, input: &[f32], output: &mut [f32]) {
        for j in 0..self.out_size {
            let mut sum = self.biases[j];
            for i in 0..self.in_size {
                sum += input[i] * self.weights[i * self.out_size + j];
            }
            output[j] = if self.relu { sum.max(0.0) } else { sum };
        }
    }

    /// Returns (z, a) flattened as [bs * out_size]
    fn forward_batch(&self, input: &[f32], bs: usize) -> (Vec<f32>, Vec<f32>) {
        let mut z = vec![0.0f32; bs * self.out_size];
        let mut a = vec![0.0f32; bs * self.out_size];

        for b in 0..bs {
            let inp = &input[b * self.in_size..(b + 1) * self.in_size];
            for j in 0..self.out_size {
                let mut sum = self.biases[j];
                for i in 0..self.in_size {
                    sum += inp[i] * self.weights[i * self.out_size + j];
                }
                let idx = b * self.out_size + j;
                z[idx] = sum;
                a[idx] = if self.relu { sum.max(0.0) } else { sum };
            }
        }

        (z, a)
    }

    fn check_shape(&self, layer: usize, in_size: usize, out_size: usize, relu: bool) -> Result<()> {
        let expected = format!("{in_size}x{out_size} relu={relu}");
        let got = format!(
            "{}x{} relu={} ({} weights, {} biases)",
            self.in_size,
            self.out_size,
            self.relu,
            self.weights.len(),
            self.biases.len()
        );
        if self.in_size != in_size
            || self.out_size != out_size
            || self.relu != relu
            || self.weights.len() != in_size * out_size
            || self.biases.len() != out_size
        {
            return Err(SnakeError::ShapeMismatch {
                layer,
                expected,
                got,
            });
        }
        Ok(())
    }
}

/// Per-layer gradients, same layout as the layer parameters.
#[derive(Clone, Debug, Default)]
pub struct LayerGradients {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct Gradients {
    pub layers: Vec<LayerGradients>,
}

impl Gradients {
    /// Global L2 norm across every layer.
    pub fn norm(&self) -> f32 {
        self.layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(l.biases.iter()))
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt()
    }
}

/// Cached activations from a training forward pass.
pub struct ForwardPass {
    batch_size: usize,
    inputs: Vec<f32>,
    pre: Vec<Vec<f32>>,
    post: Vec<Vec<f32>>,
    masks: Vec<Option<Vec<f32>>>,
}

impl ForwardPass {
    /// Network output, [batch_size * OUTPUT_SIZE].
    pub fn output(&self) -> &[f32] {
        self.post.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Fully-connected Q-network: 24 → 256 → 256 → 128 → 3.
///
/// Hidden layers use ReLU followed by inverted dropout. Dropout is only
/// applied by [`Network::forward_train`]; [`Network::forward`] is deterministic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    layers: Vec<DenseLayer>,
    dropout: f32,
}

impl Network {
    pub fn new<R: Rng>(dropout: f32, rng: &mut R) -> Self {
        let mut sizes = vec![INPUT_SIZE];
        sizes.extend_from_slice(&HIDDEN_SIZES);
        sizes.push(OUTPUT_SIZE);

        let last = sizes.len() - 2;
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, w)| DenseLayer::new(w[0], w[1], i != last, rng))
            .collect();

        Network { layers, dropout }
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [DenseLayer] {
        &mut self.layers
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.biases.len())
            .sum()
    }

    pub fn forward(&self, input: &[f32]) -> [f32; OUTPUT_SIZE] {
        let mut activ = input.to_vec();
        for layer in &self.layers {
            let mut out = vec![0.0f32; layer.out_size];
            layer.forward_single(&activ, &mut out);
            activ = out;
        }

        let mut q = [0.0f32; OUTPUT_SIZE];
        q.copy_from_slice(&activ);
        q
    }

    pub fn predict_batch(&self, inputs: &[&[f32]]) -> Vec<[f32; OUTPUT_SIZE]> {
        inputs.iter().map(|inp| self.forward(inp)).collect()
    }

    /// Forward pass with dropout, caching what [`Network::backward`] needs.
    pub fn forward_train<R: Rng>(&self, inputs: &[&[f32]], rng: &mut R) -> ForwardPass {
        let bs = inputs.len();
        let flat_in: Vec<f32> = inputs.iter().flat_map(|v| v.iter().copied()).collect();
        let keep = 1.0 - self.dropout;

        let mut pre: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
        let mut post: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(self.layers.len());

        for (idx, layer) in self.layers.iter().enumerate() {
            let (z, mut a) = {
                let input = if idx == 0 { &flat_in } else { &post[idx - 1] };
                layer.forward_batch(input, bs)
            };

            let mask = if layer.relu && self.dropout > 0.0 {
                let m: Vec<f32> = (0..a.len())
                    .map(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
                    .collect();
                for (v, s) in a.iter_mut().zip(&m) {
                    *v *= s;
                }
                Some(m)
            } else {
                None
            };

            pre.push(z);
            post.push(a);
            masks.push(mask);
        }

        ForwardPass {
            batch_size: bs,
            inputs: flat_in,
            pre,
            post,
            masks,
        }
    }

    /// Backpropagates `d_output` (per-sample dL/dq, [bs * OUTPUT_SIZE]).
    /// Returned gradients are averaged over the batch.
    pub fn backward(&self, pass: &ForwardPass, d_output: &[f32]) -> Gradients {
        let bs = pass.batch_size;
        let bsf = bs as f32;
        debug_assert_eq!(d_output.len(), bs * OUTPUT_SIZE);

        let mut layers = vec![LayerGradients::default(); self.layers.len()];
        let mut delta = d_output.to_vec();

        for idx in (0..self.layers.len()).rev() {
            let l = &self.layers[idx];

            if l.relu {
                if let Some(mask) = &pass.masks[idx] {
                    for (d, s) in delta.iter_mut().zip(mask) {
                        *d *= s;
                    }
                }
                for (d, z) in delta.iter_mut().zip(&pass.pre[idx]) {
                    if *z <= 0.0 {
                        *d = 0.0;
                    }
                }
            }

            let input = if idx == 0 {
                &pass.inputs
            } else {
                &pass.post[idx - 1]
            };
            let gw = matmul_at_b(input, &delta, l.in_size, l.out_size, bs, bsf);
            let gb = sum_cols(&delta, l.out_size, bs, bsf);
            if idx > 0 {
                delta = matmul_a_bt(&delta, &l.weights, l.out_size, l.in_size, bs);
            }

            layers[idx] = LayerGradients {
                weights: gw,
                biases: gb,
            };
        }

        Gradients { layers }
    }

    /// `tau * online + (1 - tau) * target`, as a new network.
    pub fn soft_merge(online: &Network, target: &Network, tau: f32) -> Network {
        assert_eq!(online.layers.len(), target.layers.len());

        let blend = |o: &[f32], t: &[f32]| -> Vec<f32> {
            o.iter()
                .zip(t)
                .map(|(o, t)| tau * o + (1.0 - tau) * t)
                .collect()
        };

        let layers = online
            .layers
            .iter()
            .zip(&target.layers)
            .map(|(o, t)| {
                assert_eq!(o.weights.len(), t.weights.len());
                DenseLayer {
                    weights: blend(&o.weights, &t.weights),
                    biases: blend(&o.biases, &t.biases),
                    relu: t.relu,
                    in_size: t.in_size,
                    out_size: t.out_size,
                }
            })
            .collect();

        Network {
            layers,
            dropout: target.dropout,
        }
    }

    /// Euclidean distance between two parameter sets of the same shape.
    pub fn parameter_distance(&self, other: &Network) -> f32 {
        self.layers
            .iter()
            .zip(&other.layers)
            .flat_map(|(a, b)| {
                a.weights
                    .iter()
                    .zip(&b.weights)
                    .chain(a.biases.iter().zip(&b.biases))
            })
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().chain(&l.biases).all(|v| v.is_finite()))
    }

    /// Checks the architecture, e.g. after deserializing.
    pub fn validate(&self) -> Result<()> {
        let expected_layers = HIDDEN_SIZES.len() + 1;
        if self.layers.len() != expected_layers {
            return Err(SnakeError::ShapeMismatch {
                layer: self.layers.len(),
                expected: format!("{expected_layers} layers"),
                got: format!("{} layers", self.layers.len()),
            });
        }

        let mut in_size = INPUT_SIZE;
        for (i, layer) in self.layers.iter().enumerate() {
            let hidden = i < HIDDEN_SIZES.len();
            let out_size = if hidden { HIDDEN_SIZES[i] } else { OUTPUT_SIZE };
            layer.check_shape(i, in_size, out_size, hidden)?;
            in_size = out_size;
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SnakeError::Config(format!(
                "dropout {} out of range",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Compute A^T @ B / scale, where A is [bs × m] and B is [bs × n], result is [m × n]
fn matmul_at_b(a: &[f32], b: &[f32], m: usize, n: usize, bs: usize, scale: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for s in 0..bs {
        let a_row = &a[s * m..(s + 1) * m];
        let b_row = &b[s * n..(s + 1) * n];
        for i in 0..m {
            let av = a_row[i];
            if av == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += av * b_row[j];
            }
        }
    }
    for v in out.iter_mut() {
        *v /= scale;
    }
    out
}

/// delta @ W^T: [bs × out_size] @ [out_size × in_size] = [bs × in_size].
/// W is stored [in_size × out_size] row-major, so W^T[j, i] = w[i * out_size + j].
fn matmul_a_bt(a: &[f32], w: &[f32], out_size: usize, in_size: usize, bs: usize) -> Vec<f32> {
    let mut result = vec![0.0f32; bs * in_size];
    for b in 0..bs {
        let a_row = &a[b * out_size..(b + 1) * out_size];
        for i in 0..in_size {
            let mut sum = 0.0f32;
            for j in 0..out_size {
                sum += a_row[j] * w[i * out_size + j];
            }
            result[b * in_size + i] = sum;
        }
    }
    result
}

/// Sum columns across batch: result[j] = sum_b(data[b * cols + j]) / scale
fn sum_cols(data: &[f32], cols: usize, bs: usize, scale: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; cols];
    for b in 0..bs {
        for j in 0..cols {
            out[j] += data[b * cols + j];
        }
    }
    for v in out.iter_mut() {
        *v /= scale;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(seed: u64, dropout: f32) -> Network {
        Network::new(dropout, &mut StdRng::seed_from_u64(seed))
    }

    fn sample_input(k: f32) -> Vec<f32> {
        (0..INPUT_SIZE).map(|i| ((i as f32) * 0.37 + k).sin()).collect()
    }

    #[test]
    fn architecture_matches_layout() {
        let net = network(1, 0.2);
        net.validate().unwrap();
        let sizes: Vec<(usize, usize)> = net
            .layers()
            .iter()
            .map(|l| (l.in_size(), l.out_size()))
            .collect();
        assert_eq!(sizes, vec![(24, 256), (256, 256), (256, 128), (128, 3)]);
        assert_eq!(
            net.num_parameters(),
            24 * 256 + 256 + 256 * 256 + 256 + 256 * 128 + 128 + 128 * 3 + 3
        );
    }

    #[test]
    fn inference_is_deterministic() {
        let net = network(2, 0.5);
        let x = sample_input(0.1);
        assert_eq!(net.forward(&x), net.forward(&x));
    }

    #[test]
    fn training_pass_without_dropout_matches_inference() {
        let net = network(3, 0.0);
        let a = sample_input(0.0);
        let b = sample_input(1.0);
        let pass = net.forward_train(&[&a, &b], &mut StdRng::seed_from_u64(0));
        let out = pass.output();
        let qa = net.forward(&a);
        let qb = net.forward(&b);
        for j in 0..OUTPUT_SIZE {
            assert!((out[j] - qa[j]).abs() < 1e-5);
            assert!((out[OUTPUT_SIZE + j] - qb[j]).abs() < 1e-5);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut net = network(4, 0.0);
        let x = sample_input(0.3);
        let action = 1;
        let target = 2.0f32;

        let loss = |net: &Network| {
            let q = net.forward(&x)[action];
            (q - target) * (q - target)
        };

        let pass = net.forward_train(&[&x], &mut StdRng::seed_from_u64(0));
        let mut d_out = vec![0.0; OUTPUT_SIZE];
        d_out[action] = 2.0 * (pass.output()[action] - target);
        let grads = net.backward(&pass, &d_out);

        // Output bias and a first-layer weight
        let eps = 1e-2;
        for (layer, bias) in [(3usize, true), (0usize, false)] {
            let analytic;
            let base = loss(&net);
            if bias {
                analytic = grads.layers[layer].biases[action];
                net.layers_mut()[layer].biases[action] += eps;
            } else {
                let idx = grads.layers[layer]
                    .weights
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                    .map(|(i, _)| i)
                    .unwrap();
                analytic = grads.layers[layer].weights[idx];
                net.layers_mut()[layer].weights[idx] += eps;
            }
            let numeric = (loss(&net) - base) / eps;
            assert!(
                (numeric - analytic).abs() <= 0.05 * analytic.abs().max(1.0),
                "layer {layer}: numeric {numeric} vs analytic {analytic}"
            );
            net = network(4, 0.0);
        }
    }

    #[test]
    fn soft_merge_converges_to_fixed_online() {
        let online = network(5, 0.2);
        let mut target = network(6, 0.2);

        let mut prev = target.parameter_distance(&online);
        assert!(prev > 0.0);
        for _ in 0..200 {
            target = Network::soft_merge(&online, &target, 0.05);
            let d = target.parameter_distance(&online);
            assert!(d < prev);
            prev = d;
        }
        assert!(prev < 1e-3 * network(6, 0.2).parameter_distance(&online) + 1e-3);
    }

    #[test]
    fn soft_merge_leaves_inputs_untouched() {
        let online = network(7, 0.2);
        let target = network(8, 0.2);
        let before = target.clone();
        let merged = Network::soft_merge(&online, &target, 0.5);
        assert_eq!(target.parameter_distance(&before), 0.0);
        assert!(merged.parameter_distance(&target) > 0.0);
    }

    #[test]
    fn validate_rejects_wrong_shapes() {
        let mut net = network(9, 0.2);
        net.layers_mut()[1].biases.pop();
        assert!(matches!(
            net.validate(),
            Err(SnakeError::ShapeMismatch { layer: 1, .. })
        ));
    }

    #[test]
    fn detects_non_finite_parameters() {
        let mut net = network(10, 0.2);
        assert!(net.is_finite());
        net.layers_mut()[2].weights[0] = f32::NAN;
        assert!(!net.is_finite());
    }
}
