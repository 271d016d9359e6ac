use crate::{
    accumulator::Trace,
    aligned::AlignedBuffer,
    features::FeatureSet,
    loss::{sigmoid, sigmoid_prime, LossConfig, Target},
    network::{Architecture, DenseLayer, Network},
    record::Color,
    simd::{add_assign, add_scaled},
};

/// Gradients for every parameter of a network, plus which input rows hold
/// anything. Rows that no example touched stay zero and are skipped by
/// clearing, merging and the optimizer.
#[derive(Clone, Debug)]
pub struct GradientBuffer {
    hidden: usize,
    pub feature_weights: AlignedBuffer,
    pub feature_bias: AlignedBuffer,
    pub layers: Vec<DenseLayer>,
    touched: Vec<u64>,
    touched_rows: Vec<u32>,
}

impl GradientBuffer {
    pub fn new(arch: &Architecture) -> Self {
        Self {
            hidden: arch.hidden,
            feature_weights: AlignedBuffer::zeroed(arch.inputs * arch.hidden),
            feature_bias: AlignedBuffer::zeroed(arch.hidden),
            layers: arch
                .dense_shapes()
                .into_iter()
                .map(|(i, o)| DenseLayer::zeroed(i, o))
                .collect(),
            touched: vec![0; arch.inputs.div_ceil(64)],
            touched_rows: Vec::new(),
        }
    }

    fn empty_like(&self) -> Self {
        let mut out = self.clone();
        out.clear();
        out
    }

    pub fn clear(&mut self) {
        for &row in &self.touched_rows {
            self.feature_weights.row_mut(row as usize, self.hidden).fill(0.);
        }
        self.touched.fill(0);
        self.touched_rows.clear();
        self.feature_bias.zero();
        for layer in &mut self.layers {
            layer.weights.zero();
            layer.biases.zero();
        }
    }

    pub fn is_touched(&self, row: usize) -> bool {
        self.touched[row / 64] & (1 << (row % 64)) != 0
    }

    fn mark(&mut self, row: usize) {
        if !self.is_touched(row) {
            self.touched[row / 64] |= 1 << (row % 64);
            self.touched_rows.push(row as u32);
        }
    }

    /// Adds `values` into input row `row`, marking it touched.
    pub fn add_to_row(&mut self, row: usize, values: &[f32]) {
        self.mark(row);
        add_assign(self.feature_weights.row_mut(row, self.hidden), values);
    }

    /// Input rows with gradient, in the order they were first touched.
    pub fn touched_rows(&self) -> &[u32] {
        &self.touched_rows
    }

    pub fn feature_row(&self, row: usize) -> &[f32] {
        self.feature_weights.row(row, self.hidden)
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &GradientBuffer) {
        for &row in other.touched_rows() {
            let row = row as usize;
            self.add_to_row(row, other.feature_row(row));
        }
        add_assign(&mut self.feature_bias, &other.feature_bias);
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            add_assign(&mut mine.weights, &theirs.weights);
            add_assign(&mut mine.biases, &theirs.biases);
        }
    }
}

/// Sums per-worker buffers into one. The result does not depend on how the
/// examples were spread over the buffers, only on the order of `buffers`.
///
/// # Panics
/// If `buffers` is empty, since there is no shape to build the sum from.
pub fn reduce(buffers: &[GradientBuffer]) -> GradientBuffer {
    assert!(!buffers.is_empty(), "nothing to reduce");
    let mut total = buffers[0].empty_like();
    reduce_into(&mut total, buffers);
    total
}

/// [`reduce`] into an existing buffer, which is cleared first.
pub fn reduce_into(total: &mut GradientBuffer, buffers: &[GradientBuffer]) {
    total.clear();
    for buf in buffers {
        total.merge(buf);
    }
}

/// Per-worker scratch for the backward pass: the loss with respect to the
/// input of every dense layer.
#[derive(Clone, Debug)]
pub struct BackwardScratch {
    losses: Vec<AlignedBuffer>,
}

impl BackwardScratch {
    pub fn new(arch: &Architecture) -> Self {
        Self {
            losses: arch
                .dense_shapes()
                .into_iter()
                .map(|(inputs, _)| AlignedBuffer::zeroed(inputs))
                .collect(),
        }
    }
}

impl Network {
    /// Backpropagates one example whose forward pass is in `trace`, adding
    /// its gradients into `grads`. Returns the example's loss.
    ///
    /// Only the input rows listed in `features` are written.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        features: &FeatureSet,
        stm: Color,
        trace: &Trace,
        target: &Target,
        loss: &LossConfig,
        grads: &mut GradientBuffer,
        scratch: &mut BackwardScratch,
    ) -> f32 {
        let activation = self.arch.activation;
        let hidden = self.hidden();

        let p = sigmoid(trace.output, loss.scale);
        let error = loss.error(p, target);
        let output_delta = [sigmoid_prime(p, loss.scale) * loss.error_gradient(p, target)];

        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let g = &mut grads.layers[l];
            let input = trace.layer_input(l);

            let (lower, upper) = scratch.losses.split_at_mut(l + 1);
            let in_loss = &mut lower[l];
            let out_loss: &[f32] = if l + 1 == self.layers.len() {
                &output_delta
            } else {
                &upper[0]
            };

            in_loss.zero();
            for (j, &d) in out_loss.iter().enumerate() {
                if d == 0. {
                    continue;
                }
                g.biases[j] += d;
                add_scaled(g.weights.row_mut(j, layer.inputs), input, d);
                add_scaled(in_loss, layer.weights.row(j, layer.inputs), d);
            }
            in_loss
                .iter_mut()
                .zip(input)
                .for_each(|(x, &a)| *x *= activation.prime(a));
        }

        let acc_loss = &mut scratch.losses[0];
        if loss.lasso != 0. {
            for (x, &a) in acc_loss.iter_mut().zip(trace.accumulator.iter()) {
                if a > 0. {
                    *x += loss.lasso;
                }
            }
        }

        let (us, them) = acc_loss.split_at(hidden);
        add_assign(&mut grads.feature_bias, us);
        add_assign(&mut grads.feature_bias, them);

        for (view, part) in [(stm, us), (stm.flip(), them)] {
            for &f in features.perspective(view) {
                grads.add_to_row(usize::from(f), part);
            }
        }

        error
    }
}
