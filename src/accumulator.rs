use crate::{
    aligned::AlignedBuffer,
    features::FeatureSet,
    network::{Architecture, Network},
    record::Color,
    simd::{add_assign, clamp_relu, dot},
};

/// Everything the forward pass produced for one position. The backward pass
/// reads it instead of recomputing activations.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    /// Activated accumulators, side to move first then the other side,
    /// `2 * hidden` values in total.
    pub accumulator: AlignedBuffer,
    /// Activated output of every dense hidden layer (the output layer is not
    /// included).
    pub layers: Vec<AlignedBuffer>,
    /// Raw network output, before the logistic.
    pub output: f32,
}

impl Trace {
    pub fn new(arch: &Architecture) -> Self {
        Self {
            accumulator: AlignedBuffer::zeroed(2 * arch.hidden),
            layers: arch.layers.iter().map(|&n| AlignedBuffer::zeroed(n)).collect(),
            output: 0.,
        }
    }

    /// Input vector of dense layer `l`.
    pub fn layer_input(&self, l: usize) -> &[f32] {
        if l == 0 {
            &self.accumulator
        } else {
            &self.layers[l - 1]
        }
    }
}

impl Network {
    pub fn predict(&self, features: &FeatureSet, stm: Color) -> (f32, Trace) {
        let mut trace = Trace::new(&self.arch);
        let out = self.predict_into(features, stm, &mut trace);
        (out, trace)
    }

    /// Forward pass reusing `trace`'s buffers. Returns the raw output.
    pub fn predict_into(&self, features: &FeatureSet, stm: Color, trace: &mut Trace) -> f32 {
        let ceiling = self.arch.activation.ceiling();
        let Trace {
            accumulator,
            layers,
            output,
        } = trace;

        let (us, them) = accumulator.split_at_mut(self.hidden());
        self.accumulate(features.perspective(stm), us);
        self.accumulate(features.perspective(stm.flip()), them);
        clamp_relu(accumulator, ceiling);

        let Some((out_layer, hidden_layers)) = self.layers.split_last() else {
            unreachable!("a network always has an output layer");
        };

        let mut input: &[f32] = accumulator;
        for (layer, out) in hidden_layers.iter().zip(layers.iter_mut()) {
            for (j, o) in out.iter_mut().enumerate() {
                *o = layer.biases[j] + dot(layer.weights.row(j, layer.inputs), input);
            }
            clamp_relu(out, ceiling);
            input = out;
        }

        *output = out_layer.biases[0] + dot(out_layer.weights.row(0, out_layer.inputs), input);
        *output
    }

    /// Sparse embedding sum: bias plus one weight row per active feature.
    fn accumulate(&self, features: &[u16], acc: &mut [f32]) {
        acc.copy_from_slice(&self.feature_bias);
        for &f in features {
            add_assign(acc, self.feature_row(usize::from(f)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        features::{FeatureIndexer, KingBucketIndexer},
        network::Activation,
        test_support::{positions, small_arch},
    };

    #[test]
    fn prediction_is_deterministic() {
        let net = Network::randomized(&small_arch(), 11);
        let indexer = KingBucketIndexer::default();
        for pos in positions() {
            let features = indexer.features(&pos.record);
            let (a, ta) = net.predict(&features, pos.record.side_to_move());
            let (b, tb) = net.predict(&features, pos.record.side_to_move());
            assert_eq!(a.to_bits(), b.to_bits());
            assert_eq!(ta, tb);
        }
    }

    #[test]
    fn reused_trace_matches_fresh_one() {
        let net = Network::randomized(&small_arch(), 5);
        let indexer = KingBucketIndexer::default();
        let all = positions();
        let mut trace = Trace::new(&net.arch);
        // dirty the buffers with another position first
        let first = indexer.features(&all[0].record);
        net.predict_into(&first, all[0].record.side_to_move(), &mut trace);

        let features = indexer.features(&all[1].record);
        let out = net.predict_into(&features, all[1].record.side_to_move(), &mut trace);
        let (fresh, fresh_trace) = net.predict(&features, all[1].record.side_to_move());
        assert_eq!(out, fresh);
        assert_eq!(trace, fresh_trace);
    }

    #[test]
    fn empty_side_is_bias_only() {
        let arch = Architecture {
            layers: vec![],
            activation: Activation::Relu,
            ..small_arch()
        };
        let mut net = Network::zeroed(&arch);
        net.feature_bias.iter_mut().enumerate().for_each(|(i, b)| *b = i as f32 - 4.);
        net.layers[0].weights.fill(1.);

        let (out, trace) = net.predict(&FeatureSet::default(), Color::White);
        let relu_sum: f32 = net.feature_bias.iter().map(|b| b.max(0.)).sum();
        assert_eq!(trace.accumulator[..16], trace.accumulator[16..]);
        assert_eq!(out, 2. * relu_sum);
    }

    #[test]
    fn side_to_move_orders_the_accumulators() {
        let net = Network::randomized(&small_arch(), 9);
        let indexer = KingBucketIndexer::default();
        let pos = positions()[2].record;
        let features = indexer.features(&pos);
        let (_, white) = net.predict(&features, Color::White);
        let (_, black) = net.predict(&features, Color::Black);
        assert_eq!(white.accumulator[..16], black.accumulator[16..]);
        assert_eq!(white.accumulator[16..], black.accumulator[..16]);
    }
}
