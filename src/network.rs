use crate::{
    aligned::AlignedBuffer,
    error::{Error, Result},
    features::MAX_ACTIVE,
};
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

pub const NETWORK_MAGIC: [u8; 4] = *b"BRKR";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Activation {
    Relu,
    /// ReLU bounded to `[0, max]`, for nets headed for fixed point.
    ClippedRelu { max: f32 },
}

impl Activation {
    pub fn ceiling(self) -> f32 {
        match self {
            Activation::Relu => f32::INFINITY,
            Activation::ClippedRelu { max } => max,
        }
    }

    /// Derivative given the activated value: 1 strictly inside the
    /// unsaturated range, 0 elsewhere.
    pub fn prime(self, activated: f32) -> f32 {
        if activated > 0. && activated < self.ceiling() {
            1.
        } else {
            0.
        }
    }
}

/// Shape of a network, resolved once from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    /// Input feature rows; must match the feature indexer.
    pub inputs: usize,
    /// Accumulator width per perspective.
    pub hidden: usize,
    /// Widths of the dense hidden layers between the accumulators and the
    /// single output. Empty means the accumulators feed the output directly.
    pub layers: Vec<usize>,
    pub activation: Activation,
}

impl Architecture {
    /// `(inputs, outputs)` of every dense layer, output layer last.
    pub fn dense_shapes(&self) -> Vec<(usize, usize)> {
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        let mut width = 2 * self.hidden;
        for &size in self.layers.iter().chain(std::iter::once(&1)) {
            shapes.push((width, size));
            width = size;
        }
        shapes
    }

    pub fn parameter_count(&self) -> usize {
        self.inputs * self.hidden
            + self.hidden
            + self.dense_shapes().iter().map(|(i, o)| i * o + o).sum::<usize>()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DenseLayer {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major `outputs x inputs`.
    pub weights: AlignedBuffer,
    pub biases: AlignedBuffer,
}

impl DenseLayer {
    pub fn zeroed(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: AlignedBuffer::zeroed(inputs * outputs),
            biases: AlignedBuffer::zeroed(outputs),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    pub arch: Architecture,
    /// One row of `hidden` weights per input feature.
    pub feature_weights: AlignedBuffer,
    pub feature_bias: AlignedBuffer,
    /// Dense layers, output layer last.
    pub layers: Vec<DenseLayer>,
}

impl Network {
    pub fn zeroed(arch: &Architecture) -> Self {
        Self {
            feature_weights: AlignedBuffer::zeroed(arch.inputs * arch.hidden),
            feature_bias: AlignedBuffer::zeroed(arch.hidden),
            layers: arch
                .dense_shapes()
                .into_iter()
                .map(|(i, o)| DenseLayer::zeroed(i, o))
                .collect(),
            arch: arch.clone(),
        }
    }

    /// Uniform weights in `±1/sqrt(fan_in)`, zero biases. The input layer's
    /// fan-in is the number of features that can be active at once, not the
    /// number of rows.
    pub fn randomized(arch: &Architecture, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut net = Self::zeroed(arch);
        let mut fill = |buf: &mut AlignedBuffer, fan_in: usize| {
            let limit = 1. / (fan_in as f32).sqrt();
            buf.iter_mut().for_each(|w| *w = rng.gen_range(-limit..limit));
        };

        fill(&mut net.feature_weights, MAX_ACTIVE);
        for layer in &mut net.layers {
            fill(&mut layer.weights, layer.inputs);
        }
        net
    }

    pub fn hidden(&self) -> usize {
        self.arch.hidden
    }

    pub fn feature_row(&self, feature: usize) -> &[f32] {
        self.feature_weights.row(feature, self.arch.hidden)
    }

    /// The bias of the final, single-output layer.
    pub fn output_bias(&self) -> f32 {
        self.layers.last().map_or(0., |l| l.biases[0])
    }

    /// Every parameter tensor in network-file order.
    pub fn tensors(&self) -> Vec<&[f32]> {
        let mut out = vec![self.feature_weights.as_slice(), self.feature_bias.as_slice()];
        for layer in &self.layers {
            out.push(layer.weights.as_slice());
            out.push(layer.biases.as_slice());
        }
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out = vec![
            self.feature_weights.as_mut_slice(),
            self.feature_bias.as_mut_slice(),
        ];
        for layer in &mut self.layers {
            out.push(layer.weights.as_mut_slice());
            out.push(layer.biases.as_mut_slice());
        }
        out
    }

    /// Order-dependent fingerprint of every parameter's bit pattern.
    pub fn hash(&self) -> u64 {
        self.tensors()
            .into_iter()
            .flatten()
            .fold(0u64, |h, x| {
                h.wrapping_add(324_723_947u64.wrapping_add(u64::from(x.to_bits())))
                    ^ 93_485_734_985
            })
    }

    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(&NETWORK_MAGIC)?;
        out.write_all(&self.hash().to_le_bytes())?;
        for tensor in self.tensors() {
            for x in tensor {
                out.write_all(&x.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Reads a network of shape `arch`. The file does not describe its own
    /// shape, so a size mismatch is the only hint of a wrong architecture.
    pub fn read_from(input: &mut impl Read, arch: &Architecture) -> Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != NETWORK_MAGIC {
            return Err(Error::BadMagic {
                expected: NETWORK_MAGIC,
                found: magic,
            });
        }

        let mut hash = [0u8; 8];
        input.read_exact(&mut hash)?;
        info!("Reading network with hash {:x}", u64::from_le_bytes(hash));

        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let expected = 4 * arch.parameter_count() as u64;
        if bytes.len() as u64 != expected {
            return Err(Error::NetworkSize {
                expected,
                found: bytes.len() as u64,
            });
        }

        let mut net = Self::zeroed(arch);
        let mut values = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        for tensor in net.tensors_mut() {
            tensor.iter_mut().zip(&mut values).for_each(|(x, v)| *x = v);
        }
        Ok(net)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, arch: &Architecture) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        Self::read_from(&mut input, arch)
    }

    /// Smallest and largest parameter of each tensor, for eyeballing how
    /// close the weights are to their clamp.
    pub fn min_max(&self) -> Vec<(f32, f32)> {
        self.tensors()
            .into_iter()
            .map(|t| {
                t.iter()
                    .fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_arch;
    use std::io::Cursor;

    #[test]
    fn dense_shapes_chain_to_one_output() {
        let arch = small_arch();
        assert_eq!(arch.dense_shapes(), vec![(32, 8), (8, 1)]);
        let flat = Architecture { layers: vec![], ..arch };
        assert_eq!(flat.dense_shapes(), vec![(32, 1)]);
        assert_eq!(flat.parameter_count(), 768 * 16 + 16 + 32 + 1);
    }

    #[test]
    fn save_then_load_is_bit_exact() {
        let arch = small_arch();
        let net = Network::randomized(&arch, 7);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.nn");

        net.save(&path).unwrap();
        let back = Network::load(&path, &arch).unwrap();

        for (a, b) in net.tensors().into_iter().zip(back.tensors()) {
            assert!(a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
        assert_eq!(net.hash(), back.hash());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let arch = small_arch();
        let mut bytes = Vec::new();
        Network::zeroed(&arch).write_to(&mut bytes).unwrap();
        bytes[0] = b'X';
        let err = Network::read_from(&mut Cursor::new(bytes), &arch).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let arch = small_arch();
        let mut bytes = Vec::new();
        Network::zeroed(&arch).write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 4);
        let err = Network::read_from(&mut Cursor::new(bytes), &arch).unwrap_err();
        assert!(matches!(err, Error::NetworkSize { .. }));
    }

    #[test]
    fn hash_sees_small_changes() {
        let arch = small_arch();
        let mut net = Network::randomized(&arch, 1);
        let before = net.hash();
        net.layers[0].weights[3] += 1e-6;
        assert_ne!(before, net.hash());
    }

    #[test]
    fn randomized_is_seeded() {
        let arch = small_arch();
        assert_eq!(Network::randomized(&arch, 3), Network::randomized(&arch, 3));
        assert_ne!(Network::randomized(&arch, 3), Network::randomized(&arch, 4));
    }
}
