use crate::{
    error::{Error, Result},
    features::{FeatureIndexer, KingBucketIndexer},
    loss::LossConfig,
    network::{Activation, Architecture},
    optimizer::{AdamConfig, LrSchedule},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Network shape; the input width comes from the feature indexer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub hidden: usize,
    pub layers: Vec<usize>,
    pub activation: Activation,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden: 256,
            layers: Vec::new(),
            activation: Activation::ClippedRelu { max: 1. },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Output path, `{epoch}` is replaced by the epoch number.
    pub pattern: String,
    /// Save after every `every` epochs; 0 never saves.
    pub every: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            pattern: "nets/epoch-{epoch}.bin".to_string(),
            every: 1,
        }
    }
}

impl CheckpointConfig {
    pub fn path_for(&self, epoch: usize) -> String {
        self.pattern.replace("{epoch}", &epoch.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    pub network: NetworkConfig,
    pub features: KingBucketIndexer,
    pub loss: LossConfig,
    pub optimizer: AdamConfig,
    pub schedule: LrSchedule,
    pub threads: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
    /// Stream the training file in chunks of this many records instead of
    /// loading it whole.
    pub records_per_load: Option<usize>,
    pub checkpoint: CheckpointConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            features: KingBucketIndexer::default(),
            loss: LossConfig::default(),
            optimizer: AdamConfig::default(),
            schedule: LrSchedule::default(),
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            batch_size: 16_384,
            epochs: 22,
            seed: 0,
            records_per_load: None,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn architecture(&self) -> Architecture {
        Architecture {
            inputs: self.features.inputs(),
            hidden: self.network.hidden,
            layers: self.network.layers.clone(),
            activation: self.network.activation,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.threads == 0 {
            return fail("threads must be at least 1".into());
        }
        if self.batch_size < self.threads {
            return fail(format!(
                "batch size {} is smaller than the thread count {}",
                self.batch_size, self.threads
            ));
        }
        if self.epochs == 0 {
            return fail("epochs must be at least 1".into());
        }
        if self.network.hidden == 0 {
            return fail("hidden size must be at least 1".into());
        }
        if let Some(n) = self.network.layers.iter().position(|&w| w == 0) {
            return fail(format!("dense layer {n} has no neurons"));
        }
        if let Activation::ClippedRelu { max } = self.network.activation {
            if max.is_nan() || max <= 0. {
                return fail(format!("clipped relu ceiling {max} must be positive"));
            }
        }
        for (name, clamp) in [
            ("clamp_input", self.optimizer.clamp_input),
            ("clamp_dense", self.optimizer.clamp_dense),
        ] {
            if clamp.is_some_and(|c| c.is_nan() || c <= 0.) {
                return fail(format!("{name} must be positive"));
            }
        }
        if !(0. ..=1.).contains(&self.loss.wdl_weight) {
            return fail(format!("wdl_weight {} is outside [0, 1]", self.loss.wdl_weight));
        }
        if self.loss.power.is_nan() || self.loss.power < 1. {
            return fail(format!("loss power {} must be at least 1", self.loss.power));
        }
        if let LrSchedule::Step { every: 0, .. } = self.schedule {
            return fail("step schedule interval must be at least 1".into());
        }
        if self.records_per_load == Some(0) {
            return fail("records_per_load must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{features::BUCKET_INPUTS, optimizer::MomentumMode};

    #[test]
    fn defaults_are_valid() {
        let config = TrainerConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.architecture().inputs, BUCKET_INPUTS);
    }

    #[test]
    fn parses_a_full_file() {
        let text = r#"
            threads = 4
            batch_size = 1024
            epochs = 3
            seed = 7
            records_per_load = 100000

            [network]
            hidden = 64
            layers = [16, 8]
            activation = { kind = "relu" }

            [features]
            mirror = true

            [loss]
            wdl_weight = 0.25
            power = 2.5

            [optimizer]
            mode = "age_aware"
            clamp_input = 1.98

            [schedule]
            kind = "step"
            initial = 0.001
            gamma = 0.3
            every = 10

            [checkpoint]
            pattern = "out/{epoch}.net"
            every = 2
        "#;
        let config = TrainerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.network.layers, vec![16, 8]);
        assert_eq!(config.network.activation, Activation::Relu);
        assert!(config.features.mirror);
        assert_eq!(config.optimizer.mode, MomentumMode::AgeAware);
        assert_eq!(config.optimizer.clamp_input, Some(1.98));
        assert_eq!(config.optimizer.beta1, 0.9);
        assert_eq!(config.schedule.rate(11), 0.001 * 0.3);
        assert_eq!(config.checkpoint.path_for(4), "out/4.net");
        assert_eq!(config.records_per_load, Some(100_000));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            TrainerConfig::from_toml_str("thraeds = 4"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn bucket_tables_are_checked_on_load() {
        let mut table = vec![0u8; 64];
        table[0] = 2;
        let text = format!("[features]\nbuckets = {table:?}\n");
        assert!(TrainerConfig::from_toml_str(&text).is_err());

        table[1] = 1;
        let config = TrainerConfig::from_toml_str(&format!("[features]\nbuckets = {table:?}\n")).unwrap();
        assert_eq!(config.architecture().inputs, 3 * BUCKET_INPUTS);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases: [fn(&mut TrainerConfig); 9] = [
            |c| c.threads = 0,
            |c| c.batch_size = c.threads - 1,
            |c| c.network.hidden = 0,
            |c| c.network.layers = vec![8, 0],
            |c| c.optimizer.clamp_dense = Some(0.),
            |c| c.loss.wdl_weight = 1.5,
            |c| c.loss.power = 0.5,
            |c| c.network.activation = Activation::ClippedRelu { max: 0. },
            |c| c.records_per_load = Some(0),
        ];
        for (i, break_it) in cases.iter().enumerate() {
            let mut config = TrainerConfig {
                threads: 2,
                ..TrainerConfig::default()
            };
            break_it(&mut config);
            assert!(matches!(config.validate(), Err(Error::Config(_))), "case {i}");
        }
    }
}
