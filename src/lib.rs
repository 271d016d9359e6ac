//! Trainer for efficiently updatable chess evaluation networks: a sparse,
//! king-bucketed input layer feeding small dense layers, learned with Adam
//! from packed position files.

pub mod accumulator;
pub mod aligned;
pub mod config;
pub mod dataloader;
pub mod error;
pub mod features;
pub mod gradients;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod packer;
pub mod record;
pub mod simd;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use config::TrainerConfig;
pub use error::{Error, Result};
pub use network::Network;
pub use trainer::Trainer;
