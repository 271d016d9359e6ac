use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use nnue_trainer::{
    dataloader::{read_all, shuffle_on_disk, TrainingData},
    loss::EVAL_SCALE,
    packer::{import_bulletformat, pack_text},
    Network, Trainer, TrainerConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train NNUE chess evaluation networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a network on a binpack file
    Train {
        /// TOML configuration; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Training positions
        #[arg(long)]
        data: PathBuf,
        /// Positions used for the per-epoch validation loss
        #[arg(long)]
        validation: Option<PathBuf>,
        /// Network to continue from instead of a random one
        #[arg(long)]
        start: Option<PathBuf>,
        /// Where the final network is written
        #[arg(long, default_value = "network.bin")]
        output: PathBuf,
    },
    /// Shuffle a binpack file that may not fit in memory
    Shuffle {
        input: PathBuf,
        output: PathBuf,
        /// Records shuffled in memory at a time
        #[arg(long, default_value_t = 1 << 24)]
        chunk_records: usize,
        /// Directory for the temporary chunk files
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Pack annotated FEN lines ("<fen> [1.0] <eval>") into binpack
    Pack {
        input: PathBuf,
        output: PathBuf,
        /// Stop after this many positions
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Convert a bulletformat file into binpack
    Import { input: PathBuf, output: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train {
            config,
            data,
            validation,
            start,
            output,
        } => {
            let config = match config {
                Some(path) => TrainerConfig::load(&path)
                    .with_context(|| format!("loading configuration from {}", path.display()))?,
                None => TrainerConfig::default(),
            };

            let start = match start {
                Some(path) => Some(
                    Network::load(&path, &config.architecture())
                        .with_context(|| format!("loading start network {}", path.display()))?,
                ),
                None => None,
            };
            let validation = match validation {
                Some(path) => read_all(&path).with_context(|| format!("reading {}", path.display()))?,
                None => Vec::new(),
            };
            let mut data = TrainingData::open(&data, config.records_per_load, config.seed)
                .with_context(|| format!("opening {}", data.display()))?;

            let mut trainer = Trainer::new(&config, start)?;
            trainer.run(&mut data, &validation)?;

            for (i, (min, max)) in trainer.net.min_max().into_iter().enumerate() {
                info!("Tensor {i}: min {min:.4} max {max:.4}");
            }
            trainer
                .net
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("Wrote {} (hash {:x})", output.display(), trainer.net.hash());
        }
        Command::Shuffle {
            input,
            output,
            chunk_records,
            temp_dir,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(seed);
            let n = shuffle_on_disk(&input, &output, chunk_records, temp_dir.as_deref(), &mut rng)?;
            info!("Shuffled {n} records into {}", output.display());
        }
        Command::Pack { input, output, limit } => {
            pack_text(&input, &output, limit, EVAL_SCALE)?;
        }
        Command::Import { input, output } => {
            import_bulletformat(&input, &output, EVAL_SCALE)?;
        }
    }

    Ok(())
}
