use crate::{
    accumulator::Trace,
    config::{CheckpointConfig, TrainerConfig},
    dataloader::{shuffle_in_memory, TrainingData},
    error::{Error, Result},
    features::FeatureIndexer,
    gradients::{reduce_into, BackwardScratch, GradientBuffer},
    loss::{sigmoid, Example, LossConfig},
    network::{Architecture, Network},
    optimizer::{Adam, LrSchedule},
    record::PositionRecord,
};
use log::{debug, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    ShuffleEpoch,
    TrainBatch,
    Validate,
    Checkpoint,
    Done,
}

/// Mutable progress of a run, handed to whatever needs it.
#[derive(Clone, Debug)]
pub struct TrainerState {
    /// 1-based once training starts.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub iteration: u64,
    pub learning_rate: f32,
    /// Iteration at which each input row was last updated.
    pub feature_last_seen: Vec<u64>,
    pub phase: Phase,
}

impl TrainerState {
    pub fn new(arch: &Architecture, learning_rate: f32) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            learning_rate,
            feature_last_seen: vec![0; arch.inputs],
            phase: Phase::Init,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchReport {
    /// Mean loss over the batch, before the update.
    pub loss: f32,
    pub skipped_updates: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub validation_loss: Option<f32>,
    pub positions: u64,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Forward/backward scratch owned by one worker.
struct Worker {
    trace: Trace,
    scratch: BackwardScratch,
}

pub struct Trainer {
    pub net: Network,
    pub optimizer: Adam,
    pub state: TrainerState,
    indexer: Box<dyn FeatureIndexer>,
    loss: LossConfig,
    schedule: LrSchedule,
    batch_size: usize,
    epochs: usize,
    checkpoint: CheckpointConfig,
    pool: ThreadPool,
    workers: Vec<Worker>,
    grads: Vec<GradientBuffer>,
    total: GradientBuffer,
    rng: StdRng,
}

impl Trainer {
    /// Starts from `net` when given, otherwise from a seeded random network.
    pub fn new(config: &TrainerConfig, net: Option<Network>) -> Result<Self> {
        config.validate()?;
        let arch = config.architecture();
        let net = match net {
            Some(net) if net.arch != arch => {
                return Err(Error::Config(format!(
                    "starting network has shape {:?}, configuration asks for {arch:?}",
                    net.arch
                )))
            }
            Some(net) => net,
            None => Network::randomized(&arch, config.seed),
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("trainer-{i}"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        info!(
            "Training {} parameters ({} inputs, {} hidden, dense {:?}) on {} threads",
            arch.parameter_count(),
            arch.inputs,
            arch.hidden,
            arch.layers,
            config.threads
        );

        Ok(Self {
            optimizer: Adam::new(&net, config.optimizer.clone()),
            state: TrainerState::new(&arch, config.schedule.rate(1)),
            indexer: Box::new(config.features.clone()),
            loss: config.loss.clone(),
            schedule: config.schedule.clone(),
            batch_size: config.batch_size,
            epochs: config.epochs,
            checkpoint: config.checkpoint.clone(),
            pool,
            workers: (0..config.threads)
                .map(|_| Worker {
                    trace: Trace::new(&arch),
                    scratch: BackwardScratch::new(&arch),
                })
                .collect(),
            grads: (0..config.threads).map(|_| GradientBuffer::new(&arch)).collect(),
            total: GradientBuffer::new(&arch),
            rng: StdRng::seed_from_u64(config.seed),
            net,
        })
    }

    /// One optimizer step over `batch`, split into contiguous slices across
    /// the workers.
    pub fn train_batch<E: Example>(&mut self, batch: &[E]) -> BatchReport {
        if batch.is_empty() {
            return BatchReport::default();
        }

        for grads in &mut self.grads {
            grads.clear();
        }

        let slice_len = batch.len().div_ceil(self.workers.len());
        let net = &self.net;
        let indexer = &*self.indexer;
        let loss = &self.loss;
        let workers = &mut self.workers;
        let grads = &mut self.grads;

        let losses: Vec<f32> = self.pool.install(|| {
            workers
                .par_iter_mut()
                .zip(grads.par_iter_mut())
                .zip(batch.par_chunks(slice_len))
                .map(|((worker, grads), slice)| {
                    let mut sum = 0.;
                    for example in slice {
                        let record = example.record();
                        let features = indexer.features(record);
                        let stm = record.side_to_move();
                        net.predict_into(&features, stm, &mut worker.trace);
                        sum += net.backward(
                            &features,
                            stm,
                            &worker.trace,
                            &example.target(),
                            loss,
                            grads,
                            &mut worker.scratch,
                        );
                    }
                    sum
                })
                .collect()
        });

        reduce_into(&mut self.total, &self.grads);
        let step = self.optimizer.step(&mut self.net, &self.total, &mut self.state);
        if step.skipped > 0 {
            warn!(
                "Skipped {} non-finite updates at iteration {}",
                step.skipped, self.state.iteration
            );
        }

        BatchReport {
            loss: losses.iter().sum::<f32>() / batch.len() as f32,
            skipped_updates: step.skipped,
        }
    }

    /// Mean loss over `examples` without touching the network.
    pub fn validate<E: Example>(&self, examples: &[E]) -> f32 {
        if examples.is_empty() {
            return 0.;
        }

        let slice_len = examples.len().div_ceil(self.workers.len());
        let net = &self.net;
        let indexer = &*self.indexer;
        let loss = &self.loss;

        let sums: Vec<f32> = self.pool.install(|| {
            examples
                .par_chunks(slice_len)
                .map(|slice| {
                    let mut trace = Trace::new(&net.arch);
                    slice
                        .iter()
                        .map(|example| {
                            let record = example.record();
                            let features = indexer.features(record);
                            let out = net.predict_into(&features, record.side_to_move(), &mut trace);
                            loss.error(sigmoid(out, loss.scale), &example.target())
                        })
                        .sum::<f32>()
                })
                .collect()
        });

        sums.iter().sum::<f32>() / examples.len() as f32
    }

    /// Runs every configured epoch over `data`, validating on `validation`
    /// (skipped when empty) and writing checkpoints as configured.
    pub fn run(&mut self, data: &mut TrainingData, validation: &[PositionRecord]) -> Result<Vec<EpochReport>> {
        self.state.phase = Phase::Init;
        let mut reports = Vec::with_capacity(self.epochs);

        for epoch in 1..=self.epochs {
            let start = Instant::now();
            self.state.epoch = epoch;
            self.apply_schedule(epoch);

            let mut totals = EpochTotals::default();
            match data {
                TrainingData::Resident(records) => {
                    self.state.phase = Phase::ShuffleEpoch;
                    shuffle_in_memory(records, &mut self.rng);
                    self.train_records(records, &mut totals);
                }
                TrainingData::Streamed {
                    loader,
                    loads_per_epoch,
                } => {
                    for _ in 0..*loads_per_epoch {
                        self.state.phase = Phase::ShuffleEpoch;
                        let chunk = loader.next_chunk()?;
                        self.train_records(&chunk, &mut totals);
                    }
                }
            }

            self.state.phase = Phase::Validate;
            let validation_loss = (!validation.is_empty()).then(|| self.validate(validation));

            self.state.phase = Phase::Checkpoint;
            if self.checkpoint.every > 0 && epoch % self.checkpoint.every == 0 {
                self.save_checkpoint(epoch)?;
            }

            let report = EpochReport {
                epoch,
                learning_rate: self.state.learning_rate,
                train_loss: totals.mean(),
                validation_loss,
                positions: totals.positions,
                batches: totals.batches,
                elapsed: start.elapsed(),
            };
            let speed = report.positions as f64 / report.elapsed.as_secs_f64().max(1e-9);
            match validation_loss {
                Some(v) => info!(
                    "Epoch {epoch:>3} | lr {:.2e} | train {:.6} | validation {v:.6} | {speed:.0} pos/s",
                    report.learning_rate, report.train_loss
                ),
                None => info!(
                    "Epoch {epoch:>3} | lr {:.2e} | train {:.6} | {speed:.0} pos/s",
                    report.learning_rate, report.train_loss
                ),
            }
            reports.push(report);
        }

        self.state.phase = Phase::Done;
        Ok(reports)
    }

    fn apply_schedule(&mut self, epoch: usize) {
        let lr = self.schedule.rate(epoch);
        if lr != self.state.learning_rate {
            info!("Learning rate {:.2e} -> {lr:.2e}", self.state.learning_rate);
            if self.optimizer.config.reset_on_lr_drop {
                self.optimizer.reset();
            }
        }
        self.state.learning_rate = lr;
    }

    fn train_records(&mut self, records: &[PositionRecord], totals: &mut EpochTotals) {
        self.state.phase = Phase::TrainBatch;
        for batch in records.chunks(self.batch_size) {
            let report = self.train_batch(batch);
            totals.loss += f64::from(report.loss) * batch.len() as f64;
            totals.positions += batch.len() as u64;
            totals.batches += 1;
            debug!(
                "Batch {:>6} | loss {:.6} | iteration {}",
                totals.batches, report.loss, self.state.iteration
            );
        }
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let path = self.checkpoint.path_for(epoch);
        if let Some(parent) = Path::new(&path).parent() {
            fs::create_dir_all(parent)?;
        }
        self.net.save(&path)?;
        info!("Saved {path} (hash {:x})", self.net.hash());
        Ok(())
    }
}

#[derive(Default)]
struct EpochTotals {
    loss: f64,
    positions: u64,
    batches: usize,
}

impl EpochTotals {
    fn mean(&self) -> f32 {
        if self.positions == 0 {
            0.
        } else {
            (self.loss / self.positions as f64) as f32
        }
    }
}
