//! Binpack files: reading, writing, shuffling and background streaming of
//! [`PositionRecord`]s.

use crate::{
    error::{Error, Result},
    record::{PositionRecord, RECORD_SIZE},
};
use bytemuck::Zeroable;
use log::{debug, info};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// Number of records in a binpack file.
pub fn count_records(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let len = fs::metadata(path)?.len();
    if len % RECORD_SIZE as u64 != 0 {
        return Err(Error::RecordCount {
            path: path.to_path_buf(),
            len,
            record_size: RECORD_SIZE,
        });
    }
    Ok(len / RECORD_SIZE as u64)
}

/// Reads `n` records starting at record `offset`. Running out of file before
/// `n` records is an error, as is any record that fails validation.
pub fn read_records(path: impl AsRef<Path>, offset: u64, n: usize) -> Result<Vec<PositionRecord>> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    read_records_at(&mut file, path, offset, n)
}

fn read_records_at(file: &mut File, path: &Path, offset: u64, n: usize) -> Result<Vec<PositionRecord>> {
    file.seek(SeekFrom::Start(offset * RECORD_SIZE as u64))?;
    read_exact_records(file, path, n)
}

fn read_exact_records(reader: &mut impl Read, path: &Path, n: usize) -> Result<Vec<PositionRecord>> {
    let mut records = vec![PositionRecord::zeroed(); n];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut records);
    let filled = read_up_to(reader, bytes)?;
    if filled < bytes.len() {
        return Err(Error::ShortRead {
            path: path.to_path_buf(),
            expected: n as u64,
            read: (filled / RECORD_SIZE) as u64,
        });
    }
    for record in &records {
        record.validate()?;
    }
    Ok(records)
}

/// The whole file in memory.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<PositionRecord>> {
    let path = path.as_ref();
    let n = count_records(path)?;
    read_records(path, 0, n as usize)
}

pub fn write_records(out: &mut impl Write, records: &[PositionRecord]) -> Result<()> {
    out.write_all(bytemuck::cast_slice(records))?;
    Ok(())
}

/// Fills `buf` as far as the input allows; less than `buf.len()` means EOF.
pub fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

pub fn shuffle_in_memory(records: &mut [PositionRecord], rng: &mut impl Rng) {
    records.shuffle(rng);
}

struct Spill {
    reader: BufReader<File>,
    left: u64,
}

/// Shuffles a binpack file too large for memory. The input is cut into
/// chunks of `chunk_records`, each shuffled and spilled to an anonymous temp
/// file (in `temp_dir`, or the system default), and the spills are merged by
/// drawing one record at a time from a spill picked with probability
/// proportional to the records it has left. Returns the record count.
pub fn shuffle_on_disk(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    chunk_records: usize,
    temp_dir: Option<&Path>,
    rng: &mut impl Rng,
) -> Result<u64> {
    if chunk_records == 0 {
        return Err(Error::Config("shuffle chunk size must be at least one record".into()));
    }
    let input = input.as_ref();
    let total = count_records(input)?;
    let mut reader = BufReader::new(File::open(input)?);

    let mut spills = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let n = remaining.min(chunk_records as u64) as usize;
        let mut chunk = read_exact_records(&mut reader, input, n)?;
        shuffle_in_memory(&mut chunk, rng);

        let mut file = match temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut writer = BufWriter::new(&mut file);
        write_records(&mut writer, &chunk)?;
        writer.flush()?;
        drop(writer);
        file.rewind()?;

        spills.push(Spill {
            reader: BufReader::new(file),
            left: n as u64,
        });
        remaining -= n as u64;
    }
    info!("Shuffling {total} records through {} temp files", spills.len());

    let mut out = BufWriter::new(File::create(output.as_ref())?);
    let mut record = [0u8; RECORD_SIZE];
    let mut left = total;
    while left > 0 {
        let mut pick = rng.gen_range(0..left);
        let mut i = 0;
        while pick >= spills[i].left {
            pick -= spills[i].left;
            i += 1;
        }

        spills[i].reader.read_exact(&mut record)?;
        out.write_all(&record)?;
        spills[i].left -= 1;
        if spills[i].left == 0 {
            // closing the handle deletes the temp file
            spills.swap_remove(i);
        }
        left -= 1;
    }
    out.flush()?;

    Ok(total)
}

/// Streams a binpack file in shuffled chunks from a background thread,
/// starting over from the top whenever the next chunk would run past the end.
pub struct CyclicLoader {
    receiver: Option<Receiver<Result<Vec<PositionRecord>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    total: u64,
}

impl CyclicLoader {
    pub fn spawn(path: impl Into<PathBuf>, records_per_load: usize, seed: u64) -> Result<Self> {
        let path = path.into();
        let total = count_records(&path)?;
        if total == 0 {
            return Err(Error::Config(format!("{} holds no records", path.display())));
        }
        if records_per_load == 0 {
            return Err(Error::Config("records per load must be at least one".into()));
        }
        let file = File::open(&path)?;

        let (sender, receiver) = sync_channel(0);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let per_load = (records_per_load as u64).min(total);
        let handle = thread::Builder::new()
            .name("loader".into())
            .spawn(move || load_loop(file, &path, total, per_load, seed, &sender, &flag))?;

        Ok(Self {
            receiver: Some(receiver),
            stop,
            handle: Some(handle),
            total,
        })
    }

    /// Records in the underlying file.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Blocks until the loader hands over its next chunk.
    pub fn next_chunk(&self) -> Result<Vec<PositionRecord>> {
        match self.receiver.as_ref().map(Receiver::recv) {
            Some(Ok(chunk)) => chunk,
            _ => Err(Error::LoaderStopped),
        }
    }
}

fn load_loop(
    mut file: File,
    path: &Path,
    total: u64,
    per_load: u64,
    seed: u64,
    sender: &SyncSender<Result<Vec<PositionRecord>>>,
    stop: &AtomicBool,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut offset = 0;

    while !stop.load(Ordering::Relaxed) {
        if offset + per_load > total {
            debug!("Loader wrapped after {offset} records");
            offset = 0;
        }

        let chunk = read_records_at(&mut file, path, offset, per_load as usize).map(|mut chunk| {
            shuffle_in_memory(&mut chunk, &mut rng);
            chunk
        });
        offset += per_load;

        let failed = chunk.is_err();
        if sender.send(chunk).is_err() || failed {
            break;
        }
    }
}

impl Drop for CyclicLoader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // unblocks a pending send
        drop(self.receiver.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Where the trainer gets its positions from.
pub enum TrainingData {
    /// Everything in memory, reshuffled every epoch.
    Resident(Vec<PositionRecord>),
    /// `loads_per_epoch` chunks from a background loader make up an epoch.
    Streamed { loader: CyclicLoader, loads_per_epoch: usize },
}

impl TrainingData {
    /// Loads `path` into memory, or streams it in chunks of
    /// `records_per_load` when given.
    pub fn open(path: impl AsRef<Path>, records_per_load: Option<usize>, seed: u64) -> Result<Self> {
        let path = path.as_ref();
        match records_per_load {
            None => {
                let records = read_all(path)?;
                info!("Loaded {} records from {}", records.len(), path.display());
                Ok(TrainingData::Resident(records))
            }
            Some(per_load) => {
                let loader = CyclicLoader::spawn(path, per_load, seed)?;
                // the loader skips a tail shorter than one load before wrapping
                let per_load = (per_load as u64).min(loader.total());
                let loads_per_epoch = (loader.total() / per_load).max(1) as usize;
                info!(
                    "Streaming {} records from {} in {loads_per_epoch} loads per epoch",
                    loader.total(),
                    path.display()
                );
                Ok(TrainingData::Streamed {
                    loader,
                    loads_per_epoch,
                })
            }
        }
    }
}
