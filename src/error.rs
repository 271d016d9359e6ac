use std::{io, path::PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can abort a training run. All of these point at a corrupt
/// or incompatible artifact (or a bad configuration), so callers are expected
/// to give up rather than retry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{path}: expected {expected} records but only {read} could be read")]
    ShortRead {
        path: PathBuf,
        expected: u64,
        read: u64,
    },

    #[error("{path}: file length {len} is not a whole number of {record_size}-byte records")]
    RecordCount {
        path: PathBuf,
        len: u64,
        record_size: usize,
    },

    #[error("invalid position record: {0}")]
    InvalidRecord(String),

    #[error("unable to parse line ({reason}): {line}")]
    InvalidFen { line: String, reason: &'static str },

    #[error("network file magic {found:?} does not match {expected:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("network file holds {found} bytes of parameters, architecture needs {expected}")]
    NetworkSize { expected: u64, found: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("the background loader stopped unexpectedly")]
    LoaderStopped,
}
