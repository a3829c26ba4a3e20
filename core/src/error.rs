use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Pipeline stage an I/O failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the corpus or a snapshot.
    Read,
    /// Writing a partial index to the intermediate store.
    Stage,
    /// Listing or reading staged partial indexes.
    Merge,
    /// Writing the final snapshot.
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Stage => "stage",
            Stage::Merge => "merge",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{stage} failed on {}: {source}", .path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Recovered locally by the map worker; never aborts a run.
    #[error("line {line}: expected at least {expected} fields, found {found}")]
    Schema {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("cannot encode partial index for chunk {chunk_id}: {source}")]
    Encode {
        chunk_id: usize,
        #[source]
        source: bincode::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    pub fn io<P: AsRef<Path>>(stage: Stage, path: P, source: io::Error) -> Self {
        IndexError::Io { stage, path: path.as_ref().to_path_buf(), source }
    }

    pub fn decode<P, E>(path: P, source: E) -> Self
    where
        P: AsRef<Path>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        IndexError::Decode { path: path.as_ref().to_path_buf(), source: source.into() }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        IndexError::Config(msg.into())
    }

    /// Whether retrying the same unit of work could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Io { .. })
    }
}
