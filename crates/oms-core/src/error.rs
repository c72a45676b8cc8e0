//! Error types for the scheduling core.
//!
//! Mirrors `sem_os_core::error::SemOsError`: one top-level enum that
//! aggregates the lower per-concern error types via `#[from]`, used
//! internally with `?`. Per spec.md §7, most of these are logged and
//! turned into a filesystem-visible state change (a file moved to
//! `history/` with status `error`, a compute server marked `Error`) rather
//! than surfaced to peers — peers only ever observe the filesystem.

use thiserror::Error;

use crate::compute::ComputeConfigError;
use crate::diskuse::DiskConfigError;
use crate::paths::PathCodecError;
use crate::stamp::StampError;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("path codec: {0}")]
    PathCodec(#[from] PathCodecError),

    #[error("stamp: {0}")]
    Stamp(#[from] StampError),

    #[error("compute config: {0}")]
    ComputeConfig(#[from] ComputeConfigError),

    #[error("disk config: {0}")]
    DiskConfig(#[from] DiskConfigError),

    #[error("i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed job file {0}")]
    MalformedJob(String),

    #[error("template render failed for job {job}: {message}")]
    TemplateRender { job: String, message: String },

    #[error("resource packing failed: demand cpu={cpu} mem={mem} exceeds available capacity")]
    DoesNotFit { cpu: u32, mem: u64 },
}

impl SchedError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SchedResult<T> = Result<T, SchedError>;
