use thiserror::Error;

use crate::{fabric::FabricError, report};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Report(#[from] report::Error),
    #[error("transport error: {0}")]
    Transport(#[from] FabricError),
    #[error("input has no frame {index} at t={timestamp}")]
    MissingFrame { index: u64, timestamp: f64 },
    #[error(
        "{workers} workers pre-queue {prequeue} frames each, more than the \
         {frames} frames to convert"
    )]
    TooManyWorkers {
        workers: usize,
        prequeue: u64,
        frames: u64,
    },
    #[error("verification failed: {what}")]
    VerifyMismatch { what: String },
}

impl Error {
    pub(crate) fn mismatch(what: impl Into<String>) -> Self {
        Self::VerifyMismatch { what: what.into() }
    }
}
