use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open report {uri}: {reason}")]
    Open { uri: String, reason: String },
    #[error("report {uri} already exists and overwrite is disabled")]
    Exists { uri: String },
    #[error(
        "report {uri} cannot be shared by {writers} writers without \
         overwrite mode"
    )]
    ConcurrentWriteUnsupported { uri: String, writers: usize },
    #[error("invalid report header: {0}")]
    InvalidHeader(String),
    #[error("layout error for gid {gid}: {reason}")]
    Layout { gid: u32, reason: String },
    #[error(
        "gid {gid} expects {expected} compartments per frame, got {found}"
    )]
    Size {
        gid: u32,
        expected: usize,
        found: usize,
    },
    #[error("{operation} called out of order: {reason}")]
    OutOfOrder {
        operation: &'static str,
        reason: &'static str,
    },
    #[error("timestamp {timestamp} is not a frame of this report")]
    NoSuchFrame { timestamp: f64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn open(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::Open {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn layout(gid: u32, reason: impl ToString) -> Self {
        Self::Layout {
            gid,
            reason: reason.to_string(),
        }
    }
}
