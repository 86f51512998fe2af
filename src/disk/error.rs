//! Error types of the disk task.

use std::path::PathBuf;

use thiserror::Error;

use crate::{PieceIndex, TorrentId};

/// The disk task's result type.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors of the disk task itself (not tied to a single torrent).
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// A channel to or from the disk task was unexpectedly closed.
    #[error("disk channel error")]
    Channel,
    /// The torrent id is not registered with the disk task.
    #[error("invalid torrent id {0}")]
    InvalidTorrentId(TorrentId),
    /// The torrent's write queue is saturated; the write should be retried.
    #[error("disk write queue full")]
    QueueFull,
}

impl From<Error> for crate::error::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::QueueFull => crate::error::Error::QueueFull,
            Error::InvalidTorrentId(_) => {
                crate::error::Error::InvalidTorrentId
            }
            Error::Channel => crate::error::Error::Channel,
        }
    }
}

/// Errors of allocating a new torrent on disk.
#[derive(Debug, Error)]
pub(crate) enum NewTorrentError {
    #[error("torrent already allocated")]
    AlreadyExists,
    #[error("disk IO error at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors of writing piece payloads to disk.
#[derive(Debug, Error)]
pub(crate) enum WriteError {
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),
    #[error("disk IO error at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors of reading blocks back from disk.
#[derive(Debug, Error)]
pub(crate) enum ReadError {
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("disk IO error at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
