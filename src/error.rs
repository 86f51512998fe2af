//! The errors the engine can surface, as one closed sum type.
//!
//! Transient faults inside a subsystem (a timed out DHT query, a failed
//! tracker announce) are absorbed and scored locally; what crosses a
//! component boundary is always one of these variants.

use std::path::PathBuf;

use thiserror::Error;

use crate::PieceIndex;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer's handshake was malformed or advertised the wrong info hash.
    /// Closes the peer connection.
    #[error("peer handshake error")]
    Handshake,

    /// A peer wire message could not be parsed. Closes the peer connection.
    #[error("peer message error")]
    Message,

    /// A peer sent a bitfield message after the initial availability
    /// exchange, which the protocol forbids.
    #[error("bitfield sent not directly after handshake")]
    BitfieldNotAfterHandshake,

    /// Disk read or write failure with the originating path.
    #[error("disk error at {path:?}")]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The disk write queue is saturated. The operation is retryable.
    #[error("disk write queue full")]
    QueueFull,

    /// No checkpoint exists for the torrent. Loading yields empty state.
    #[error("checkpoint not found")]
    CheckpointNotFound,

    /// The checkpoint file exists but could not be parsed or failed its
    /// integrity checks.
    #[error("checkpoint corrupted: {0}")]
    CheckpointCorrupted(String),

    /// The checkpoint was written by an incompatible version.
    #[error("incompatible checkpoint version: {0}")]
    CheckpointVersion(String),

    /// A torrent, bencode, or configuration structural fault, rejected at
    /// the boundary where it was detected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transient network failure; the caller may retry.
    #[error("network error: {0}")]
    Network(String),

    /// An operation did not complete within its timeout budget.
    #[error("operation timed out")]
    Timeout,

    /// The session or task was shut down while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    /// A peer failed a security check and is dropped.
    #[error("peer validation failed")]
    PeerValidation,

    /// A peer exceeded its rate budget and is dropped.
    #[error("peer rate limited")]
    RateLimit,

    /// The piece index is invalid in the context of the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    /// The torrent id does not correspond to a torrent in the engine.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// A channel to another engine task was unexpectedly closed. Always a
    /// shutdown artifact or a bug.
    #[error("engine channel error")]
    Channel,
}

impl Error {
    /// The session-level exit code associated with this error.
    ///
    /// 0 is success (never produced by an error), 1 a generic error,
    /// 2 a configuration error, 3 an I/O error, 4 a protocol error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) => 2,
            Error::Disk { .. } | Error::QueueFull => 3,
            Error::Handshake
            | Error::Message
            | Error::BitfieldNotAfterHandshake => 4,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Disk {
            path: PathBuf::new(),
            source: e,
        }
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Validation(format!("bencode: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Validation("bad".into()).exit_code(), 2);
        assert_eq!(
            Error::Disk {
                path: PathBuf::from("/x"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::Handshake.exit_code(), 4);
        assert_eq!(Error::Message.exit_code(), 4);
        assert_eq!(Error::Timeout.exit_code(), 1);
    }
}
