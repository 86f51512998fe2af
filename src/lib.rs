// the deeper select! trees in the task loops overflow the default macro
// recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod checkpoint;
pub mod conf;
mod counter;
mod dht;
mod disk;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece;
mod storage_info;
mod torrent;
mod tracker;

use std::net::SocketAddr;

use bitvec::prelude::{BitVec, Msb0};

pub use checkpoint::{CheckpointStore, TorrentCheckpoint};
pub use conf::Conf;
pub use storage_info::{FileInfo, FsStructure};

/// A piece's index within its torrent.
///
/// `usize` in memory for natural indexing into the piece vectors; the wire
/// carries it as a 4 byte big endian integer.
pub type PieceIndex = usize;

/// A file's index within a torrent's flattened file list.
pub type FileIndex = usize;

/// Identifies a torrent within the engine for the lifetime of the process.
pub type TorrentId = u32;

/// Our own or a remote peer's 20 byte id, as exchanged in the handshake
/// (BEP-20 describes the common naming conventions).
pub type PeerId = [u8; 20];

/// Peers are keyed by their socket address for availability tracking and
/// request accounting.
pub type PeerKey = SocketAddr;

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long. Used by v2 and hybrid torrents.
pub type Sha256Hash = [u8; 32];

/// The 20 byte torrent identifier: the SHA-1 of the bencoded info dictionary
/// for v1 torrents, or the truncated SHA-256 root for v2 torrents.
pub type InfoHash = [u8; 20];

/// A peer's piece availability as a packed bool vector.
///
/// Bits are MSB first within each byte, indexed by piece: the highest bit
/// of byte 0 is piece 0, so `0b1010_0000` advertises pieces 0 and 2. Wire
/// bitfields may carry spare trailing bits when the piece count is not a
/// byte multiple; receivers truncate those before registering
/// availability.
pub type Bitfield = BitVec<u8, Msb0>;

/// The largest transfer block the engine requests or serves, 16 KiB.
///
/// The configured block size (`network.block_size_kib`) may be smaller, but
/// never exceeds this: peers routinely drop connections over larger
/// requests, so the cap doubles as a sanity bound on inbound `request`
/// messages.
pub(crate) const MAX_BLOCK_LEN: u32 = 0x4000;

/// Addresses one transfer block on the wire: a sub-range of a piece.
///
/// Request, piece, and cancel messages all carry this triple. The actual
/// block layout of a piece is owned by the piece engine (it is derived from
/// the configured block size); `BlockInfo` is only the wire-level claim a
/// message makes about a range, so it must always be validated against the
/// piece it names before any buffer is touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The range's length in bytes. At most 16 KiB; shorter for the tail of
    /// a piece that is not a block size multiple.
    pub len: u32,
}

impl BlockInfo {
    /// One past the last byte of the range, within its piece.
    pub fn end_offset(&self) -> u64 {
        self.offset as u64 + self.len as u64
    }

    /// Whether the claimed range is one this engine would ever transfer for
    /// a piece of the given length: non-empty, within the protocol's block
    /// cap, and fully inside the piece.
    pub fn is_within(&self, piece_len: u32) -> bool {
        self.len > 0
            && self.len <= MAX_BLOCK_LEN
            && self.end_offset() <= piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_range_validation() {
        // a piece shorter than the block cap, as the last piece often is
        let piece_len = 7_232;

        let head = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: piece_len,
        };
        assert!(head.is_within(piece_len));
        assert_eq!(head.end_offset(), piece_len as u64);

        // flush against the end of the piece
        let tail = BlockInfo {
            piece_index: 0,
            offset: piece_len - 100,
            len: 100,
        };
        assert!(tail.is_within(piece_len));

        // one byte past the end of the piece
        let overrun = BlockInfo {
            piece_index: 0,
            offset: piece_len - 100,
            len: 101,
        };
        assert!(!overrun.is_within(piece_len));
    }

    #[test]
    fn test_block_range_rejects_degenerate_claims() {
        let piece_len = 4 * MAX_BLOCK_LEN;

        // empty ranges carry no data and are never requested
        let empty = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 0,
        };
        assert!(!empty.is_within(piece_len));

        // ranges beyond the protocol cap are a drop offense even when the
        // piece itself would be large enough to hold them
        let oversized = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: MAX_BLOCK_LEN + 1,
        };
        assert!(!oversized.is_within(piece_len));

        // an offset past the piece end cannot wrap into validity
        let astray = BlockInfo {
            piece_index: 0,
            offset: piece_len,
            len: 1,
        };
        assert!(!astray.is_within(piece_len));
    }
}
