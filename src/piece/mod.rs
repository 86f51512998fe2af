//! The piece engine: the single source of truth over which blocks exist,
//! are in flight, are complete, and are verified.
//!
//! Peer sessions and the torrent task share the [`PieceManager`] behind an
//! `Arc<RwLock>`: sessions register availability and deposit blocks, the
//! torrent drives selection ticks and routes the resulting request plans
//! back to sessions. Completed pieces are hashed on a bounded blocking
//! worker pool and reported through the alert channel.

pub(crate) mod picker;
pub(crate) mod verify;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    RwLock, Semaphore,
};

use crate::{
    checkpoint::{
        DownloadStats, PieceStateTag, TorrentCheckpoint, CHECKPOINT_VERSION,
    },
    conf::StrategyConf,
    counter::ThruputCounter,
    error::{Error, Result},
    metainfo::MetaVersion,
    Bitfield, BlockInfo, InfoHash, PeerKey, PieceIndex, Sha256Hash,
};

use verify::{ExpectedHash, VerifyJob};

/// When the piece count is inferred from `have` messages of magnet peers
/// (before the info dictionary is known), it is capped at this.
pub(crate) const MAX_INFERRED_PIECES: usize = 1 << 20;

/// How many pieces a single selection tick fans out to.
const SELECT_FAN_OUT: usize = 5;

/// States of a piece download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceState {
    /// We don't have this piece.
    Missing,
    /// The piece has been handed to peers for download.
    Requested,
    /// At least one of the piece's blocks has arrived.
    Downloading,
    /// Every block has been deposited but the hash has not been checked yet.
    Complete,
    /// The piece hash has been verified.
    Verified,
}

/// A block within a piece.
#[derive(Debug)]
pub(crate) struct Block {
    pub offset: u32,
    pub len: u32,
    /// Whether the block's bytes have been deposited. The data itself may
    /// already have moved on to the hash worker or to disk.
    pub received: bool,
    pub data: Option<Vec<u8>>,
    /// The peers this block is currently requested from. More than one entry
    /// only occurs in endgame.
    pub requested_from: HashSet<PeerKey>,
}

impl Block {
    fn new(offset: u32, len: u32) -> Self {
        Self {
            offset,
            len,
            received: false,
            data: None,
            requested_from: HashSet::new(),
        }
    }
}

/// A piece and its download state.
#[derive(Debug)]
pub(crate) struct Piece {
    pub len: u32,
    pub state: PieceState,
    pub blocks: Vec<Block>,
    pub hash_verified: bool,
    /// Higher priority pieces are selected earlier.
    pub priority: i64,
    /// How many times this piece has been handed out for download.
    pub request_count: usize,
}

impl Piece {
    fn new(len: u32, block_size: u32) -> Self {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < len {
            let block_len = block_size.min(len - offset);
            blocks.push(Block::new(offset, block_len));
            offset += block_len;
        }
        Self {
            len,
            state: PieceState::Missing,
            blocks,
            hash_verified: false,
            priority: 0,
            request_count: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.received)
    }

    /// Drops all deposited data and in-flight bookkeeping, returning the
    /// piece to `Missing`.
    fn reset(&mut self) {
        self.state = PieceState::Missing;
        self.hash_verified = false;
        for block in self.blocks.iter_mut() {
            block.received = false;
            block.data = None;
            block.requested_from.clear();
        }
    }

    /// Moves the deposited block data out of the piece, concatenated in
    /// offset order. The blocks stay marked received.
    fn take_data(&mut self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut data = Vec::with_capacity(self.len as usize);
        for block in self.blocks.iter_mut() {
            if let Some(block_data) = block.data.take() {
                data.extend_from_slice(&block_data);
            }
        }
        data
    }
}

/// What a peer session is currently allowed to do, mirrored into the piece
/// engine so request plans never violate the per-peer invariants.
#[derive(Debug)]
pub(crate) struct PeerStatus {
    /// Whether the peer is choking us. No requests are planned towards
    /// choking peers.
    pub is_choking: bool,
    /// The number of requests in flight towards this peer.
    pub outstanding: usize,
    /// The request pipeline capacity of this peer's session.
    pub pipeline_depth: usize,
}

impl PeerStatus {
    fn can_request(&self) -> bool {
        !self.is_choking && self.outstanding < self.pipeline_depth
    }
}

/// The per-tick request plan: which blocks to request from which peer.
#[derive(Debug, Default)]
pub(crate) struct RequestPlan {
    pub requests: Vec<(PeerKey, Vec<BlockInfo>)>,
}

/// The outcome of depositing a block.
#[derive(Debug, Default)]
pub(crate) struct BlockDeposit {
    /// Set when this deposit completed the piece; the job is to be run via
    /// [`spawn_verification`].
    pub verify: Option<VerifyJob>,
    /// Duplicate in-flight requests to cancel (endgame).
    pub cancels: Vec<(PeerKey, BlockInfo)>,
}

/// Events the piece engine reports to the torrent task.
#[derive(Debug)]
pub(crate) enum PieceAlert {
    /// All blocks of the piece have been deposited; verification is underway.
    Completed(PieceIndex),
    /// The piece hash verified; the payload is handed over for the disk
    /// write and the have broadcast.
    Verified { index: PieceIndex, data: Vec<u8> },
    /// The piece hash did not match; the piece was reset to missing.
    VerificationFailed(PieceIndex),
    /// Every piece is verified.
    DownloadComplete,
    /// The engine requests a checkpoint save.
    CheckpointRequested,
}

pub(crate) type PieceAlertSender = UnboundedSender<PieceAlert>;
pub(crate) type PieceAlertReceiver = UnboundedReceiver<PieceAlert>;

pub(crate) struct PieceManager {
    /// The torrent's canonical identifier.
    info_hash: InfoHash,
    /// All pieces of the torrent, indexed by piece index.
    pub(crate) pieces: Vec<Piece>,
    piece_len: u32,
    last_piece_len: u32,
    block_size: u32,
    /// Concatenated 20 byte SHA-1 hashes (v1 and hybrid torrents).
    piece_hashes: Vec<u8>,
    /// Per-piece SHA-256 hashes (v2 and hybrid torrents).
    v2_piece_hashes: Option<Vec<Sha256Hash>>,
    meta_version: MetaVersion,

    /// Pieces with every block deposited (verification may be pending).
    completed: HashSet<PieceIndex>,
    /// Pieces whose hash has been verified.
    verified: HashSet<PieceIndex>,

    /// Which pieces each peer advertises.
    availability: HashMap<PeerKey, HashSet<PieceIndex>>,
    /// How many peers advertise each piece. Kept consistent with
    /// `availability` on every bitfield, have, and departure event.
    frequency: HashMap<PieceIndex, u32>,
    /// Choke and pipeline state per peer, mirrored from the sessions.
    peers: HashMap<PeerKey, PeerStatus>,

    pub(crate) strategy: StrategyConf,
    /// Set once the remaining missing pieces drop below the endgame
    /// threshold; never unset.
    endgame: bool,
    /// The cursor of sequential selection.
    pub(crate) sequential_cursor: PieceIndex,

    /// Limits the number of concurrently running hash worker tasks.
    hash_workers: Arc<Semaphore>,
    downloaded: ThruputCounter,
    alert_chan: PieceAlertSender,
}

impl PieceManager {
    /// Creates a piece manager for a torrent with known metadata and returns
    /// it together with the alert port.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: InfoHash,
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        piece_hashes: Vec<u8>,
        v2_piece_hashes: Option<Vec<Sha256Hash>>,
        meta_version: MetaVersion,
        block_size: u32,
        hash_worker_count: usize,
        strategy: StrategyConf,
    ) -> (Self, PieceAlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let mut pieces = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            let len = if index + 1 == piece_count {
                last_piece_len
            } else {
                piece_len
            };
            let mut piece = Piece::new(len, block_size);
            if strategy.streaming_mode {
                piece.priority = streaming_priority(index, piece_count);
            }
            pieces.push(piece);
        }

        (
            Self {
                info_hash,
                pieces,
                piece_len,
                last_piece_len,
                block_size,
                piece_hashes,
                v2_piece_hashes,
                meta_version,
                completed: HashSet::new(),
                verified: HashSet::new(),
                availability: HashMap::new(),
                frequency: HashMap::new(),
                peers: HashMap::new(),
                strategy,
                endgame: false,
                sequential_cursor: 0,
                hash_workers: Arc::new(Semaphore::new(hash_worker_count.max(1))),
                downloaded: ThruputCounter::new(),
                alert_chan,
            },
            alert_port,
        )
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.pieces.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn verified_pieces(&self) -> &HashSet<PieceIndex> {
        &self.verified
    }

    pub fn frequency(&self, index: PieceIndex) -> u32 {
        self.frequency.get(&index).copied().unwrap_or(0)
    }

    /// Registers a freshly connected peer with its session's pipeline depth.
    pub fn register_peer(&mut self, peer: PeerKey, pipeline_depth: usize) {
        self.peers.insert(
            peer,
            PeerStatus {
                is_choking: true,
                outstanding: 0,
                pipeline_depth,
            },
        );
    }

    /// Removes the peer and all its availability and in-flight bookkeeping.
    pub fn remove_peer(&mut self, peer: &PeerKey) {
        if let Some(pieces) = self.availability.remove(peer) {
            for index in pieces {
                decrement(&mut self.frequency, index);
            }
        }
        self.peers.remove(peer);
        for piece in self.pieces.iter_mut() {
            for block in piece.blocks.iter_mut() {
                block.requested_from.remove(peer);
            }
        }
    }

    /// The peer choked us: all requests towards it are void.
    pub fn peer_choked(&mut self, peer: &PeerKey) {
        if let Some(status) = self.peers.get_mut(peer) {
            status.is_choking = true;
            status.outstanding = 0;
        }
        for piece in self.pieces.iter_mut() {
            let mut in_flight = false;
            for block in piece.blocks.iter_mut() {
                block.requested_from.remove(peer);
                in_flight |= !block.requested_from.is_empty();
            }
            // a piece with no remaining in-flight requests goes back to the
            // selector
            if !in_flight
                && matches!(
                    piece.state,
                    PieceState::Requested | PieceState::Downloading
                )
                && !piece.blocks.iter().any(|b| b.received)
            {
                piece.state = PieceState::Missing;
            }
        }
    }

    pub fn peer_unchoked(&mut self, peer: &PeerKey) {
        if let Some(status) = self.peers.get_mut(peer) {
            status.is_choking = false;
        }
    }

    /// Replaces the peer's availability with the given bitfield; the piece
    /// frequency counter is updated by set difference in both directions.
    ///
    /// A bitfield wider than the torrent is truncated with a warning.
    /// Returns whether the peer has any piece we are still missing, i.e.
    /// whether we are interested.
    pub fn update_peer_bitfield(
        &mut self,
        peer: PeerKey,
        bitfield: &Bitfield,
    ) -> bool {
        let piece_count = self.pieces.len();
        if piece_count > 0 && bitfield.len() > piece_count {
            log::warn!(
                "Peer {} sent bitfield wider than torrent ({} > {}), \
                truncating",
                peer,
                bitfield.len(),
                piece_count,
            );
        }

        let mut pieces = HashSet::new();
        for (index, bit) in bitfield.iter().enumerate() {
            if *bit && (piece_count == 0 || index < piece_count) {
                if index >= MAX_INFERRED_PIECES {
                    break;
                }
                pieces.insert(index);
            }
        }

        let old = self.availability.remove(&peer).unwrap_or_default();
        for index in old.difference(&pieces) {
            decrement(&mut self.frequency, *index);
        }
        for index in pieces.difference(&old) {
            *self.frequency.entry(*index).or_insert(0) += 1;
        }

        let interested = pieces
            .iter()
            .any(|index| *index < piece_count && !self.verified.contains(index));
        self.availability.insert(peer, pieces);
        interested
    }

    /// Registers a single `have` announcement. Accepted even before the
    /// peer's bitfield; inferred piece indices are capped.
    pub fn update_peer_have(&mut self, peer: PeerKey, index: PieceIndex) {
        if index >= MAX_INFERRED_PIECES {
            log::warn!(
                "Peer {} announced piece {} beyond the inferred piece cap, \
                dropping",
                peer,
                index,
            );
            return;
        }
        if !self.pieces.is_empty() && index >= self.pieces.len() {
            log::warn!(
                "Peer {} announced out of range piece {}, dropping",
                peer,
                index
            );
            return;
        }
        let pieces = self.availability.entry(peer).or_default();
        if pieces.insert(index) {
            *self.frequency.entry(index).or_insert(0) += 1;
        }
    }

    /// Deposits a block received from the given peer.
    ///
    /// Out of range piece indices are dropped silently; so are deposits
    /// whose length does not match the block's declared length, and
    /// duplicates of already received blocks. The last block of a piece
    /// transitions it to complete and yields a verification job.
    pub fn handle_block(
        &mut self,
        peer: PeerKey,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> BlockDeposit {
        let mut deposit = BlockDeposit::default();

        if piece_index >= self.pieces.len() {
            log::warn!("Block for out of range piece {} dropped", piece_index);
            return deposit;
        }

        let piece = &mut self.pieces[piece_index];
        let block_pos = piece.blocks.iter().position(|b| b.offset == offset);
        let block_pos = match block_pos {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Block at invalid offset {} in piece {} dropped",
                    offset,
                    piece_index
                );
                return deposit;
            }
        };

        {
            let block = &mut piece.blocks[block_pos];

            // the delivering peer's request slot is freed even if the block
            // turns out to be a duplicate
            if block.requested_from.remove(&peer) {
                if let Some(status) = self.peers.get_mut(&peer) {
                    status.outstanding = status.outstanding.saturating_sub(1);
                }
            }

            if block.received {
                log::debug!(
                    "Duplicate block {} in piece {} ignored",
                    offset,
                    piece_index
                );
                return deposit;
            }
            if data.len() != block.len as usize {
                log::warn!(
                    "Block {} in piece {} has invalid length {} (expected {})",
                    offset,
                    piece_index,
                    data.len(),
                    block.len
                );
                return deposit;
            }

            self.downloaded.register(data.len() as u64);
            block.received = true;
            block.data = Some(data);

            // outstanding duplicates of this block are cancelled (endgame)
            let block_len = block.len;
            for other in block.requested_from.drain() {
                if let Some(status) = self.peers.get_mut(&other) {
                    status.outstanding = status.outstanding.saturating_sub(1);
                }
                deposit.cancels.push((
                    other,
                    BlockInfo {
                        piece_index,
                        offset,
                        len: block_len,
                    },
                ));
            }
        }

        if piece.is_complete() {
            piece.state = PieceState::Complete;
            self.completed.insert(piece_index);
            log::info!("Piece {} complete, scheduling verification", piece_index);
            let _ = self.alert_chan.send(PieceAlert::Completed(piece_index));
            deposit.verify = self.verify_job(piece_index);
        } else if piece.state == PieceState::Requested {
            piece.state = PieceState::Downloading;
        }

        deposit
    }

    /// Builds the verification job for a completed piece.
    fn verify_job(&mut self, index: PieceIndex) -> Option<VerifyJob> {
        let expected = match self.meta_version {
            MetaVersion::V1 => {
                ExpectedHash::V1(self.v1_piece_hash(index)?)
            }
            MetaVersion::V2 => {
                ExpectedHash::V2(self.v2_piece_hash(index)?)
            }
            MetaVersion::Hybrid => ExpectedHash::Hybrid(
                self.v1_piece_hash(index)?,
                self.v2_piece_hash(index)?,
            ),
        };
        let piece = &mut self.pieces[index];
        Some(VerifyJob {
            piece_index: index,
            data: piece.take_data(),
            expected,
        })
    }

    fn v1_piece_hash(&self, index: PieceIndex) -> Option<crate::Sha1Hash> {
        let pos = index * 20;
        let slice = self.piece_hashes.get(pos..pos + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    fn v2_piece_hash(&self, index: PieceIndex) -> Option<Sha256Hash> {
        self.v2_piece_hashes.as_ref()?.get(index).copied()
    }

    /// Applies the outcome of a hash verification.
    ///
    /// On success the piece becomes verified and its payload is forwarded on
    /// the alert channel for the disk write. On failure the piece is reset
    /// to missing and will be selected again; there is no synchronous retry.
    pub fn on_verify_result(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
        is_valid: bool,
    ) {
        if index >= self.pieces.len() {
            return;
        }
        if is_valid {
            let piece = &mut self.pieces[index];
            piece.state = PieceState::Verified;
            piece.hash_verified = true;
            // the payload moves on to disk; the blocks count as present
            for block in piece.blocks.iter_mut() {
                block.received = true;
                block.data = None;
            }
            self.verified.insert(index);
            log::info!(
                "Piece {} verified ({}/{})",
                index,
                self.verified.len(),
                self.pieces.len()
            );
            let _ = self
                .alert_chan
                .send(PieceAlert::Verified { index, data });
            let _ = self.alert_chan.send(PieceAlert::CheckpointRequested);
            if !self.pieces.is_empty() && self.verified.len() == self.pieces.len()
            {
                log::info!("All {} pieces verified", self.pieces.len());
                let _ = self.alert_chan.send(PieceAlert::DownloadComplete);
            }
        } else {
            // failed verification is silent towards the user; the piece is
            // simply downloaded again
            log::warn!("Piece {} failed hash verification", index);
            self.completed.remove(&index);
            self.pieces[index].reset();
            let _ = self.alert_chan.send(PieceAlert::VerificationFailed(index));
        }
        self.update_endgame();
    }

    /// Drops a piece whose verified payload was lost (e.g. its disk write
    /// failed): the piece returns to missing and will be selected again.
    pub fn invalidate_piece(&mut self, index: PieceIndex) {
        if index >= self.pieces.len() {
            return;
        }
        self.verified.remove(&index);
        self.completed.remove(&index);
        self.pieces[index].reset();
    }

    /// Returns the requested range of a piece, but only once the piece has
    /// been verified and only while its payload is still memory resident
    /// (after the disk write the caller reads through the disk layer).
    pub fn get_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<Vec<u8>> {
        let piece = self.pieces.get(piece_index)?;
        if piece.state != PieceState::Verified {
            return None;
        }
        let block = piece.blocks.iter().find(|b| b.offset == offset)?;
        let data = block.data.as_ref()?;
        if len as usize > data.len() {
            return None;
        }
        Some(data[..len as usize].to_vec())
    }

    /// The fraction of verified pieces, in `[0, 1]`. Saturates at 1 only
    /// when every piece is verified; a torrent without pieces reports 0.
    pub fn get_progress(&self) -> f64 {
        if self.pieces.is_empty() {
            return 0.0;
        }
        self.verified.len() as f64 / self.pieces.len() as f64
    }

    /// Piece counts per state, for diagnostics.
    pub fn piece_status(&self) -> HashMap<&'static str, usize> {
        let mut status = HashMap::new();
        for piece in self.pieces.iter() {
            let name = match piece.state {
                PieceState::Missing => "missing",
                PieceState::Requested => "requested",
                PieceState::Downloading => "downloading",
                PieceState::Complete => "complete",
                PieceState::Verified => "verified",
            };
            *status.entry(name).or_insert(0) += 1;
        }
        status
    }

    /// Swarm health metrics derived from the availability counters.
    pub fn swarm_health(&self) -> SwarmHealth {
        let total = self.pieces.len();
        let total_availability: u64 =
            self.frequency.values().map(|f| *f as u64).sum();
        SwarmHealth {
            total_pieces: total,
            verified_pieces: self.verified.len(),
            active_peers: self.availability.len(),
            average_availability: if total > 0 {
                total_availability as f64 / total as f64
            } else {
                0.0
            },
            rarest_availability: self
                .pieces
                .iter()
                .enumerate()
                .filter(|(index, piece)| {
                    piece.state != PieceState::Verified
                        && self.frequency.get(index).is_some()
                })
                .map(|(index, _)| self.frequency[&index])
                .min()
                .unwrap_or(0),
        }
    }

    pub fn download_stats(&self) -> DownloadStats {
        DownloadStats {
            bytes_downloaded: self.downloaded.total(),
            download_time: self.downloaded.elapsed_secs(),
            average_speed: self.downloaded.avg_rate(),
            start_time: self.downloaded.started_at_secs(),
            last_update: self.downloaded.updated_at_secs(),
        }
    }

    fn update_endgame(&mut self) {
        if self.endgame || self.pieces.is_empty() {
            return;
        }
        let remaining = self.pieces.len() - self.verified.len();
        let threshold = self.pieces.len() as f64
            * (1.0 - self.strategy.endgame_threshold);
        if (remaining as f64) <= threshold {
            self.endgame = true;
            log::info!(
                "Entering endgame mode with {} piece(s) remaining",
                remaining
            );
        }
    }

    /// The piece indices that still need downloading, with stale state
    /// corrected along the way: a piece declared complete without all its
    /// blocks present is demoted back to missing.
    pub(crate) fn missing_pieces(&mut self) -> Vec<PieceIndex> {
        let mut missing = Vec::new();
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            match piece.state {
                PieceState::Missing => missing.push(index),
                PieceState::Complete | PieceState::Verified
                    if !piece.is_complete() =>
                {
                    log::warn!(
                        "Piece {} declared {:?} without all blocks, resetting",
                        index,
                        piece.state
                    );
                    piece.reset();
                    missing.push(index);
                }
                _ => {}
            }
        }
        missing
    }

    /// Builds the durable snapshot of the engine state.
    pub fn checkpoint_state(
        &self,
        torrent_name: &str,
        output_dir: &str,
        files: Vec<crate::checkpoint::FileCheckpoint>,
    ) -> TorrentCheckpoint {
        let mut piece_states = HashMap::new();
        for (index, piece) in self.pieces.iter().enumerate() {
            piece_states.insert(index, PieceStateTag::from(piece.state));
        }
        let mut verified: Vec<PieceIndex> =
            self.verified.iter().copied().collect();
        verified.sort_unstable();
        TorrentCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            info_hash: self.info_hash,
            torrent_name: torrent_name.to_string(),
            created_at: self.downloaded.started_at_secs(),
            updated_at: self.downloaded.updated_at_secs(),
            total_pieces: self.pieces.len(),
            piece_length: self.piece_len,
            total_length: self.total_length(),
            verified_pieces: verified,
            piece_states,
            download_stats: self.download_stats(),
            output_dir: output_dir.to_string(),
            files,
            peer_info: HashMap::new(),
            endgame_mode: self.endgame,
            torrent_file_path: None,
            magnet_uri: None,
            announce_urls: Vec::new(),
            display_name: None,
        }
    }

    fn total_length(&self) -> u64 {
        if self.pieces.is_empty() {
            return 0;
        }
        (self.pieces.len() as u64 - 1) * self.piece_len as u64
            + self.last_piece_len as u64
    }

    /// Validates and adopts checkpointed state.
    ///
    /// A checkpoint declaring every piece complete while carrying no
    /// verified pieces and no downloaded bytes is treated as corrupted: only
    /// the scaffolding is restored. Verified pieces are restored with their
    /// blocks marked present (the payload lives on disk); a piece declared
    /// complete-but-unverified has no durable payload and is reset to
    /// missing.
    pub fn restore(&mut self, checkpoint: &TorrentCheckpoint) -> Result<()> {
        if checkpoint.info_hash != self.info_hash {
            return Err(Error::CheckpointCorrupted(
                "info hash mismatch".into(),
            ));
        }
        if checkpoint.total_pieces != self.pieces.len() {
            log::warn!(
                "Checkpoint declares {} pieces, torrent has {}; restoring \
                overlapping range only",
                checkpoint.total_pieces,
                self.pieces.len()
            );
        }

        let mut piece_states = checkpoint.piece_states.clone();
        let mut verified_list = checkpoint.verified_pieces.clone();

        // corruption sentinel: every piece complete, nothing verified,
        // nothing downloaded
        let complete_count = piece_states
            .values()
            .filter(|state| {
                matches!(state, PieceStateTag::Complete | PieceStateTag::Verified)
            })
            .count();
        if !piece_states.is_empty()
            && complete_count == piece_states.len()
            && verified_list.is_empty()
            && checkpoint.download_stats.bytes_downloaded == 0
        {
            log::warn!(
                "Checkpoint corruption detected: all {} pieces declared \
                complete with no verified pieces and no bytes downloaded; \
                discarding piece states",
                piece_states.len()
            );
            piece_states.clear();
            verified_list.clear();
        }

        let verified_set: HashSet<PieceIndex> = verified_list
            .iter()
            .copied()
            .filter(|index| *index < self.pieces.len())
            .collect();

        for (index, state) in piece_states {
            if index >= self.pieces.len() {
                log::debug!(
                    "Skipping checkpoint state for out of range piece {}",
                    index
                );
                continue;
            }
            let piece = &mut self.pieces[index];
            match state {
                PieceStateTag::Verified if verified_set.contains(&index) => {
                    piece.state = PieceState::Verified;
                    piece.hash_verified = true;
                    // the payload is on disk; the blocks count as present
                    for block in piece.blocks.iter_mut() {
                        block.received = true;
                        block.data = None;
                    }
                }
                PieceStateTag::Verified | PieceStateTag::Complete => {
                    // without a verified payload on disk there is nothing to
                    // resume for this piece
                    log::warn!(
                        "Checkpoint declares piece {} {:?} without verified \
                        payload, resetting to missing",
                        index,
                        state,
                    );
                    piece.reset();
                }
                _ => piece.reset(),
            }
        }

        self.verified = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| piece.state == PieceState::Verified)
            .map(|(index, _)| index)
            .collect();
        self.completed = self.verified.clone();
        self.endgame = checkpoint.endgame_mode;
        self.downloaded = ThruputCounter::restore(
            checkpoint.download_stats.bytes_downloaded,
            checkpoint.download_stats.start_time,
        );

        log::info!(
            "Restored checkpoint: {} of {} pieces verified",
            self.verified.len(),
            self.pieces.len()
        );
        Ok(())
    }
}

/// Swarm health metrics derived from availability.
#[derive(Debug)]
pub(crate) struct SwarmHealth {
    pub total_pieces: usize,
    pub verified_pieces: usize,
    pub active_peers: usize,
    pub average_availability: f64,
    pub rarest_availability: u32,
}

/// The initial priority of a piece under streaming selection: the first five
/// pieces are boosted to the maximum for fast startup, priority decays with
/// the index, and the last piece is boosted so playback can probe the
/// container's tail early.
pub(crate) fn streaming_priority(
    index: PieceIndex,
    piece_count: usize,
) -> i64 {
    if index < 5 {
        1000
    } else if index + 1 == piece_count {
        100
    } else {
        (1000 - index as i64).max(0)
    }
}

/// Runs a verification job on the bounded blocking worker pool and applies
/// its result to the shared manager.
pub(crate) fn spawn_verification(
    manager: Arc<RwLock<PieceManager>>,
    job: VerifyJob,
) {
    tokio::spawn(async move {
        let semaphore =
            Arc::clone(&manager.read().await.hash_workers);
        // the semaphore lives as long as the manager; acquisition only fails
        // after close, which we never do
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let index = job.piece_index;
        let result = tokio::task::spawn_blocking(move || {
            let is_valid = verify::verify(&job.data, &job.expected);
            (job.data, is_valid)
        })
        .await;
        match result {
            Ok((data, is_valid)) => {
                manager.write().await.on_verify_result(index, data, is_valid);
            }
            Err(e) => {
                // a panicking hash worker is isolated to its piece
                log::error!("Hash worker for piece {} failed: {}", index, e);
                manager.write().await.on_verify_result(index, Vec::new(), false);
            }
        }
    });
}

fn decrement(frequency: &mut HashMap<PieceIndex, u32>, index: PieceIndex) {
    if let Some(count) = frequency.get_mut(&index) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            frequency.remove(&index);
        }
    }
}
