//! This module defines types used to configure the engine and its parts.
//!
//! Defaults are produced by [`Conf::new`]; [`Conf::from_env`] additionally
//! applies the `CCBT_*` environment overrides on top of the defaults.

use std::{env, path::PathBuf, time::Duration};

use crate::PeerId;

/// The default ccbt client id.
pub const CCBT_CLIENT_ID: &PeerId = b"-cb0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub network: NetworkConf,
    pub strategy: StrategyConf,
    pub disk: DiskConf,
    pub dht: DhtConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default ccbt client id, [`CCBT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CCBT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
            network: NetworkConf::default(),
            strategy: StrategyConf::default(),
            disk: DiskConf::default(),
            dht: DhtConf::default(),
        }
    }

    /// Like [`Conf::new`], but applies `CCBT_*` environment variable
    /// overrides on top of the defaults. Unparsable values are ignored.
    pub fn from_env(download_dir: impl Into<PathBuf>) -> Self {
        let mut conf = Self::new(download_dir);

        env_parse("CCBT_PIPELINE_DEPTH", &mut conf.network.pipeline_depth);
        env_parse("CCBT_BLOCK_SIZE_KIB", &mut conf.network.block_size_kib);
        env_parse("CCBT_MAX_PEERS", &mut conf.network.max_global_peers);
        env_parse(
            "CCBT_MAX_PEERS_PER_TORRENT",
            &mut conf.torrent.max_connected_peer_count,
        );
        env_parse("CCBT_LISTEN_PORT", &mut conf.network.listen_port);
        env_parse("CCBT_ENABLE_PEX", &mut conf.network.enable_pex);
        env_parse(
            "CCBT_ENABLE_UDP_TRACKERS",
            &mut conf.network.enable_udp_trackers,
        );

        if let Ok(strategy) = env::var("CCBT_PIECE_SELECTION") {
            if let Some(strategy) = PieceSelection::from_name(&strategy) {
                conf.strategy.piece_selection = strategy;
            }
        }
        env_parse(
            "CCBT_ENDGAME_DUPLICATES",
            &mut conf.strategy.endgame_duplicates,
        );
        env_parse(
            "CCBT_ENDGAME_THRESHOLD",
            &mut conf.strategy.endgame_threshold,
        );
        env_parse("CCBT_STREAMING_MODE", &mut conf.strategy.streaming_mode);

        env_parse("CCBT_HASH_WORKERS", &mut conf.disk.hash_workers);
        env_parse(
            "CCBT_CHECKPOINT_ENABLED",
            &mut conf.disk.checkpoint_enabled,
        );
        if let Ok(dir) = env::var("CCBT_CHECKPOINT_DIR") {
            conf.disk.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Ok(format) = env::var("CCBT_CHECKPOINT_FORMAT") {
            if let Some(format) = CheckpointFormat::from_name(&format) {
                conf.disk.checkpoint_format = format;
            }
        }
        env_parse(
            "CCBT_CHECKPOINT_COMPRESSION",
            &mut conf.disk.checkpoint_compression,
        );

        env_parse("CCBT_ENABLE_DHT", &mut conf.dht.enabled);
        env_parse("CCBT_DHT_PORT", &mut conf.dht.bind_port);

        conf
    }
}

/// Parses the environment variable into the target if it is set and valid.
fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        } else {
            log::warn!("Ignoring unparsable {}={}", name, raw);
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many failed attempts, the torrent stops announcing to a
    /// tracker.
    pub tracker_error_threshold: usize,

    /// How often the piece engine state is checkpointed, besides the save
    /// triggered by each piece verification.
    pub checkpoint_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration of the peer wire and general networking behavior.
#[derive(Clone, Debug)]
pub struct NetworkConf {
    /// The port on which we accept inbound peer connections.
    pub listen_port: u16,
    /// The number of block requests kept outstanding towards a single peer.
    /// Sessions may adapt downwards from this under backpressure.
    pub pipeline_depth: usize,
    /// The transfer block size, in KiB. The de facto value is 16 and peers
    /// routinely reject anything larger.
    pub block_size_kib: u32,
    /// The number of peer connections allowed across all torrents.
    pub max_global_peers: usize,
    /// Timeout for establishing the TCP connection to a peer.
    pub connection_timeout: Duration,
    /// Timeout for the handshake round-trip once connected.
    pub handshake_timeout: Duration,
    /// How often a keep-alive is sent on an otherwise idle connection.
    pub keep_alive_interval: Duration,
    /// A peer silent for longer than this is disconnected.
    pub peer_timeout: Duration,
    /// Timeout budget for a single tracker announce.
    pub tracker_timeout: Duration,
    /// Whether announcing to UDP trackers is attempted at all.
    pub enable_udp_trackers: bool,
    /// Whether peers learned through peer exchange are admitted.
    pub enable_pex: bool,
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            pipeline_depth: 4,
            block_size_kib: 16,
            max_global_peers: 200,
            connection_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(120),
            tracker_timeout: Duration::from_secs(30),
            enable_udp_trackers: true,
            enable_pex: true,
        }
    }
}

/// The piece selection strategy a torrent runs under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceSelection {
    /// Pick the pieces the fewest connected peers have, first.
    RarestFirst,
    /// Pick pieces in index order within a sliding window, falling back to
    /// rarest-first when window availability is poor.
    Sequential,
    /// Sequential selection tuned for playback: front pieces prioritized,
    /// seek support.
    Streaming,
}

impl PieceSelection {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "rarest_first" => Some(Self::RarestFirst),
            "sequential" => Some(Self::Sequential),
            "streaming" => Some(Self::Streaming),
            _ => {
                log::warn!("Unknown piece selection strategy: {}", name);
                None
            }
        }
    }
}

/// Configuration of piece selection and endgame behavior.
#[derive(Clone, Debug)]
pub struct StrategyConf {
    pub piece_selection: PieceSelection,
    /// The number of pieces ahead of the cursor considered by sequential
    /// selection.
    pub sequential_window: usize,
    /// Sequential selection falls back to rarest-first for the tick when the
    /// average availability of window pieces, relative to the connected peer
    /// count, drops below this.
    pub sequential_fallback_threshold: f64,
    /// Endgame starts when the remaining missing pieces drop to
    /// `total * (1 - endgame_threshold)`.
    pub endgame_threshold: f64,
    /// In endgame, every outstanding block is requested from up to this many
    /// distinct peers.
    pub endgame_duplicates: usize,
    /// Whether pieces get streaming priorities at initialization.
    pub streaming_mode: bool,
}

impl Default for StrategyConf {
    fn default() -> Self {
        Self {
            piece_selection: PieceSelection::RarestFirst,
            sequential_window: 10,
            sequential_fallback_threshold: 0.3,
            endgame_threshold: 0.95,
            endgame_duplicates: 3,
            streaming_mode: false,
        }
    }
}

/// How output files are preallocated before the download starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preallocation {
    /// Files grow as pieces are written.
    None,
    /// Seek to `size - 1` and write a single byte, letting the file system
    /// create a sparse file.
    Sparse,
    /// Zero-fill the whole file up front.
    Full,
    /// `posix_fallocate` where the platform has it, sparse elsewhere.
    Fallocate,
}

/// The on-disk checkpoint representation(s) to maintain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    Binary,
    /// Write both; loading prefers JSON.
    Both,
}

impl CheckpointFormat {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "binary" => Some(Self::Binary),
            "both" => Some(Self::Both),
            _ => {
                log::warn!("Unknown checkpoint format: {}", name);
                None
            }
        }
    }
}

/// Configuration of the disk layer, hashing, and checkpointing.
#[derive(Clone, Debug)]
pub struct DiskConf {
    pub preallocation: Preallocation,
    /// Whether reads are served through the mmap cache.
    pub use_mmap: bool,
    /// The byte budget of the read mmap cache.
    pub mmap_cache_bytes: u64,
    /// Contiguous write runs are coalesced up to this many bytes before being
    /// issued as a single positioned write.
    pub write_batch_bytes: usize,
    /// Capacity of a torrent's pending write queue. A full queue surfaces
    /// a retryable error to the caller.
    pub write_queue_size: usize,
    /// Pending writes older than this are flushed even if their batch has not
    /// filled up, to bound the latency of small-file trailing writes.
    pub stale_write_timeout: Duration,
    /// The number of blocking workers hashing completed pieces.
    pub hash_workers: usize,
    /// Doubles the worker count (capped) to approximate a work-sharing queue.
    pub hash_workers_adaptive: bool,
    pub checkpoint_enabled: bool,
    /// Where checkpoints are stored. Defaults to `.ccbt/checkpoints` under
    /// the download directory when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_format: CheckpointFormat,
    /// Whether binary checkpoints are gzip framed.
    pub checkpoint_compression: bool,
    /// Whether a checkpoint, if present, is loaded at torrent start.
    pub auto_resume: bool,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            preallocation: Preallocation::Sparse,
            use_mmap: true,
            mmap_cache_bytes: 256 * 1024 * 1024,
            write_batch_bytes: 128 * 1024,
            write_queue_size: 200,
            stale_write_timeout: Duration::from_millis(100),
            hash_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            hash_workers_adaptive: true,
            checkpoint_enabled: true,
            checkpoint_dir: None,
            checkpoint_format: CheckpointFormat::Json,
            checkpoint_compression: false,
            auto_resume: true,
        }
    }
}

/// Configuration of the DHT node.
#[derive(Clone, Debug)]
pub struct DhtConf {
    pub enabled: bool,
    /// The UDP port the node binds. 0 lets the OS pick.
    pub bind_port: u16,
    /// Bootstrap contacts as `host:port` strings. Invalid entries are skipped
    /// with a warning.
    pub bootstrap_nodes: Vec<String>,
    /// Kademlia bucket size.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Iteration depth cap of a lookup.
    pub max_depth: usize,
    /// The floor of the adaptive per-query timeout.
    pub min_query_timeout: Duration,
    /// The ceiling of the adaptive per-query timeout.
    pub max_query_timeout: Duration,
    /// Base interval of the routing table refresh loop; scaled by swarm
    /// health and clamped to the min/max below.
    pub base_refresh_interval: Duration,
    pub min_refresh_interval: Duration,
    pub max_refresh_interval: Duration,
    /// How long an announce token stays valid.
    pub token_ttl: Duration,
    /// BEP-43: mark all outgoing queries read-only and never announce.
    pub read_only: bool,
}

impl Default for DhtConf {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_port: 6881,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
            ],
            k: 8,
            alpha: 3,
            max_depth: 10,
            min_query_timeout: Duration::from_secs(1),
            max_query_timeout: Duration::from_secs(10),
            base_refresh_interval: Duration::from_secs(60),
            min_refresh_interval: Duration::from_secs(30),
            max_refresh_interval: Duration::from_secs(300),
            token_ttl: Duration::from_secs(900),
            read_only: false,
        }
    }
}
