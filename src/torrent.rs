//! The per-torrent task: binds discovery (tracker announces, DHT lookups)
//! to peer sessions, routes the piece engine's request plans and alerts,
//! forwards verified pieces to the disk task, and keeps the checkpoint
//! fresh.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time,
};
use url::Url;

use crate::{
    checkpoint::{CheckpointStore, FileCheckpoint},
    conf::Conf,
    dht::DhtNode,
    disk::{self, DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::*,
    peer::{self, PeerSession, SessionContext},
    piece::{PieceAlert, PieceAlertReceiver, PieceManager},
    storage_info::{FsStructure, StorageInfo},
    tracker::{Announce, Event, Tracker},
    BlockInfo, InfoHash, PeerId, PeerKey, PieceIndex, TorrentId,
};

/// The channel on which the engine commands a torrent task.
pub(crate) type Sender = UnboundedSender<Command>;
pub(crate) type Receiver = UnboundedReceiver<Command>;

/// The commands a torrent task accepts.
pub(crate) enum Command {
    /// Candidate peers from an external discovery source (PEX, user).
    AddPeers(Vec<SocketAddr>),
    /// Streaming playback seeked: reposition the sequential cursor.
    Seek(PieceIndex),
    /// An inbound connection whose handshake the engine already consumed.
    InboundPeer {
        socket: tokio::net::TcpStream,
        peer_id: PeerId,
        read_buf: bytes::BytesMut,
    },
    /// Eventually shut down the torrent and its peer sessions.
    Shutdown,
}

/// Internal notifications from per-peer session tasks.
enum PeerEvent {
    Disconnected(PeerKey),
}

pub(crate) struct Torrent {
    id: TorrentId,
    name: String,
    info_hash: InfoHash,
    conf: Conf,
    storage: StorageInfo,
    piece_manager: Arc<RwLock<PieceManager>>,
    piece_alert_port: PieceAlertReceiver,
    disk: DiskHandle,
    disk_alert_port: TorrentAlertReceiver,
    dht: Option<DhtNode>,
    checkpoints: Option<Arc<CheckpointStore>>,
    trackers: Vec<Tracker>,
    is_private: bool,

    cmd_port: Receiver,
    /// Command channels of the running peer sessions.
    peers: HashMap<PeerKey, peer::Sender>,
    /// Discovered but not yet connected candidates.
    candidates: VecDeque<SocketAddr>,
    known_candidates: HashSet<SocketAddr>,
    /// Endgame duplicate cancellations routed from sessions.
    cancel_chan: UnboundedSender<(PeerKey, BlockInfo)>,
    cancel_port: UnboundedReceiver<(PeerKey, BlockInfo)>,
    peer_event_chan: UnboundedSender<PeerEvent>,
    peer_event_port: UnboundedReceiver<PeerEvent>,

    /// Verified piece payloads the disk queue rejected; retried on the next
    /// tick.
    write_retries: VecDeque<(PieceIndex, Vec<u8>)>,
    announced_started: bool,
    uploaded: u64,
    /// Descriptor provenance, carried into checkpoints.
    magnet_uri: Option<String>,
    torrent_file_path: Option<String>,
}

impl Torrent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TorrentId,
        name: String,
        info_hash: InfoHash,
        is_private: bool,
        tracker_urls: Vec<String>,
        storage: StorageInfo,
        piece_manager: PieceManager,
        piece_alert_port: PieceAlertReceiver,
        disk: DiskHandle,
        disk_alert_port: TorrentAlertReceiver,
        dht: Option<DhtNode>,
        checkpoints: Option<Arc<CheckpointStore>>,
        magnet_uri: Option<String>,
        torrent_file_path: Option<String>,
        conf: Conf,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (cancel_chan, cancel_port) = mpsc::unbounded_channel();
        let (peer_event_chan, peer_event_port) = mpsc::unbounded_channel();
        let trackers = tracker_urls
            .iter()
            .filter_map(|raw| match Url::parse(raw) {
                Ok(url)
                    if url.scheme() == "http"
                        || url.scheme() == "https" =>
                {
                    Some(Tracker::new(url))
                }
                Ok(url) if url.scheme() == "udp" => {
                    // the UDP announce wire lives outside the engine; the
                    // enable flag only gates the collaborator that speaks it
                    log::debug!("Skipping udp tracker {}", url);
                    None
                }
                Ok(url) => {
                    log::debug!("Skipping unsupported tracker {}", url);
                    None
                }
                Err(e) => {
                    log::warn!("Invalid tracker URL {:?}: {}", raw, e);
                    None
                }
            })
            .collect();

        (
            Self {
                id,
                name,
                info_hash,
                conf,
                storage,
                piece_manager: Arc::new(RwLock::new(piece_manager)),
                piece_alert_port,
                disk,
                disk_alert_port,
                dht,
                checkpoints,
                trackers,
                is_private,
                cmd_port,
                peers: HashMap::new(),
                candidates: VecDeque::new(),
                known_candidates: HashSet::new(),
                cancel_chan,
                cancel_port,
                peer_event_chan,
                peer_event_port,
                write_retries: VecDeque::new(),
                announced_started: false,
                uploaded: 0,
                magnet_uri,
                torrent_file_path,
            },
            cmd_chan,
        )
    }

    /// Restores checkpointed state if resume is enabled and a checkpoint
    /// exists. A corrupted or version-mismatched checkpoint is reported
    /// and the torrent starts from zero rather than from partial invalid
    /// state.
    async fn try_resume(&mut self) {
        let store = match (&self.checkpoints, self.conf.disk.auto_resume) {
            (Some(store), true) => Arc::clone(store),
            _ => return,
        };
        match store.load(&self.info_hash).await {
            Ok(checkpoint) => {
                let mut manager = self.piece_manager.write().await;
                match manager.restore(&checkpoint) {
                    Ok(()) => log::info!(
                        "Torrent {} resumed from checkpoint", self.id
                    ),
                    Err(e) => log::warn!(
                        "Torrent {} checkpoint rejected: {}; starting from \
                        zero",
                        self.id,
                        e
                    ),
                }
            }
            Err(Error::CheckpointNotFound) => {
                log::debug!("Torrent {} has no checkpoint", self.id);
            }
            Err(e) => {
                log::warn!(
                    "Torrent {} checkpoint load failed: {}; starting from \
                    zero",
                    self.id,
                    e
                );
            }
        }
    }

    /// The torrent's main loop.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {} ({})", self.id, self.name);

        if let Some(dht) = &self.dht {
            if self.is_private {
                // BEP-27: private torrents must stay off the DHT
                dht.mark_private(self.info_hash);
            }
        }

        self.try_resume().await;
        self.announce(Some(Event::Started)).await;
        self.announced_started = true;
        self.dht_discover().await;

        let mut select_timer = time::interval(Duration::from_secs(1));
        let mut announce_timer =
            time::interval(self.conf.torrent.announce_interval);
        announce_timer.tick().await;
        let mut checkpoint_timer =
            time::interval(self.conf.torrent.checkpoint_interval);
        checkpoint_timer.tick().await;

        loop {
            tokio::select! {
                _ = select_timer.tick() => {
                    self.tick().await;
                }
                _ = announce_timer.tick() => {
                    self.announce(None).await;
                    self.dht_discover().await;
                }
                _ = checkpoint_timer.tick() => {
                    self.save_checkpoint().await;
                }
                alert = self.piece_alert_port.recv() => {
                    match alert {
                        Some(alert) => self.handle_piece_alert(alert).await,
                        None => break,
                    }
                }
                alert = self.disk_alert_port.recv() => {
                    if let Some(alert) = alert {
                        self.handle_disk_alert(alert).await;
                    }
                }
                cancel = self.cancel_port.recv() => {
                    if let Some((peer, block)) = cancel {
                        if let Some(chan) = self.peers.get(&peer) {
                            let _ = chan.send(peer::Command::Cancel(block));
                        }
                    }
                }
                event = self.peer_event_port.recv() => {
                    if let Some(PeerEvent::Disconnected(peer)) = event {
                        self.remove_peer(&peer).await;
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::AddPeers(peers)) => {
                            self.add_candidates(peers);
                        }
                        Some(Command::Seek(target)) => {
                            self.piece_manager
                                .write()
                                .await
                                .handle_seek(target);
                        }
                        Some(Command::InboundPeer {
                            socket,
                            peer_id,
                            read_buf,
                        }) => {
                            self.spawn_inbound_peer(
                                socket, peer_id, read_buf,
                            );
                        }
                        Some(Command::Shutdown) | None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// One orchestration tick: connect fresh candidates, retry rejected
    /// disk writes, run a selection pass, and route the plan to sessions.
    async fn tick(&mut self) {
        self.connect_candidates();
        self.retry_writes().await;

        let plan = self.piece_manager.write().await.select_pieces();
        for (peer, blocks) in plan.requests {
            if let Some(chan) = self.peers.get(&peer) {
                let _ = chan.send(peer::Command::Request(blocks));
            }
        }
    }

    /// Opens sessions towards queued candidates up to the connection cap.
    fn connect_candidates(&mut self) {
        while self.peers.len()
            < self.conf.torrent.max_connected_peer_count
        {
            let addr = match self.candidates.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            if self.peers.contains_key(&addr) {
                continue;
            }
            self.spawn_outbound_peer(addr);
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            torrent_id: self.id,
            info_hash: self.info_hash,
            client_id: self.conf.engine.client_id,
            piece_count: self.storage.piece_count,
            piece_manager: Arc::clone(&self.piece_manager),
            disk: self.disk.clone(),
            cancel_chan: self.cancel_chan.clone(),
            pipeline_depth: self.conf.network.pipeline_depth,
            connect_timeout: self.conf.network.connection_timeout,
            handshake_timeout: self.conf.network.handshake_timeout,
            keep_alive_interval: self.conf.network.keep_alive_interval,
            peer_timeout: self.conf.network.peer_timeout,
        }
    }

    fn spawn_outbound_peer(&mut self, addr: SocketAddr) {
        let (mut session, chan) =
            PeerSession::new(self.session_context(), addr);
        self.peers.insert(addr, chan);
        let events = self.peer_event_chan.clone();
        tokio::spawn(async move {
            if let Err(e) = session.start().await {
                log::info!("Peer {} session ended: {}", addr, e);
            }
            let _ = events.send(PeerEvent::Disconnected(addr));
        });
    }

    fn spawn_inbound_peer(
        &mut self,
        socket: tokio::net::TcpStream,
        peer_id: PeerId,
        read_buf: bytes::BytesMut,
    ) {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("Inbound peer without address: {}", e);
                return;
            }
        };
        if self.peers.len() >= self.conf.torrent.max_connected_peer_count {
            log::debug!(
                "Rejecting inbound peer {}: connection cap reached", addr
            );
            return;
        }
        let (mut session, chan) =
            PeerSession::new(self.session_context(), addr);
        self.peers.insert(addr, chan);
        let events = self.peer_event_chan.clone();
        tokio::spawn(async move {
            if let Err(e) =
                session.start_accepted(socket, peer_id, read_buf).await
            {
                log::info!("Peer {} session ended: {}", addr, e);
            }
            let _ = events.send(PeerEvent::Disconnected(addr));
        });
    }

    async fn remove_peer(&mut self, peer: &PeerKey) {
        self.peers.remove(peer);
        self.piece_manager.write().await.remove_peer(peer);
        log::debug!(
            "Torrent {} now has {} peer(s)", self.id, self.peers.len()
        );
    }

    fn add_candidates(&mut self, peers: Vec<SocketAddr>) {
        for peer in peers {
            if self.known_candidates.insert(peer) {
                self.candidates.push_back(peer);
            }
        }
    }

    /// Announces to every configured HTTP tracker. A failing announce is
    /// logged and counted; the torrent keeps running as long as another
    /// discovery source remains.
    async fn announce(&mut self, event: Option<Event>) {
        let (downloaded, left) = {
            let manager = self.piece_manager.read().await;
            let downloaded = manager.download_stats().bytes_downloaded;
            let left = self
                .storage
                .download_len
                .saturating_sub(downloaded);
            (downloaded, left)
        };
        let params = Announce {
            info_hash: self.info_hash,
            peer_id: self.conf.engine.client_id,
            port: self.conf.network.listen_port,
            uploaded: self.uploaded,
            downloaded,
            left,
            event,
            num_want: Some(self.conf.torrent.min_requested_peer_count.max(10)),
        };
        let timeout = self.conf.network.tracker_timeout;
        let threshold = self.conf.torrent.tracker_error_threshold;

        let mut discovered = Vec::new();
        for tracker in self.trackers.iter_mut() {
            if tracker.error_count >= threshold {
                continue;
            }
            match tracker.announce(params.clone(), timeout).await {
                Ok(response) => discovered.extend(response.peers),
                Err(_) => {
                    // already logged and counted by the tracker client
                }
            }
        }
        self.add_candidates(discovered);
    }

    /// Looks up peers in the DHT and announces our listen port there.
    async fn dht_discover(&mut self) {
        let dht = match &self.dht {
            Some(dht) => dht.clone(),
            None => return,
        };
        if self.is_private {
            return;
        }
        let peers = dht
            .get_peers(
                self.info_hash,
                self.conf.torrent.min_requested_peer_count.max(10) * 5,
            )
            .await;
        self.add_candidates(peers);
        dht.announce_peer(self.info_hash, self.conf.network.listen_port)
            .await;
    }

    async fn handle_piece_alert(&mut self, alert: PieceAlert) {
        match alert {
            PieceAlert::Completed(index) => {
                log::debug!(
                    "Torrent {} piece {} complete, verifying", self.id, index
                );
            }
            PieceAlert::Verified { index, data } => {
                self.on_piece_verified(index, data).await;
            }
            PieceAlert::VerificationFailed(index) => {
                // silent beyond metrics: the selector re-issues the piece
                log::debug!(
                    "Torrent {} piece {} re-queued after failed \
                    verification",
                    self.id,
                    index
                );
            }
            PieceAlert::CheckpointRequested => {
                self.save_checkpoint().await;
            }
            PieceAlert::DownloadComplete => {
                log::info!("Torrent {} download complete", self.id);
                self.announce(Some(Event::Completed)).await;
                // the snapshot has served its purpose
                if let Some(store) = &self.checkpoints {
                    if let Err(e) = store.delete(&self.info_hash).await {
                        log::warn!(
                            "Failed to delete checkpoint: {}", e
                        );
                    }
                }
            }
        }
    }

    /// A verified piece heads to disk and is announced to every connected
    /// peer.
    async fn on_piece_verified(&mut self, index: PieceIndex, data: Vec<u8>) {
        match self.disk.write_piece(self.id, index, data) {
            Ok(()) => {}
            Err(disk::WriteRejection::QueueFull(data)) => {
                // readmitted on the next tick; the payload is kept
                log::debug!(
                    "Disk queue full, retrying piece {} later", index
                );
                self.write_retries.push_back((index, data));
            }
            Err(e) => {
                log::error!(
                    "Failed to queue piece {} for writing: {:?}", index, e
                );
            }
        }

        for chan in self.peers.values() {
            let _ = chan.send(peer::Command::Have(index));
        }
    }

    /// Retries piece writes the bounded disk queue previously rejected.
    async fn retry_writes(&mut self) {
        for _ in 0..self.write_retries.len() {
            let (index, data) = match self.write_retries.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            match self.disk.write_piece(self.id, index, data) {
                Ok(()) => {}
                Err(disk::WriteRejection::QueueFull(data)) => {
                    // still saturated; put it back and stop for this tick
                    self.write_retries.push_front((index, data));
                    break;
                }
                Err(e) => {
                    log::error!(
                        "Dropping piece {} write after error: {:?}",
                        index,
                        e
                    );
                }
            }
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::PieceWritten {
                piece_index,
                result: Ok(write_count),
            } => {
                log::debug!(
                    "Torrent {} piece {} flushed ({} bytes)",
                    self.id,
                    piece_index,
                    write_count
                );
            }
            TorrentAlert::PieceWritten {
                piece_index,
                result: Err(e),
            } => {
                // the verified payload never reached disk; the piece goes
                // back to the selector
                log::error!(
                    "Torrent {} piece {} write failed: {}",
                    self.id,
                    piece_index,
                    e
                );
                self.piece_manager
                    .write()
                    .await
                    .invalidate_piece(piece_index);
            }
        }
    }

    /// Snapshots the piece engine state into the checkpoint store.
    async fn save_checkpoint(&mut self) {
        let store = match &self.checkpoints {
            Some(store) => Arc::clone(store),
            None => return,
        };
        let mut checkpoint = {
            let manager = self.piece_manager.read().await;
            manager.checkpoint_state(
                &self.name,
                &self.storage.download_dir.to_string_lossy(),
                self.file_checkpoints(),
            )
        };
        checkpoint.magnet_uri = self.magnet_uri.clone();
        checkpoint.torrent_file_path = self.torrent_file_path.clone();
        checkpoint.display_name = Some(self.name.clone());
        checkpoint.announce_urls = self
            .trackers
            .iter()
            .map(|tracker| tracker.url().to_string())
            .collect();
        if let Err(e) = store.save(&checkpoint).await {
            log::warn!(
                "Torrent {} checkpoint save failed: {}", self.id, e
            );
        }
    }

    /// The checkpoint's file list with BEP-47 attributes. Padding files
    /// are omitted; they are never materialized.
    fn file_checkpoints(&self) -> Vec<FileCheckpoint> {
        let files = match &self.storage.structure {
            FsStructure::File(file) => std::slice::from_ref(file),
            FsStructure::Archive { files } => files.as_slice(),
        };
        files
            .iter()
            .filter(|file| !file.is_padding())
            .map(|file| {
                let path = self.storage.download_dir.join(&file.path);
                FileCheckpoint {
                    exists: path.exists(),
                    path: path.to_string_lossy().into_owned(),
                    size: file.len,
                    attributes: file.attr.clone(),
                    symlink_path: file
                        .symlink_target
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    file_sha1: file.sha1.map(hex::encode),
                }
            })
            .collect()
    }

    /// Orderly shutdown: `stopped` to the trackers, a final checkpoint,
    /// and shutdown commands to every session.
    async fn shutdown(&mut self) {
        log::info!("Shutting down torrent {}", self.id);
        if self.announced_started {
            self.announce(Some(Event::Stopped)).await;
        }
        self.save_checkpoint().await;
        for (addr, chan) in self.peers.drain() {
            log::debug!("Stopping peer {} session", addr);
            let _ = chan.send(peer::Command::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::metainfo::MetaVersion;
    use crate::{FileInfo, MAX_BLOCK_LEN};

    /// A torrent task wired to bare channels: no disk task, no network.
    /// The held receivers let tests observe what the torrent would have
    /// sent and control the write queue's fill level.
    struct TestRig {
        torrent: Torrent,
        write_port: mpsc::Receiver<disk::WriteCommand>,
        _cmd_chan: Sender,
        _disk_cmd_port: disk::CommandReceiver,
        _disk_alert_chan: disk::TorrentAlertSender,
    }

    fn single_file_storage() -> StorageInfo {
        StorageInfo {
            piece_count: 2,
            piece_len: 16_384,
            last_piece_len: 16_384,
            download_len: 32_768,
            download_dir: PathBuf::from("/downloads/payload"),
            structure: FsStructure::File(FileInfo::new("payload", 0, 32_768)),
        }
    }

    fn rig(
        storage: StorageInfo,
        tracker_urls: Vec<String>,
        write_queue_size: usize,
        conf: Conf,
    ) -> TestRig {
        let (manager, piece_alert_port) = PieceManager::new(
            [0x21; 20],
            storage.piece_count,
            storage.piece_len,
            storage.last_piece_len,
            vec![0u8; storage.piece_count * 20],
            None,
            MetaVersion::V1,
            MAX_BLOCK_LEN,
            1,
            conf.strategy.clone(),
        );
        let (disk_handle, disk_cmd_port, write_port) =
            disk::test_handle(write_queue_size);
        let (disk_alert_chan, disk_alert_port) = mpsc::unbounded_channel();
        let (torrent, cmd_chan) = Torrent::new(
            0,
            "payload".into(),
            [0x21; 20],
            false,
            tracker_urls,
            storage,
            manager,
            piece_alert_port,
            disk_handle,
            disk_alert_port,
            None,
            None,
            None,
            None,
            conf,
        );
        TestRig {
            torrent,
            write_port,
            _cmd_chan: cmd_chan,
            _disk_cmd_port: disk_cmd_port,
            _disk_alert_chan: disk_alert_chan,
        }
    }

    fn candidate(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 1, 1, n], 6881))
    }

    // Only http(s) announce URLs become tracker clients; udp and malformed
    // entries are skipped (the udp wire lives outside the engine).
    #[test]
    fn test_tracker_urls_are_filtered() {
        let rig = rig(
            single_file_storage(),
            vec![
                "http://tracker.one/announce".into(),
                "udp://tracker.two:6969/announce".into(),
                "https://tracker.three/announce".into(),
                "not an url at all".into(),
                "ftp://tracker.four/announce".into(),
            ],
            8,
            Conf::new("/downloads"),
        );
        let urls: Vec<String> = rig
            .torrent
            .trackers
            .iter()
            .map(|tracker| tracker.url().to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://tracker.one/announce",
                "https://tracker.three/announce",
            ]
        );
    }

    // Candidates are deduplicated for the torrent's lifetime and sessions
    // are only opened up to the configured connection cap; the overflow
    // stays queued.
    #[tokio::test]
    async fn test_candidates_dedup_and_connection_cap() {
        let mut conf = Conf::new("/downloads");
        conf.torrent.max_connected_peer_count = 2;
        let mut rig =
            rig(single_file_storage(), Vec::new(), 8, conf);

        rig.torrent.add_candidates(vec![
            candidate(1),
            candidate(2),
            candidate(3),
        ]);
        // repeats of known candidates are dropped, new ones queued
        rig.torrent
            .add_candidates(vec![candidate(2), candidate(4)]);
        assert_eq!(rig.torrent.candidates.len(), 4);

        rig.torrent.connect_candidates();
        assert_eq!(rig.torrent.peers.len(), 2);
        assert_eq!(rig.torrent.candidates.len(), 2);

        // a peer we already hold a session towards is not re-queued either
        rig.torrent.add_candidates(vec![candidate(1)]);
        assert_eq!(rig.torrent.candidates.len(), 2);
    }

    // A piece write rejected by the saturated disk queue keeps its payload
    // and is retried once the queue has drained.
    #[tokio::test]
    async fn test_retry_writes_respects_queue_backpressure() {
        let mut rig = rig(
            single_file_storage(),
            Vec::new(),
            // room for exactly one queued piece
            1,
            Conf::new("/downloads"),
        );

        rig.torrent.write_retries.push_back((0, vec![0xab; 8]));
        rig.torrent.write_retries.push_back((1, vec![0xcd; 8]));

        // the first piece fills the queue; the second is handed back
        rig.torrent.retry_writes().await;
        assert_eq!(rig.torrent.write_retries.len(), 1);
        assert_eq!(rig.torrent.write_retries[0].0, 1);
        // the rejected payload survives for the retry
        assert_eq!(rig.torrent.write_retries[0].1, vec![0xcd; 8]);

        let queued = rig.write_port.try_recv().unwrap();
        assert_eq!(queued.piece_index, 0);
        assert_eq!(queued.data, vec![0xab; 8]);

        // with the queue drained the retry goes through
        rig.torrent.retry_writes().await;
        assert!(rig.torrent.write_retries.is_empty());
        let queued = rig.write_port.try_recv().unwrap();
        assert_eq!(queued.piece_index, 1);
        assert_eq!(queued.data, vec![0xcd; 8]);
    }

    // The checkpoint's file list carries BEP-47 attributes but omits
    // padding files, which are never materialized on disk.
    #[test]
    fn test_file_checkpoints_exclude_padding() {
        let mut tool = FileInfo::new("bin/tool", 0, 700);
        tool.attr = Some("x".into());
        let mut pad = FileInfo::new(".pad/324", 700, 324);
        pad.attr = Some("p".into());
        let readme = FileInfo::new("readme", 1024, 512);

        let storage = StorageInfo {
            piece_count: 3,
            piece_len: 512,
            last_piece_len: 512,
            download_len: 1536,
            download_dir: PathBuf::from("/downloads/bundle"),
            structure: FsStructure::Archive {
                files: vec![tool, pad, readme],
            },
        };
        let rig = rig(storage, Vec::new(), 8, Conf::new("/downloads"));

        let files = rig.torrent.file_checkpoints();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "/downloads/bundle/bin/tool");
        assert_eq!(files[0].attributes.as_deref(), Some("x"));
        assert_eq!(files[1].path, "/downloads/bundle/readme");
        assert!(files.iter().all(|f| f.attributes.as_deref() != Some("p")));
    }
}
