//! The engine: owns the disk task, the optional DHT node, and the
//! torrents, and accepts inbound peer connections on the configured listen
//! port.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use bytes::BytesMut;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time,
};

use crate::{
    checkpoint::CheckpointStore,
    conf::Conf,
    dht::DhtNode,
    disk::{self, Alert, AlertReceiver, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    peer::codec::{HANDSHAKE_LEN, PROTOCOL_STRING},
    piece::{verify, PieceManager},
    storage_info::StorageInfo,
    torrent::{self, Torrent},
    InfoHash, TorrentId,
};

/// Parameters of a torrent to add to the engine.
pub struct TorrentParams {
    pub metainfo: Metainfo,
    /// Overrides the engine-wide download directory for this torrent.
    pub download_dir: Option<PathBuf>,
    /// The magnet URI the descriptor originated from, if any; carried into
    /// checkpoints so a resume can reconstruct the source.
    pub magnet_uri: Option<String>,
    /// The path of the `.torrent` file the descriptor was parsed from.
    pub torrent_file_path: Option<PathBuf>,
}

/// Routes inbound connections to their torrent by info hash.
type TorrentRegistry = Arc<StdMutex<HashMap<InfoHash, torrent::Sender>>>;

pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    disk_join: JoinHandle<disk::Result<()>>,
    disk_alert_port: AlertReceiver,
    dht: Option<DhtNode>,
    checkpoints: Option<Arc<CheckpointStore>>,
    torrents: HashMap<TorrentId, torrent::Sender>,
    registry: TorrentRegistry,
    listener: Option<JoinHandle<()>>,
    next_torrent_id: TorrentId,
}

impl Engine {
    /// Brings up the engine's shared services: the disk task, the DHT node
    /// (when enabled; a failure to bind only disables DHT discovery), and
    /// the inbound peer listener.
    pub async fn new(conf: Conf) -> Result<Self> {
        let (disk_join, disk, disk_alert_port) =
            disk::spawn(conf.disk.clone())?;

        let dht = if conf.dht.enabled {
            match DhtNode::start(conf.dht.clone()).await {
                Ok(dht) => Some(dht),
                Err(e) => {
                    log::warn!(
                        "DHT disabled, node failed to start: {}", e
                    );
                    None
                }
            }
        } else {
            None
        };

        let checkpoints = if conf.disk.checkpoint_enabled {
            match CheckpointStore::new(&conf.disk, &conf.torrent.download_dir)
            {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::warn!("Checkpointing disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let registry: TorrentRegistry =
            Arc::new(StdMutex::new(HashMap::new()));
        let listener = match TcpListener::bind((
            "0.0.0.0",
            conf.network.listen_port,
        ))
        .await
        {
            Ok(listener) => {
                log::info!(
                    "Listening for peers on {:?}",
                    listener.local_addr().ok()
                );
                Some(tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&registry),
                    conf.network.handshake_timeout,
                )))
            }
            Err(e) => {
                log::warn!(
                    "Inbound connections disabled, failed to bind port {}: \
                    {}",
                    conf.network.listen_port,
                    e
                );
                None
            }
        };

        Ok(Self {
            conf,
            disk,
            disk_join,
            disk_alert_port,
            dht,
            checkpoints,
            torrents: HashMap::new(),
            registry,
            listener,
            next_torrent_id: 0,
        })
    }

    /// Adds a torrent and starts downloading (or seeding, once complete).
    pub async fn add_torrent(
        &mut self,
        params: TorrentParams,
    ) -> Result<TorrentId> {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let metainfo = params.metainfo;
        let info_hash = metainfo.create_info_hash()?;
        let download_dir = params
            .download_dir
            .unwrap_or_else(|| self.conf.torrent.download_dir.clone());
        let storage = StorageInfo::new(&metainfo, download_dir);

        // the disk task sets up the directory tree and the files
        self.disk.allocate_new_torrent(id, storage.clone())?;
        let disk_alert_port = loop {
            match self.disk_alert_port.recv().await {
                Some(Alert::TorrentAllocation(Ok(allocation)))
                    if allocation.id == id =>
                {
                    break allocation.alert_port;
                }
                Some(Alert::TorrentAllocation(Ok(allocation))) => {
                    log::warn!(
                        "Unexpected allocation result for torrent {}",
                        allocation.id
                    );
                }
                Some(Alert::TorrentAllocation(Err(e))) => {
                    return Err(match e {
                        disk::NewTorrentError::AlreadyExists => {
                            Error::Validation(
                                "torrent already in engine".into(),
                            )
                        }
                        disk::NewTorrentError::Io { path, source } => {
                            Error::Disk { path, source }
                        }
                    });
                }
                None => return Err(Error::Channel),
            }
        };

        let (piece_manager, piece_alert_port) = PieceManager::new(
            info_hash,
            storage.piece_count,
            storage.piece_len,
            storage.last_piece_len,
            metainfo.piece_hashes().map(|h| h.to_vec()).unwrap_or_default(),
            metainfo.v2_piece_hashes(),
            metainfo.meta_version(),
            self.conf.network.block_size_kib * 1024,
            verify::effective_hash_workers(
                self.conf.disk.hash_workers,
                self.conf.disk.hash_workers_adaptive,
            ),
            self.conf.strategy.clone(),
        );

        let (mut torrent, torrent_chan) = Torrent::new(
            id,
            metainfo.info.name.clone(),
            info_hash,
            metainfo.is_private(),
            metainfo.trackers(),
            storage,
            piece_manager,
            piece_alert_port,
            self.disk.clone(),
            disk_alert_port,
            self.dht.clone(),
            self.checkpoints.clone(),
            params.magnet_uri,
            params
                .torrent_file_path
                .map(|p| p.to_string_lossy().into_owned()),
            self.conf.clone(),
        );

        // stream DHT discoveries into the torrent as peer candidates
        if let Some(dht) = &self.dht {
            let mut discoveries = dht.subscribe(Some(info_hash));
            let chan = torrent_chan.clone();
            tokio::spawn(async move {
                while let Some((_, peers)) = discoveries.recv().await {
                    if chan.send(torrent::Command::AddPeers(peers)).is_err()
                    {
                        break;
                    }
                }
            });
        }

        self.registry
            .lock()
            .unwrap()
            .insert(info_hash, torrent_chan.clone());
        self.torrents.insert(id, torrent_chan);

        tokio::spawn(async move {
            if let Err(e) = torrent.start().await {
                log::error!("Torrent {} failed: {}", id, e);
            }
        });

        log::info!(
            "Added torrent {} ({})", id, hex::encode(info_hash)
        );
        Ok(id)
    }

    /// Repositions a streaming torrent's playback cursor; the pieces around
    /// the new position get their priority raised.
    pub fn seek(
        &self,
        id: TorrentId,
        target_piece: crate::PieceIndex,
    ) -> Result<()> {
        let chan = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        chan.send(torrent::Command::Seek(target_piece))
            .map_err(|_| Error::Channel)
    }

    /// Hands externally discovered peers (e.g. PEX) to a torrent.
    pub fn add_peers(
        &self,
        id: TorrentId,
        peers: Vec<std::net::SocketAddr>,
    ) -> Result<()> {
        if !self.conf.network.enable_pex {
            return Ok(());
        }
        let chan = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        chan.send(torrent::Command::AddPeers(peers))
            .map_err(|_| Error::Channel)
    }

    /// Shuts the engine down: torrents announce `stopped` and checkpoint,
    /// the DHT node stops, and the disk task flushes pending writes before
    /// the call returns.
    pub async fn shutdown(self) -> Result<()> {
        log::info!("Shutting down engine");
        for (id, chan) in self.torrents.iter() {
            log::debug!("Stopping torrent {}", id);
            let _ = chan.send(torrent::Command::Shutdown);
        }
        // give torrents a moment to run their shutdown sequence
        time::sleep(std::time::Duration::from_millis(250)).await;

        if let Some(listener) = self.listener {
            listener.abort();
        }
        if let Some(dht) = &self.dht {
            dht.shutdown();
        }

        self.disk.shutdown().map_err(Error::from)?;
        match self.disk_join.await {
            Ok(result) => result.map_err(Error::from)?,
            Err(e) => log::warn!("Disk task join failed: {}", e),
        }
        Ok(())
    }
}

/// Accepts inbound connections, consumes and validates the remote
/// handshake, and routes the socket to the torrent owning the advertised
/// info hash. Unknown info hashes and malformed handshakes close the
/// connection.
async fn accept_loop(
    listener: TcpListener,
    registry: TorrentRegistry,
    handshake_timeout: std::time::Duration,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                continue;
            }
        };
        log::debug!("Inbound connection from {}", addr);

        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            match time::timeout(
                handshake_timeout,
                read_handshake(socket),
            )
            .await
            {
                Ok(Ok((socket, info_hash, peer_id))) => {
                    let chan = registry
                        .lock()
                        .unwrap()
                        .get(&info_hash)
                        .cloned();
                    match chan {
                        Some(chan) => {
                            let _ = chan.send(
                                torrent::Command::InboundPeer {
                                    socket,
                                    peer_id,
                                    read_buf: BytesMut::new(),
                                },
                            );
                        }
                        None => {
                            log::debug!(
                                "Inbound peer {} for unknown torrent {}",
                                addr,
                                hex::encode(info_hash)
                            );
                        }
                    }
                }
                Ok(Err(e)) => {
                    log::debug!(
                        "Inbound handshake from {} failed: {}", addr, e
                    );
                }
                Err(_) => {
                    log::debug!(
                        "Inbound handshake from {} timed out", addr
                    );
                }
            }
        });
    }
}

/// Reads and validates the remote's 68 byte handshake, returning the
/// socket together with the advertised info hash and peer id.
async fn read_handshake(
    mut socket: TcpStream,
) -> Result<(TcpStream, InfoHash, crate::PeerId)> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    socket
        .read_exact(&mut buf)
        .await
        .map_err(|_| Error::Handshake)?;
    let (info_hash, peer_id) = parse_handshake(&buf)?;
    Ok((socket, info_hash, peer_id))
}

/// Validates a raw 68 byte handshake and extracts the advertised info hash
/// and peer id.
fn parse_handshake(
    buf: &[u8; HANDSHAKE_LEN],
) -> Result<(InfoHash, crate::PeerId)> {
    if buf[0] as usize != PROTOCOL_STRING.len()
        || &buf[1..20] != PROTOCOL_STRING.as_bytes()
    {
        return Err(Error::Handshake);
    }
    // bytes 20..28 are the reserved extension bits, accepted as-is

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[28..48]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok((info_hash, peer_id))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::peer::codec::{Handshake, HandshakeCodec};

    fn raw_handshake(
        info_hash: InfoHash,
        peer_id: crate::PeerId,
    ) -> [u8; HANDSHAKE_LEN] {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new(info_hash, peer_id), &mut buf)
            .unwrap();
        buf[..].try_into().unwrap()
    }

    #[test]
    fn test_parse_handshake_extracts_identity() {
        let info_hash = [0x5c; 20];
        let peer_id = *b"-cb0100-aaaaaaaaaaaa";
        let buf = raw_handshake(info_hash, peer_id);

        let (parsed_hash, parsed_id) = parse_handshake(&buf).unwrap();
        assert_eq!(parsed_hash, info_hash);
        assert_eq!(parsed_id, peer_id);
    }

    #[test]
    fn test_parse_handshake_rejects_bad_length_prefix() {
        let mut buf = raw_handshake([0x5c; 20], [0; 20]);
        buf[0] = 18;
        assert!(matches!(parse_handshake(&buf), Err(Error::Handshake)));
    }

    #[test]
    fn test_parse_handshake_rejects_wrong_protocol_string() {
        let mut buf = raw_handshake([0x5c; 20], [0; 20]);
        buf[5] ^= 0xff;
        assert!(matches!(parse_handshake(&buf), Err(Error::Handshake)));
    }

    // The reserved extension bits carry no meaning for the engine and must
    // not fail validation.
    #[test]
    fn test_parse_handshake_accepts_reserved_bits() {
        let mut buf = raw_handshake([0x5c; 20], [0; 20]);
        for bit in buf[20..28].iter_mut() {
            *bit = 0xff;
        }
        assert!(parse_handshake(&buf).is_ok());
    }

    #[tokio::test]
    async fn test_read_handshake_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [0x7d; 20];
        let peer_id = *b"-cb0100-bbbbbbbbbbbb";

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(&raw_handshake(info_hash, peer_id))
                .await
                .unwrap();
            stream
        });

        let (socket, _) = listener.accept().await.unwrap();
        let (_socket, parsed_hash, parsed_id) =
            read_handshake(socket).await.unwrap();
        assert_eq!(parsed_hash, info_hash);
        assert_eq!(parsed_id, peer_id);
        client.await.unwrap();
    }

    // A connection that closes before delivering all 68 bytes is a
    // handshake failure, not a hang.
    #[tokio::test]
    async fn test_read_handshake_rejects_truncated_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let partial = raw_handshake([0x7d; 20], [0; 20]);
            stream.write_all(&partial[..20]).await.unwrap();
            // dropping the stream cuts the handshake short
        });

        let (socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            read_handshake(socket).await,
            Err(Error::Handshake)
        ));
        client.await.unwrap();
    }
}
