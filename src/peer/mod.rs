//! One state machine per TCP peer connection.
//!
//! A session drives the connection from TCP connect through the handshake
//! and the availability exchange into the connected state, then relays
//! blocks between the wire and the piece engine: outgoing requests are
//! routed in from the torrent's selection tick, incoming requests are
//! served from verified pieces through the disk layer while the remote is
//! unchoked.

pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock,
    },
    time::{self, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    disk::DiskHandle,
    error::*,
    piece::{self, PieceManager},
    Bitfield, BlockInfo, InfoHash, PeerId, PieceIndex, TorrentId,
};
use codec::*;

/// The channel on which the torrent task commands a peer session.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Send block requests planned by the piece engine's selection tick.
    Request(Vec<BlockInfo>),
    /// Cancel an in-flight request (endgame duplicates).
    Cancel(BlockInfo),
    /// Announce a freshly verified piece to the peer.
    Have(PieceIndex),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Everything a session needs from its torrent, bundled at spawn.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub torrent_id: TorrentId,
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub piece_manager: Arc<RwLock<PieceManager>>,
    pub disk: DiskHandle,
    /// Endgame duplicate cancellations are routed through the torrent task,
    /// which owns every session's command channel.
    pub cancel_chan: UnboundedSender<(SocketAddr, BlockInfo)>,
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub peer_timeout: Duration,
}

pub(crate) struct PeerSession {
    ctx: SessionContext,
    /// The port on which the peer session receives commands.
    cmd_port: Receiver,
    /// The remote address of the peer.
    addr: SocketAddr,
    status: Status,
    /// Our pending requests that we sent to peer. If we receive a block
    /// that is not in this list, it was either cancelled under us or the
    /// peer is misbehaving; the piece engine sorts out true duplicates.
    /// Emptied when we get choked, as in that case we don't expect
    /// outstanding requests to be served.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address.
    pub fn new(ctx: SessionContext, addr: SocketAddr) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                cmd_port,
                addr,
                status: Status::default(),
                outgoing_requests: Vec::new(),
                peer_info: None,
            },
            cmd_chan,
        )
    }

    /// Starts an outbound session: connects, handshakes, and runs the
    /// message loop until the connection closes or an error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = time::timeout(
            self.ctx.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await?
        .map_err(|e| {
            log::info!("Failed to connect to peer {}: {}", self.addr, e);
            Error::Network(e.to_string())
        })?;
        log::info!("Connected to peer {}", self.addr);
        tune_socket(&socket);

        let socket = time::timeout(
            self.ctx.handshake_timeout,
            self.handshake(socket),
        )
        .await??;
        self.run(socket).await
    }

    /// Starts a session on an accepted inbound connection whose handshake
    /// the listener already consumed and validated. Any bytes the peer
    /// sent right after its handshake arrive in `read_buf`.
    pub async fn start_accepted(
        &mut self,
        socket: TcpStream,
        peer_id: PeerId,
        read_buf: bytes::BytesMut,
    ) -> Result<()> {
        log::info!("Accepted inbound peer {}", self.addr);
        tune_socket(&socket);
        self.status.state = State::Handshaking;

        // reply with our own handshake
        let mut framed = Framed::new(socket, HandshakeCodec);
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        time::timeout(self.ctx.handshake_timeout, framed.send(handshake))
            .await?
            .map_err(|_| Error::Handshake)?;

        self.peer_info = Some(PeerInfo {
            peer_id,
            pieces: None,
        });

        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.ctx
            .piece_manager
            .write()
            .await
            .register_peer(self.addr, self.ctx.pipeline_depth);
        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}", self.addr, self.status.state
        );

        self.run(socket).await
    }

    /// Exchanges the 68 byte handshakes of an outbound connection and
    /// returns the socket re-framed with the peer message codec.
    async fn handshake(
        &mut self,
        socket: TcpStream,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        // the outbound side sends the first handshake
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await.map_err(|_| Error::Handshake)?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = match socket.next().await {
            Some(Ok(peer_handshake)) => peer_handshake,
            Some(Err(e)) => {
                log::info!("Peer {} handshake error: {}", self.addr, e);
                return Err(Error::Handshake);
            }
            None => return Err(Error::Handshake),
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // the codec only returns handshakes with a valid protocol string
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::Handshake);
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });

        // switch to the peer message codec, keeping any bytes the peer may
        // have sent right after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.ctx
            .piece_manager
            .write()
            .await
            .register_peer(self.addr, self.ctx.pipeline_depth);

        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);
        Ok(socket)
    }

    /// The main session loop: relays messages, commands, and timers until
    /// shutdown or a connection error.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        // our own availability is advertised right after the handshake
        let own_pieces = self.own_bitfield().await;
        if own_pieces.any() {
            log::info!("Sending bitfield to peer {}", self.addr);
            sink.send(Message::Bitfield(own_pieces))
                .await
                .map_err(|_| Error::Network("send failed".into()))?;
        }

        let mut keep_alive = time::interval(self.ctx.keep_alive_interval);
        keep_alive.tick().await;
        let mut last_recv = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            log::info!(
                                "Peer {} message error: {}", self.addr, e
                            );
                            return Err(Error::Message);
                        }
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            break;
                        }
                    };
                    last_recv = Instant::now();

                    // the bitfield may only be received directly after the
                    // handshake
                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                        } else {
                            // a peer that starts with any other message has
                            // no pieces yet; have messages will trickle in
                            self.handle_msg(&mut sink, msg).await?;
                        }
                        self.status.state = State::Connected;
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Request(blocks)) => {
                            self.make_requests(&mut sink, blocks).await?;
                        }
                        Some(Command::Cancel(block)) => {
                            if let Some(pos) = self
                                .outgoing_requests
                                .iter()
                                .position(|b| *b == block)
                            {
                                self.outgoing_requests.remove(pos);
                                sink.send(Message::Cancel(block))
                                    .await
                                    .map_err(|_| Error::Network(
                                        "send failed".into(),
                                    ))?;
                            }
                        }
                        Some(Command::Have(piece_index)) => {
                            sink.send(Message::Have { piece_index })
                                .await
                                .map_err(|_| {
                                    Error::Network("send failed".into())
                                })?;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!(
                                "Shutting down peer {} session", self.addr
                            );
                            self.status.state = State::Disconnecting;
                            break;
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if last_recv.elapsed() > self.ctx.peer_timeout {
                        log::warn!(
                            "Peer {} timed out after {:?} of silence",
                            self.addr,
                            self.ctx.peer_timeout
                        );
                        return Err(Error::Timeout);
                    }
                    log::debug!("Sending keep alive to peer {}", self.addr);
                    sink.send(Message::KeepAlive).await.map_err(|_| {
                        Error::Network("send failed".into())
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Handles the peer's one-shot bitfield message.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Slice off the trailing bits.
        if self.ctx.piece_count > 0 {
            bitfield.resize(self.ctx.piece_count, false);
        }

        self.status.is_interested = self
            .ctx
            .piece_manager
            .write()
            .await
            .update_peer_bitfield(self.addr, &bitfield);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        if self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            sink.send(Message::Interested)
                .await
                .map_err(|_| Error::Network("send failed".into()))?;
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                    self.ctx
                        .piece_manager
                        .write()
                        .await
                        .peer_choked(&self.addr);
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.ctx
                        .piece_manager
                        .write()
                        .await
                        .peer_unchoked(&self.addr);
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    // no optimistic unchoke scheduler in the core: an
                    // interested peer is served for the connection's
                    // lifetime
                    self.status.is_peer_choked = false;
                    sink.send(Message::Unchoke)
                        .await
                        .map_err(|_| Error::Network("send failed".into()))?;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                log::debug!("Peer {} has piece {}", self.addr, piece_index);
                self.ctx
                    .piece_manager
                    .write()
                    .await
                    .update_peer_have(self.addr, piece_index);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(sink, block).await?;
            }
            Message::Cancel(block) => {
                // nothing is queued per connection at the moment, so an
                // unserved request simply won't be answered
                log::debug!(
                    "Peer {} cancelled request {:?}", self.addr, block
                );
            }
        }

        Ok(())
    }

    /// Sends the planned block requests, within the session's pipeline
    /// allowance.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        blocks: Vec<BlockInfo>,
    ) -> Result<()> {
        if self.status.is_choked || self.status.state != State::Connected {
            log::debug!(
                "Dropping {} planned request(s) towards peer {}: session \
                cannot request",
                blocks.len(),
                self.addr
            );
            return Ok(());
        }
        for block in blocks {
            if self.outgoing_requests.len() >= self.ctx.pipeline_depth {
                break;
            }
            if self.outgoing_requests.contains(&block) {
                continue;
            }
            log::debug!(
                "Requesting block {:?} from peer {}", block, self.addr
            );
            self.outgoing_requests.push(block);
            sink.send(Message::Request(block))
                .await
                .map_err(|_| Error::Network("send failed".into()))?;
        }
        Ok(())
    }

    /// Deposits a received block with the piece engine and schedules hash
    /// verification when the piece became complete.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        log::debug!(
            "Received block from peer {}: {:?}", self.addr, block_info
        );

        if let Some(pos) = self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            self.outgoing_requests.remove(pos);
        } else {
            // in endgame the same block is in flight towards several peers,
            // so unsolicited blocks may legitimately arrive; the piece
            // engine drops true duplicates
            log::debug!(
                "Peer {} sent not requested block: {:?}",
                self.addr,
                block_info,
            );
        }

        let deposit = self
            .ctx
            .piece_manager
            .write()
            .await
            .handle_block(self.addr, piece_index, offset, data);
        if let Some(job) = deposit.verify {
            piece::spawn_verification(
                Arc::clone(&self.ctx.piece_manager),
                job,
            );
        }
        // duplicate in-flight requests towards other peers are cancelled by
        // the torrent task, which owns their command channels
        for cancel in deposit.cancels {
            let _ = self.ctx.cancel_chan.send(cancel);
        }

        Ok(())
    }

    /// Serves a block request from a verified piece, unless we are choking
    /// the peer.
    async fn handle_request_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::warn!(
                "Peer {} requested {:?} while choked, dropping",
                self.addr,
                block
            );
            return Ok(());
        }
        let (piece_len, verified, cached) = {
            let manager = self.ctx.piece_manager.read().await;
            if block.piece_index >= manager.piece_count() {
                log::warn!(
                    "Peer {} requested out of range piece {}, dropping",
                    self.addr,
                    block.piece_index
                );
                return Ok(());
            }
            (
                manager.piece_len(block.piece_index),
                manager.verified_pieces().contains(&block.piece_index),
                manager.get_block(block.piece_index, block.offset, block.len),
            )
        };
        if !block.is_within(piece_len) {
            log::warn!(
                "Peer {} requested invalid range {:?} of a {} byte piece",
                self.addr,
                block,
                piece_len
            );
            return Err(Error::Message);
        }

        // serve from the engine if the payload is still memory resident,
        // falling back to the disk layer's read cache
        let data = match cached {
            Some(data) => data,
            None => {
                if !verified {
                    log::warn!(
                        "Peer {} requested unverified piece {}, dropping",
                        self.addr,
                        block.piece_index
                    );
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                self.ctx.disk.read_block(self.ctx.torrent_id, block, tx)?;
                match rx.await {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        log::warn!(
                            "Disk read for {:?} failed: {}", block, e
                        );
                        return Ok(());
                    }
                    Err(_) => return Err(Error::Channel),
                }
            }
        };

        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await
        .map_err(|_| Error::Network("send failed".into()))?;
        Ok(())
    }

    /// Our own piece availability, for the post-handshake bitfield.
    async fn own_bitfield(&self) -> Bitfield {
        let manager = self.ctx.piece_manager.read().await;
        let mut bitfield = Bitfield::repeat(false, self.ctx.piece_count);
        for index in manager.verified_pieces() {
            if *index < bitfield.len() {
                bitfield.set(*index, true);
            }
        }
        bitfield
    }
}

/// Enables the latency and keep-alive socket options the engine relies on.
/// These are performance defaults; failures are logged and ignored.
fn tune_socket(socket: &TcpStream) {
    if let Err(e) = socket.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    #[cfg(unix)]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        if let Err(e) = setsockopt(socket, sockopt::KeepAlive, &true) {
            log::debug!("Failed to set SO_KEEPALIVE: {}", e);
        }
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    #[default]
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield
    /// exchange occurs after the handshake and not later. It is set once
    /// the handshakes are exchanged and changed as soon as we receive the
    /// bitfield or the first message that is not a bitfield. Any subsequent
    /// bitfield messages are rejected and the connection is dropped, as per
    /// the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
    /// The session is shutting down and the connection is being torn down.
    Disconnecting,
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    #[allow(dead_code)]
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Option<Bitfield>,
}
