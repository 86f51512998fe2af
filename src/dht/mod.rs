//! The DHT node: Kademlia peer discovery and announce without a tracker.
//!
//! One UDP endpoint serves both roles: a client issuing `ping`,
//! `find_node`, `get_peers`, and `announce_peer` queries, and a server
//! answering the same queries from other nodes (token gated storage for
//! `announce_peer`). Background loops refresh the routing table on an
//! adaptive interval and expire stale tokens and dead nodes every five
//! minutes. Discovered peers are streamed to subscribers as they surface,
//! not only when a lookup completes.

pub(crate) mod lookup;
pub(crate) mod msg;
pub(crate) mod routing;

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rand::Rng;
use serde_bencode::value::Value;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};

use crate::{
    conf::DhtConf,
    error::{Error, Result},
    InfoHash,
};
use lookup::{Candidate, LookupState};
use msg::{KrpcKind, KrpcResponse, TransactionId};
use routing::{NodeId, NodeInfo, RoutingTable};

/// A batch of peers discovered for a torrent.
pub(crate) type Discovery = (InfoHash, Vec<SocketAddr>);
pub(crate) type DiscoverySender = mpsc::UnboundedSender<Discovery>;
pub(crate) type DiscoveryReceiver = mpsc::UnboundedReceiver<Discovery>;

/// Diagnostic counters of the node.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DhtStats {
    pub nodes: usize,
    pub good_nodes: usize,
    pub health: f64,
    pub stored_torrents: usize,
}

/// How many failed queries expire a node in the cleanup pass.
const NODE_FAILURE_THRESHOLD: u32 = 3;
/// The cleanup loop period.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// How many random targets each refresh round walks.
const REFRESH_TARGETS: usize = 8;

struct PendingQuery {
    chan: oneshot::Sender<KrpcResponse>,
}

struct IssuedToken {
    token: Vec<u8>,
    issued_at: Instant,
}

struct CapturedToken {
    token: Vec<u8>,
    captured_at: Instant,
}

struct Inner {
    conf: DhtConf,
    own_id: NodeId,
    routing: RoutingTable,
    /// In-flight queries keyed by transaction id; late responses find no
    /// entry and are dropped.
    pending: HashMap<TransactionId, PendingQuery>,
    /// Tokens other nodes gave us, per info hash and responder address.
    captured_tokens: HashMap<InfoHash, HashMap<SocketAddr, CapturedToken>>,
    /// Tokens we handed out, per requester ip.
    issued_tokens: HashMap<IpAddr, IssuedToken>,
    /// Peers announced to us, per info hash.
    peer_store: HashMap<InfoHash, HashSet<SocketAddr>>,
    /// Torrents that must never touch the DHT (BEP-27).
    private_torrents: HashSet<InfoHash>,
    /// Global subscribers receive every discovery; keyed subscribers only
    /// their info hash.
    subscribers: Vec<DiscoverySender>,
    subscribers_by_hash: HashMap<InfoHash, Vec<DiscoverySender>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn fresh_tid(&self) -> TransactionId {
        let mut rng = rand::thread_rng();
        loop {
            let tid: TransactionId = rng.gen();
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    /// The per-query timeout, derived from the observed health of known
    /// nodes and clamped to the configured bounds.
    fn adaptive_timeout(&self) -> Duration {
        let times: Vec<f64> = self
            .routing
            .iter()
            .filter(|n| n.avg_response_time > 0.0)
            .map(|n| n.avg_response_time)
            .collect();
        let timeout = if times.is_empty() {
            self.conf.max_query_timeout
        } else {
            let avg = times.iter().sum::<f64>() / times.len() as f64;
            Duration::from_secs_f64(avg * 3.0 + 0.5)
        };
        timeout.clamp(self.conf.min_query_timeout, self.conf.max_query_timeout)
    }

    /// The refresh interval, scaled by swarm size and health and clamped
    /// to the configured bounds.
    fn adaptive_refresh_interval(&self) -> Duration {
        let total = self.routing.len();
        let health = self.routing.health();
        let multiplier = if total >= 50 && health >= 0.8 {
            1.5
        } else if total < 20 || health < 0.5 {
            0.5
        } else {
            1.0
        };
        let interval = self.conf.base_refresh_interval.mul_f64(multiplier);
        interval.clamp(
            self.conf.min_refresh_interval,
            self.conf.max_refresh_interval,
        )
    }

    fn notify_peers(&mut self, info_hash: InfoHash, peers: &[SocketAddr]) {
        if peers.is_empty() {
            return;
        }
        self.subscribers
            .retain(|chan| chan.send((info_hash, peers.to_vec())).is_ok());
        if let Some(subscribers) =
            self.subscribers_by_hash.get_mut(&info_hash)
        {
            subscribers
                .retain(|chan| chan.send((info_hash, peers.to_vec())).is_ok());
        }
    }

    fn record_success(&mut self, id: &NodeId, elapsed: Duration) {
        if let Some(node) = self.routing.get_mut(id) {
            node.record_success(elapsed);
        }
    }

    fn record_failure(&mut self, id: &NodeId, elapsed: Option<Duration>) {
        if let Some(node) = self.routing.get_mut(id) {
            node.record_failure(elapsed);
        }
    }
}

/// A handle to the DHT node; cloning is cheap and all clones drive the same
/// node.
#[derive(Clone)]
pub(crate) struct DhtNode {
    inner: Arc<Mutex<Inner>>,
    socket: Arc<UdpSocket>,
}

impl DhtNode {
    /// Binds the UDP endpoint, spawns the receive, refresh, and cleanup
    /// loops, and kicks off bootstrap.
    pub async fn start(conf: DhtConf) -> Result<Self> {
        let socket =
            UdpSocket::bind(("0.0.0.0", conf.bind_port))
                .await
                .map_err(|e| {
                    Error::Network(format!(
                        "failed to bind DHT port {}: {}",
                        conf.bind_port, e
                    ))
                })?;
        let socket = Arc::new(socket);
        let own_id = NodeId::random();
        log::info!(
            "DHT node {:?} listening on {:?}",
            own_id,
            socket.local_addr().ok()
        );

        let k = conf.k.max(1);
        let inner = Arc::new(Mutex::new(Inner {
            own_id,
            routing: RoutingTable::new(own_id, k),
            pending: HashMap::new(),
            captured_tokens: HashMap::new(),
            issued_tokens: HashMap::new(),
            peer_store: HashMap::new(),
            private_torrents: HashSet::new(),
            subscribers: Vec::new(),
            subscribers_by_hash: HashMap::new(),
            tasks: Vec::new(),
            conf,
        }));
        let node = Self {
            inner,
            socket,
        };

        let recv = tokio::spawn(node.clone().recv_loop());
        let refresh = tokio::spawn(node.clone().refresh_loop());
        let cleanup = tokio::spawn(node.clone().cleanup_loop());
        let bootstrap = tokio::spawn(node.clone().bootstrap());
        node.inner
            .lock()
            .unwrap()
            .tasks
            .extend([recv, refresh, cleanup, bootstrap]);

        Ok(node)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Stops the background loops. In-flight queries resolve as timeouts.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        log::info!("DHT node stopped");
    }

    /// Subscribes to discovered peers: globally, or for one info hash.
    pub fn subscribe(
        &self,
        info_hash: Option<InfoHash>,
    ) -> DiscoveryReceiver {
        let (chan, port) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        match info_hash {
            Some(info_hash) => inner
                .subscribers_by_hash
                .entry(info_hash)
                .or_default()
                .push(chan),
            None => inner.subscribers.push(chan),
        }
        port
    }

    /// Marks a torrent private: the node will never run `get_peers` or
    /// `announce_peer` for it (BEP-27).
    pub fn mark_private(&self, info_hash: InfoHash) {
        self.inner
            .lock()
            .unwrap()
            .private_torrents
            .insert(info_hash);
    }

    pub fn stats(&self) -> DhtStats {
        let inner = self.inner.lock().unwrap();
        let nodes = inner.routing.len();
        let good_nodes =
            inner.routing.iter().filter(|n| n.is_good).count();
        DhtStats {
            nodes,
            good_nodes,
            health: inner.routing.health(),
            stored_torrents: inner.peer_store.len(),
        }
    }

    /// Waits until bootstrap populated the routing table, up to the
    /// timeout. Returns whether any node was learned.
    pub async fn wait_for_bootstrap(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let nodes = self.inner.lock().unwrap().routing.len();
            if nodes >= self.inner.lock().unwrap().conf.k {
                return true;
            }
            if Instant::now() >= deadline {
                return nodes > 0;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The iterative `get_peers` lookup.
    ///
    /// Runs α parallel queries per iteration against the closest unqueried
    /// candidates, merges returned nodes into the candidate set and the
    /// routing table, captures announce tokens, and streams deduplicated
    /// peers to subscribers as they are discovered. Terminates on the peer
    /// cap, the depth cap, the `max(2k, 50)` queried cap, or candidate
    /// exhaustion (after a final expansion from the routing table).
    pub async fn get_peers(
        &self,
        info_hash: InfoHash,
        max_peers: usize,
    ) -> Vec<SocketAddr> {
        let (alpha, k, max_depth, read_only, own_id) = {
            let inner = self.inner.lock().unwrap();
            if inner.private_torrents.contains(&info_hash) {
                log::debug!(
                    "Skipping DHT lookup for private torrent {}",
                    hex::encode(info_hash)
                );
                return Vec::new();
            }
            (
                inner.conf.alpha,
                inner.conf.k,
                inner.conf.max_depth,
                inner.conf.read_only,
                inner.own_id,
            )
        };
        if max_peers == 0 {
            return Vec::new();
        }

        let seeds = self.closest_candidates(&NodeId(info_hash), k);
        let mut state = LookupState::new(
            NodeId(info_hash),
            seeds,
            alpha,
            k,
            max_depth,
            max_peers,
        );

        while !state.is_done() {
            if state.is_exhausted() {
                // before terminating, expand once more from the routing
                // table, which background traffic may have grown
                state.add_nodes(
                    self.closest_candidates(&NodeId(info_hash), k * 3),
                );
                if state.is_exhausted() {
                    break;
                }
            }

            let batch = state.next_batch();
            if batch.is_empty() {
                break;
            }
            log::debug!(
                "DHT lookup depth {} for {}: querying {} node(s)",
                state.depth(),
                hex::encode(info_hash),
                batch.len()
            );

            let queries = batch.iter().map(|candidate| {
                let node = self.clone();
                let candidate = *candidate;
                async move {
                    let query = {
                        let inner = node.inner.lock().unwrap();
                        let tid = inner.fresh_tid();
                        (
                            tid,
                            msg::get_peers_query(
                                tid, &own_id, &info_hash, read_only,
                            ),
                        )
                    };
                    let (tid, query) = query;
                    let query = match query {
                        Ok(query) => query,
                        Err(_) => return (candidate, None),
                    };
                    (
                        candidate,
                        node.send_query(candidate.addr, tid, query).await,
                    )
                }
            });
            let responses = futures::future::join_all(queries).await;

            for (candidate, response) in responses {
                let response = match response {
                    Some(response) => response,
                    None => continue,
                };

                if let Some(token) = response.token.clone() {
                    let mut inner = self.inner.lock().unwrap();
                    inner
                        .captured_tokens
                        .entry(info_hash)
                        .or_default()
                        .insert(
                            candidate.addr,
                            CapturedToken {
                                token,
                                captured_at: Instant::now(),
                            },
                        );
                }

                // peers are surfaced to subscribers immediately, not only
                // at lookup completion
                let fresh = state.add_peers(response.peers);
                if !fresh.is_empty() {
                    self.inner
                        .lock()
                        .unwrap()
                        .notify_peers(info_hash, &fresh);
                }

                let mut candidates = Vec::new();
                {
                    let mut inner = self.inner.lock().unwrap();
                    for (id, addr) in response.nodes {
                        inner.routing.insert(NodeInfo::new(id, addr));
                        candidates.push(Candidate { id, addr });
                    }
                }
                state.add_nodes(candidates);
            }
        }

        log::debug!(
            "DHT lookup for {} finished: {} peer(s), {} node(s) queried, \
            depth {}",
            hex::encode(info_hash),
            state.peers().len(),
            state.queried_count(),
            state.depth()
        );
        state.peers().iter().copied().collect()
    }

    /// Announces our listen port for the torrent to the k closest nodes,
    /// using the tokens captured by `get_peers`. Succeeds if any node
    /// acknowledges.
    pub async fn announce_peer(
        &self,
        info_hash: InfoHash,
        port: u16,
    ) -> bool {
        let (k, read_only, own_id, is_private) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.conf.k,
                inner.conf.read_only,
                inner.own_id,
                inner.private_torrents.contains(&info_hash),
            )
        };
        if is_private {
            log::debug!(
                "Skipping DHT announce for private torrent {}",
                hex::encode(info_hash)
            );
            return false;
        }
        if read_only {
            // BEP-43: read-only nodes never announce
            return false;
        }

        let has_tokens = self
            .inner
            .lock()
            .unwrap()
            .captured_tokens
            .get(&info_hash)
            .map_or(false, |tokens| !tokens.is_empty());
        if !has_tokens {
            // fetch tokens with a small lookup
            let _ = self.get_peers(info_hash, 1).await;
        }

        let targets = self.closest_candidates(&NodeId(info_hash), k);
        let token_ttl =
            self.inner.lock().unwrap().conf.token_ttl;
        let mut success = 0;
        for candidate in targets {
            let token = {
                let inner = self.inner.lock().unwrap();
                inner.captured_tokens.get(&info_hash).and_then(|tokens| {
                    // prefer the token this exact node handed out; any
                    // fresh token as fallback
                    tokens
                        .get(&candidate.addr)
                        .or_else(|| tokens.values().next())
                        .filter(|t| t.captured_at.elapsed() < token_ttl)
                        .map(|t| t.token.clone())
                })
            };
            let token = match token {
                Some(token) => token,
                None => continue,
            };

            let (tid, query) = {
                let inner = self.inner.lock().unwrap();
                let tid = inner.fresh_tid();
                (
                    tid,
                    msg::announce_peer_query(
                        tid, &own_id, &info_hash, port, &token, read_only,
                    ),
                )
            };
            let query = match query {
                Ok(query) => query,
                Err(_) => continue,
            };
            if self.send_query(candidate.addr, tid, query).await.is_some() {
                success += 1;
            }
        }

        log::info!(
            "Announced {} to {} node(s)",
            hex::encode(info_hash),
            success
        );
        success > 0
    }

    /// Sends a `find_node` towards the address and merges returned nodes
    /// into the routing table.
    async fn find_node(&self, addr: SocketAddr, target: NodeId) {
        let (tid, query) = {
            let inner = self.inner.lock().unwrap();
            let tid = inner.fresh_tid();
            (
                tid,
                msg::find_node_query(
                    tid,
                    &inner.own_id,
                    &target,
                    inner.conf.read_only,
                ),
            )
        };
        let query = match query {
            Ok(query) => query,
            Err(_) => return,
        };
        if let Some(response) = self.send_query(addr, tid, query).await {
            let mut inner = self.inner.lock().unwrap();
            if let Some(id) = response.id {
                inner.routing.insert(NodeInfo::new(id, addr));
            }
            for (id, node_addr) in response.nodes {
                inner.routing.insert(NodeInfo::new(id, node_addr));
            }
        }
    }

    /// Sends one query datagram and waits for the matching response under
    /// the adaptive timeout. Timeouts and send failures count against the
    /// queried node's quality.
    async fn send_query(
        &self,
        addr: SocketAddr,
        tid: TransactionId,
        query: Vec<u8>,
    ) -> Option<KrpcResponse> {
        let (port, timeout) = {
            let mut inner = self.inner.lock().unwrap();
            let (chan, port) = oneshot::channel();
            inner.pending.insert(tid, PendingQuery { chan });
            (port, inner.adaptive_timeout())
        };

        let started = Instant::now();
        if let Err(e) = self.socket.send_to(&query, addr).await {
            log::debug!("DHT send to {} failed: {}", addr, e);
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(&tid);
            if let Some(id) =
                inner.routing.find_by_addr(&addr).map(|n| n.id)
            {
                inner.record_failure(&id, None);
            }
            return None;
        }

        match time::timeout(timeout, port).await {
            Ok(Ok(response)) => {
                let elapsed = started.elapsed();
                let mut inner = self.inner.lock().unwrap();
                if let Some(id) = response.id {
                    inner.record_success(&id, elapsed);
                } else if let Some(id) =
                    inner.routing.find_by_addr(&addr).map(|n| n.id)
                {
                    inner.record_success(&id, elapsed);
                }
                Some(response)
            }
            Ok(Err(_)) | Err(_) => {
                log::debug!(
                    "DHT query to {} timed out after {:?}", addr, timeout
                );
                let mut inner = self.inner.lock().unwrap();
                inner.pending.remove(&tid);
                if let Some(id) =
                    inner.routing.find_by_addr(&addr).map(|n| n.id)
                {
                    inner.record_failure(&id, Some(timeout));
                }
                None
            }
        }
    }

    fn closest_candidates(
        &self,
        target: &NodeId,
        count: usize,
    ) -> Vec<Candidate> {
        let inner = self.inner.lock().unwrap();
        let prefer_v6 = false;
        inner
            .routing
            .closest(target, count)
            .into_iter()
            .map(|node| Candidate {
                id: node.id,
                addr: node.select_addr(prefer_v6),
            })
            .collect()
    }

    /// Receives datagrams and dispatches them: responses resolve pending
    /// queries by transaction id, queries are answered by the server side.
    async fn recv_loop(self) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("DHT receive error: {}", e);
                    continue;
                }
            };
            let message = match msg::parse_message(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("Invalid DHT datagram from {}: {}", addr, e);
                    continue;
                }
            };

            match message.kind {
                KrpcKind::Response(response) => {
                    let mut inner = self.inner.lock().unwrap();
                    let tid: Option<TransactionId> =
                        message.tid.as_slice().try_into().ok();
                    match tid.and_then(|tid| inner.pending.remove(&tid)) {
                        Some(pending) => {
                            let _ = pending.chan.send(response);
                        }
                        None => {
                            // a response after its timeout, or one we never
                            // asked for
                            log::debug!(
                                "Dropping unmatched DHT response from {}",
                                addr
                            );
                        }
                    }
                }
                KrpcKind::Query { name, args, .. } => {
                    self.handle_query(&name, args, &message.tid, addr).await;
                }
                KrpcKind::Error { code, message: reason } => {
                    log::debug!(
                        "DHT error {} from {}: {}", code, addr, reason
                    );
                    // an error reply settles its query as a failure by
                    // dropping the response channel
                    let mut inner = self.inner.lock().unwrap();
                    if let Ok(tid) =
                        TransactionId::try_from(message.tid.as_slice())
                    {
                        inner.pending.remove(&tid);
                    }
                }
            }
        }
    }

    /// The server side: answers `ping`, `find_node`, `get_peers`, and
    /// `announce_peer` and learns the querying node.
    async fn handle_query(
        &self,
        name: &[u8],
        args: HashMap<Vec<u8>, Value>,
        tid: &[u8],
        addr: SocketAddr,
    ) {
        let reply = {
            let mut inner = self.inner.lock().unwrap();
            // every query teaches us its sender
            if let Some(id) = msg::id_value(&args) {
                inner.routing.insert(NodeInfo::new(id, addr));
            }
            let own_id = inner.own_id;

            match name {
                b"ping" => msg::response(
                    tid,
                    vec![(
                        "id",
                        Value::Bytes(own_id.as_bytes().to_vec()),
                    )],
                ),
                b"find_node" => {
                    let target = match args.get(b"target".as_slice()) {
                        Some(Value::Bytes(target))
                            if target.len() == 20 =>
                        {
                            let mut bytes = [0u8; 20];
                            bytes.copy_from_slice(target);
                            NodeId(bytes)
                        }
                        _ => {
                            let _ = self.send_error(
                                tid,
                                addr,
                                203,
                                "missing target",
                            );
                            return;
                        }
                    };
                    let k = inner.conf.k;
                    let nodes: Vec<(NodeId, SocketAddr)> = inner
                        .routing
                        .closest(&target, k)
                        .into_iter()
                        .map(|n| (n.id, n.addr))
                        .collect();
                    msg::response(
                        tid,
                        vec![
                            (
                                "id",
                                Value::Bytes(own_id.as_bytes().to_vec()),
                            ),
                            (
                                "nodes",
                                Value::Bytes(msg::encode_compact_nodes(
                                    &nodes,
                                )),
                            ),
                        ],
                    )
                }
                b"get_peers" => {
                    let info_hash =
                        match args.get(b"info_hash".as_slice()) {
                            Some(Value::Bytes(hash))
                                if hash.len() == 20 =>
                            {
                                let mut bytes = [0u8; 20];
                                bytes.copy_from_slice(hash);
                                bytes
                            }
                            _ => {
                                let _ = self.send_error(
                                    tid,
                                    addr,
                                    203,
                                    "missing info_hash",
                                );
                                return;
                            }
                        };
                    let token = inner.issue_token(addr.ip());
                    let mut fields = vec![
                        ("id", Value::Bytes(own_id.as_bytes().to_vec())),
                        ("token", Value::Bytes(token)),
                    ];
                    let stored: Vec<SocketAddr> = inner
                        .peer_store
                        .get(&info_hash)
                        .map(|peers| peers.iter().copied().collect())
                        .unwrap_or_default();
                    if stored.is_empty() {
                        let k = inner.conf.k;
                        let nodes: Vec<(NodeId, SocketAddr)> = inner
                            .routing
                            .closest(&NodeId(info_hash), k)
                            .into_iter()
                            .map(|n| (n.id, n.addr))
                            .collect();
                        fields.push((
                            "nodes",
                            Value::Bytes(msg::encode_compact_nodes(&nodes)),
                        ));
                    } else {
                        fields.push((
                            "values",
                            Value::List(
                                stored
                                    .iter()
                                    .map(|p| {
                                        Value::Bytes(
                                            msg::encode_compact_peer(p),
                                        )
                                    })
                                    .collect(),
                            ),
                        ));
                    }
                    msg::response(tid, fields)
                }
                b"announce_peer" => {
                    if inner.conf.read_only {
                        // read-only nodes refuse storage puts
                        let _ = self.send_error(
                            tid,
                            addr,
                            201,
                            "read-only node",
                        );
                        return;
                    }
                    if !inner.verify_token(addr.ip(), &args) {
                        let _ = self
                            .send_error(tid, addr, 203, "bad token");
                        return;
                    }
                    let info_hash =
                        match args.get(b"info_hash".as_slice()) {
                            Some(Value::Bytes(hash))
                                if hash.len() == 20 =>
                            {
                                let mut bytes = [0u8; 20];
                                bytes.copy_from_slice(hash);
                                bytes
                            }
                            _ => {
                                let _ = self.send_error(
                                    tid,
                                    addr,
                                    203,
                                    "missing info_hash",
                                );
                                return;
                            }
                        };
                    let implied = matches!(
                        args.get(b"implied_port".as_slice()),
                        Some(Value::Int(1))
                    );
                    let port = if implied {
                        addr.port()
                    } else {
                        match args.get(b"port".as_slice()) {
                            Some(Value::Int(port))
                                if (1..=u16::MAX as i64)
                                    .contains(port) =>
                            {
                                *port as u16
                            }
                            _ => {
                                let _ = self.send_error(
                                    tid,
                                    addr,
                                    203,
                                    "missing port",
                                );
                                return;
                            }
                        }
                    };
                    let peer = SocketAddr::new(addr.ip(), port);
                    inner
                        .peer_store
                        .entry(info_hash)
                        .or_default()
                        .insert(peer);
                    log::debug!(
                        "Stored announced peer {} for {}",
                        peer,
                        hex::encode(info_hash)
                    );
                    msg::response(
                        tid,
                        vec![(
                            "id",
                            Value::Bytes(own_id.as_bytes().to_vec()),
                        )],
                    )
                }
                _ => {
                    let _ = self.send_error(
                        tid,
                        addr,
                        204,
                        "method unknown",
                    );
                    return;
                }
            }
        };

        match reply {
            Ok(reply) => {
                if let Err(e) = self.socket.send_to(&reply, addr).await {
                    log::debug!("DHT reply to {} failed: {}", addr, e);
                }
            }
            Err(e) => log::debug!("Failed to build DHT reply: {}", e),
        }
    }

    fn send_error(
        &self,
        tid: &[u8],
        addr: SocketAddr,
        code: i64,
        reason: &str,
    ) -> Result<()> {
        let reply = msg::error_response(tid, code, reason)?;
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let _ = socket.send_to(&reply, addr).await;
        });
        Ok(())
    }

    /// Contacts the configured bootstrap nodes with `find_node` towards our
    /// own id. Invalid `host:port` entries are skipped with a warning.
    async fn bootstrap(self) {
        let (bootstrap_nodes, own_id) = {
            let inner = self.inner.lock().unwrap();
            (inner.conf.bootstrap_nodes.clone(), inner.own_id)
        };
        for entry in bootstrap_nodes {
            let addrs = match lookup_host(entry.as_str()).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    log::warn!(
                        "Invalid bootstrap node {:?} (expected host:port): {}",
                        entry,
                        e
                    );
                    continue;
                }
            };
            for addr in addrs {
                self.find_node(addr, own_id).await;
            }
        }
        let nodes = self.inner.lock().unwrap().routing.len();
        log::info!("DHT bootstrap finished with {} node(s)", nodes);
    }

    /// Periodically walks 8 random targets to keep the routing table
    /// fresh; the interval adapts to swarm size and health.
    async fn refresh_loop(self) {
        loop {
            let interval = self
                .inner
                .lock()
                .unwrap()
                .adaptive_refresh_interval();
            time::sleep(interval).await;

            let k = self.inner.lock().unwrap().conf.k;
            for _ in 0..REFRESH_TARGETS {
                let target = NodeId::random();
                let candidates = self.closest_candidates(&target, k);
                for candidate in candidates {
                    self.find_node(candidate.addr, target).await;
                }
            }
        }
    }

    /// Every five minutes: expired tokens are dropped and nodes that failed
    /// three or more queries are removed.
    async fn cleanup_loop(self) {
        loop {
            time::sleep(CLEANUP_INTERVAL).await;
            let mut inner = self.inner.lock().unwrap();
            let token_ttl = inner.conf.token_ttl;
            for tokens in inner.captured_tokens.values_mut() {
                tokens.retain(|_, token| {
                    token.captured_at.elapsed() < token_ttl
                });
            }
            inner
                .captured_tokens
                .retain(|_, tokens| !tokens.is_empty());
            inner
                .issued_tokens
                .retain(|_, token| token.issued_at.elapsed() < token_ttl);

            let expired =
                inner.routing.expired_nodes(NODE_FAILURE_THRESHOLD);
            for id in expired {
                log::debug!("Removing dead DHT node {:?}", id);
                inner.routing.remove(&id);
            }
        }
    }
}

impl Inner {
    fn issue_token(&mut self, ip: IpAddr) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let token: [u8; 8] = rng.gen();
        self.issued_tokens.insert(
            ip,
            IssuedToken {
                token: token.to_vec(),
                issued_at: Instant::now(),
            },
        );
        token.to_vec()
    }

    /// An announce is accepted only with the token we handed this ip in a
    /// recent `get_peers` response.
    fn verify_token(
        &self,
        ip: IpAddr,
        args: &HashMap<Vec<u8>, Value>,
    ) -> bool {
        let presented = match args.get(b"token".as_slice()) {
            Some(Value::Bytes(token)) => token,
            _ => return false,
        };
        match self.issued_tokens.get(&ip) {
            Some(issued) => {
                issued.token == *presented
                    && issued.issued_at.elapsed() < self.conf.token_ttl
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf(bootstrap: Vec<String>) -> DhtConf {
        DhtConf {
            bind_port: 0,
            bootstrap_nodes: bootstrap,
            min_query_timeout: Duration::from_millis(200),
            max_query_timeout: Duration::from_secs(2),
            ..DhtConf::default()
        }
    }

    async fn started(bootstrap: Vec<String>) -> DhtNode {
        DhtNode::start(test_conf(bootstrap)).await.unwrap()
    }

    fn bootstrap_entry(node: &DhtNode) -> String {
        let addr = node.local_addr().unwrap();
        format!("127.0.0.1:{}", addr.port())
    }

    // Two nodes on localhost: the second bootstraps off the first, then
    // announces a torrent and a third node finds the announced peer via
    // the iterative lookup.
    #[tokio::test]
    async fn test_announce_and_lookup_roundtrip() {
        let hub = started(Vec::new()).await;
        let announcer = started(vec![bootstrap_entry(&hub)]).await;
        assert!(
            announcer.wait_for_bootstrap(Duration::from_secs(1)).await
        );

        let info_hash = [0x5au8; 20];
        assert!(announcer.announce_peer(info_hash, 7777).await);

        let seeker = started(vec![bootstrap_entry(&hub)]).await;
        assert!(seeker.wait_for_bootstrap(Duration::from_secs(1)).await);

        let mut discoveries = seeker.subscribe(Some(info_hash));
        let peers = seeker.get_peers(info_hash, 10).await;
        assert!(
            peers.iter().any(|p| p.port() == 7777),
            "announced peer not found: {:?}",
            peers
        );
        // the peer was also streamed to the subscriber during the lookup
        let (streamed_hash, streamed) = discoveries.try_recv().unwrap();
        assert_eq!(streamed_hash, info_hash);
        assert!(streamed.iter().any(|p| p.port() == 7777));

        hub.shutdown();
        announcer.shutdown();
        seeker.shutdown();
    }

    // BEP-27: a private torrent never touches the DHT.
    #[tokio::test]
    async fn test_private_torrent_short_circuits() {
        let hub = started(Vec::new()).await;
        let node = started(vec![bootstrap_entry(&hub)]).await;
        node.wait_for_bootstrap(Duration::from_secs(1)).await;

        let info_hash = [0x77u8; 20];
        node.mark_private(info_hash);
        assert!(node.get_peers(info_hash, 10).await.is_empty());
        assert!(!node.announce_peer(info_hash, 7777).await);

        hub.shutdown();
        node.shutdown();
    }

    // BEP-43: a read-only node marks its queries and never announces.
    #[tokio::test]
    async fn test_read_only_node_never_announces() {
        let hub = started(Vec::new()).await;
        let mut conf = test_conf(vec![bootstrap_entry(&hub)]);
        conf.read_only = true;
        let node = DhtNode::start(conf).await.unwrap();
        node.wait_for_bootstrap(Duration::from_secs(1)).await;

        assert!(!node.announce_peer([0x11; 20], 7777).await);

        hub.shutdown();
        node.shutdown();
    }

    #[tokio::test]
    async fn test_get_peers_with_zero_cap_returns_immediately() {
        let node = started(Vec::new()).await;
        assert!(node.get_peers([0x22; 20], 0).await.is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn test_stats_reflect_learned_nodes() {
        let hub = started(Vec::new()).await;
        let node = started(vec![bootstrap_entry(&hub)]).await;
        node.wait_for_bootstrap(Duration::from_secs(1)).await;

        // the hub learned the node from its query, the node learned the
        // hub from the response
        assert!(node.stats().nodes >= 1);
        assert!(hub.stats().nodes >= 1);

        hub.shutdown();
        node.shutdown();
    }
}
