//! The mainline DHT node: one task owning a UDP socket, a Kademlia
//! routing table and the server-side state (peer store, write tokens,
//! BEP 44 items, the BEP 51 index), plus the client-side iterative
//! lookups torrents use for peer discovery.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use ed25519_dalek::SigningKey;
use tokio::{
    net::UdpSocket,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
    time::{interval, timeout},
};

use crate::{
    alert::{self, Alert, AlertSender},
    conf::DhtConf,
    error::dht::{DhtError, Result},
    torrent, InfoHash,
};

pub mod index;
pub mod krpc;
pub mod lookup;
pub mod node;
pub mod storage;
pub mod table;
pub mod token;

use index::{InfohashIndex, InfohashSample};
use krpc::{KrpcMessage, QueryKind, ResponseBody};
use lookup::LookupState;
use node::{DhtNode, NodeId};
use storage::{StorageCache, StorageItem};
use table::{InsertResult, RoutingTable, K};
use token::TokenStore;

pub type JoinHandle = task::JoinHandle<Result<()>>;
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands the DHT task accepts from the engine and torrents.
pub enum Command {
    /// Look up peers for the info hash, deliver them to the torrent, and
    /// (unless this node is read-only) announce our own port.
    FindPeers {
        info_hash: InfoHash,
        port: u16,
        reply: torrent::Sender,
    },
    /// Store a BEP 44 item on the nodes closest to its target.
    Put {
        item: StorageItem,
        reply: oneshot::Sender<Result<[u8; 20]>>,
    },
    /// Retrieve a BEP 44 item.
    Get {
        target: [u8; 20],
        reply: oneshot::Sender<Result<Option<StorageItem>>>,
    },
    /// Publish a torrent sample under its name's index key (BEP 51).
    PublishIndex {
        sample: InfohashSample,
        reply: oneshot::Sender<Result<[u8; 20]>>,
    },
    /// Query the index by name, merging local and remote entries.
    QueryIndex {
        query: String,
        max_results: usize,
        reply: oneshot::Sender<Vec<InfohashSample>>,
    },
    Shutdown,
}

/// Spawns the DHT task.
pub fn spawn(
    conf: DhtConf,
    alert_tx: AlertSender,
) -> (JoinHandle, Sender) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let join_handle =
        task::spawn(async move { Dht::run(conf, alert_tx, cmd_rx).await });
    (join_handle, cmd_tx)
}

/// The state shared between the main task and spawned lookup drivers.
struct Inner {
    socket: UdpSocket,
    /// In-flight transactions awaiting their response.
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<Result<ResponseBody>>>>,
    /// The routing table; lookups read it often, inserts are rare.
    table: RwLock<RoutingTable>,
    conf: DhtConf,
    local_id: NodeId,
    tid_counter: AtomicU16,
}

impl Inner {
    fn next_tid(&self) -> Vec<u8> {
        let tid = self.tid_counter.fetch_add(1, Ordering::Relaxed);
        tid.to_be_bytes().to_vec()
    }

    /// Sends a query and awaits its response, with the per-query timeout.
    ///
    /// Liveness accounting is the caller's job: it knows whether the
    /// queried endpoint corresponds to a node in the routing table.
    async fn query(
        &self,
        addr: SocketAddr,
        query: QueryKind,
    ) -> Result<ResponseBody> {
        let tid = self.next_tid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tid.clone(), tx);

        let frame =
            KrpcMessage::query(tid.clone(), query, self.conf.read_only)
                .encode();
        if let Err(e) = self.socket.send_to(&frame, addr).await {
            self.pending.lock().unwrap().remove(&tid);
            return Err(DhtError::Io(e));
        }

        match timeout(self.conf.query_timeout, rx).await {
            Ok(Ok(result)) => result,
            // the responder side dropped, which shouldn't happen
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                self.pending.lock().unwrap().remove(&tid);
                Err(DhtError::Timeout)
            }
        }
    }

    /// Queries a known node, folding the outcome into its health.
    async fn query_node(
        &self,
        node: &DhtNode,
        query: QueryKind,
    ) -> Result<ResponseBody> {
        let addr = node
            .best_addr(self.conf.prefer_ipv6)
            .ok_or(DhtError::LookupFailed)?;
        let result = self.query(addr, query).await;
        let mut table = self.table.write().unwrap();
        match &result {
            Ok(_) => table.record_response(&node.id),
            Err(_) => table.record_failure(&node.id),
        }
        result
    }

    /// Folds freshly learned nodes into the routing table, pinging the
    /// oldest occupant of a full bucket and replacing it if unresponsive.
    async fn offer_nodes(&self, nodes: impl IntoIterator<Item = DhtNode>) {
        for node in nodes {
            let result = self.table.write().unwrap().insert(node.clone());
            if let InsertResult::Full { oldest } = result {
                let oldest_node = {
                    let table = self.table.read().unwrap();
                    table
                        .closest(&oldest, 1)
                        .into_iter()
                        .find(|n| n.id == oldest)
                };
                if let Some(oldest_node) = oldest_node {
                    let ping = QueryKind::Ping { id: self.local_id };
                    if self.query_node(&oldest_node, ping).await.is_err() {
                        let mut table = self.table.write().unwrap();
                        table.evict(&oldest);
                        table.insert(node);
                    }
                }
            }
        }
    }

    /// Runs an iterative lookup: get_peers for peer discovery, get for
    /// BEP 44 values, find_node otherwise.
    ///
    /// Returns the converged lookup state plus whatever peers and items
    /// were collected along the way.
    async fn lookup(&self, kind: LookupKind) -> LookupOutcome {
        let target = kind.target();
        let seeds = {
            let table = self.table.read().unwrap();
            table.closest(&target, K)
        };
        let mut state = LookupState::new(target, seeds);
        let mut outcome = LookupOutcome::default();
        let deadline =
            tokio::time::Instant::now() + self.conf.lookup_timeout;

        while !state.is_complete() {
            if tokio::time::Instant::now() >= deadline {
                log::debug!("Lookup for {:?} hit its deadline", target);
                break;
            }
            let batch = state.next_batch();
            if batch.is_empty() {
                // everything in flight already; yield briefly
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let queries = batch.iter().map(|n| {
                let query = kind.query(self.local_id);
                self.query_node(n, query)
            });
            let results = futures::future::join_all(queries).await;

            for (node, result) in batch.iter().zip(results) {
                match result {
                    Ok(body) => {
                        let learned: Vec<DhtNode> = body
                            .nodes
                            .iter()
                            .chain(body.nodes6.iter())
                            .map(|(id, addr)| DhtNode::new(*id, *addr))
                            .collect();
                        self.offer_nodes(learned.iter().cloned()).await;

                        outcome.peers.extend(body.values.iter().copied());
                        if let Some(item) = body.item {
                            if item.verify().is_ok() {
                                outcome.consider_item(item);
                            }
                        }
                        state.on_response(
                            &node.id,
                            learned,
                            body.token.clone(),
                        );
                    }
                    Err(_) => state.on_failure(&node.id),
                }
            }
        }

        outcome.state = Some(state);
        outcome
    }
}

/// What a lookup is for.
#[derive(Clone, Copy)]
enum LookupKind {
    Peers(InfoHash),
    Value([u8; 20]),
    Nodes(NodeId),
}

impl LookupKind {
    fn target(&self) -> NodeId {
        match self {
            Self::Peers(hash) => NodeId::new(*hash),
            Self::Value(target) => NodeId::new(*target),
            Self::Nodes(id) => *id,
        }
    }

    fn query(&self, local_id: NodeId) -> QueryKind {
        match self {
            Self::Peers(info_hash) => QueryKind::GetPeers {
                id: local_id,
                info_hash: *info_hash,
            },
            Self::Value(target) => QueryKind::Get {
                id: local_id,
                target: *target,
            },
            Self::Nodes(target) => QueryKind::FindNode {
                id: local_id,
                target: *target,
            },
        }
    }
}

#[derive(Default)]
struct LookupOutcome {
    peers: Vec<SocketAddr>,
    /// The best BEP 44 item seen: for mutable items the highest sequence
    /// wins.
    item: Option<StorageItem>,
    state: Option<LookupState>,
}

impl LookupOutcome {
    fn consider_item(&mut self, item: StorageItem) {
        let better = match (&self.item, &item.mutable) {
            (None, _) => true,
            (Some(held), Some(new_meta)) => held
                .mutable
                .as_ref()
                .map(|held_meta| new_meta.seq > held_meta.seq)
                .unwrap_or(true),
            (Some(_), None) => false,
        };
        if better {
            self.item = Some(item);
        }
    }
}

/// The DHT task state.
struct Dht {
    inner: Arc<Inner>,
    cmd_rx: Receiver,
    alert_tx: AlertSender,
    tokens: TokenStore,
    storage: StorageCache,
    index: InfohashIndex,
    /// The peers announced to us, per info hash.
    peer_store: HashMap<InfoHash, HashSet<SocketAddr>>,
    /// The key signing our mutable items (the published index entries).
    signing_key: SigningKey,
}

impl Dht {
    async fn run(
        conf: DhtConf,
        alert_tx: AlertSender,
        cmd_rx: Receiver,
    ) -> Result<()> {
        let bind_addr: SocketAddr = if conf.enable_ipv6 {
            (std::net::Ipv6Addr::UNSPECIFIED, conf.port).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, conf.port).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        log::info!("DHT bound to {}", socket.local_addr()?);

        let local_id = NodeId::random();
        let inner = Arc::new(Inner {
            socket,
            pending: Mutex::new(HashMap::new()),
            table: RwLock::new(RoutingTable::new(local_id)),
            conf,
            local_id,
            tid_counter: AtomicU16::new(0),
        });

        let signing_key = SigningKey::from_bytes(&{
            let mut seed = [0u8; 32];
            use rand::Rng;
            rand::thread_rng().fill(&mut seed);
            seed
        });

        let mut dht = Dht {
            inner,
            cmd_rx,
            alert_tx,
            tokens: TokenStore::new(),
            storage: StorageCache::default(),
            index: InfohashIndex::default(),
            peer_store: HashMap::new(),
            signing_key,
        };

        dht.bootstrap().await;
        dht.event_loop().await
    }

    /// Seeds the routing table from the configured routers and walks
    /// toward our own id.
    async fn bootstrap(&mut self) {
        let mut seeds = Vec::new();
        for host in &self.inner.conf.bootstrap_nodes {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => seeds.extend(addrs),
                Err(e) => {
                    log::warn!("Bootstrap node {} failed to resolve: {}", host, e)
                }
            }
        }

        // routers answer find_node without being in any table yet
        for addr in seeds {
            let query = QueryKind::FindNode {
                id: self.inner.local_id,
                target: self.inner.local_id,
            };
            if let Ok(body) = self.inner.query(addr, query).await {
                let learned: Vec<DhtNode> = body
                    .nodes
                    .iter()
                    .chain(body.nodes6.iter())
                    .map(|(id, addr)| DhtNode::new(*id, *addr))
                    .collect();
                self.inner.offer_nodes(learned).await;
            }
        }

        let inner = Arc::clone(&self.inner);
        let alert_tx = self.alert_tx.clone();
        task::spawn(async move {
            inner.lookup(LookupKind::Nodes(inner.local_id)).await;
            let size = inner.table.read().unwrap().node_count();
            log::info!("DHT bootstrapped with {} nodes", size);
            alert::send(
                &alert_tx,
                Alert::DhtBootstrapped {
                    routing_table_size: size,
                },
            );
        });
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut recv_buf = vec![0u8; 65536];
        let mut tick = interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                incoming = self.inner.socket.recv_from(&mut recv_buf) => {
                    match incoming {
                        Ok((len, from)) => {
                            let packet = recv_buf[..len].to_vec();
                            self.handle_packet(&packet, from).await;
                        }
                        Err(e) => {
                            log::warn!("DHT socket error: {}", e);
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down DHT task");
                            return Ok(());
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                _ = tick.tick() => {
                    self.periodic_maintenance();
                }
            }
        }
    }

    fn periodic_maintenance(&mut self) {
        self.tokens.maybe_rotate();
        let expired = self.storage.cleanup_expired();
        if expired > 0 {
            log::debug!("Expired {} stored DHT items", expired);
        }

        // stale buckets get a refresh lookup toward a random id in range
        let targets = self.inner.table.read().unwrap().refresh_targets();
        for target in targets {
            let inner = Arc::clone(&self.inner);
            task::spawn(async move {
                inner.lookup(LookupKind::Nodes(target)).await;
            });
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::FindPeers {
                info_hash,
                port,
                reply,
            } => {
                let inner = Arc::clone(&self.inner);
                task::spawn(async move {
                    let outcome =
                        inner.lookup(LookupKind::Peers(info_hash)).await;

                    if !outcome.peers.is_empty() {
                        let _ = reply.send(torrent::Command::AvailablePeers {
                            addrs: outcome.peers,
                            source: torrent::PeerSource::Dht,
                        });
                    }

                    // a read-only node never announces (BEP 43)
                    if inner.conf.read_only {
                        return;
                    }
                    let Some(state) = outcome.state else { return };
                    for (node, token) in state.closest_responded(K) {
                        let Some(token) = token else { continue };
                        let announce = QueryKind::AnnouncePeer {
                            id: inner.local_id,
                            info_hash,
                            port,
                            implied_port: false,
                            token,
                        };
                        let _ = inner.query_node(&node, announce).await;
                    }
                });
            }
            Command::Put { item, reply } => {
                self.spawn_put(item, reply);
            }
            Command::Get { target, reply } => {
                // a locally stored item short-circuits the lookup
                if let Some(item) = self.storage.get(&target) {
                    let _ = reply.send(Ok(Some(item.clone())));
                    return;
                }
                let inner = Arc::clone(&self.inner);
                task::spawn(async move {
                    let outcome =
                        inner.lookup(LookupKind::Value(target)).await;
                    let _ = reply.send(Ok(outcome.item));
                });
            }
            Command::PublishIndex { sample, reply } => {
                let key = index::index_key(&sample.name);
                let (_, seq) = self.index.update_entry(&key, sample);
                let entry = self
                    .index
                    .entry(&key)
                    .expect("entry just updated")
                    .clone();
                let item =
                    entry.to_storage_item(&key, seq, &self.signing_key);
                self.spawn_put(item, reply);
            }
            Command::QueryIndex {
                query,
                max_results,
                reply,
            } => {
                let key = index::index_key(&query);
                let local = self.index.query(&query, max_results);

                let inner = Arc::clone(&self.inner);
                task::spawn(async move {
                    let outcome =
                        inner.lookup(LookupKind::Value(key)).await;
                    let mut results = local;
                    if let Some(item) = outcome.item {
                        if let Ok(remote) =
                            index::IndexEntry::decode(&item.value)
                        {
                            for sample in remote.samples {
                                if results
                                    .iter()
                                    .all(|s| s.info_hash != sample.info_hash)
                                {
                                    results.push(sample);
                                }
                            }
                        }
                    }
                    results.truncate(max_results);
                    let _ = reply.send(results);
                });
            }
            Command::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    /// Validates a BEP 44 item, caches it locally, then spawns the lookup
    /// and the put round against the closest responders.
    fn spawn_put(
        &mut self,
        item: StorageItem,
        reply: oneshot::Sender<Result<[u8; 20]>>,
    ) {
        if let Err(e) = item.validate() {
            let _ = reply.send(Err(e));
            return;
        }
        // keep our own copy hot too
        let target = item.target();
        let _ = self.storage.put(item.clone());

        let inner = Arc::clone(&self.inner);
        task::spawn(async move {
            let outcome = inner.lookup(LookupKind::Value(target)).await;
            let Some(state) = outcome.state else {
                let _ = reply.send(Err(DhtError::LookupFailed));
                return;
            };
            let mut stored = 0;
            for (node, token) in state.closest_responded(K) {
                let Some(token) = token else { continue };
                let put = QueryKind::Put {
                    id: inner.local_id,
                    token,
                    item: item.clone(),
                };
                if inner.query_node(&node, put).await.is_ok() {
                    stored += 1;
                }
            }
            let _ = reply.send(if stored > 0 {
                Ok(target)
            } else {
                Err(DhtError::LookupFailed)
            });
        });
    }

    async fn handle_packet(&mut self, packet: &[u8], from: SocketAddr) {
        let msg = match KrpcMessage::decode(packet) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Malformed KRPC packet from {}: {}", from, e);
                return;
            }
        };

        match msg {
            KrpcMessage::Query {
                transaction_id,
                query,
                read_only,
            } => {
                let reply = self.answer_query(&query, from, read_only);
                let frame = match reply {
                    Ok(body) => {
                        KrpcMessage::response(transaction_id, body)
                    }
                    Err((code, message)) => {
                        KrpcMessage::error(transaction_id, code, message)
                    }
                }
                .encode();
                if let Err(e) =
                    self.inner.socket.send_to(&frame, from).await
                {
                    log::debug!("Failed to answer {}: {}", from, e);
                }
            }
            KrpcMessage::Response {
                transaction_id,
                body,
            } => {
                if let Some(waiter) = self
                    .inner
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&transaction_id)
                {
                    let _ = waiter.send(Ok(body));
                } else {
                    log::debug!("Unsolicited response from {}", from);
                }
            }
            KrpcMessage::Error {
                transaction_id,
                code,
                message,
            } => {
                if let Some(waiter) = self
                    .inner
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&transaction_id)
                {
                    let _ =
                        waiter.send(Err(DhtError::Remote { code, message }));
                }
            }
        }
    }

    /// The server side: answers a remote node's query, or yields a KRPC
    /// error (code, message).
    fn answer_query(
        &mut self,
        query: &QueryKind,
        from: SocketAddr,
        sender_read_only: bool,
    ) -> std::result::Result<ResponseBody, (i64, String)> {
        // read-only senders don't join the routing table (BEP 43)
        if !sender_read_only {
            if let Some(id) = query_sender_id(query) {
                let mut node = DhtNode::new(id, from);
                node.record_query();
                // full buckets are not ping-verified on the server path;
                // the insert is best effort
                let _ = self.inner.table.write().unwrap().insert(node);
            }
        }

        let local_id = self.inner.local_id;
        let mut body = ResponseBody {
            id: Some(local_id),
            ..ResponseBody::default()
        };

        match query {
            QueryKind::Ping { .. } => Ok(body),
            QueryKind::FindNode { target, .. } => {
                self.fill_nodes(&mut body, target);
                Ok(body)
            }
            QueryKind::GetPeers { info_hash, .. } => {
                body.token = Some(self.tokens.issue(&from));
                match self.peer_store.get(info_hash) {
                    Some(peers) if !peers.is_empty() => {
                        body.values = peers.iter().copied().collect();
                    }
                    _ => {
                        self.fill_nodes(
                            &mut body,
                            &NodeId::new(*info_hash),
                        );
                    }
                }
                Ok(body)
            }
            QueryKind::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                if self.inner.conf.read_only {
                    return Err((201, "node is read-only".into()));
                }
                if !self.tokens.verify(&from, token) {
                    return Err((203, "bad token".into()));
                }
                let peer_port =
                    if *implied_port { from.port() } else { *port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                self.peer_store
                    .entry(*info_hash)
                    .or_default()
                    .insert(peer);
                Ok(body)
            }
            QueryKind::Get { target, .. } => {
                body.token = Some(self.tokens.issue(&from));
                if let Some(item) = self.storage.get(target) {
                    body.item = Some(item.clone());
                } else {
                    self.fill_nodes(&mut body, &NodeId::new(*target));
                }
                Ok(body)
            }
            QueryKind::Put { token, item, .. } => {
                if self.inner.conf.read_only {
                    return Err((201, "node is read-only".into()));
                }
                if !self.tokens.verify(&from, token) {
                    return Err((203, "bad token".into()));
                }
                match self.storage.put(item.clone()) {
                    Ok(_) => Ok(body),
                    Err(DhtError::ValueTooLarge) => {
                        Err((205, "message too big".into()))
                    }
                    Err(DhtError::InvalidSignature) => {
                        Err((206, "invalid signature".into()))
                    }
                    Err(DhtError::StaleSequence) => {
                        Err((302, "sequence number less than current".into()))
                    }
                    Err(_) => Err((202, "server error".into())),
                }
            }
        }
    }

    /// Fills the closest-nodes fields of a response, split by family
    /// (`nodes6` per BEP 32, only when IPv6 is on).
    fn fill_nodes(&self, body: &mut ResponseBody, target: &NodeId) {
        let closest =
            self.inner.table.read().unwrap().closest(target, K);
        for node in closest {
            if let Some(addr @ SocketAddr::V4(_)) = node.addr_v4 {
                body.nodes.push((node.id, addr));
            }
            if self.inner.conf.enable_ipv6 {
                if let Some(addr @ SocketAddr::V6(_)) = node.addr_v6 {
                    body.nodes6.push((node.id, addr));
                }
            }
        }
    }
}

fn query_sender_id(query: &QueryKind) -> Option<NodeId> {
    match query {
        QueryKind::Ping { id }
        | QueryKind::FindNode { id, .. }
        | QueryKind::GetPeers { id, .. }
        | QueryKind::AnnouncePeer { id, .. }
        | QueryKind::Get { id, .. }
        | QueryKind::Put { id, .. } => Some(*id),
    }
}
