//! The per-torrent task: owns the peer pool, the selection state shared
//! with the sessions, the choke rounds, tracker and DHT discovery, and
//! the checkpoint schedule.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task,
};

use crate::{
    alert::{self, Alert, AlertSender},
    blockinfo::BlockInfo,
    checkpoint::{
        self, CheckpointFile, CheckpointStats, CheckpointStore,
        TorrentCheckpoint,
    },
    conf::TorrentConf,
    counter::ThruputSnapshot,
    dht,
    disk,
    download::{BlockReceipt, PieceDownload},
    error::{
        disk::{ReadError, WriteError},
        torrent::{Result, TorrentError},
    },
    peer::{self, PeerSession, SessionTick},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker::tier::{
        AnnounceStats, Announcer, AnnouncerCommand, AnnouncerSender,
        TrackerTiers,
    },
    Bitfield, InfoHash, PeerId, PieceIndex, TorrentId,
};

pub mod choke;
pub mod stats;

use choke::{ChokeCandidate, CHOKE_ROUND_SECS};
use stats::TorrentStats;

/// The channel for communication with a torrent task.
pub type Sender = UnboundedSender<Command>;
pub type Receiver = UnboundedReceiver<Command>;

/// Creates a torrent command channel.
///
/// The channel exists before the torrent task does, because the disk
/// allocation (which needs the sender for its completion notifications)
/// and the resume verification pass both happen first.
pub fn channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}

/// Where a peer address was learned. Drives the BEP 27 private-torrent
/// policy: private torrents refuse DHT and PEX sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Manual,
    /// An alternative transport's signaling layer handed us the peer.
    /// The pool treats these like manual additions.
    Webrtc,
}

/// The messages a torrent receives from its peer sessions, the disk task,
/// discovery sources and the engine.
pub enum Command {
    /// A peer session finished its handshake.
    PeerConnected { addr: SocketAddr, id: PeerId },
    /// A peer session ended; its picker state is already cleaned up.
    PeerDisconnected { addr: SocketAddr },
    /// A session's periodic state report.
    PeerState {
        addr: SocketAddr,
        info: SessionTick,
    },
    /// Peer addresses from a tracker, the DHT, PEX or the API user.
    AvailablePeers {
        addrs: Vec<SocketAddr>,
        source: PeerSource,
    },
    /// Ask the session holding this in-flight request to send a cancel
    /// (endgame duplicate resolution).
    CancelRequest {
        addr: SocketAddr,
        block: BlockInfo,
    },
    /// The disk task finished handling a completed piece: hashed, and
    /// written when valid.
    PieceCompletion {
        index: PieceIndex,
        result: std::result::Result<bool, WriteError>,
    },
    /// A block read failed.
    ReadError {
        block_info: BlockInfo,
        error: ReadError,
    },
    /// Disk queue watermark crossings.
    SetRequestThrottle(bool),
    /// Gracefully shut down the torrent: stop sessions, announce stopped,
    /// write a final checkpoint.
    Shutdown,
}

/// The shared state a torrent hands to each of its peer sessions.
pub struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    /// The torrent's command channel.
    pub cmd_tx: Sender,
    pub disk_tx: disk::Sender,
    pub alert_tx: AlertSender,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    /// The raw bencoded info dictionary, served to ut_metadata requests.
    pub metadata: Option<Arc<Vec<u8>>>,
    /// The piece selection state: the picker plus the per-piece block
    /// downloads. One coarse lock per torrent; operations under it are
    /// short and never await.
    pub piece_state: Mutex<PieceTracker>,
    /// Set while the disk write queue is over its high watermark; the
    /// sessions stop pulling new requests until it clears.
    pub request_throttle: AtomicBool,
}

/// The piece picker and the in-progress block downloads, guarded
/// together: a request decision needs both.
pub struct PieceTracker {
    pub picker: PiecePicker,
    pub downloads: HashMap<PieceIndex, PieceDownload>,
    storage: StorageInfo,
}

impl PieceTracker {
    pub fn new(picker: PiecePicker, storage: StorageInfo) -> Self {
        Self {
            picker,
            downloads: HashMap::new(),
            storage,
        }
    }

    /// Picks up to `n` blocks for a peer: blocks of pieces already being
    /// downloaded first, then fresh pieces from the picker.
    pub fn pick_blocks_for_peer(
        &mut self,
        addr: SocketAddr,
        peer_pieces: &Bitfield,
        n: usize,
        in_endgame: bool,
        buf: &mut Vec<BlockInfo>,
    ) -> usize {
        let mut picked = 0;

        for download in self.downloads.values_mut() {
            if picked == n {
                return picked;
            }
            if peer_pieces[download.index()] {
                picked += download.pick_blocks(
                    n - picked,
                    addr,
                    in_endgame,
                    buf,
                );
            }
        }

        while picked < n {
            let Some(index) =
                self.picker.pick_piece(peer_pieces, in_endgame)
            else {
                break;
            };
            let Ok(piece_len) = self.storage.piece_len(index) else {
                break;
            };
            let download = self
                .downloads
                .entry(index)
                .or_insert_with(|| PieceDownload::new(index, piece_len));
            let got =
                download.pick_blocks(n - picked, addr, in_endgame, buf);
            if got == 0 {
                // in endgame the picker may hand back a piece this peer
                // already has fully in flight
                break;
            }
            picked += got;
        }

        picked
    }

    /// Routes a block delivery to its piece download. The bool reports
    /// whether the piece now has all its blocks.
    pub fn received_block(
        &mut self,
        block: &BlockInfo,
        from: SocketAddr,
    ) -> (BlockReceipt, bool) {
        match self.downloads.get_mut(&block.piece_index) {
            Some(download) => {
                let receipt = download.received_block(block, from);
                (receipt, download.is_complete())
            }
            None => (BlockReceipt::Invalid, false),
        }
    }

    /// Releases all blocks a peer has in flight, across all downloads.
    /// The freed blocks stay in their downloads, pickable by any peer.
    pub fn cancel_peer(&mut self, addr: SocketAddr) {
        for download in self.downloads.values_mut() {
            download.cancel_blocks(addr);
        }
    }
}

/// Everything needed to start a torrent task.
pub struct Params {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub name: String,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    /// Pieces we already have (resume), or all-zero for a fresh start.
    pub own_pieces: Bitfield,
    pub trackers: TrackerTiers,
    /// The BEP 27 flag: refuse DHT/PEX peers when set.
    pub private: bool,
    pub metadata: Option<Arc<Vec<u8>>>,
    pub listen_addr: SocketAddr,
    pub listen_port: u16,
    pub seeds: Vec<SocketAddr>,
    pub disk_tx: disk::Sender,
    pub dht_tx: Option<dht::Sender>,
    pub alert_tx: AlertSender,
    pub checkpoint_store: Arc<CheckpointStore>,
    pub checkpoint_interval: Duration,
    pub checkpoint_piece_threshold: usize,
    pub resume_stats: CheckpointStats,
    /// Peers connected across the whole engine, shared by all torrents.
    pub global_peer_count: Arc<AtomicUsize>,
    /// The engine-wide connection cap.
    pub max_global_peer_count: usize,
}

/// A connected peer's entry in the pool.
struct PeerEntry {
    tx: peer::Sender,
    join_handle: Option<task::JoinHandle<()>>,
    /// The latest session tick, for choking and stats.
    last_tick: Option<SessionTick>,
    /// How many hash-failed pieces this peer contributed to.
    hash_failures: u32,
}

/// A known but not connected peer address.
struct AddrEntry {
    source: PeerSource,
    fail_count: u32,
    next_attempt: Instant,
}

pub struct Torrent {
    ctx: Arc<TorrentContext>,
    cmd_rx: Receiver,
    name: String,
    private: bool,
    /// Connected (or connecting) peers.
    peers: HashMap<SocketAddr, PeerEntry>,
    /// Known peer endpoints, deduplicated by address. An endpoint is
    /// either here or in `peers`, never both.
    available: HashMap<SocketAddr, AddrEntry>,
    announcer_tx: Option<AnnouncerSender>,
    announcer_join: Option<task::JoinHandle<()>>,
    announce_stats_tx: watch::Sender<AnnounceStats>,
    dht_tx: Option<dht::Sender>,
    listen_addr: SocketAddr,
    listen_port: u16,
    seeds: Vec<SocketAddr>,
    trackers: Option<TrackerTiers>,
    checkpoint_store: Arc<CheckpointStore>,
    checkpoint_interval: Duration,
    checkpoint_piece_threshold: usize,
    last_checkpoint: Instant,
    pieces_since_checkpoint: usize,
    created_at: u64,
    start_time: Instant,
    tick_count: u64,
    choke_optimistic: Option<SocketAddr>,
    total_uploaded: u64,
    total_downloaded: u64,
    global_peer_count: Arc<AtomicUsize>,
    max_global_peer_count: usize,
    /// Pieces completed since the last stats alert.
    recently_completed: Vec<PieceIndex>,
    /// Set on a durable disk failure; no new requests are made until the
    /// operator intervenes.
    paused: bool,
    completed: bool,
}

impl Torrent {
    pub fn new(params: Params, cmd_tx: Sender, cmd_rx: Receiver) -> Self {
        let (announce_stats_tx, _) = watch::channel(AnnounceStats {
            uploaded: params.resume_stats.uploaded,
            downloaded: params.resume_stats.downloaded,
            left: params.storage.download_len,
        });

        let picker = PiecePicker::new(params.own_pieces);
        let completed = picker.is_seed();
        let piece_state = Mutex::new(PieceTracker::new(
            picker,
            params.storage.clone(),
        ));

        let ctx = Arc::new(TorrentContext {
            id: params.id,
            info_hash: params.info_hash,
            client_id: params.client_id,
            cmd_tx: cmd_tx.clone(),
            disk_tx: params.disk_tx,
            alert_tx: params.alert_tx,
            storage: params.storage,
            conf: params.conf,
            metadata: params.metadata,
            piece_state,
            request_throttle: AtomicBool::new(false),
        });

        Self {
            ctx,
            cmd_rx,
            name: params.name,
            private: params.private,
            peers: HashMap::new(),
            available: HashMap::new(),
            announcer_tx: None,
            announcer_join: None,
            announce_stats_tx,
            dht_tx: params.dht_tx,
            listen_addr: params.listen_addr,
            listen_port: params.listen_port,
            seeds: params.seeds,
            trackers: Some(params.trackers),
            checkpoint_store: params.checkpoint_store,
            checkpoint_interval: params.checkpoint_interval,
            checkpoint_piece_threshold: params.checkpoint_piece_threshold,
            last_checkpoint: Instant::now(),
            pieces_since_checkpoint: 0,
            created_at: checkpoint::unix_now(),
            start_time: Instant::now(),
            tick_count: 0,
            choke_optimistic: None,
            total_uploaded: params.resume_stats.uploaded,
            total_downloaded: params.resume_stats.downloaded,
            global_peer_count: params.global_peer_count,
            max_global_peer_count: params.max_global_peer_count,
            recently_completed: Vec::new(),
            paused: false,
            completed,
        }
    }

    /// Runs the torrent until shutdown.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {} ({})", self.ctx.id, self.name);

        let listener = TcpListener::bind(self.listen_addr).await?;
        log::info!(
            "Torrent {} listening on {}",
            self.ctx.id,
            listener.local_addr()?
        );

        self.spawn_announcer();
        self.request_dht_peers();

        // seed addresses given by the caller connect first
        let seeds: Vec<SocketAddr> = self.seeds.drain(..).collect();
        self.add_available_peers(seeds, PeerSource::Manual);

        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.accept_peer(socket, addr),
                        Err(e) => log::warn!("Accept error: {}", e),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Err(TorrentError::Channel);
                    };
                    if self.handle_command(cmd).await? {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    fn spawn_announcer(&mut self) {
        let tiers = self.trackers.take().expect("announcer spawned once");
        let (announcer, announcer_tx) = Announcer::new(
            tiers,
            self.ctx.id,
            self.ctx.info_hash,
            self.ctx.client_id,
            self.listen_port,
            self.ctx.conf.announce_interval,
            self.announce_stats_tx.subscribe(),
            self.ctx.cmd_tx.clone(),
            self.ctx.alert_tx.clone(),
        );
        self.announcer_tx = Some(announcer_tx);
        self.announcer_join =
            Some(task::spawn(async move { announcer.run().await }));
    }

    /// Asks the DHT for peers (and announces us), unless the torrent is
    /// private.
    fn request_dht_peers(&self) {
        if self.private {
            return;
        }
        if let Some(dht_tx) = &self.dht_tx {
            let _ = dht_tx.send(dht::Command::FindPeers {
                info_hash: self.ctx.info_hash,
                port: self.listen_port,
                reply: self.ctx.cmd_tx.clone(),
            });
        }
    }

    /// Handles one command; returns true when the torrent should exit.
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::PeerConnected { addr, id } => {
                log::info!(
                    "Torrent {} peer {} connected",
                    self.ctx.id,
                    addr
                );
                if let Some(entry) = self.available.get_mut(&addr) {
                    entry.fail_count = 0;
                }
                alert::send(
                    &self.ctx.alert_tx,
                    Alert::PeerConnected {
                        id: self.ctx.id,
                        addr,
                        peer_id: id,
                    },
                );
            }
            Command::PeerDisconnected { addr } => {
                self.on_peer_disconnected(addr);
            }
            Command::PeerState { addr, info } => {
                self.on_peer_state(addr, info);
            }
            Command::AvailablePeers { addrs, source } => {
                if self.private
                    && matches!(source, PeerSource::Dht | PeerSource::Pex)
                {
                    log::debug!(
                        "Torrent {} is private; ignoring {} {:?} peers",
                        self.ctx.id,
                        addrs.len(),
                        source
                    );
                } else {
                    self.add_available_peers(addrs, source);
                }
            }
            Command::CancelRequest { addr, block } => {
                if let Some(entry) = self.peers.get(&addr) {
                    let _ =
                        entry.tx.send(peer::Command::CancelRequest(block));
                }
            }
            Command::PieceCompletion { index, result } => {
                self.on_piece_completion(index, result).await?;
            }
            Command::ReadError { block_info, error } => {
                log::warn!(
                    "Torrent {} read error at {}: {}",
                    self.ctx.id,
                    block_info,
                    error
                );
            }
            Command::SetRequestThrottle(throttled) => {
                self.ctx
                    .request_throttle
                    .store(throttled, Ordering::Relaxed);
            }
            Command::Shutdown => {
                self.shutdown().await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether one more connection fits under both the per-torrent and
    /// the engine-wide caps.
    fn has_peer_capacity(&self) -> bool {
        self.peers.len() < self.ctx.conf.max_connected_peer_count
            && self.global_peer_count.load(Ordering::Relaxed)
                < self.max_global_peer_count
    }

    fn accept_peer(&mut self, socket: tokio::net::TcpStream, addr: SocketAddr) {
        if !self.has_peer_capacity() {
            log::debug!("Torrent {} at peer cap; rejecting {}", self.ctx.id, addr);
            return;
        }
        self.global_peer_count.fetch_add(1, Ordering::Relaxed);
        let (mut session, tx) = PeerSession::new(Arc::clone(&self.ctx), addr);
        let join_handle = task::spawn(async move {
            if let Err(e) = session.start_inbound(socket).await {
                log::info!("Inbound session {} ended: {}", addr, e);
            }
        });
        self.peers.insert(
            addr,
            PeerEntry {
                tx,
                join_handle: Some(join_handle),
                last_tick: None,
                hash_failures: 0,
            },
        );
    }

    fn add_available_peers(
        &mut self,
        addrs: Vec<SocketAddr>,
        source: PeerSource,
    ) {
        let now = Instant::now();
        for addr in addrs {
            // a peer is in the pool at most once, connected or not
            if self.peers.contains_key(&addr) {
                continue;
            }
            self.available.entry(addr).or_insert(AddrEntry {
                source,
                fail_count: 0,
                next_attempt: now,
            });
        }
    }

    fn on_peer_disconnected(&mut self, addr: SocketAddr) {
        if self.peers.remove(&addr).is_some() {
            self.global_peer_count.fetch_sub(1, Ordering::Relaxed);
            alert::send(
                &self.ctx.alert_tx,
                Alert::PeerDisconnected {
                    id: self.ctx.id,
                    addr,
                },
            );
        }

        // the endpoint goes back into the pool with a backoff; endpoints
        // that keep failing are dropped
        let conf = &self.ctx.conf;
        if let Some(entry) = self.available.get_mut(&addr) {
            entry.fail_count += 1;
            if entry.fail_count >= conf.max_connect_attempts {
                self.available.remove(&addr);
            } else {
                entry.next_attempt = Instant::now()
                    + Duration::from_secs(15 << entry.fail_count.min(6));
            }
        }
    }

    fn on_peer_state(&mut self, addr: SocketAddr, info: SessionTick) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            // accumulate the delta since the session's previous tick
            let previous = entry
                .last_tick
                .as_ref()
                .map(|t| t.counters)
                .unwrap_or_default();
            self.total_uploaded += info
                .counters
                .payload_up_total
                .saturating_sub(previous.payload_up_total);
            self.total_downloaded += info
                .counters
                .payload_down_total
                .saturating_sub(previous.payload_down_total);
            entry.last_tick = Some(info);
        }
    }

    async fn on_piece_completion(
        &mut self,
        index: PieceIndex,
        result: std::result::Result<bool, WriteError>,
    ) -> Result<()> {
        match result {
            Ok(true) => {
                {
                    let mut tracker = self.ctx.piece_state.lock().unwrap();
                    tracker.picker.received_piece(index, true);
                    tracker.downloads.remove(&index);
                }

                self.pieces_since_checkpoint += 1;
                self.recently_completed.push(index);
                alert::send(
                    &self.ctx.alert_tx,
                    Alert::PieceVerified {
                        id: self.ctx.id,
                        piece: index,
                    },
                );

                // everyone learns what we now have
                for entry in self.peers.values() {
                    let _ = entry
                        .tx
                        .send(peer::Command::PieceCompletion { index });
                }

                let is_seed = {
                    let tracker = self.ctx.piece_state.lock().unwrap();
                    tracker.picker.is_seed()
                };
                if is_seed && !self.completed {
                    self.on_download_complete().await?;
                }
            }
            Ok(false) => {
                // hash mismatch: back to missing, penalize contributors
                let contributors = {
                    let mut tracker = self.ctx.piece_state.lock().unwrap();
                    if let Some(download) =
                        tracker.downloads.get_mut(&index)
                    {
                        let contributors =
                            download.contributors().to_vec();
                        download.free_all_blocks();
                        contributors
                    } else {
                        Vec::new()
                    }
                };
                {
                    let mut tracker = self.ctx.piece_state.lock().unwrap();
                    tracker.picker.received_piece(index, false);
                }

                alert::send(
                    &self.ctx.alert_tx,
                    Alert::PieceFailedVerification {
                        id: self.ctx.id,
                        piece: index,
                    },
                );

                for addr in contributors {
                    if let Some(entry) = self.peers.get_mut(&addr) {
                        entry.hash_failures += 1;
                        if entry.hash_failures >= 3 {
                            log::warn!(
                                "Peer {} fed us {} bad pieces; dropping",
                                addr,
                                entry.hash_failures
                            );
                            let _ = entry.tx.send(peer::Command::Shutdown);
                            // don't redial it either
                            self.available.remove(&addr);
                        }
                    }
                }
            }
            Err(e) => {
                // a durable IO failure pauses the torrent; verified
                // pieces stay recoverable from the checkpoint
                log::error!(
                    "Torrent {} disk write failed: {}",
                    self.ctx.id,
                    e
                );
                alert::send(
                    &self.ctx.alert_tx,
                    Alert::DiskWriteFailed {
                        id: self.ctx.id,
                        error: e.to_string().into(),
                    },
                );
                {
                    let mut tracker = self.ctx.piece_state.lock().unwrap();
                    if let Some(download) = tracker.downloads.get_mut(&index)
                    {
                        download.free_all_blocks();
                    }
                    tracker.picker.received_piece(index, false);
                }
                self.paused = true;
                self.ctx.request_throttle.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn on_download_complete(&mut self) -> Result<()> {
        log::info!("Torrent {} download complete", self.ctx.id);
        self.completed = true;

        // attributes (and per-file hashes) go on once the data is stable
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.ctx.disk_tx.send(disk::Command::ApplyAttributes {
            id: self.ctx.id,
            ack_tx,
        });
        match ack_rx.await {
            Ok(Ok(failed)) if !failed.is_empty() => {
                log::warn!(
                    "Torrent {}: {} files failed their per-file hash",
                    self.ctx.id,
                    failed.len()
                );
            }
            Ok(Err(e)) => {
                log::warn!("Attribute application failed: {}", e)
            }
            _ => {}
        }

        self.write_checkpoint().await;

        alert::send(
            &self.ctx.alert_tx,
            Alert::DownloadComplete(self.ctx.id),
        );
        if let Some(announcer_tx) = &self.announcer_tx {
            let _ = announcer_tx.send(AnnouncerCommand::Completed);
        }
        Ok(())
    }

    /// The per-second housekeeping.
    async fn tick(&mut self) -> Result<()> {
        self.tick_count += 1;

        if !self.paused {
            self.connect_available_peers();
        }

        if self.tick_count % CHOKE_ROUND_SECS == 0 {
            self.run_choke_round();
        }

        // stats flow to the announcer continuously and to observers
        // periodically
        self.publish_announce_stats();
        if self.tick_count % 5 == 0 {
            self.publish_stats_alert();
        }

        // periodic DHT re-discovery while missing pieces remain
        if self.tick_count % 300 == 0 && !self.completed {
            self.request_dht_peers();
        }

        let checkpoint_due = self.last_checkpoint.elapsed()
            >= self.checkpoint_interval
            || self.pieces_since_checkpoint
                >= self.checkpoint_piece_threshold;
        if checkpoint_due && self.pieces_since_checkpoint > 0 {
            self.write_checkpoint().await;
        }

        Ok(())
    }

    /// Dials available peers until the connection caps are met.
    fn connect_available_peers(&mut self) {
        let now = Instant::now();
        let capacity = self
            .ctx
            .conf
            .max_connected_peer_count
            .saturating_sub(self.peers.len())
            .min(
                self.max_global_peer_count.saturating_sub(
                    self.global_peer_count.load(Ordering::Relaxed),
                ),
            );

        let candidates: Vec<SocketAddr> = self
            .available
            .iter()
            .filter(|(addr, entry)| {
                entry.next_attempt <= now && !self.peers.contains_key(addr)
            })
            .map(|(addr, _)| *addr)
            .take(capacity)
            .collect();

        for addr in candidates {
            log::debug!("Torrent {} dialing {}", self.ctx.id, addr);
            self.global_peer_count.fetch_add(1, Ordering::Relaxed);
            let (mut session, tx) =
                PeerSession::new(Arc::clone(&self.ctx), addr);
            let join_handle = task::spawn(async move {
                if let Err(e) = session.start_outbound().await {
                    log::info!("Session {} ended: {}", addr, e);
                }
            });
            self.peers.insert(
                addr,
                PeerEntry {
                    tx,
                    join_handle: Some(join_handle),
                    last_tick: None,
                    hash_failures: 0,
                },
            );
        }
    }

    fn run_choke_round(&mut self) {
        let seeding = self.completed;
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter_map(|(addr, entry)| {
                let tick = entry.last_tick.as_ref()?;
                Some(ChokeCandidate {
                    addr: *addr,
                    is_interested: tick.state.is_peer_interested,
                    is_choked: tick.state.is_peer_choked,
                    reciprocation_rate: if seeding {
                        tick.counters.payload_up_rate
                    } else {
                        tick.counters.payload_down_rate
                    },
                })
            })
            .collect();

        let round = self.tick_count / CHOKE_ROUND_SECS;
        let decisions = choke::run_round(
            &candidates,
            self.ctx.conf.unchoke_slots,
            round,
            &mut self.choke_optimistic,
        );

        for addr in decisions.unchoke {
            if let Some(entry) = self.peers.get(&addr) {
                let _ = entry.tx.send(peer::Command::SetChoked(false));
            }
        }
        for addr in decisions.choke {
            if let Some(entry) = self.peers.get(&addr) {
                let _ = entry.tx.send(peer::Command::SetChoked(true));
            }
        }
    }

    fn left_bytes(&self) -> u64 {
        let tracker = self.ctx.piece_state.lock().unwrap();
        let missing = tracker.picker.missing_piece_count() as u64;
        // close enough for announces: the last piece's shorter length
        // only skews this by a few KiB
        missing * self.ctx.storage.piece_len as u64
    }

    fn publish_announce_stats(&mut self) {
        let _ = self.announce_stats_tx.send(AnnounceStats {
            uploaded: self.total_uploaded,
            downloaded: self.total_downloaded,
            left: self.left_bytes(),
        });
    }

    fn publish_stats_alert(&mut self) {
        let (piece_count, total, pending) = {
            let tracker = self.ctx.piece_state.lock().unwrap();
            (
                tracker.picker.owned_piece_count(),
                tracker.picker.piece_count(),
                tracker.downloads.len(),
            )
        };

        let mut thruput = ThruputSnapshot {
            payload_up_total: self.total_uploaded,
            payload_down_total: self.total_downloaded,
            ..Default::default()
        };
        for entry in self.peers.values() {
            if let Some(tick) = &entry.last_tick {
                thruput.payload_down_rate += tick.counters.payload_down_rate;
                thruput.payload_up_rate += tick.counters.payload_up_rate;
                thruput.waste_total += tick.counters.waste_total;
            }
        }

        let completed_pieces = if self.ctx.conf.alerts.completed_pieces {
            std::mem::take(&mut self.recently_completed)
        } else {
            self.recently_completed.clear();
            Vec::new()
        };

        alert::send(
            &self.ctx.alert_tx,
            Alert::TorrentStats {
                id: self.ctx.id,
                stats: Box::new(TorrentStats {
                    run_duration: self.start_time.elapsed(),
                    piece_count,
                    total_piece_count: total,
                    pending_piece_count: pending,
                    thruput,
                    peer_count: self.peers.len(),
                    available_peer_count: self.available.len(),
                    completed_pieces,
                }),
            },
        );
    }

    /// Builds and durably writes the resume state. The disk flush+sync
    /// must complete before the checkpoint file is renamed into place, so
    /// a checkpointed verified piece is never lost to a crash.
    async fn write_checkpoint(&mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.ctx.disk_tx.send(disk::Command::FlushAndSync {
            id: self.ctx.id,
            ack_tx,
        });
        match ack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!(
                    "Torrent {} flush before checkpoint failed: {}",
                    self.ctx.id,
                    e
                );
                return;
            }
            Err(_) => return,
        }

        let checkpoint = self.build_checkpoint();
        let store = Arc::clone(&self.checkpoint_store);
        let result =
            task::spawn_blocking(move || store.save(&checkpoint)).await;

        match result {
            Ok(Ok(path)) => {
                self.last_checkpoint = Instant::now();
                self.pieces_since_checkpoint = 0;
                alert::send(
                    &self.ctx.alert_tx,
                    Alert::CheckpointSaved {
                        id: self.ctx.id,
                        path,
                    },
                );
            }
            Ok(Err(e)) => {
                log::error!(
                    "Torrent {} checkpoint save failed: {}",
                    self.ctx.id,
                    e
                );
            }
            Err(e) => {
                log::error!("Checkpoint task panicked: {}", e);
            }
        }
    }

    fn build_checkpoint(&self) -> TorrentCheckpoint {
        let verified_pieces: Vec<PieceIndex> = {
            let tracker = self.ctx.piece_state.lock().unwrap();
            tracker.picker.own_pieces().iter_ones().collect()
        };
        let storage = &self.ctx.storage;

        TorrentCheckpoint {
            info_hash: self.ctx.info_hash,
            torrent_name: self.name.clone(),
            created_at: self.created_at,
            updated_at: checkpoint::unix_now(),
            total_pieces: storage.piece_count,
            piece_length: storage.piece_len,
            total_length: storage.download_len,
            verified_pieces,
            output_dir: storage.download_dir.clone(),
            files: storage
                .files
                .iter()
                .map(|file| CheckpointFile {
                    path: file.path.clone(),
                    length: file.len,
                    attr: {
                        let attrs = &file.attributes;
                        let mut attr = String::new();
                        if attrs.padding {
                            attr.push('p');
                        }
                        if attrs.symlink {
                            attr.push('l');
                        }
                        if attrs.executable {
                            attr.push('x');
                        }
                        if attrs.hidden {
                            attr.push('h');
                        }
                        attr
                    },
                    symlink_target: file.attributes.symlink_target.clone(),
                })
                .collect(),
            stats: CheckpointStats {
                uploaded: self.total_uploaded,
                downloaded: self.total_downloaded,
            },
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        log::info!("Shutting down torrent {}", self.ctx.id);

        for entry in self.peers.values_mut() {
            let _ = entry.tx.send(peer::Command::Shutdown);
        }
        for entry in self.peers.values_mut() {
            if let Some(join_handle) = entry.join_handle.take() {
                let _ = join_handle.await;
            }
        }
        self.peers.clear();

        if let Some(announcer_tx) = self.announcer_tx.take() {
            let _ = announcer_tx.send(AnnouncerCommand::Shutdown);
        }
        if let Some(join_handle) = self.announcer_join.take() {
            let _ = join_handle.await;
        }

        self.write_checkpoint().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{piece_picker::PiecePicker, storage_info::FileInfo, BLOCK_LEN};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    fn tracker(piece_count: usize) -> PieceTracker {
        let storage = StorageInfo {
            piece_count,
            piece_len: PIECE_LEN,
            last_piece_len: PIECE_LEN,
            download_len: piece_count as u64 * PIECE_LEN as u64,
            download_dir: std::path::PathBuf::from("/"),
            files: vec![FileInfo {
                path: std::path::PathBuf::from("t.bin"),
                len: piece_count as u64 * PIECE_LEN as u64,
                torrent_offset: 0,
                attributes: Default::default(),
            }],
        };
        PieceTracker::new(PiecePicker::empty(piece_count), storage)
    }

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn all_pieces(count: usize) -> Bitfield {
        Bitfield::repeat(true, count)
    }

    #[test]
    fn test_blocks_flow_from_new_and_existing_downloads() {
        let mut tracker = tracker(2);
        tracker.picker.register_peer_pieces(&all_pieces(2));
        let peer = addr(1);

        // the first pull opens a download and fills from it
        let mut buf = Vec::new();
        let got =
            tracker.pick_blocks_for_peer(peer, &all_pieces(2), 1, false, &mut buf);
        assert_eq!(got, 1);
        assert_eq!(tracker.downloads.len(), 1);

        // the second pull continues the same piece before opening another
        let mut buf2 = Vec::new();
        tracker.pick_blocks_for_peer(peer, &all_pieces(2), 1, false, &mut buf2);
        assert_eq!(buf2[0].piece_index, buf[0].piece_index);

        // a bigger pull spills into the second piece
        let mut buf3 = Vec::new();
        let got =
            tracker.pick_blocks_for_peer(peer, &all_pieces(2), 8, false, &mut buf3);
        assert_eq!(got, 2);
        assert_eq!(tracker.downloads.len(), 2);
    }

    #[test]
    fn test_received_and_completion_reporting() {
        let mut tracker = tracker(1);
        tracker.picker.register_peer_pieces(&all_pieces(1));
        let peer = addr(1);

        let mut buf = Vec::new();
        tracker.pick_blocks_for_peer(peer, &all_pieces(1), 8, false, &mut buf);
        assert_eq!(buf.len(), 2);

        let (receipt, done) = tracker.received_block(&buf[0], peer);
        assert!(matches!(receipt, BlockReceipt::Accepted { .. }));
        assert!(!done);

        let (receipt, done) = tracker.received_block(&buf[1], peer);
        assert!(matches!(receipt, BlockReceipt::Accepted { .. }));
        assert!(done);

        // a block for a piece with no download in progress is refused
        let stray = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        let (receipt, _) = tracker.received_block(&stray, peer);
        assert_eq!(receipt, BlockReceipt::Duplicate);
    }

    #[test]
    fn test_cancel_peer_frees_blocks_for_others() {
        let mut tracker = tracker(1);
        tracker.picker.register_peer_pieces(&all_pieces(1));
        let first = addr(1);
        let second = addr(2);

        let mut buf = Vec::new();
        tracker.pick_blocks_for_peer(first, &all_pieces(1), 8, false, &mut buf);

        // with everything in flight to the first peer, the second gets
        // nothing until the first is canceled
        let mut buf2 = Vec::new();
        assert_eq!(
            tracker.pick_blocks_for_peer(second, &all_pieces(1), 8, false, &mut buf2),
            0
        );
        tracker.cancel_peer(first);
        assert_eq!(
            tracker.pick_blocks_for_peer(second, &all_pieces(1), 8, false, &mut buf2),
            2
        );
    }
}
