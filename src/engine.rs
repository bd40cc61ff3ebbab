//! The engine is the top-level coordinator that runs and manages all
//! entities in the torrent engine. The user interacts with it via the
//! [`EngineHandle`], which exposes a restricted public API; the
//! underlying communication method is a tokio mpsc channel.
//!
//! The engine is spawned as a tokio task and runs in the background until
//! an unrecoverable error occurs or the user sends a shutdown command.

use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    sync::oneshot,
    task,
};

use crate::{
    alert::{AlertReceiver, AlertSender},
    checkpoint::{CheckpointStats, CheckpointStore},
    conf::{Conf, TorrentConf},
    dht, disk,
    error::{EngineResult, Error, TorrentResult},
    magnet::MagnetUri,
    metadata,
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::{self, Torrent},
    tracker::TrackerTiers,
    Bitfield, PieceIndex, TorrentId,
};

/// The channel through which the user can send commands to the engine.
pub type Sender = UnboundedSender<Command>;
/// The channel on which the engine listens for commands.
type Receiver = UnboundedReceiver<Command>;

/// The type of commands that the engine can receive.
pub enum Command {
    /// Contains the information for creating a new torrent.
    CreateTorrent {
        id: TorrentId,
        params: Box<TorrentParams>,
    },
    /// Contains a magnet link whose metadata must be fetched before the
    /// torrent proper can start.
    CreateMagnet {
        id: TorrentId,
        params: Box<MagnetParams>,
    },
    /// The magnet metadata task finished; the torrent can be assembled.
    MetadataReady {
        id: TorrentId,
        params: Box<MagnetParams>,
        info_bytes: Vec<u8>,
        peers: Vec<SocketAddr>,
    },
    /// Gracefully shuts down the engine and waits for all its torrents to
    /// do the same.
    Shutdown,
}

/// Information for creating a new torrent.
pub struct TorrentParams {
    /// The torrent's parsed metadata.
    pub metainfo: Metainfo,
    /// The raw bencoded info dictionary, if the caller has it; used to
    /// serve ut_metadata requests from other magnet users.
    pub info_bytes: Option<Vec<u8>>,
    /// If set, overrides the default per-torrent config.
    pub conf: Option<TorrentConf>,
    /// Whether to download or seed the torrent.
    pub mode: Mode,
    /// The address on which the torrent should listen for new peers.
    pub listen_addr: Option<SocketAddr>,
}

/// Information for creating a torrent from a magnet link.
pub struct MagnetParams {
    pub magnet: MagnetUri,
    pub conf: Option<TorrentConf>,
    pub listen_addr: Option<SocketAddr>,
}

/// The download mode.
#[derive(Debug)]
pub enum Mode {
    Download { seeds: Vec<SocketAddr> },
    Seed,
}

impl Mode {
    fn own_pieces(&self, piece_count: usize) -> Bitfield {
        match self {
            Mode::Download { .. } => Bitfield::repeat(false, piece_count),
            Mode::Seed => Bitfield::repeat(true, piece_count),
        }
    }

    fn seeds(&self) -> Vec<SocketAddr> {
        match self {
            Mode::Download { seeds } => seeds.clone(),
            _ => Vec::new(),
        }
    }
}

/// Spawns the engine as a tokio task.
///
/// The return value is a tuple of an [`EngineHandle`], which may be used
/// to send the engine commands, and an [`AlertReceiver`], to which the
/// various components in the engine send alerts of events.
pub fn spawn(conf: Conf) -> EngineResult<(EngineHandle, AlertReceiver)> {
    log::info!("Spawning engine task");

    let (alert_tx, alert_rx) = crate::alert::channel();
    let engine_alert_tx = alert_tx.clone();
    let (mut engine, cmd_tx) = Engine::new(conf, alert_tx)?;

    let join_handle = task::spawn(async move { engine.run().await });

    Ok((
        EngineHandle {
            cmd_tx,
            alert_tx: engine_alert_tx,
            join_handle: Some(join_handle),
            next_torrent_id: std::sync::atomic::AtomicU32::new(1),
        },
        alert_rx,
    ))
}

struct Engine {
    /// All currently running torrents in the engine.
    torrents: HashMap<TorrentId, TorrentEntry>,
    /// The port on which the engine receives commands.
    cmd_rx: Receiver,
    /// Our own sender, cloned into spawned helper tasks (metadata
    /// fetches) that report back as commands.
    cmd_tx: Sender,
    disk_tx: disk::Sender,
    disk_join_handle: Option<disk::JoinHandle>,
    dht_tx: Option<dht::Sender>,
    dht_join_handle: Option<dht::JoinHandle>,
    /// The channel on which tasks in the engine post alerts to the user.
    alert_tx: AlertSender,
    checkpoint_store: Arc<CheckpointStore>,
    /// Peers connected across all torrents, bounding the engine-wide cap.
    global_peer_count: Arc<std::sync::atomic::AtomicUsize>,
    /// The global engine configuration that includes defaults for
    /// torrents whose config is not overridden.
    conf: Conf,
}

/// A running torrent's entry in the engine.
struct TorrentEntry {
    /// The torrent's command channel, on which the engine sends commands
    /// to the torrent.
    tx: torrent::Sender,
    /// The torrent task's join handle, used during shutdown.
    join_handle: Option<task::JoinHandle<TorrentResult<()>>>,
}

impl Engine {
    /// Creates the engine, spawning the disk and DHT tasks.
    fn new(conf: Conf, alert_tx: AlertSender) -> EngineResult<(Self, Sender)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let (disk_join_handle, disk_tx) = disk::spawn(conf.disk.clone())?;

        let (dht_tx, dht_join_handle) = if conf.dht.enabled {
            let (join_handle, tx) =
                dht::spawn(conf.dht.clone(), alert_tx.clone());
            (Some(tx), Some(join_handle))
        } else {
            (None, None)
        };

        let checkpoint_store = Arc::new(CheckpointStore::new(
            conf.engine.state_dir.clone(),
            conf.engine.checkpoint_format,
        ));

        Ok((
            Engine {
                torrents: HashMap::new(),
                cmd_rx,
                cmd_tx: cmd_tx.clone(),
                disk_tx,
                disk_join_handle: Some(disk_join_handle),
                dht_tx,
                dht_join_handle,
                alert_tx,
                checkpoint_store,
                global_peer_count: Arc::new(
                    std::sync::atomic::AtomicUsize::new(0),
                ),
                conf,
            },
            cmd_tx,
        ))
    }

    async fn run(&mut self) -> EngineResult<()> {
        log::info!("Starting engine");

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::CreateTorrent { id, params } => {
                    if let Err(e) = self.create_torrent(id, *params).await {
                        log::error!("Failed to create torrent {}: {}", id, e);
                        crate::alert::send(
                            &self.alert_tx,
                            crate::alert::Alert::Error(Arc::new(e)),
                        );
                    }
                }
                Command::CreateMagnet { id, params } => {
                    self.start_metadata_fetch(id, params);
                }
                Command::MetadataReady {
                    id,
                    params,
                    info_bytes,
                    peers,
                } => {
                    if let Err(e) = self
                        .create_from_metadata(id, *params, info_bytes, peers)
                        .await
                    {
                        log::error!(
                            "Failed to start magnet torrent {}: {}",
                            id,
                            e
                        );
                        crate::alert::send(
                            &self.alert_tx,
                            crate::alert::Alert::Error(Arc::new(e)),
                        );
                    }
                }
                Command::Shutdown => {
                    self.shutdown().await?;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Creates and spawns a new torrent based on the parameters given.
    ///
    /// If a checkpoint exists for the info hash, the torrent resumes from
    /// it: the files are size-checked, pieces overlapping corrupt files
    /// are invalidated, and the BEP 47 attributes are re-applied.
    async fn create_torrent(
        &mut self,
        id: TorrentId,
        params: TorrentParams,
    ) -> EngineResult<()> {
        let conf = params
            .conf
            .unwrap_or_else(|| self.conf.torrent.clone());
        let metainfo = params.metainfo;
        let storage_info = StorageInfo::new(
            &metainfo,
            self.conf.engine.download_dir.clone(),
        );

        // resume state, if any; an unreadable checkpoint is a validation
        // error reported to the caller rather than silently ignored
        let (mut own_pieces, resume_stats) =
            if self.checkpoint_store.exists(&metainfo.info_hash) {
                let checkpoint =
                    self.checkpoint_store.load(&metainfo.info_hash)?;
                if checkpoint.total_pieces != storage_info.piece_count
                    || checkpoint.piece_length != storage_info.piece_len
                {
                    return Err(Error::Checkpoint(
                        crate::error::CheckpointError::InvalidContents,
                    ));
                }
                let mut pieces =
                    Bitfield::repeat(false, storage_info.piece_count);
                for piece in &checkpoint.verified_pieces {
                    pieces.set(*piece, true);
                }
                log::info!(
                    "Torrent {} resuming with {} verified pieces",
                    id,
                    checkpoint.verified_pieces.len()
                );
                (pieces, checkpoint.stats)
            } else {
                (
                    params.mode.own_pieces(storage_info.piece_count),
                    CheckpointStats::default(),
                )
            };

        // the command channel precedes the task: the disk allocation and
        // the resume pass below both need the sender
        let (torrent_tx, torrent_rx) = torrent::channel();

        // allocate the torrent on disk before anything connects
        let written_pieces: HashSet<PieceIndex> =
            own_pieces.iter_ones().collect();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.disk_tx.send(disk::Command::NewTorrent {
            id,
            storage_info: storage_info.clone(),
            piece_hashes: metainfo.pieces.clone(),
            written_pieces,
            torrent_tx: torrent_tx.clone(),
            ack_tx,
        })?;
        match ack_rx.await {
            Ok(Ok(())) => log::info!("Torrent {} allocated on disk", id),
            Ok(Err(e)) => {
                log::error!("Error allocating torrent {} on disk: {}", id, e);
                return Err(Error::InvalidDownloadPath);
            }
            Err(_) => return Err(Error::Channel),
        }

        // resume consistency: size-check the files, drop pieces touching
        // anything corrupt (both here and in the disk's record), and
        // re-apply the BEP 47 attributes
        if own_pieces.any() {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.disk_tx
                .send(disk::Command::VerifyFiles { id, ack_tx })?;
            if let Ok(Ok(invalid)) = ack_rx.await {
                if !invalid.is_empty() {
                    log::warn!(
                        "Torrent {}: invalidating {} pieces over corrupt files",
                        id,
                        invalid.len()
                    );
                    for piece in invalid {
                        if piece < own_pieces.len() {
                            own_pieces.set(piece, false);
                        }
                    }
                }
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            self.disk_tx
                .send(disk::Command::ApplyAttributes { id, ack_tx })?;
            let _ = ack_rx.await;
        }

        let mut torrent = Torrent::new(torrent::Params {
            id,
            info_hash: metainfo.info_hash,
            name: metainfo.name.clone(),
            client_id: self.conf.engine.client_id,
            storage: storage_info.clone(),
            conf,
            own_pieces: own_pieces.clone(),
            trackers: TrackerTiers::new(metainfo.trackers.clone()),
            private: metainfo.private,
            metadata: params.info_bytes.map(Arc::new),
            listen_addr: params.listen_addr.unwrap_or_else(|| {
                SocketAddr::new(
                    Ipv4Addr::UNSPECIFIED.into(),
                    self.conf.engine.listen_port,
                )
            }),
            listen_port: self.conf.engine.listen_port,
            seeds: params.mode.seeds(),
            disk_tx: self.disk_tx.clone(),
            dht_tx: if metainfo.private {
                None
            } else {
                self.dht_tx.clone()
            },
            alert_tx: self.alert_tx.clone(),
            checkpoint_store: Arc::clone(&self.checkpoint_store),
            checkpoint_interval: self.conf.engine.checkpoint_interval,
            checkpoint_piece_threshold: self
                .conf
                .engine
                .checkpoint_piece_threshold,
            resume_stats,
            global_peer_count: Arc::clone(&self.global_peer_count),
            max_global_peer_count: self.conf.engine.max_global_peer_count,
        }, torrent_tx.clone(), torrent_rx);

        let join_handle = task::spawn(async move { torrent.start().await });

        self.torrents.insert(
            id,
            TorrentEntry {
                tx: torrent_tx,
                join_handle: Some(join_handle),
            },
        );

        Ok(())
    }

    /// Spawns the magnet metadata pipeline: discover candidate peers via
    /// the magnet's trackers and the DHT, fetch the metadata (BEP 9), and
    /// report back for torrent assembly. No payload is exchanged until
    /// the metadata is complete and verified.
    fn start_metadata_fetch(&self, id: TorrentId, params: Box<MagnetParams>) {
        let magnet = params.magnet.clone();
        let client_id = self.conf.engine.client_id;
        let listen_port = self.conf.engine.listen_port;
        let dht_tx = self.dht_tx.clone();
        let engine_tx = self.cmd_tx.clone();

        task::spawn(async move {
            // peer discovery: a private mpsc poses as a torrent channel
            // so both trackers and the DHT can deliver to us
            let (peers_tx, mut peers_rx) =
                mpsc::unbounded_channel::<torrent::Command>();

            if let Some(dht_tx) = &dht_tx {
                let _ = dht_tx.send(dht::Command::FindPeers {
                    info_hash: magnet.info_hash,
                    port: listen_port,
                    reply: peers_tx.clone(),
                });
            }

            let tiers: Vec<Vec<url::Url>> =
                magnet.trackers.iter().map(|t| vec![t.clone()]).collect();
            let mut trackers = TrackerTiers::new(tiers);
            if !trackers.is_empty() {
                let announce = crate::tracker::Announce {
                    info_hash: magnet.info_hash,
                    peer_id: client_id,
                    port: listen_port,
                    ip: None,
                    downloaded: 0,
                    uploaded: 0,
                    // the size is unknown until the metadata arrives
                    left: u64::MAX,
                    peer_count: Some(50),
                    tracker_id: None,
                    event: Some(crate::tracker::Event::Started),
                };
                if let Ok((_, response)) = trackers.announce(&announce).await
                {
                    let addrs: Vec<SocketAddr> =
                        response.all_peers().collect();
                    if !addrs.is_empty() {
                        let _ =
                            peers_tx.send(torrent::Command::AvailablePeers {
                                addrs,
                                source: torrent::PeerSource::Tracker,
                            });
                    }
                }
            }

            // gather addresses for a short window, then retry in rounds
            // until the overall metadata deadline gives up
            let mut candidates: Vec<SocketAddr> = Vec::new();
            let mut seen = HashSet::new();
            let gather = tokio::time::timeout(
                std::time::Duration::from_secs(10),
                async {
                    while let Some(cmd) = peers_rx.recv().await {
                        if let torrent::Command::AvailablePeers {
                            addrs,
                            ..
                        } = cmd
                        {
                            for addr in addrs {
                                if seen.insert(addr) {
                                    candidates.push(addr);
                                }
                            }
                            if candidates.len() >= 30 {
                                break;
                            }
                        }
                    }
                },
            );
            let _ = gather.await;

            log::info!(
                "Magnet {}: {} candidate peers for metadata",
                hex::encode(magnet.info_hash),
                candidates.len()
            );

            let mut reliability = HashMap::new();
            match metadata::fetch(
                magnet.info_hash,
                client_id,
                candidates.clone(),
                &mut reliability,
            )
            .await
            {
                Some(info_bytes) => {
                    let _ = engine_tx.send(Command::MetadataReady {
                        id,
                        params,
                        info_bytes,
                        peers: candidates,
                    });
                }
                None => {
                    log::warn!(
                        "Magnet {}: metadata could not be obtained",
                        hex::encode(magnet.info_hash)
                    );
                }
            }
        });
    }

    /// Builds the real torrent from fetched magnet metadata.
    async fn create_from_metadata(
        &mut self,
        id: TorrentId,
        params: MagnetParams,
        info_bytes: Vec<u8>,
        peers: Vec<SocketAddr>,
    ) -> EngineResult<()> {
        let mut metainfo = Metainfo::from_info_bytes(
            &info_bytes,
            params.magnet.info_hash,
        )?;
        // the magnet's trackers become single-tracker tiers
        metainfo.trackers = params
            .magnet
            .trackers
            .iter()
            .map(|t| vec![t.clone()])
            .collect();

        self.create_torrent(
            id,
            TorrentParams {
                metainfo,
                info_bytes: Some(info_bytes),
                conf: params.conf,
                mode: Mode::Download { seeds: peers },
                listen_addr: params.listen_addr,
            },
        )
        .await
    }

    async fn shutdown(&mut self) -> EngineResult<()> {
        log::info!("Shutting down engine");

        // tell all torrents to shut down and join their tasks
        for entry in self.torrents.values_mut() {
            // the torrent task may no longer be running, so don't panic
            entry.tx.send(torrent::Command::Shutdown).ok();
        }
        for entry in self.torrents.values_mut() {
            if let Some(join_handle) = entry.join_handle.take() {
                match join_handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Torrent error: {}", e),
                    Err(e) => log::error!("Torrent task panicked: {}", e),
                }
            }
        }

        if let Some(dht_tx) = &self.dht_tx {
            let _ = dht_tx.send(dht::Command::Shutdown);
        }
        if let Some(join_handle) = self.dht_join_handle.take() {
            let _ = join_handle.await;
        }

        // the disk flushes everything on its way out
        self.disk_tx.send(disk::Command::Shutdown)?;
        self.disk_join_handle
            .take()
            .expect("disk join handle missing")
            .await
            .expect("disk task has panicked")?;

        Ok(())
    }
}

/// A handle to the currently running torrent engine.
pub struct EngineHandle {
    cmd_tx: Sender,
    alert_tx: AlertSender,
    join_handle: Option<task::JoinHandle<EngineResult<()>>>,
    next_torrent_id: std::sync::atomic::AtomicU32,
}

impl EngineHandle {
    /// Transports an operator-defined alert condition onto the event
    /// stream. Rule evaluation lives outside the core; the engine only
    /// carries the event to every observer.
    pub fn trigger_alert(&self, name: &str, message: &str) {
        crate::alert::send(
            &self.alert_tx,
            crate::alert::Alert::AlertTriggered {
                name: name.into(),
                message: message.into(),
            },
        );
    }

    /// Transports the clearing of an operator-defined alert condition.
    pub fn resolve_alert(&self, name: &str) {
        crate::alert::send(
            &self.alert_tx,
            crate::alert::Alert::AlertResolved { name: name.into() },
        );
    }

    /// Reports a failure to deliver a notification to an external sink.
    pub fn report_notification_error(&self, message: &str) {
        crate::alert::send(
            &self.alert_tx,
            crate::alert::Alert::NotificationError {
                message: message.into(),
            },
        );
    }

    fn next_id(&self) -> TorrentId {
        self.next_torrent_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Creates and starts a torrent from parsed metainfo.
    ///
    /// If successful, returns the id of the torrent, used to identify it
    /// when issuing further commands.
    pub fn create_torrent(
        &self,
        params: TorrentParams,
    ) -> EngineResult<TorrentId> {
        log::trace!("Creating torrent");
        let id = self.next_id();
        self.cmd_tx.send(Command::CreateTorrent {
            id,
            params: Box::new(params),
        })?;
        Ok(id)
    }

    /// Creates a torrent from a magnet URI. The metadata is fetched from
    /// the swarm before the download proper begins.
    pub fn create_magnet(
        &self,
        uri: &str,
        conf: Option<TorrentConf>,
        listen_addr: Option<SocketAddr>,
    ) -> EngineResult<TorrentId> {
        let magnet = MagnetUri::parse(uri)?;
        let id = self.next_id();
        self.cmd_tx.send(Command::CreateMagnet {
            id,
            params: Box::new(MagnetParams {
                magnet,
                conf,
                listen_addr,
            }),
        })?;
        Ok(id)
    }

    /// Gracefully shuts down the engine and waits for all its torrents to
    /// do the same.
    ///
    /// # Panics
    ///
    /// Panics if the engine has already been shut down.
    pub async fn shutdown(mut self) -> EngineResult<()> {
        log::trace!("Shutting down engine task");
        self.cmd_tx.send(Command::Shutdown)?;
        if let Err(e) = self
            .join_handle
            .take()
            .expect("engine already shut down")
            .await
            .expect("task error")
        {
            log::error!("Engine error: {}", e);
        }
        Ok(())
    }
}
