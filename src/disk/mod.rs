//! The disk task: one task per engine owning every torrent's storage
//! state, consuming commands from torrents and peer sessions.
//!
//! Hashing and file IO run on blocking threads; the task itself only does
//! bookkeeping. Backpressure toward the piece selection is signaled when
//! a torrent's buffered block count crosses its watermarks.

use std::collections::{HashMap, HashSet};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    blockinfo::BlockInfo,
    conf::DiskConf,
    error::{DiskResult, Error, NewTorrentError},
    peer,
    storage_info::StorageInfo,
    torrent, FileIndex, PieceIndex, TorrentId,
};

pub mod io;

use io::torrent::Torrent;

pub type JoinHandle = task::JoinHandle<DiskResult<()>>;

/// The channel for sending commands to the disk task.
pub type Sender = UnboundedSender<Command>;
/// The channel on which the disk task listens for commands.
type Receiver = UnboundedReceiver<Command>;

/// The types of commands that the disk task can execute.
pub enum Command {
    /// Allocate a new torrent in `Disk`.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        /// Pieces already verified, restored from a checkpoint.
        written_pieces: HashSet<PieceIndex>,
        torrent_tx: torrent::Sender,
        /// Reports whether the allocation succeeded.
        ack_tx: oneshot::Sender<Result<(), NewTorrentError>>,
    },
    /// Request to eventually write a block to disk.
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    /// Request to eventually read a block from disk and return it via the
    /// sender.
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_tx: peer::Sender,
    },
    /// Drain the torrent's dirty files to disk with fsync. Checkpoints
    /// wait for the ack before they rename themselves into place.
    FlushAndSync {
        id: TorrentId,
        ack_tx: oneshot::Sender<DiskResult<()>>,
    },
    /// Resume-time file consistency pass: reports the pieces that must be
    /// invalidated because a file is missing or mis-sized.
    VerifyFiles {
        id: TorrentId,
        ack_tx: oneshot::Sender<DiskResult<HashSet<PieceIndex>>>,
    },
    /// Apply BEP 47 attributes (and per-file hashes); reports the indices
    /// of files failing their hash check.
    ApplyAttributes {
        id: TorrentId,
        ack_tx: oneshot::Sender<DiskResult<Vec<FileIndex>>>,
    },
    /// Remove a torrent's entry, e.g. when it is stopped.
    RemoveTorrent { id: TorrentId },
    /// Eventually shut down the disk task.
    Shutdown,
}

/// Spawns the disk task, returning its join handle and command sender.
pub fn spawn(conf: DiskConf) -> DiskResult<(JoinHandle, Sender)> {
    log::info!("Spawning disk IO task");
    let (tx, rx) = mpsc::unbounded_channel();
    let mut disk = Disk::new(conf, rx);
    let join_handle = task::spawn(async move { disk.run().await });
    Ok((join_handle, tx))
}

/// The entity responsible for saving downloaded blocks to disk and
/// verifying whether downloaded pieces are valid.
struct Disk {
    /// Each torrent in the engine has a corresponding entry in this map.
    torrents: HashMap<TorrentId, TorrentEntry>,
    /// The port on which disk IO commands are received.
    cmd_rx: Receiver,
    conf: DiskConf,
}

struct TorrentEntry {
    torrent: Torrent,
    torrent_tx: torrent::Sender,
    /// Whether we told the torrent to stop pulling requests.
    throttled: bool,
}

impl Disk {
    fn new(conf: DiskConf, cmd_rx: Receiver) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_rx,
            conf,
        }
    }

    /// The disk event loop, run until shutdown or an unrecoverable error
    /// (an mpsc channel failure).
    async fn run(&mut self) -> DiskResult<()> {
        log::info!("Starting disk IO event loop");
        let mut flush_tick =
            tokio::time::interval(self.conf.flush_interval());
        flush_tick
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let cmd = tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    cmd
                }
                _ = flush_tick.tick() => {
                    // bound how long completed writes sit unsynced
                    for entry in self.torrents.values_mut() {
                        if let Err(e) = entry.torrent.flush_and_sync().await {
                            log::warn!("Periodic flush failed: {}", e);
                        }
                    }
                    continue;
                }
            };
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    written_pieces,
                    torrent_tx,
                    ack_tx,
                } => {
                    let result = self.new_torrent(
                        id,
                        storage_info,
                        piece_hashes,
                        written_pieces,
                        torrent_tx,
                    );
                    let _ = ack_tx.send(result);
                }
                Command::WriteBlock {
                    id,
                    block_info,
                    data,
                } => {
                    // NOTE: do _not_ return on failure; disk IO errors are
                    // reported to the torrent, they don't kill the disk
                    // task
                    if let Some(entry) = self.entry(id) {
                        entry.torrent.write_block(block_info, data).await?;
                    }
                    self.update_throttle(id)?;
                }
                Command::ReadBlock {
                    id,
                    block_info,
                    result_tx,
                } => {
                    if let Some(entry) = self.entry(id) {
                        entry.torrent.read_block(block_info, result_tx).await?;
                    }
                }
                Command::FlushAndSync { id, ack_tx } => {
                    let result = match self.entry(id) {
                        Some(entry) => entry
                            .torrent
                            .flush_and_sync()
                            .await
                            .map_err(Error::from),
                        None => Err(Error::InvalidTorrentId),
                    };
                    let _ = ack_tx.send(result);
                }
                Command::VerifyFiles { id, ack_tx } => {
                    let result = match self.entry(id) {
                        Some(entry) => {
                            let corrupt = entry.torrent.verify_files();
                            let invalid = entry
                                .torrent
                                .pieces_overlapping_files(&corrupt);
                            entry.torrent.invalidate_pieces(&invalid);
                            Ok(invalid)
                        }
                        None => Err(Error::InvalidTorrentId),
                    };
                    let _ = ack_tx.send(result);
                }
                Command::ApplyAttributes { id, ack_tx } => {
                    let result = match self.entry(id) {
                        Some(entry) => entry
                            .torrent
                            .apply_attributes()
                            .await
                            .map_err(Error::from),
                        None => Err(Error::InvalidTorrentId),
                    };
                    let _ = ack_tx.send(result);
                }
                Command::RemoveTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    // leave nothing buffered only in page caches
                    for entry in self.torrents.values_mut() {
                        if let Err(e) = entry.torrent.flush_and_sync().await {
                            log::error!("Shutdown sync failed: {}", e);
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        written_pieces: HashSet<PieceIndex>,
        torrent_tx: torrent::Sender,
    ) -> Result<(), NewTorrentError> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            return Err(NewTorrentError::AlreadyExists);
        }
        let torrent = Torrent::new(
            storage_info,
            piece_hashes,
            torrent_tx.clone(),
            &self.conf,
            written_pieces,
        )?;
        log::info!("Torrent {} successfully allocated", id);
        self.torrents.insert(
            id,
            TorrentEntry {
                torrent,
                torrent_tx,
                throttled: false,
            },
        );
        Ok(())
    }

    fn entry(&mut self, id: TorrentId) -> Option<&mut TorrentEntry> {
        let entry = self.torrents.get_mut(&id);
        if entry.is_none() {
            log::warn!("Torrent {} not found", id);
        }
        entry
    }

    /// Tells the torrent to stop (or resume) pulling new requests when
    /// its write queue depth crosses the watermarks.
    fn update_throttle(&mut self, id: TorrentId) -> DiskResult<()> {
        let high = self.conf.queue_high_watermark;
        let low = self.conf.queue_low_watermark;
        if let Some(entry) = self.torrents.get_mut(&id) {
            let depth = entry.torrent.queue_depth();
            if !entry.throttled && depth >= high {
                entry.throttled = true;
                log::info!(
                    "Torrent {} disk queue high watermark ({} blocks)",
                    id,
                    depth
                );
                entry
                    .torrent_tx
                    .send(torrent::Command::SetRequestThrottle(true))?;
            } else if entry.throttled && depth <= low {
                entry.throttled = false;
                log::info!(
                    "Torrent {} disk queue back at low watermark",
                    id
                );
                entry
                    .torrent_tx
                    .send(torrent::Command::SetRequestThrottle(false))?;
            }
        }
        Ok(())
    }
}
