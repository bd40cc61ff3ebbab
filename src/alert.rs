//! This module defines the alerts the API user may receive from the torrent
//! engine.
//!
//! Alerts are broadcast on a bounded [`tokio::sync::broadcast`] channel.
//! Sending is fire and forget: a slow consumer never blocks a producer, it
//! simply loses the oldest alerts and observes the lag count the next time
//! it receives ([`tokio::sync::broadcast::error::RecvError::Lagged`]).

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::sync::broadcast;

use crate::{
    error::Error, torrent::stats::TorrentStats, PeerId, PieceIndex, TorrentId,
};

/// The number of alerts buffered per receiver before the oldest are dropped.
const ALERT_CHANNEL_CAPACITY: usize = 1024;

pub type AlertSender = broadcast::Sender<Alert>;
/// The channel on which the engine's users can listen for alerts.
pub type AlertReceiver = broadcast::Receiver<Alert>;

/// Creates the alert channel pair used by an engine.
pub fn channel() -> (AlertSender, AlertReceiver) {
    broadcast::channel(ALERT_CHANNEL_CAPACITY)
}

/// Sends an alert, ignoring the error returned when no receiver is
/// currently subscribed.
pub fn send(tx: &AlertSender, alert: Alert) {
    let _ = tx.send(alert);
}

/// The events a running engine reports to its observers.
#[derive(Clone, Debug)]
pub enum Alert {
    /// A peer connection completed its handshake.
    PeerConnected {
        id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// A peer session ended, cleanly or not.
    PeerDisconnected { id: TorrentId, addr: SocketAddr },
    /// A piece was downloaded and passed its hash check.
    PieceVerified { id: TorrentId, piece: PieceIndex },
    /// A complete piece failed its hash check and was re-queued.
    PieceFailedVerification { id: TorrentId, piece: PieceIndex },
    /// All pieces of the torrent are verified and on disk.
    DownloadComplete(TorrentId),
    /// The torrent's resume state was durably written.
    CheckpointSaved { id: TorrentId, path: PathBuf },
    /// An announce round to a tracker finished.
    TrackerAnnounced {
        id: TorrentId,
        url: String,
        peer_count: usize,
    },
    /// The DHT finished bootstrapping its routing table.
    DhtBootstrapped { routing_table_size: usize },
    /// An operator-defined alert condition fired. The engine itself only
    /// transports these; rule evaluation lives outside the core.
    AlertTriggered { name: Arc<str>, message: Arc<str> },
    /// A previously triggered alert condition cleared.
    AlertResolved { name: Arc<str> },
    /// Delivering a notification to an external sink failed.
    NotificationError { message: Arc<str> },
    /// A durable disk write, fsync or rename failed; the torrent is paused
    /// pending operator action.
    DiskWriteFailed { id: TorrentId, error: Arc<str> },
    /// Periodic per-torrent statistics.
    TorrentStats {
        id: TorrentId,
        stats: Box<TorrentStats>,
    },
    /// A terminal error escalated out of a subsystem.
    Error(Arc<Error>),
}
