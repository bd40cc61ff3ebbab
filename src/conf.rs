//! This module defines the types used to configure the engine and its parts,
//! plus the capability descriptor computed once at startup.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The client id prefix announced to trackers and peers, Azureus style.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RT0010-";

/// Generates a peer id: the fixed client prefix followed by random digits.
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub disk: DiskConf,
    pub dht: DhtConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
                download_dir: download_dir.clone(),
                state_dir: download_dir.join(".riptide"),
                listen_port: 6881,
                max_global_peer_count: 200,
                checkpoint_format: CheckpointFormat::Binary,
                checkpoint_interval: Duration::from_secs(60),
                checkpoint_piece_threshold: 64,
            },
            torrent: TorrentConf::default(),
            disk: DiskConf::default(),
            dht: DhtConf::default(),
        }
    }
}

/// The checkpoint serialization format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Human readable, for debugging.
    Json,
    /// Compact header + bencoded payload.
    Binary,
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The directory in which a torrent's files are placed upon download
    /// and from which they are seeded.
    pub download_dir: PathBuf,
    /// The directory holding checkpoint files, one per info hash.
    pub state_dir: PathBuf,
    /// The TCP port on which we accept peer connections, also announced to
    /// trackers and the DHT.
    pub listen_port: u16,
    /// The cap on connected peers across all torrents.
    pub max_global_peer_count: usize,
    /// Which on-disk format checkpoints are written in.
    pub checkpoint_format: CheckpointFormat,
    /// How often a running torrent's checkpoint is refreshed.
    pub checkpoint_interval: Duration,
    /// A checkpoint is also written every time this many pieces have been
    /// verified since the last one.
    pub checkpoint_piece_threshold: usize,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Debug, Clone)]
pub struct TorrentConf {
    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,
    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,
    /// The timeout for an outbound connection attempt, including the
    /// handshake exchange.
    pub connect_timeout: Duration,
    /// Repeated dial failures to the same endpoint back off exponentially;
    /// after this many failures the endpoint is dropped from the pool.
    pub max_connect_attempts: u32,
    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing every 30 minutes.
    pub announce_interval: Duration,
    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
    /// The lower bound of the per-peer request pipeline. The session starts
    /// here and adapts upward with observed throughput.
    pub min_request_queue_len: usize,
    /// The upper bound of the per-peer request pipeline.
    pub max_request_queue_len: usize,
    /// When at most this many pieces are missing, the torrent enters
    /// endgame mode and outstanding blocks may be requested from several
    /// peers at once.
    pub endgame_threshold: usize,
    /// The number of peers kept unchoked by the regular choke rounds, not
    /// counting the optimistic slot.
    pub unchoke_slots: usize,
    /// Whether to honor the metainfo's `private` flag by refusing peers
    /// learned from the DHT or PEX.
    pub respect_private: bool,
    /// Specifies which optional alerts to send, besides the default
    /// periodic stats update.
    pub alerts: TorrentAlertConf,
}

/// Configuration of a torrent's optional alerts.
///
/// By default, all optional alerts are turned off, since some of them have
/// overhead that shouldn't be paid when nothing consumes them.
#[derive(Debug, Clone, Default)]
pub struct TorrentAlertConf {
    /// Receive the pieces that were completed each round.
    pub completed_pieces: bool,
    /// Receive aggregate statistics about the torrent's peers.
    ///
    /// This may be relatively expensive, so it should only be turned on
    /// when specifically needed, e.g. when a UI is showing the peers of
    /// a torrent.
    pub peers: bool,
}

impl Default for TorrentConf {
    fn default() -> Self {
        TorrentConf {
            // We always request at least 10 peers as anything less is
            // a waste of a network round trip.
            min_requested_peer_count: 10,
            // Picked for performance while keeping in mind not to overwhelm
            // the host.
            max_connected_peer_count: 50,
            connect_timeout: Duration::from_secs(15),
            max_connect_attempts: 4,
            announce_interval: Duration::from_secs(30 * 60),
            tracker_error_threshold: 15,
            min_request_queue_len: 5,
            max_request_queue_len: 20,
            endgame_threshold: 8,
            unchoke_slots: 4,
            respect_private: true,
            alerts: Default::default(),
        }
    }
}

/// The class of storage backing the download directory. Determines how
/// aggressively the disk task batches writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Hdd,
    Ssd,
    Nvme,
}

impl StorageKind {
    /// The write batch flush window appropriate for this storage class:
    /// tens of milliseconds on spinning disks, ones on SSDs, sub-millisecond
    /// on NVMe.
    pub fn write_batch_timeout(&self) -> Duration {
        match self {
            StorageKind::Hdd => Duration::from_millis(50),
            StorageKind::Ssd => Duration::from_millis(5),
            StorageKind::Nvme => Duration::from_micros(500),
        }
    }
}

/// Configuration of the disk task.
#[derive(Debug, Clone)]
pub struct DiskConf {
    /// The storage class backing the download directory, from the
    /// capability probe or the host's override.
    pub storage_kind: StorageKind,
    /// How long completed writes may sit unsynced before the flush round
    /// runs. `None` means adaptive: derived from the storage kind.
    pub write_batch_timeout: Option<Duration>,
    /// The number of blocking threads hashing and writing pieces.
    pub worker_count: usize,
    /// The size of the per-torrent read cache, in MiB.
    pub cache_size_mib: usize,
    /// Queue depths at which backpressure toward the piece selection engages
    /// and releases.
    pub queue_high_watermark: usize,
    pub queue_low_watermark: usize,
    /// Content-defined chunking for the dedup store.
    pub xet_chunking: ChunkingConf,
}

impl DiskConf {
    /// The effective flush window: the explicit setting, or the storage
    /// kind's adaptive default, floored so the flush loop stays sane.
    pub fn flush_interval(&self) -> Duration {
        self.write_batch_timeout
            .unwrap_or_else(|| self.storage_kind.write_batch_timeout())
            .max(Duration::from_millis(10))
    }
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            storage_kind: StorageKind::Ssd,
            write_batch_timeout: None,
            worker_count: 2,
            cache_size_mib: 64,
            queue_high_watermark: 512,
            queue_low_watermark: 128,
            xet_chunking: ChunkingConf::default(),
        }
    }
}

/// Configuration for content-defined chunk deduplication.
#[derive(Debug, Clone)]
pub struct ChunkingConf {
    pub enabled: bool,
    /// The average chunk size the gear hash boundary mask aims for.
    pub target_chunk_size: usize,
}

impl Default for ChunkingConf {
    fn default() -> Self {
        Self {
            enabled: false,
            target_chunk_size: 64 * 1024,
        }
    }
}

/// Configuration of the DHT node.
#[derive(Debug, Clone)]
pub struct DhtConf {
    /// Whether to run a DHT node at all.
    pub enabled: bool,
    /// The UDP port the DHT binds; defaults to the engine listen port.
    pub port: u16,
    /// Well-known router endpoints used to bootstrap an empty table.
    pub bootstrap_nodes: Vec<String>,
    /// Whether to answer and emit IPv6 (BEP 32).
    pub enable_ipv6: bool,
    /// Prefer IPv6 endpoints of dual-stack nodes when both are reachable
    /// (BEP 45).
    pub prefer_ipv6: bool,
    /// Run as a read-only node (BEP 43): `ro=1` on our queries, stores
    /// refused, zero announces sent.
    pub read_only: bool,
    /// Per-query response timeout.
    pub query_timeout: Duration,
    /// Global deadline for one iterative lookup.
    pub lookup_timeout: Duration,
}

impl Default for DhtConf {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 6881,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
            ],
            enable_ipv6: false,
            prefer_ipv6: false,
            read_only: false,
            query_timeout: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(30),
        }
    }
}

/// A description of the host computed once at startup and passed into the
/// components that pick strategies from it. Code paths never probe the OS
/// at runtime; they match on this descriptor.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// The storage class of the download directory.
    pub storage: StorageKind,
    /// Whether an IPv6 socket could be bound.
    pub ipv6: bool,
    /// The number of logical CPUs, bounding worker pools.
    pub cpu_count: usize,
}

impl Capabilities {
    /// Detects host capabilities. Cheap enough to run once per engine.
    pub fn detect() -> Self {
        let ipv6 =
            std::net::TcpListener::bind(("::1", 0)).map(|_| true).unwrap_or(false);
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            // without a reliable cross-platform probe, assume the common
            // case; the host can override via `DiskConf`
            storage: StorageKind::Ssd,
            ipv6,
            cpu_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_batch_timeout_ordering() {
        assert!(
            StorageKind::Hdd.write_batch_timeout()
                > StorageKind::Ssd.write_batch_timeout()
        );
        assert!(
            StorageKind::Ssd.write_batch_timeout()
                > StorageKind::Nvme.write_batch_timeout()
        );
    }
}
