//! Per-subsystem error types.
//!
//! Each long-running component has its own error enum so that transient and
//! terminal failures can be told apart at the boundary where they occur.
//! The crate-level [`Error`] aggregates the terminal ones that reach the
//! engine.

pub mod bencode;
pub mod checkpoint;
pub mod dht;
pub mod disk;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;

use std::net::SocketAddr;

pub use bencode::BencodeError;
pub use checkpoint::{CheckpointError, Result as CheckpointResult};
pub use dht::{DhtError, Result as DhtResult};
pub use disk::{NewTorrentError, ReadError, Result as DiskResult, WriteError};
pub use metainfo::{MagnetError, MetainfoError};
pub use peer::{PeerError, Result as PeerResult};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{Result as TrackerResult, TrackerError};

use crate::TorrentId;

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("channel error")]
    /// The channel on which some component in the engine was listening or
    /// sending died.
    Channel,

    #[error("invalid download path")]
    /// The torrent download location is not valid.
    InvalidDownloadPath,

    #[error("invalid torrent id")]
    /// The torrent ID did not correspond to any entry. This is returned when
    /// the user specified a torrent that does not exist.
    InvalidTorrentId,

    #[error("invalid piece index")]
    /// A piece index at or above the torrent's piece count.
    InvalidPieceIndex,

    #[error("invalid metainfo: {0}")]
    /// The torrent file given to the engine could not be parsed or failed
    /// validation.
    InvalidMetainfo(#[from] MetainfoError),

    #[error("invalid magnet link: {0}")]
    /// The magnet URI given to the engine could not be parsed.
    InvalidMagnet(#[from] MagnetError),

    #[error("checkpoint error: {0}")]
    /// A checkpoint could not be loaded or written. When loading, the
    /// session is not started.
    Checkpoint(#[from] CheckpointError),

    #[error("{0}")]
    /// Holds global IO related errors.
    Io(IoError),

    #[error("torrent {id} error: {error}")]
    /// An error specific to a torrent.
    Torrent { id: TorrentId, error: TorrentError },

    #[error("torrent {id} tracker error: {error}")]
    /// An error that occurred while a torrent was announcing to a tracker.
    Tracker { id: TorrentId, error: TrackerError },

    #[error("torrent {id} peer {addr} error: {error}")]
    /// An error that occurred in a torrent's session with a peer.
    Peer {
        id: TorrentId,
        addr: SocketAddr,
        error: PeerError,
    },
}

impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl From<WriteError> for Error {
    fn from(value: WriteError) -> Self {
        match value {
            WriteError::Io(e) => Self::Io(e),
            WriteError::InvalidPieceIndex => Self::InvalidPieceIndex,
        }
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
