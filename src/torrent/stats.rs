use std::time::Duration;

use crate::counter::ThruputSnapshot;

/// Aggregate statistics of a torrent, sent periodically on the alert
/// channel and used for tracker announces.
#[derive(Clone, Debug, Default)]
pub struct TorrentStats {
    /// How long the torrent has been running.
    pub run_duration: Duration,
    /// The number of pieces the torrent owns (verified and durable).
    pub piece_count: usize,
    /// The number of pieces in the torrent.
    pub total_piece_count: usize,
    /// Pieces whose download is currently in progress.
    pub pending_piece_count: usize,
    /// The summed transfer statistics of all peer sessions.
    pub thruput: ThruputSnapshot,
    /// The number of connected peers.
    pub peer_count: usize,
    /// Peer addresses known but not currently connected.
    pub available_peer_count: usize,
    /// The indices of pieces completed in the last round, only collected
    /// when the torrent's alert config asks for it.
    pub completed_pieces: Vec<usize>,
}

impl TorrentStats {
    /// Returns the download completion as a value in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_piece_count == 0 {
            return 0.0;
        }
        self.piece_count as f64 / self.total_piece_count as f64
    }

    pub fn is_complete(&self) -> bool {
        self.piece_count == self.total_piece_count
    }
}
