use rand::Rng;

use crate::{Bitfield, PieceIndex};

/// The picker decides which piece to download next, tracking how many known
/// peers have each piece.
///
/// Selection order is: elevated priority pieces first, then rarest first,
/// choosing uniformly at random among equally rare candidates so that
/// concurrent downloaders of the same torrent don't converge on the same
/// pieces. Pieces already picked (pending) or owned are skipped, except in
/// endgame, where pending pieces may be picked again so their blocks can be
/// requested from several peers at once.
pub struct PiecePicker {
    /// Which pieces we have (verified and durably written).
    own_pieces: Bitfield,
    /// Per-piece bookkeeping.
    pieces: Vec<Piece>,
}

/// Internal metadata of a single piece.
#[derive(Clone, Copy, Debug, Default)]
struct Piece {
    /// The number of known peers that have this piece.
    frequency: usize,
    /// Whether the piece has been picked and its download is in progress.
    is_pending: bool,
    /// Whether the caller elevated this piece above the rarest-first order
    /// (e.g. resuming a file's head for inspection).
    is_priority: bool,
}

impl PiecePicker {
    /// Creates a new picker for a torrent where we already have the given
    /// pieces.
    pub fn new(own_pieces: Bitfield) -> Self {
        let pieces = vec![Piece::default(); own_pieces.len()];
        Self { own_pieces, pieces }
    }

    /// Creates a picker with no pieces owned.
    pub fn empty(piece_count: usize) -> Self {
        Self::new(Bitfield::repeat(false, piece_count))
    }

    /// Returns the bitfield of owned pieces.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The number of pieces still missing (not owned), whether or not
    /// their download is already in progress.
    pub fn missing_piece_count(&self) -> usize {
        self.pieces.len() - self.own_pieces.count_ones()
    }

    pub fn owned_piece_count(&self) -> usize {
        self.own_pieces.count_ones()
    }

    /// Returns true if all pieces are owned.
    pub fn is_seed(&self) -> bool {
        self.own_pieces.all()
    }

    /// Returns the indices of all missing pieces.
    pub fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.own_pieces.iter_zeros().collect()
    }

    /// Registers the whole availability of a newly connected peer.
    ///
    /// # Panics
    ///
    /// Panics if the bitfield's length doesn't match the piece count; the
    /// peer session validates that before registering.
    pub fn register_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        for index in pieces.iter_ones() {
            self.pieces[index].frequency += 1;
        }
    }

    /// Registers that a peer announced a new piece via a have message.
    pub fn register_peer_have(&mut self, index: PieceIndex) {
        self.pieces[index].frequency += 1;
    }

    /// Removes a disconnected peer's contribution to the availability
    /// counts.
    pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        for index in pieces.iter_ones() {
            debug_assert!(self.pieces[index].frequency > 0);
            self.pieces[index].frequency =
                self.pieces[index].frequency.saturating_sub(1);
        }
    }

    /// Elevates (or demotes) a piece above the rarest-first order.
    pub fn set_priority(&mut self, index: PieceIndex, elevated: bool) {
        self.pieces[index].is_priority = elevated;
    }

    /// Picks the next piece to download from the given peer, marking it
    /// pending, or returns `None` if the peer has nothing we need.
    ///
    /// With `in_endgame` set, pieces whose download is already in progress
    /// are eligible again, so that their remaining blocks can be requested
    /// redundantly from this peer.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
        in_endgame: bool,
    ) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.pieces.len());

        let mut rng = rand::thread_rng();
        let mut best: Option<(PieceIndex, usize)> = None;
        // how many candidates tied at the current best rarity; drives the
        // uniform choice among them (reservoir of size one)
        let mut tie_count = 0;

        for index in peer_pieces.iter_ones() {
            let piece = &self.pieces[index];
            if self.own_pieces[index] {
                continue;
            }
            if piece.is_pending && !in_endgame {
                continue;
            }

            // a priority piece beats everything else immediately
            if piece.is_priority {
                best = Some((index, 0));
                break;
            }

            match best {
                Some((_, best_freq)) if piece.frequency > best_freq => {}
                Some((_, best_freq)) if piece.frequency == best_freq => {
                    tie_count += 1;
                    if rng.gen_range(0..=tie_count) == 0 {
                        best = Some((index, best_freq));
                    }
                }
                _ => {
                    best = Some((index, piece.frequency));
                    tie_count = 0;
                }
            }
        }

        let (index, _) = best?;
        self.pieces[index].is_pending = true;
        Some(index)
    }

    /// Records the outcome of a finished piece download.
    ///
    /// A piece that passed its hash check becomes owned; one that failed
    /// returns to the free set to be picked again.
    pub fn received_piece(&mut self, index: PieceIndex, valid: bool) {
        let piece = &mut self.pieces[index];
        debug_assert!(piece.is_pending || !valid);
        piece.is_pending = false;
        if valid {
            debug_assert!(!self.own_pieces[index]);
            self.own_pieces.set(index, true);
            piece.is_priority = false;
        }
    }

    /// Returns a pending piece to the free set without completing it, used
    /// when its download was abandoned (e.g. the last peer having it
    /// disconnected).
    pub fn unpick_piece(&mut self, index: PieceIndex) {
        self.pieces[index].is_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield(bits: &[bool]) -> Bitfield {
        bits.iter().copied().collect()
    }

    #[test]
    fn test_rarest_piece_is_picked_first() {
        // five peers: piece 3 is held by exactly one peer, pieces 0,1,2,4
        // by all five
        let mut picker = PiecePicker::empty(5);
        let all = bitfield(&[true, true, true, true, true]);
        let rare = bitfield(&[true, true, true, false, true]);
        picker.register_peer_pieces(&all);
        for _ in 0..4 {
            picker.register_peer_pieces(&rare);
        }

        assert_eq!(picker.pick_piece(&all, false), Some(3));
    }

    #[test]
    fn test_pending_and_owned_pieces_are_skipped() {
        let mut picker = PiecePicker::empty(3);
        let all = bitfield(&[true, true, true]);
        picker.register_peer_pieces(&all);

        let first = picker.pick_piece(&all, false).unwrap();
        let second = picker.pick_piece(&all, false).unwrap();
        let third = picker.pick_piece(&all, false).unwrap();
        let mut picked = [first, second, third];
        picked.sort_unstable();
        assert_eq!(picked, [0, 1, 2]);

        // everything pending: nothing more to pick
        assert_eq!(picker.pick_piece(&all, false), None);

        // completing a piece keeps it out of the candidate set
        picker.received_piece(first, true);
        assert_eq!(picker.pick_piece(&all, false), None);
        assert_eq!(picker.owned_piece_count(), 1);
    }

    #[test]
    fn test_endgame_repicks_pending_pieces() {
        let mut picker = PiecePicker::empty(1);
        let all = bitfield(&[true]);
        picker.register_peer_pieces(&all);

        assert_eq!(picker.pick_piece(&all, false), Some(0));
        // without endgame the pending piece is not re-picked
        assert_eq!(picker.pick_piece(&all, false), None);
        // in endgame it is
        assert_eq!(picker.pick_piece(&all, true), Some(0));
    }

    #[test]
    fn test_failed_piece_returns_to_free_set() {
        let mut picker = PiecePicker::empty(1);
        let all = bitfield(&[true]);
        picker.register_peer_pieces(&all);

        assert_eq!(picker.pick_piece(&all, false), Some(0));
        picker.received_piece(0, false);
        assert_eq!(picker.missing_piece_count(), 1);
        assert_eq!(picker.pick_piece(&all, false), Some(0));
    }

    #[test]
    fn test_priority_beats_rarity() {
        let mut picker = PiecePicker::empty(3);
        let all = bitfield(&[true, true, true]);
        // piece 0 is the rarest
        picker.register_peer_pieces(&bitfield(&[true, true, true]));
        picker.register_peer_pieces(&bitfield(&[false, true, true]));

        picker.set_priority(2, true);
        assert_eq!(picker.pick_piece(&all, false), Some(2));
        // with the priority piece pending, rarity applies again
        assert_eq!(picker.pick_piece(&all, false), Some(0));
    }

    #[test]
    fn test_unregister_decrements_frequency() {
        let mut picker = PiecePicker::empty(2);
        let both = bitfield(&[true, true]);
        let second = bitfield(&[false, true]);
        picker.register_peer_pieces(&both);
        picker.register_peer_pieces(&second);
        picker.register_peer_pieces(&second);

        // piece 1 is common, piece 0 rare
        assert_eq!(picker.pick_piece(&both, false), Some(0));
        picker.unpick_piece(0);

        // after the two extra holders of piece 1 leave, piece 1 is rarer
        picker.unregister_peer_pieces(&second);
        picker.unregister_peer_pieces(&second);
        picker.unregister_peer_pieces(&both);
        picker.register_peer_pieces(&both);
        picker.register_peer_pieces(&bitfield(&[true, false]));

        assert_eq!(picker.pick_piece(&both, false), Some(1));
    }
}
