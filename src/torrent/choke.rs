//! The tit-for-tat choking algorithm.
//!
//! Every round (10 seconds), the interested peers are ranked by what they
//! give us: their rolling download rate while we're leeching, their upload
//! rate once we seed. The top N keep (or gain) an unchoke, everyone else
//! is choked. Every third round one additional randomly chosen choked and
//! interested peer is unchoked optimistically, probing for better
//! reciprocation than the current favorites.

use std::net::SocketAddr;

use rand::seq::IteratorRandom;

/// How often the regular unchoke ranking runs.
pub const CHOKE_ROUND_SECS: u64 = 10;

/// Every this many rounds the optimistic slot rotates (30 seconds with 10
/// second rounds).
pub const OPTIMISTIC_ROUND_INTERVAL: u64 = 3;

/// What the choker needs to know about one candidate peer.
#[derive(Clone, Copy, Debug)]
pub struct ChokeCandidate {
    pub addr: SocketAddr,
    /// Whether the peer wants anything from us; only interested peers
    /// compete for slots.
    pub is_interested: bool,
    /// Whether we are currently choking the peer.
    pub is_choked: bool,
    /// The peer's rolling payload rate in the direction we reciprocate
    /// for: down while leeching, up while seeding.
    pub reciprocation_rate: u64,
}

/// The decisions of one choke round.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeDecisions {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

/// Runs one round of the choking algorithm.
///
/// `round` is the monotonically increasing round counter; it drives the
/// optimistic rotation. The current optimistic peer, if any, keeps its
/// slot between rotations without competing by rate.
pub fn run_round(
    candidates: &[ChokeCandidate],
    unchoke_slots: usize,
    round: u64,
    optimistic: &mut Option<SocketAddr>,
) -> ChokeDecisions {
    // rotate (or initially pick) the optimistic slot
    if round % OPTIMISTIC_ROUND_INTERVAL == 0 {
        let mut rng = rand::thread_rng();
        *optimistic = candidates
            .iter()
            .filter(|c| c.is_interested && c.is_choked)
            .map(|c| c.addr)
            .choose(&mut rng);
    } else if let Some(addr) = *optimistic {
        // drop the slot if its holder left or lost interest
        if !candidates
            .iter()
            .any(|c| c.addr == addr && c.is_interested)
        {
            *optimistic = None;
        }
    }

    // rank interested peers by their reciprocation rate
    let mut ranked: Vec<&ChokeCandidate> = candidates
        .iter()
        .filter(|c| c.is_interested && Some(c.addr) != *optimistic)
        .collect();
    ranked.sort_by(|a, b| b.reciprocation_rate.cmp(&a.reciprocation_rate));

    let mut decisions = ChokeDecisions::default();
    let mut unchoked: Vec<SocketAddr> =
        ranked.iter().take(unchoke_slots).map(|c| c.addr).collect();
    if let Some(addr) = *optimistic {
        unchoked.push(addr);
    }

    for candidate in candidates {
        let should_unchoke = unchoked.contains(&candidate.addr);
        if should_unchoke && candidate.is_choked {
            decisions.unchoke.push(candidate.addr);
        } else if !should_unchoke && !candidate.is_choked {
            decisions.choke.push(candidate.addr);
        }
    }

    decisions
}
