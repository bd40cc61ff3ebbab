//! The iterative lookup's frontier bookkeeping, kept free of IO so it can
//! be driven by the DHT task and tested without a network.
//!
//! The lookup keeps a shortlist of candidates ordered by distance to the
//! target, queries up to α of the closest unqueried ones in parallel,
//! folds newly learned nodes in, and converges when the K closest
//! candidates have all been heard from (or failed) with nothing closer
//! left to ask.

use std::collections::BTreeMap;

use super::{
    node::{DhtNode, Distance, NodeId},
    table::K,
};

/// The lookup concurrency factor.
pub const ALPHA: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

struct Candidate {
    node: DhtNode,
    state: CandidateState,
    /// The write token from this node's response, needed to announce or
    /// put against it later.
    token: Option<Vec<u8>>,
}

pub struct LookupState {
    target: NodeId,
    /// Candidates ordered by distance to the target; the BTreeMap keeps
    /// the frontier sorted for free.
    shortlist: BTreeMap<Distance, Candidate>,
}

impl LookupState {
    pub fn new(
        target: NodeId,
        seeds: impl IntoIterator<Item = DhtNode>,
    ) -> Self {
        let mut lookup = Self {
            target,
            shortlist: BTreeMap::new(),
        };
        for node in seeds {
            lookup.add_candidate(node);
        }
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    fn add_candidate(&mut self, node: DhtNode) {
        let distance = node.id.distance(&self.target);
        self.shortlist.entry(distance).or_insert(Candidate {
            node,
            state: CandidateState::Unqueried,
            token: None,
        });
    }

    /// The next up-to-α closest unqueried nodes, marked in flight.
    pub fn next_batch(&mut self) -> Vec<DhtNode> {
        let mut batch = Vec::with_capacity(ALPHA);
        for candidate in self.shortlist.values_mut() {
            if batch.len() == ALPHA {
                break;
            }
            if candidate.state == CandidateState::Unqueried {
                candidate.state = CandidateState::InFlight;
                batch.push(candidate.node.clone());
            }
        }
        batch
    }

    /// Folds a node's response into the shortlist.
    pub fn on_response(
        &mut self,
        id: &NodeId,
        learned: impl IntoIterator<Item = DhtNode>,
        token: Option<Vec<u8>>,
    ) {
        let distance = id.distance(&self.target);
        if let Some(candidate) = self.shortlist.get_mut(&distance) {
            candidate.state = CandidateState::Responded;
            candidate.token = token;
        }
        for node in learned {
            self.add_candidate(node);
        }
    }

    /// Marks a queried node as unresponsive.
    pub fn on_failure(&mut self, id: &NodeId) {
        let distance = id.distance(&self.target);
        if let Some(candidate) = self.shortlist.get_mut(&distance) {
            candidate.state = CandidateState::Failed;
        }
    }

    /// The lookup has converged when, among the K closest candidates that
    /// haven't failed, everyone has responded and no unqueried candidate
    /// remains closer than the furthest of them.
    pub fn is_complete(&self) -> bool {
        let mut seen = 0;
        for candidate in self.shortlist.values() {
            match candidate.state {
                CandidateState::Failed => continue,
                CandidateState::Responded => {
                    seen += 1;
                    if seen == K {
                        return true;
                    }
                }
                CandidateState::Unqueried | CandidateState::InFlight => {
                    return false;
                }
            }
        }
        // fewer than K live candidates exist at all; we're done when none
        // of them are outstanding
        true
    }

    /// The closest responders with their tokens, for the announce or put
    /// step that follows a lookup.
    pub fn closest_responded(&self, count: usize) -> Vec<(DhtNode, Option<Vec<u8>>)> {
        self.shortlist
            .values()
            .filter(|c| c.state == CandidateState::Responded)
            .take(count)
            .map(|c| (c.node.clone(), c.token.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(last_byte: u8) -> DhtNode {
        let mut bytes = [0u8; 20];
        bytes[19] = last_byte;
        DhtNode::new(
            NodeId::new(bytes),
            ([10, 0, 0, last_byte], 6881).into(),
        )
    }

    fn target() -> NodeId {
        NodeId::new([0; 20])
    }

    #[test]
    fn test_batches_go_closest_first() {
        let mut lookup =
            LookupState::new(target(), (1..=8u8).rev().map(node));

        let batch = lookup.next_batch();
        let ids: Vec<u8> =
            batch.iter().map(|n| n.id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // in-flight nodes aren't handed out again
        let batch = lookup.next_batch();
        let ids: Vec<u8> =
            batch.iter().map(|n| n.id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }

    #[test]
    fn test_learned_nodes_join_the_frontier() {
        let mut lookup = LookupState::new(target(), [node(200)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);

        // the far node teaches us much closer ones
        lookup.on_response(
            &node(200).id,
            (1..=3u8).map(node),
            Some(b"tok".to_vec()),
        );
        let batch = lookup.next_batch();
        let ids: Vec<u8> =
            batch.iter().map(|n| n.id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_completion_requires_k_responses_or_exhaustion() {
        // fewer than K candidates: complete once all are heard from
        let mut lookup = LookupState::new(target(), (1..=3u8).map(node));
        assert!(!lookup.is_complete());
        for n in lookup.next_batch() {
            lookup.on_response(&n.id, [], None);
        }
        assert!(lookup.is_complete());

        // K or more: needs the K closest to respond
        let mut lookup = LookupState::new(target(), (1..=12u8).map(node));
        for _ in 0..4 {
            for n in lookup.next_batch() {
                lookup.on_response(&n.id, [], None);
            }
        }
        assert!(lookup.is_complete());
    }

    #[test]
    fn test_failures_dont_block_completion() {
        let mut lookup = LookupState::new(target(), (1..=4u8).map(node));
        let batch = lookup.next_batch();
        lookup.on_failure(&batch[0].id);
        lookup.on_response(&batch[1].id, [], None);
        lookup.on_response(&batch[2].id, [], None);
        for n in lookup.next_batch() {
            lookup.on_response(&n.id, [], None);
        }
        assert!(lookup.is_complete());
        // failed nodes don't appear among the responders
        let responders = lookup.closest_responded(K);
        assert_eq!(responders.len(), 3);
    }

    #[test]
    fn test_closest_responded_carries_tokens() {
        let mut lookup = LookupState::new(target(), (1..=2u8).map(node));
        for n in lookup.next_batch() {
            let token = vec![n.id.as_bytes()[19]];
            lookup.on_response(&n.id, [], Some(token));
        }
        let responders = lookup.closest_responded(K);
        assert_eq!(responders.len(), 2);
        assert_eq!(responders[0].1, Some(vec![1]));
        assert_eq!(responders[1].1, Some(vec![2]));
    }
}
