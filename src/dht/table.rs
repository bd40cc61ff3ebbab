use std::time::{Duration, Instant};

use super::node::{DhtNode, NodeId, NodeStatus};

/// The maximum number of nodes per bucket.
pub const K: usize = 8;

/// One bucket per shared-prefix length.
pub const BUCKET_COUNT: usize = 160;

/// Buckets untouched for this long are refreshed with a lookup of
/// a random id in their range.
const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// The outcome of trying to insert a node.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertResult {
    /// The node went into its bucket.
    Added,
    /// The node was already present; its liveness data was updated.
    Updated,
    /// The bucket is full of non-bad nodes. The caller should ping the
    /// returned oldest node and, if it doesn't answer, evict it and
    /// insert again.
    Full { oldest: NodeId },
    /// Our own id, or a node already known to be bad.
    Rejected,
}

struct Bucket {
    nodes: Vec<DhtNode>,
    last_changed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(K),
            last_changed: Instant::now(),
        }
    }
}

/// The Kademlia routing table: 160 buckets of up to K nodes, bucket `i`
/// holding nodes that share exactly `i` leading bits with our id.
///
/// Bucket membership is disjoint by construction: a node's bucket index
/// is a function of its id.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// Tries to add the node to the routing table.
    pub fn insert(&mut self, node: DhtNode) -> InsertResult {
        if node.status() == NodeStatus::Bad {
            return InsertResult::Rejected;
        }
        let Some(index) = self.local_id.bucket_index(&node.id) else {
            // our own id
            return InsertResult::Rejected;
        };
        let bucket = &mut self.buckets[index];

        if let Some(existing) =
            bucket.nodes.iter_mut().find(|n| n.id == node.id)
        {
            if let Some(addr) = node.addr_v4 {
                existing.record_addr(addr);
            }
            if let Some(addr) = node.addr_v6 {
                existing.record_addr(addr);
            }
            existing.last_seen = Instant::now();
            bucket.last_changed = Instant::now();
            return InsertResult::Updated;
        }

        if bucket.nodes.len() < K {
            bucket.nodes.push(node);
            bucket.last_changed = Instant::now();
            return InsertResult::Added;
        }

        // a full bucket first drops any node that has struck out
        if let Some(bad_pos) = bucket
            .nodes
            .iter()
            .position(|n| n.status() == NodeStatus::Bad)
        {
            bucket.nodes.remove(bad_pos);
            bucket.nodes.push(node);
            bucket.last_changed = Instant::now();
            return InsertResult::Added;
        }

        // otherwise the oldest (least recently responded) node gets
        // a liveness check before anyone is displaced
        let oldest = bucket
            .nodes
            .iter()
            .min_by_key(|n| n.last_responded)
            .expect("full bucket has nodes")
            .id;
        InsertResult::Full { oldest }
    }

    /// Removes a node, e.g. after it failed its liveness check.
    pub fn evict(&mut self, id: &NodeId) {
        if let Some(index) = self.local_id.bucket_index(id) {
            self.buckets[index].nodes.retain(|n| n.id != *id);
        }
    }

    /// Records a response from the node, resetting its strikes.
    pub fn record_response(&mut self, id: &NodeId) {
        if let Some(node) = self.find_mut(id) {
            node.record_response();
        }
    }

    /// Records an unanswered query; the node is removed at three strikes.
    pub fn record_failure(&mut self, id: &NodeId) {
        let mut evict = false;
        if let Some(node) = self.find_mut(id) {
            node.record_failure();
            evict = node.status() == NodeStatus::Bad;
        }
        if evict {
            self.evict(id);
        }
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut DhtNode> {
        let index = self.local_id.bucket_index(id)?;
        self.buckets[index].nodes.iter_mut().find(|n| n.id == *id)
    }

    /// The `count` nodes closest to the target by XOR distance, good and
    /// questionable ones only, closest first.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtNode> {
        let mut nodes: Vec<DhtNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.status() != NodeStatus::Bad)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    /// Random targets inside every bucket that hasn't changed in a while;
    /// looking them up keeps the table fresh.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                !bucket.nodes.is_empty()
                    && bucket.last_changed.elapsed() > REFRESH_INTERVAL
            })
            .map(|(index, _)| self.random_id_in_bucket(index))
            .collect()
    }

    /// A random id sharing exactly `index` leading bits with ours.
    fn random_id_in_bucket(&self, index: usize) -> NodeId {
        use rand::Rng;
        let mut bytes = *self.local_id.as_bytes();
        let mut rng = rand::thread_rng();
        // flip the bit at `index`, randomize everything after it
        let byte = index / 8;
        let bit = 7 - (index % 8);
        bytes[byte] ^= 1 << bit;
        for b in bytes.iter_mut().skip(byte + 1) {
            *b = rng.gen();
        }
        let mask = (1u16 << bit) - 1;
        bytes[byte] =
            (bytes[byte] & !(mask as u8)) | (rng.gen::<u8>() & mask as u8);
        NodeId::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(bytes: [u8; 20], port: u16) -> DhtNode {
        DhtNode::new(NodeId::new(bytes), ([10, 0, 0, 1], port).into())
    }

    fn id_with_prefix_byte(first: u8, rest: u8) -> [u8; 20] {
        let mut bytes = [rest; 20];
        bytes[0] = first;
        bytes
    }

    #[test]
    fn test_insert_and_update() {
        let mut table = RoutingTable::new(NodeId::new([0; 20]));
        let n = node(id_with_prefix_byte(0x80, 1), 1);

        assert_eq!(table.insert(n.clone()), InsertResult::Added);
        assert_eq!(table.insert(n), InsertResult::Updated);
        assert_eq!(table.node_count(), 1);

        // our own id is never inserted
        let own = DhtNode::new(
            NodeId::new([0; 20]),
            ([10, 0, 0, 1], 9).into(),
        );
        assert_eq!(table.insert(own), InsertResult::Rejected);
    }

    #[test]
    fn test_bucket_never_exceeds_k() {
        let local = NodeId::new([0; 20]);
        let mut table = RoutingTable::new(local);

        // an adversarial stream of ids all landing in bucket 0 (first
        // bit set)
        let mut full_results = 0;
        for i in 0..64u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = i;
            match table.insert(node(bytes, 6881)) {
                InsertResult::Added => {}
                InsertResult::Full { .. } => full_results += 1,
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert_eq!(table.node_count(), K);
        assert_eq!(full_results, 64 - K);
    }

    #[test]
    fn test_full_bucket_replaces_bad_node() {
        let local = NodeId::new([0; 20]);
        let mut table = RoutingTable::new(local);

        let mut first = [0u8; 20];
        first[0] = 0x80;
        for i in 0..K as u8 {
            let mut bytes = first;
            bytes[19] = i;
            table.insert(node(bytes, 6881));
        }

        // strike out the first node
        let victim = NodeId::new({
            let mut bytes = first;
            bytes[19] = 0;
            bytes
        });
        for _ in 0..3 {
            table.record_failure(&victim);
        }
        // three strikes removed it already
        assert_eq!(table.node_count(), K - 1);

        let mut fresh = first;
        fresh[19] = 0xff;
        assert_eq!(table.insert(node(fresh, 6881)), InsertResult::Added);
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_full_bucket_reports_oldest_for_ping() {
        let local = NodeId::new([0; 20]);
        let mut table = RoutingTable::new(local);

        let mut first = [0u8; 20];
        first[0] = 0x80;
        for i in 0..K as u8 {
            let mut bytes = first;
            bytes[19] = i;
            table.insert(node(bytes, 6881));
        }
        // everyone responded except node 3
        for i in 0..K as u8 {
            if i != 3 {
                let mut bytes = first;
                bytes[19] = i;
                table.record_response(&NodeId::new(bytes));
            }
        }

        let mut fresh = first;
        fresh[19] = 0xff;
        let expected_oldest = NodeId::new({
            let mut bytes = first;
            bytes[19] = 3;
            bytes
        });
        assert_eq!(
            table.insert(node(fresh, 6881)),
            InsertResult::Full {
                oldest: expected_oldest
            }
        );

        // the caller pinged it without luck: evict and retry
        table.evict(&expected_oldest);
        assert_eq!(table.insert(node(fresh, 6881)), InsertResult::Added);
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let local = NodeId::new([0; 20]);
        let mut table = RoutingTable::new(local);
        // ids with increasing distance from the all-zero target
        for i in 1..=16u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = i;
            table.insert(node(bytes, 6881));
        }

        let closest = table.closest(&local, 4);
        assert_eq!(closest.len(), 4);
        let closest_bytes: Vec<u8> =
            closest.iter().map(|n| n.id.as_bytes()[19]).collect();
        assert_eq!(closest_bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_random_id_in_bucket_lands_in_bucket() {
        let local = NodeId::new([0x55; 20]);
        let table = RoutingTable::new(local);
        for index in [0usize, 7, 63, 159] {
            let random = table.random_id_in_bucket(index);
            assert_eq!(local.bucket_index(&random), Some(index));
        }
    }
}
