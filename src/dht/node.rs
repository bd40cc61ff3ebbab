use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// The Kademlia node identifier, the same 160 bit space as info hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Generates a random node id. Persistent identities derive their id
    /// once at first start and reuse it; this is the first-start path.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The XOR distance to another id, compared as a 160 bit big-endian
    /// integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut bytes = [0u8; 20];
        for (out, (a, b)) in
            bytes.iter_mut().zip(self.0.iter().zip(other.0.iter()))
        {
            *out = a ^ b;
        }
        Distance(bytes)
    }

    /// The number of leading bits shared with another id, which is the
    /// routing table bucket the other id belongs in. `None` for the id
    /// itself (all 160 bits shared).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let index = self.distance(other).leading_zeros();
        if index == 160 {
            None
        } else {
            Some(index)
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// An XOR distance between two ids. Bigger array compares bigger because
/// the byte order is big-endian, so the derived ordering is the numeric
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in self.0.iter() {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }
}

/// A node is removed after this many consecutive unanswered queries.
pub const MAX_FAILURES: u32 = 3;

/// A node that answered within this window is good.
const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Responded recently; first pick for lookups.
    Good,
    /// No recent response but no strikes either.
    Questionable,
    /// Struck out; evict on sight.
    Bad,
}

/// A remote DHT node: identity, endpoints and health.
///
/// A node may be reachable over both address families (BEP 32) and may
/// advertise further endpoints (BEP 45); the primary one is whichever the
/// node was first seen at.
#[derive(Clone, Debug)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr_v4: Option<SocketAddr>,
    pub addr_v6: Option<SocketAddr>,
    /// Extra endpoints advertised by the node itself (BEP 45).
    pub additional_addresses: Vec<SocketAddr>,
    pub last_seen: Instant,
    pub last_responded: Option<Instant>,
    pub failure_count: u32,
}

impl DhtNode {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        let mut node = Self {
            id,
            addr_v4: None,
            addr_v6: None,
            additional_addresses: Vec::new(),
            last_seen: Instant::now(),
            last_responded: None,
            failure_count: 0,
        };
        node.record_addr(addr);
        node
    }

    /// Records an endpoint the node was seen at, keeping one per family.
    pub fn record_addr(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(_) => self.addr_v4 = Some(addr),
            SocketAddr::V6(_) => self.addr_v6 = Some(addr),
        }
    }

    /// The endpoint to contact the node at. Dual-stack nodes are contacted
    /// over IPv6 when the caller prefers it (BEP 45).
    pub fn best_addr(&self, prefer_v6: bool) -> Option<SocketAddr> {
        if prefer_v6 {
            self.addr_v6.or(self.addr_v4)
        } else {
            self.addr_v4.or(self.addr_v6)
        }
    }

    pub fn status(&self) -> NodeStatus {
        if self.failure_count >= MAX_FAILURES {
            return NodeStatus::Bad;
        }
        match self.last_responded {
            Some(at) if at.elapsed() < GOOD_WINDOW => NodeStatus::Good,
            _ => NodeStatus::Questionable,
        }
    }

    pub fn record_response(&mut self) {
        self.failure_count = 0;
        let now = Instant::now();
        self.last_seen = now;
        self.last_responded = Some(now);
    }

    pub fn record_query(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }
}
