use std::{net::SocketAddr, time::Duration};

use serde_derive::Deserialize;

use super::{deserialize_peers, deserialize_peers6, deserialize_seconds};

/// A tracker's answer to an announce, independent of transport.
///
/// HTTP trackers produce this via bencode deserialization; the UDP client
/// fills it in from the fixed-layout packet.
#[derive(Debug, Default, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Response {
    /// The tracker id. If set, we must send it with each subsequent
    /// announce.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    /// If this is not empty, no other field in the response is valid. It
    /// contains a human-readable error message telling why the request was
    /// rejected.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Similar to `failure_reason`, but the response is still processed.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    /// The number of seconds the client should wait before recontacting
    /// the tracker.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    /// If present, the client must not reannounce itself before the end
    /// of this interval.
    #[serde(default)]
    #[serde(rename = "min interval")]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub min_interval: Option<Duration>,

    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    /// IPv4 peers, in compact (6 bytes each) or list form.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,

    /// IPv6 peers in compact form, 18 bytes each.
    #[serde(default)]
    #[serde(rename = "peers6")]
    #[serde(deserialize_with = "deserialize_peers6")]
    pub peers6: Vec<SocketAddr>,
}

impl Response {
    /// All peers of the response, both address families.
    pub fn all_peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.peers.iter().chain(self.peers6.iter()).copied()
    }
}
