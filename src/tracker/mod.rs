use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use serde::de;
use serde_derive::Deserialize;
use url::Url;

use crate::error::tracker::{Result, TrackerError};

pub mod announce;
pub mod http;
pub mod response;
mod test;
pub mod tier;
pub mod udp;

pub use announce::{Announce, Event};
pub use response::Response;
pub use tier::TrackerTiers;

/// A tracker endpoint of either transport, dispatched by URL scheme.
pub enum Tracker {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Tracker {
    pub fn new(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(http::HttpTracker::new(url))),
            "udp" => Ok(Self::Udp(udp::UdpTracker::new(url)?)),
            scheme => {
                Err(TrackerError::UnsupportedScheme(scheme.to_string()))
            }
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }

    /// Sends an announce request to the tracker with the given parameters.
    ///
    /// This may be used by a torrent to request peers to download from and
    /// to report the current transfer status to the tracker.
    pub async fn announce(&mut self, params: &Announce) -> Result<Response> {
        match self {
            Self::Http(t) => t.announce(params).await,
            Self::Udp(t) => t.announce(params).await,
        }
    }
}

/// Deserialize an integer representing seconds into `Duration`.
pub(crate) fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Peers can be sent in two ways: as a bencoded list of dicts including
/// full peer metadata, or as a single bencoded string containing only the
/// peer IP and port in compact representation.
///
/// This helper deserializes both into the same type, discarding the peer
/// id present in the full representation: most trackers send the compact
/// form by default, and the peer id isn't needed at this stage anyway.
pub(crate) fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(
            &self,
            formatter: &mut std::fmt::Formatter,
        ) -> std::fmt::Result {
            formatter.write_str("a string or a list of dicts representing peers")
        }

        /// Deserializes a compact string of peers.
        ///
        /// Each entry is 6 bytes long: 4 bytes of IPv4 address followed by
        /// 2 bytes of port, both in network byte order.
        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            let buf_len = b.len();

            if buf_len % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }

            let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);
            for _ in (0..buf_len).step_by(ENTRY_LEN) {
                let addr = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(addr), port));
            }
            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }
            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                let ip = if let Ok(ip) = ip.parse() {
                    ip
                } else {
                    continue;
                };
                peers.push(SocketAddr::new(ip, port));
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Deserializes the compact `peers6` string: 18 bytes per peer, 16 bytes
/// of IPv6 address followed by 2 bytes of port, network byte order.
pub(crate) fn deserialize_peers6<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(
            &self,
            formatter: &mut std::fmt::Formatter,
        ) -> std::fmt::Result {
            formatter.write_str("a compact string of IPv6 peers")
        }

        fn visit_bytes<E>(self, b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 18;
            if b.len() % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers6 compact string must be a multiple of 18",
                ));
            }

            Ok(b.chunks_exact(ENTRY_LEN)
                .map(|entry| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&entry[..16]);
                    let port = u16::from_be_bytes([entry[16], entry[17]]);
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
                })
                .collect())
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
pub(crate) const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');
