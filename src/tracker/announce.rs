use std::net::IpAddr;

use crate::{InfoHash, PeerId};

/// Parameters for announcing to a tracker.
///
/// Field meanings per BEP 3 (HTTP) and BEP 15 (UDP).
#[derive(Clone, Debug)]
pub struct Announce {
    /// The torrent being announced.
    pub info_hash: InfoHash,
    /// Our own identifier.
    pub peer_id: PeerId,

    /// The port we accept peer connections on.
    pub port: u16,
    /// The true IP address, in dotted quad format. Only necessary when the
    /// request doesn't originate from the client's own address (a proxy,
    /// or a tracker on the same NAT'd subnet as the peer).
    pub ip: Option<IpAddr>,

    /// Number of payload bytes downloaded so far.
    pub downloaded: u64,
    /// Number of payload bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,

    /// The number of peers the client wishes to receive from the tracker.
    /// If omitted, UDP trackers are sent -1 (tracker decides) and HTTP
    /// trackers get their default.
    pub peer_count: Option<usize>,

    /// If previously received from the tracker, we must send it with each
    /// announce.
    pub tracker_id: Option<String>,

    /// Set only for the lifecycle events; a plain periodic announce
    /// carries none.
    pub event: Option<Event>,
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first request to a tracker must include this value.
    Started,
    /// Sent when the client becomes a seeder. Must not be sent if the
    /// client started as a seeder.
    Completed,
    /// Sent when the client shuts down gracefully.
    Stopped,
}

impl Event {
    /// The value of the HTTP `event` query parameter.
    pub fn query_str(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    /// The BEP 15 wire encoding. 0 is "none".
    pub fn udp_code(event: Option<Event>) -> u32 {
        match event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        }
    }
}
