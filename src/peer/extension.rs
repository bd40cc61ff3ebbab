//! The BEP 10 extension protocol surface: the extended handshake and the
//! two extensions the engine speaks, ut_metadata (BEP 9) and ut_pex.
//!
//! Extension payloads are built and parsed with the crate's own bencode
//! codec, since their dictionaries carry dynamic keys (the `m` map names
//! each side's chosen local message ids).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::bencode::Value;
use crate::error::peer::PeerError;

/// Extended message id 0 is always the extended handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// The local message ids we assign to the extensions we support and
/// announce in our `m` map.
pub const UT_METADATA_ID: u8 = 1;
pub const UT_PEX_ID: u8 = 2;

pub const UT_METADATA_NAME: &[u8] = b"ut_metadata";
pub const UT_PEX_NAME: &[u8] = b"ut_pex";

/// The metadata is exchanged in slices of 16 KiB, the last of which may be
/// shorter (BEP 9).
pub const METADATA_PIECE_LEN: usize = 0x4000;

/// The decoded form of an extended handshake (extended message id 0).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// Maps extension names to the message ids the *sender* chose for
    /// them. An id of 0 disables the extension.
    pub extensions: BTreeMap<Vec<u8>, u8>,
    /// The size of the metadata (info dictionary) in bytes, when the
    /// sender has it. Required before ut_metadata requests can be issued.
    pub metadata_size: Option<u32>,
    /// The sender's client name and version (`v`).
    pub client: Option<String>,
    /// The number of outstanding requests the sender is willing to queue
    /// (`reqq`).
    pub request_queue_len: Option<u32>,
    /// The sender's listen port (`p`).
    pub port: Option<u16>,
}

impl ExtendedHandshake {
    /// Builds the handshake we send: both supported extensions and, when
    /// we already have the metadata, its size (so magnet-only peers can
    /// fetch it from us).
    pub fn ours(metadata_size: Option<u32>) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_METADATA_NAME.to_vec(), UT_METADATA_ID);
        extensions.insert(UT_PEX_NAME.to_vec(), UT_PEX_ID);
        Self {
            extensions,
            metadata_size,
            client: Some(format!("riptide {}", env!("CARGO_PKG_VERSION"))),
            request_queue_len: Some(250),
            port: None,
        }
    }

    /// The id the peer assigned to its ut_metadata extension, if enabled.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions
            .get(UT_METADATA_NAME)
            .copied()
            .filter(|id| *id != 0)
    }

    /// The id the peer assigned to its ut_pex extension, if enabled.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.extensions
            .get(UT_PEX_NAME)
            .copied()
            .filter(|id| *id != 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let m = Value::Dict(
            self.extensions
                .iter()
                .map(|(name, id)| (name.clone(), Value::Int(*id as i64)))
                .collect(),
        );
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), m);
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Value::bytes(client.as_bytes()));
        }
        if let Some(reqq) = self.request_queue_len {
            dict.insert(b"reqq".to_vec(), Value::Int(reqq as i64));
        }
        if let Some(port) = self.port {
            dict.insert(b"p".to_vec(), Value::Int(port as i64));
        }
        Value::Dict(dict).encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value =
            Value::decode(payload).map_err(|_| PeerError::InvalidMessage)?;
        let dict = value.as_dict().ok_or(PeerError::InvalidMessage)?;

        let mut extensions = BTreeMap::new();
        if let Some(m) = dict.get(&b"m"[..]).and_then(Value::as_dict) {
            for (name, id) in m {
                let id = id.as_int().ok_or(PeerError::InvalidMessage)?;
                let id = u8::try_from(id).map_err(|_| PeerError::InvalidMessage)?;
                extensions.insert(name.clone(), id);
            }
        }

        let int_field = |key: &[u8]| {
            dict.get(key)
                .and_then(Value::as_int)
                .and_then(|i| u32::try_from(i).ok())
        };

        Ok(Self {
            extensions,
            metadata_size: int_field(b"metadata_size"),
            client: dict
                .get(&b"v"[..])
                .and_then(Value::as_str)
                .map(str::to_owned),
            request_queue_len: int_field(b"reqq"),
            port: int_field(b"p").and_then(|p| u16::try_from(p).ok()),
        })
    }
}

/// A ut_metadata message (BEP 9).
#[derive(Debug, PartialEq, Eq)]
pub enum MetadataMessage {
    /// Asks the peer for the metadata slice with the given index.
    Request { piece: u32 },
    /// Carries a metadata slice: the bencoded header followed by the raw
    /// slice bytes.
    Data {
        piece: u32,
        total_size: u32,
        payload: Vec<u8>,
    },
    /// The peer doesn't have (or won't serve) the requested slice.
    Reject { piece: u32 },
}

impl MetadataMessage {
    const MSG_TYPE_REQUEST: i64 = 0;
    const MSG_TYPE_DATA: i64 = 1;
    const MSG_TYPE_REJECT: i64 = 2;

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Request { piece } => Value::dict([
                (b"msg_type".to_vec(), Value::Int(Self::MSG_TYPE_REQUEST)),
                (b"piece".to_vec(), Value::Int(*piece as i64)),
            ])
            .encode(),
            Self::Data {
                piece,
                total_size,
                payload,
            } => {
                let mut buf = Value::dict([
                    (b"msg_type".to_vec(), Value::Int(Self::MSG_TYPE_DATA)),
                    (b"piece".to_vec(), Value::Int(*piece as i64)),
                    (b"total_size".to_vec(), Value::Int(*total_size as i64)),
                ])
                .encode();
                buf.extend_from_slice(payload);
                buf
            }
            Self::Reject { piece } => Value::dict([
                (b"msg_type".to_vec(), Value::Int(Self::MSG_TYPE_REJECT)),
                (b"piece".to_vec(), Value::Int(*piece as i64)),
            ])
            .encode(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, tail) = Value::decode_prefix(payload)
            .map_err(|_| PeerError::InvalidMessage)?;

        let msg_type = header
            .get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or(PeerError::InvalidMessage)?;
        let piece = header
            .get(b"piece")
            .and_then(Value::as_int)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or(PeerError::InvalidMessage)?;

        match msg_type {
            Self::MSG_TYPE_REQUEST => Ok(Self::Request { piece }),
            Self::MSG_TYPE_DATA => {
                let total_size = header
                    .get(b"total_size")
                    .and_then(Value::as_int)
                    .and_then(|s| u32::try_from(s).ok())
                    .ok_or(PeerError::InvalidMessage)?;
                Ok(Self::Data {
                    piece,
                    total_size,
                    payload: tail.to_vec(),
                })
            }
            Self::MSG_TYPE_REJECT => Ok(Self::Reject { piece }),
            _ => Err(PeerError::InvalidMessage),
        }
    }
}

/// A ut_pex message: peers the sender met or lost since its last one.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn encode(&self) -> Vec<u8> {
        let split = |addrs: &[SocketAddr], v6: bool| {
            let mut buf = Vec::new();
            for addr in addrs {
                match (addr.ip(), v6) {
                    (IpAddr::V4(ip), false) => {
                        buf.extend_from_slice(&ip.octets());
                        buf.extend_from_slice(&addr.port().to_be_bytes());
                    }
                    (IpAddr::V6(ip), true) => {
                        buf.extend_from_slice(&ip.octets());
                        buf.extend_from_slice(&addr.port().to_be_bytes());
                    }
                    _ => {}
                }
            }
            buf
        };

        Value::dict([
            (b"added".to_vec(), Value::Bytes(split(&self.added, false))),
            (b"added6".to_vec(), Value::Bytes(split(&self.added, true))),
            (b"dropped".to_vec(), Value::Bytes(split(&self.dropped, false))),
            (
                b"dropped6".to_vec(),
                Value::Bytes(split(&self.dropped, true)),
            ),
        ])
        .encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value =
            Value::decode(payload).map_err(|_| PeerError::InvalidMessage)?;

        let compact4 = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_bytes)
                .map(decode_compact_v4)
                .unwrap_or_default()
        };
        let compact6 = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_bytes)
                .map(decode_compact_v6)
                .unwrap_or_default()
        };

        let mut added = compact4(b"added");
        added.extend(compact6(b"added6"));
        let mut dropped = compact4(b"dropped");
        dropped.extend(compact6(b"dropped6"));

        Ok(Self { added, dropped })
    }
}

/// Decodes 6-byte compact IPv4 peer entries (BEP 23 format).
pub fn decode_compact_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Decodes 18-byte compact IPv6 peer entries.
pub fn decode_compact_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(18)
        .map(|entry| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect()
}
