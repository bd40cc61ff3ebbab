//! The KRPC message layer: bencoded query/response/error frames over UDP
//! (BEP 5), with the extensions the engine speaks woven in: `nodes6` and
//! `want` (BEP 32), the read-only flag (BEP 43), and `get`/`put`
//! (BEP 44).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::bencode::Value;
use crate::dht::node::NodeId;
use crate::dht::storage::StorageItem;
use crate::error::dht::{DhtError, Result};
use crate::InfoHash;

/// A decoded KRPC frame.
#[derive(Debug, PartialEq)]
pub enum KrpcMessage {
    Query {
        transaction_id: Vec<u8>,
        query: QueryKind,
        /// BEP 43: the sender declares itself read-only; don't add it to
        /// the routing table.
        read_only: bool,
    },
    Response {
        transaction_id: Vec<u8>,
        body: ResponseBody,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

/// The queries the engine sends and answers.
#[derive(Debug, PartialEq)]
pub enum QueryKind {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Vec<u8>,
    },
    /// BEP 44 retrieval.
    Get {
        id: NodeId,
        target: [u8; 20],
    },
    /// BEP 44 storage.
    Put {
        id: NodeId,
        token: Vec<u8>,
        item: StorageItem,
    },
}

impl QueryKind {
    fn method(&self) -> &'static [u8] {
        match self {
            Self::Ping { .. } => b"ping",
            Self::FindNode { .. } => b"find_node",
            Self::GetPeers { .. } => b"get_peers",
            Self::AnnouncePeer { .. } => b"announce_peer",
            Self::Get { .. } => b"get",
            Self::Put { .. } => b"put",
        }
    }
}

/// A response's fields; which ones are set depends on the query answered.
#[derive(Debug, Default, PartialEq)]
pub struct ResponseBody {
    pub id: Option<NodeId>,
    /// Compact IPv4 nodes from find_node/get_peers/get.
    pub nodes: Vec<(NodeId, SocketAddr)>,
    /// Compact IPv6 nodes (BEP 32).
    pub nodes6: Vec<(NodeId, SocketAddr)>,
    /// Peer endpoints from get_peers.
    pub values: Vec<SocketAddr>,
    /// The write token required for announce_peer/put against the sender.
    pub token: Option<Vec<u8>>,
    /// BEP 44: the stored item, when a get hit.
    pub item: Option<StorageItem>,
    /// Extra endpoints of the responding node itself (BEP 45).
    pub additional_addresses: Vec<SocketAddr>,
}

impl KrpcMessage {
    pub fn query(
        transaction_id: Vec<u8>,
        query: QueryKind,
        read_only: bool,
    ) -> Self {
        Self::Query {
            transaction_id,
            query,
            read_only,
        }
    }

    pub fn response(transaction_id: Vec<u8>, body: ResponseBody) -> Self {
        Self::Response {
            transaction_id,
            body,
        }
    }

    pub fn error(
        transaction_id: Vec<u8>,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            transaction_id,
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            Self::Query {
                transaction_id,
                query,
                read_only,
            } => {
                dict.insert(b"t".to_vec(), Value::bytes(transaction_id.clone()));
                dict.insert(b"y".to_vec(), Value::bytes(&b"q"[..]));
                dict.insert(b"q".to_vec(), Value::bytes(query.method()));
                dict.insert(b"a".to_vec(), encode_args(query));
                if *read_only {
                    dict.insert(b"ro".to_vec(), Value::Int(1));
                }
            }
            Self::Response {
                transaction_id,
                body,
            } => {
                dict.insert(b"t".to_vec(), Value::bytes(transaction_id.clone()));
                dict.insert(b"y".to_vec(), Value::bytes(&b"r"[..]));
                dict.insert(b"r".to_vec(), encode_response(body));
            }
            Self::Error {
                transaction_id,
                code,
                message,
            } => {
                dict.insert(b"t".to_vec(), Value::bytes(transaction_id.clone()));
                dict.insert(b"y".to_vec(), Value::bytes(&b"e"[..]));
                dict.insert(
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Int(*code),
                        Value::bytes(message.as_bytes()),
                    ]),
                );
            }
        }
        Value::Dict(dict).encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let value = Value::decode(buf)?;
        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .ok_or(DhtError::InvalidMessage)?
            .to_vec();

        match value.get(b"y").and_then(Value::as_bytes) {
            Some(b"q") => {
                let query = decode_query(&value)?;
                let read_only = value
                    .get(b"ro")
                    .and_then(Value::as_int)
                    .map(|ro| ro == 1)
                    .unwrap_or(false);
                Ok(Self::Query {
                    transaction_id,
                    query,
                    read_only,
                })
            }
            Some(b"r") => {
                let r = value.get(b"r").ok_or(DhtError::InvalidMessage)?;
                Ok(Self::Response {
                    transaction_id,
                    body: decode_response(r)?,
                })
            }
            Some(b"e") => {
                let list = value
                    .get(b"e")
                    .and_then(Value::as_list)
                    .ok_or(DhtError::InvalidMessage)?;
                let code = list
                    .first()
                    .and_then(Value::as_int)
                    .ok_or(DhtError::InvalidMessage)?;
                let message = list
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Self::Error {
                    transaction_id,
                    code,
                    message,
                })
            }
            _ => Err(DhtError::InvalidMessage),
        }
    }
}

fn encode_args(query: &QueryKind) -> Value {
    let mut args = BTreeMap::new();
    match query {
        QueryKind::Ping { id } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
        }
        QueryKind::FindNode { id, target } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(
                b"target".to_vec(),
                Value::bytes(target.as_bytes().to_vec()),
            );
            args.insert(b"want".to_vec(), want_list());
        }
        QueryKind::GetPeers { id, info_hash } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(
                b"info_hash".to_vec(),
                Value::bytes(info_hash.to_vec()),
            );
            args.insert(b"want".to_vec(), want_list());
        }
        QueryKind::AnnouncePeer {
            id,
            info_hash,
            port,
            implied_port,
            token,
        } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(
                b"info_hash".to_vec(),
                Value::bytes(info_hash.to_vec()),
            );
            args.insert(b"port".to_vec(), Value::Int(*port as i64));
            args.insert(
                b"implied_port".to_vec(),
                Value::Int(*implied_port as i64),
            );
            args.insert(b"token".to_vec(), Value::bytes(token.clone()));
        }
        QueryKind::Get { id, target } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(b"target".to_vec(), Value::bytes(target.to_vec()));
        }
        QueryKind::Put { id, token, item } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(b"token".to_vec(), Value::bytes(token.clone()));
            item.encode_into(&mut args);
        }
    }
    Value::Dict(args)
}

fn want_list() -> Value {
    Value::List(vec![Value::bytes(&b"n4"[..]), Value::bytes(&b"n6"[..])])
}

fn decode_query(value: &Value) -> Result<QueryKind> {
    let args = value.get(b"a").ok_or(DhtError::InvalidMessage)?;
    let id = args
        .get(b"id")
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice)
        .ok_or(DhtError::InvalidMessage)?;
    let hash20 = |key: &[u8]| -> Result<[u8; 20]> {
        args.get(key)
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 20]>::try_from(b).ok())
            .ok_or(DhtError::InvalidMessage)
    };

    match value.get(b"q").and_then(Value::as_bytes) {
        Some(b"ping") => Ok(QueryKind::Ping { id }),
        Some(b"find_node") => Ok(QueryKind::FindNode {
            id,
            target: NodeId::new(hash20(b"target")?),
        }),
        Some(b"get_peers") => Ok(QueryKind::GetPeers {
            id,
            info_hash: hash20(b"info_hash")?,
        }),
        Some(b"announce_peer") => Ok(QueryKind::AnnouncePeer {
            id,
            info_hash: hash20(b"info_hash")?,
            port: args
                .get(b"port")
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or(DhtError::InvalidMessage)?,
            implied_port: args
                .get(b"implied_port")
                .and_then(Value::as_int)
                .map(|i| i == 1)
                .unwrap_or(false),
            token: args
                .get(b"token")
                .and_then(Value::as_bytes)
                .ok_or(DhtError::InvalidMessage)?
                .to_vec(),
        }),
        Some(b"get") => Ok(QueryKind::Get {
            id,
            target: hash20(b"target")?,
        }),
        Some(b"put") => Ok(QueryKind::Put {
            id,
            token: args
                .get(b"token")
                .and_then(Value::as_bytes)
                .ok_or(DhtError::InvalidMessage)?
                .to_vec(),
            item: StorageItem::decode_from(args)?,
        }),
        _ => Err(DhtError::InvalidMessage),
    }
}

fn encode_response(body: &ResponseBody) -> Value {
    let mut r = BTreeMap::new();
    if let Some(id) = body.id {
        r.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
    }
    if !body.nodes.is_empty() {
        r.insert(b"nodes".to_vec(), Value::Bytes(encode_nodes(&body.nodes)));
    }
    if !body.nodes6.is_empty() {
        r.insert(
            b"nodes6".to_vec(),
            Value::Bytes(encode_nodes6(&body.nodes6)),
        );
    }
    if !body.values.is_empty() {
        r.insert(
            b"values".to_vec(),
            Value::List(
                body.values
                    .iter()
                    .map(|addr| Value::Bytes(encode_compact_addr(addr)))
                    .collect(),
            ),
        );
    }
    if let Some(token) = &body.token {
        r.insert(b"token".to_vec(), Value::bytes(token.clone()));
    }
    if let Some(item) = &body.item {
        item.encode_into(&mut r);
    }
    if !body.additional_addresses.is_empty() {
        r.insert(
            b"addrs".to_vec(),
            Value::List(
                body.additional_addresses
                    .iter()
                    .map(|addr| Value::Bytes(encode_compact_addr(addr)))
                    .collect(),
            ),
        );
    }
    Value::Dict(r)
}

fn decode_response(r: &Value) -> Result<ResponseBody> {
    Ok(ResponseBody {
        id: r
            .get(b"id")
            .and_then(Value::as_bytes)
            .and_then(NodeId::from_slice),
        nodes: r
            .get(b"nodes")
            .and_then(Value::as_bytes)
            .map(decode_nodes)
            .unwrap_or_default(),
        nodes6: r
            .get(b"nodes6")
            .and_then(Value::as_bytes)
            .map(decode_nodes6)
            .unwrap_or_default(),
        values: r
            .get(b"values")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes().and_then(decode_compact_addr))
                    .collect()
            })
            .unwrap_or_default(),
        token: r
            .get(b"token")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec),
        item: StorageItem::maybe_decode_from(r)?,
        additional_addresses: r
            .get(b"addrs")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes().and_then(decode_compact_addr))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// 26 bytes per node: 20 of id, 4 of IPv4, 2 of port.
fn encode_nodes(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        if let SocketAddr::V4(v4) = addr {
            buf.extend_from_slice(id.as_bytes());
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buf
}

fn decode_nodes(buf: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    buf.chunks_exact(26)
        .filter_map(|entry| {
            let id = NodeId::from_slice(&entry[..20])?;
            let ip = Ipv4Addr::new(entry[20], entry[21], entry[22], entry[23]);
            let port = u16::from_be_bytes([entry[24], entry[25]]);
            Some((id, SocketAddr::new(IpAddr::V4(ip), port)))
        })
        .collect()
}

/// 38 bytes per node: 20 of id, 16 of IPv6, 2 of port (BEP 32).
fn encode_nodes6(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 38);
    for (id, addr) in nodes {
        if let SocketAddr::V6(v6) = addr {
            buf.extend_from_slice(id.as_bytes());
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    buf
}

fn decode_nodes6(buf: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    buf.chunks_exact(38)
        .filter_map(|entry| {
            let id = NodeId::from_slice(&entry[..20])?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry[20..36]);
            let port = u16::from_be_bytes([entry[36], entry[37]]);
            Some((
                id,
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
            ))
        })
        .collect()
}

fn encode_compact_addr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = Vec::with_capacity(6);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = Vec::with_capacity(18);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
            buf
        }
    }
}

fn decode_compact_addr(buf: &[u8]) -> Option<SocketAddr> {
    match buf.len() {
        6 => {
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            ))
        }
        _ => None,
    }
}
