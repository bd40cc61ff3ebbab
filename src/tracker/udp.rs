//! The BEP 15 UDP tracker protocol: a two-step connect/announce exchange
//! over a connectionless socket, with transaction ids correlating
//! responses and a 64 bit connection id proving to the tracker that we can
//! receive at our source address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};
use url::Url;

use super::{announce::Announce, announce::Event, response::Response, Result};
use crate::error::tracker::TrackerError;

/// The fixed magic number identifying the connect request.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A connection id may be reused for 2 minutes after it was obtained.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(120);

/// The BEP 15 retransmission schedule is 15 * 2^n seconds for n in 0..=8.
/// We follow the schedule but bound n, as a tracker that hasn't answered
/// in a minute is better retried on the next announce round.
const MAX_RETRANSMISSIONS: u32 = 3;

pub struct UdpTracker {
    url: Url,
    /// The resolved tracker endpoint.
    addr: SocketAddr,
    /// The connection id from the last connect exchange and when it was
    /// obtained.
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub fn new(url: Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::UnsupportedScheme("udp".into()))?;
        let port = url
            .port()
            .ok_or_else(|| TrackerError::UnsupportedScheme("udp".into()))?;
        // resolve synchronously at construction; tracker hostnames are
        // long lived
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host, port))
            .map_err(TrackerError::Io)?
            .next()
            .ok_or_else(|| {
                TrackerError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "tracker host did not resolve",
                ))
            })?;
        Ok(Self {
            url,
            addr,
            connection: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(&mut self, params: &Announce) -> Result<Response> {
        let socket = UdpSocket::bind(match self.addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        })
        .await?;
        socket.connect(self.addr).await?;

        let connection_id = self.connection_id(&socket).await?;

        let (transaction_id, key): (u32, u32) = {
            let mut rng = rand::thread_rng();
            (rng.gen(), rng.gen())
        };

        let mut req = BytesMut::with_capacity(98);
        req.put_u64(connection_id);
        req.put_u32(ACTION_ANNOUNCE);
        req.put_u32(transaction_id);
        req.extend_from_slice(&params.info_hash);
        req.extend_from_slice(&params.peer_id);
        req.put_u64(params.downloaded);
        req.put_u64(params.left);
        req.put_u64(params.uploaded);
        req.put_u32(Event::udp_code(params.event));
        // our IP: 0 tells the tracker to use the packet source
        req.put_u32(match params.ip {
            Some(IpAddr::V4(ip)) => u32::from(ip),
            _ => 0,
        });
        // a random key identifying this client across IP changes
        req.put_u32(key);
        // number of peers wanted; -1 lets the tracker decide
        req.put_i32(params.peer_count.map(|n| n as i32).unwrap_or(-1));
        req.put_u16(params.port);

        let resp = self.exchange(&socket, &req).await?;
        let mut buf = &resp[..];
        if buf.remaining() < 20 {
            return Err(TrackerError::InvalidUdpResponse);
        }
        let action = buf.get_u32();
        let tid = buf.get_u32();
        if tid != transaction_id {
            return Err(TrackerError::InvalidUdpResponse);
        }
        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(buf.chunk()).into_owned(),
            ));
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::InvalidUdpResponse);
        }

        let interval = buf.get_u32();
        let leechers = buf.get_u32();
        let seeders = buf.get_u32();

        // the remainder is compact IPv4 peers
        let mut peers = Vec::with_capacity(buf.remaining() / 6);
        while buf.remaining() >= 6 {
            let ip = Ipv4Addr::from(buf.get_u32());
            let port = buf.get_u16();
            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        Ok(Response {
            interval: Some(Duration::from_secs(interval as u64)),
            seeder_count: Some(seeders as usize),
            leecher_count: Some(leechers as usize),
            peers,
            ..Response::default()
        })
    }

    /// Returns a valid connection id, performing the connect exchange if
    /// the cached one expired.
    async fn connection_id(&mut self, socket: &UdpSocket) -> Result<u64> {
        if let Some((id, obtained_at)) = self.connection {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = BytesMut::with_capacity(16);
        req.put_u64(PROTOCOL_ID);
        req.put_u32(ACTION_CONNECT);
        req.put_u32(transaction_id);

        let resp = self.exchange(socket, &req).await?;
        let mut buf = &resp[..];
        if buf.remaining() < 16 {
            return Err(TrackerError::InvalidUdpResponse);
        }
        if buf.get_u32() != ACTION_CONNECT
            || buf.get_u32() != transaction_id
        {
            return Err(TrackerError::InvalidUdpResponse);
        }
        let id = buf.get_u64();
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Sends a request and waits for the response, retransmitting on the
    /// BEP 15 schedule.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        req: &[u8],
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        for n in 0..=MAX_RETRANSMISSIONS {
            socket.send(req).await?;
            let window = Duration::from_secs(15 * (1 << n));
            match timeout(window, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Err(_) => {
                    log::debug!(
                        "UDP tracker {} timed out (attempt {})",
                        self.url,
                        n
                    );
                }
            }
        }
        Err(TrackerError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs a one-shot fake tracker that answers a connect and then an
    /// announce with two peers.
    async fn fake_tracker(socket: UdpSocket) {
        let mut buf = vec![0u8; 1024];

        // connect
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        let mut req = &buf[..len];
        assert_eq!(req.get_u64(), PROTOCOL_ID);
        assert_eq!(req.get_u32(), ACTION_CONNECT);
        let tid = req.get_u32();
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_CONNECT);
        resp.put_u32(tid);
        resp.put_u64(0xdead_beef);
        socket.send_to(&resp, peer).await.unwrap();

        // announce
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        let mut req = &buf[..len];
        assert_eq!(req.get_u64(), 0xdead_beef);
        assert_eq!(req.get_u32(), ACTION_ANNOUNCE);
        let tid = req.get_u32();
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(tid);
        // interval, leechers, seeders
        resp.put_u32(1800);
        resp.put_u32(3);
        resp.put_u32(2);
        // two compact peers
        resp.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        resp.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        socket.send_to(&resp, peer).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_announce_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_tracker(server));

        let url =
            Url::parse(&format!("udp://{}", server_addr)).unwrap();
        let mut tracker = UdpTracker::new(url).unwrap();

        let params = Announce {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            ip: None,
            downloaded: 0,
            uploaded: 0,
            left: 1000,
            peer_count: Some(50),
            tracker_id: None,
            event: Some(Event::Started),
        };

        let resp = tracker.announce(&params).await.unwrap();
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeder_count, Some(2));
        assert_eq!(resp.leecher_count, Some(3));
        assert_eq!(
            resp.peers,
            vec![
                SocketAddr::from(([10, 0, 0, 1], 6881)),
                SocketAddr::from(([10, 0, 0, 2], 6882)),
            ]
        );
        // the connection id is cached for the next announce
        assert!(tracker.connection.is_some());
    }
}
