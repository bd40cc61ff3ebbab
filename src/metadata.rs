//! Metadata download for magnet links (BEP 9 over BEP 10).
//!
//! Knowing only an info hash and some candidate peers, the fetcher opens
//! plaintext peer connections with the extension bit set, asks each peer
//! for the metadata in 16 KiB slices, reassembles them (out of order
//! arrivals included) and accepts the result only if its SHA-1 equals the
//! info hash. Several peers race; the first valid metadata wins and the
//! other attempts are canceled. Peer reliability (success ratio and
//! response time) orders retries, so flaky peers go to the back of the
//! line.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::peer::PeerError,
    peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    peer::extension::{
        ExtendedHandshake, MetadataMessage, EXT_HANDSHAKE_ID,
        METADATA_PIECE_LEN, UT_METADATA_ID,
    },
    InfoHash, PeerId,
};

/// The whole exchange must finish within this window.
const OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Per peer: connect, handshakes and each wait for a data message.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How many peers are tried concurrently.
const CONCURRENT_ATTEMPTS: usize = 3;

/// Metadata larger than this is refused outright; real info dictionaries
/// are a few hundred KiB at most.
const MAX_METADATA_SIZE: u32 = 8 * 1024 * 1024;

/// Per-peer bookkeeping used to order retries across fetch rounds.
#[derive(Debug, Default, Clone)]
pub struct PeerReliability {
    pub successes: u32,
    pub failures: u32,
    /// Mean response time of successful exchanges, milliseconds.
    pub avg_response_ms: u64,
}

impl PeerReliability {
    /// Lower scores order earlier. Untried peers rank between proven and
    /// failed ones.
    fn score(&self) -> i64 {
        let ratio = self.failures as i64 - self.successes as i64;
        ratio * 10_000 + self.avg_response_ms as i64
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.successes += 1;
        let ms = elapsed.as_millis() as u64;
        self.avg_response_ms = if self.avg_response_ms == 0 {
            ms
        } else {
            (self.avg_response_ms + ms) / 2
        };
    }

    fn record_failure(&mut self) {
        self.failures += 1;
    }
}

/// Downloads the metadata for `info_hash` from the candidate peers.
///
/// Returns the raw bencoded info dictionary, verified against the info
/// hash. The caller parses it into a [`crate::metainfo::Metainfo`] and
/// wires up storage and the piece picker before any payload exchange
/// begins.
pub async fn fetch(
    info_hash: InfoHash,
    client_id: PeerId,
    candidates: Vec<SocketAddr>,
    reliability: &mut HashMap<SocketAddr, PeerReliability>,
) -> Option<Vec<u8>> {
    if candidates.is_empty() {
        return None;
    }

    // proven peers first
    let mut queue = candidates;
    queue.sort_by_key(|addr| {
        reliability.get(addr).cloned().unwrap_or_default().score()
    });
    queue.reverse(); // pop from the back

    let deadline = Instant::now() + OVERALL_TIMEOUT;
    let mut attempts = FuturesUnordered::new();

    loop {
        // keep the attempt pool full
        while attempts.len() < CONCURRENT_ATTEMPTS {
            let Some(addr) = queue.pop() else { break };
            attempts.push(async move {
                let started = Instant::now();
                let result =
                    fetch_from_peer(addr, info_hash, client_id).await;
                (addr, started.elapsed(), result)
            });
        }
        if attempts.is_empty() {
            log::info!("Metadata fetch ran out of candidate peers");
            return None;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::info!("Metadata fetch timed out");
            return None;
        }

        match timeout(remaining, attempts.next()).await {
            Ok(Some((addr, elapsed, Ok(metadata)))) => {
                reliability
                    .entry(addr)
                    .or_default()
                    .record_success(elapsed);
                log::info!(
                    "Metadata ({} bytes) obtained from {} in {:?}",
                    metadata.len(),
                    addr,
                    elapsed
                );
                // dropping the set cancels the remaining attempts
                return Some(metadata);
            }
            Ok(Some((addr, _, Err(e)))) => {
                log::debug!("Metadata fetch from {} failed: {}", addr, e);
                reliability.entry(addr).or_default().record_failure();
            }
            Ok(None) => return None,
            Err(_) => {
                log::info!("Metadata fetch timed out");
                return None;
            }
        }
    }
}

/// One peer's complete ut_metadata exchange.
async fn fetch_from_peer(
    addr: SocketAddr,
    info_hash: InfoHash,
    client_id: PeerId,
) -> Result<Vec<u8>, PeerError> {
    let socket = timeout(REQUEST_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;

    // plaintext handshake with the extension bit set
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(Handshake::new(info_hash, client_id)).await?;
    let theirs = timeout(REQUEST_TIMEOUT, socket.next())
        .await
        .map_err(|_| PeerError::ConnectTimeout)?
        .ok_or(PeerError::ConnectTimeout)??;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    if !theirs.supports_extension_protocol() {
        return Err(PeerError::NoExtensionSupport);
    }

    let old_parts = socket.into_parts();
    let mut parts = FramedParts::new(old_parts.io, PeerCodec);
    parts.read_buf = old_parts.read_buf;
    parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(parts);

    // announce our side: `{m: {ut_metadata: ...}}`
    socket
        .send(Message::Extended {
            id: EXT_HANDSHAKE_ID,
            payload: ExtendedHandshake::ours(None).encode(),
        })
        .await?;

    // wait for the peer's extended handshake; it must enable ut_metadata
    // and state the metadata size
    let (peer_metadata_id, metadata_size) = loop {
        let msg = timeout(REQUEST_TIMEOUT, socket.next())
            .await
            .map_err(|_| PeerError::ConnectTimeout)?
            .ok_or(PeerError::ConnectTimeout)??;
        match msg {
            Message::Extended {
                id: EXT_HANDSHAKE_ID,
                payload,
            } => {
                let theirs = ExtendedHandshake::decode(&payload)?;
                let id = theirs
                    .ut_metadata_id()
                    .ok_or(PeerError::NoExtensionSupport)?;
                let size = theirs
                    .metadata_size
                    .filter(|s| *s > 0 && *s <= MAX_METADATA_SIZE)
                    .ok_or(PeerError::InvalidMessage)?;
                break (id, size);
            }
            // bitfields and haves may arrive first; everything else is
            // noise at this stage
            _ => continue,
        }
    };

    // pipeline a request for every slice
    let piece_count =
        (metadata_size as usize + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
    for piece in 0..piece_count as u32 {
        socket
            .send(Message::Extended {
                id: peer_metadata_id,
                payload: MetadataMessage::Request { piece }.encode(),
            })
            .await?;
    }

    // collect the slices; out of order arrival is fine
    let mut slices: Vec<Option<Vec<u8>>> = vec![None; piece_count];
    let mut received = 0;
    while received < piece_count {
        let msg = timeout(REQUEST_TIMEOUT, socket.next())
            .await
            .map_err(|_| PeerError::ConnectTimeout)?
            .ok_or(PeerError::ConnectTimeout)??;
        let Message::Extended { id, payload } = msg else {
            continue;
        };
        if id != UT_METADATA_ID {
            continue;
        }
        match MetadataMessage::decode(&payload)? {
            MetadataMessage::Data {
                piece,
                total_size,
                payload,
            } => {
                let piece = piece as usize;
                if piece >= piece_count
                    || total_size != metadata_size
                    || payload.len() != slice_len(metadata_size, piece)
                {
                    return Err(PeerError::InvalidMessage);
                }
                let slot = &mut slices[piece];
                if slot.is_none() {
                    *slot = Some(payload);
                    received += 1;
                }
            }
            MetadataMessage::Reject { piece } => {
                log::debug!("Peer {} rejected metadata piece {}", addr, piece);
                return Err(PeerError::InvalidMessage);
            }
            MetadataMessage::Request { .. } => {
                // we have nothing to serve on this connection
            }
        }
    }

    // assemble and verify: the metadata must hash to the info hash
    let mut metadata = Vec::with_capacity(metadata_size as usize);
    for slice in slices {
        metadata.extend_from_slice(&slice.expect("all slices received"));
    }
    let digest = Sha1::digest(&metadata);
    if digest.as_slice() != info_hash {
        log::warn!("Metadata from {} failed its hash check", addr);
        return Err(PeerError::InvalidMessage);
    }

    Ok(metadata)
}

/// The length of a metadata slice: 16 KiB, except the final remainder.
fn slice_len(metadata_size: u32, piece: usize) -> usize {
    let start = piece * METADATA_PIECE_LEN;
    (metadata_size as usize - start).min(METADATA_PIECE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A minimal in-process peer that serves a metadata blob over
    /// ut_metadata, exercising the whole exchange against real sockets.
    async fn serve_metadata(
        listener: TcpListener,
        info_hash: InfoHash,
        metadata: Vec<u8>,
    ) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(socket, HandshakeCodec);

        // inbound side: read the handshake, answer it
        let theirs = socket.next().await.unwrap().unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        socket.send(Handshake::new(info_hash, [9; 20])).await.unwrap();

        let old_parts = socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, PeerCodec);
        parts.read_buf = old_parts.read_buf;
        parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(parts);

        // advertise ut_metadata under local id 3 with the size
        let mut handshake = ExtendedHandshake::ours(Some(metadata.len() as u32));
        handshake
            .extensions
            .insert(b"ut_metadata".to_vec(), 3);
        socket
            .send(Message::Extended {
                id: EXT_HANDSHAKE_ID,
                payload: handshake.encode(),
            })
            .await
            .unwrap();

        // serve requests (addressed to our chosen id) until the fetcher
        // hangs up
        while let Some(Ok(msg)) = socket.next().await {
            let Message::Extended { id, payload } = msg else {
                continue;
            };
            if id == EXT_HANDSHAKE_ID {
                continue;
            }
            assert_eq!(id, 3);
            if let MetadataMessage::Request { piece } =
                MetadataMessage::decode(&payload).unwrap()
            {
                let start = piece as usize * METADATA_PIECE_LEN;
                let end =
                    (start + METADATA_PIECE_LEN).min(metadata.len());
                let reply = MetadataMessage::Data {
                    piece,
                    total_size: metadata.len() as u32,
                    payload: metadata[start..end].to_vec(),
                };
                socket
                    .send(Message::Extended {
                        id: UT_METADATA_ID,
                        payload: reply.encode(),
                    })
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_reassembles_and_verifies() {
        // 30000 bytes: two slices, the second short
        let metadata: Vec<u8> =
            (0..30000u32).map(|i| (i % 256) as u8).collect();
        let info_hash: InfoHash = {
            let digest = Sha1::digest(&metadata);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_metadata(listener, info_hash, metadata.clone()));

        let mut reliability = HashMap::new();
        let fetched = fetch(
            info_hash,
            [1; 20],
            vec![addr],
            &mut reliability,
        )
        .await
        .expect("metadata fetch failed");

        assert_eq!(fetched, metadata);
        assert_eq!(reliability[&addr].successes, 1);
    }

    #[tokio::test]
    async fn test_fetch_rejects_wrong_hash() {
        let metadata = vec![0xaau8; 20000];
        // an info hash the blob does NOT hash to
        let wrong_hash = [0x11; 20];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_metadata(listener, wrong_hash, metadata));

        let mut reliability = HashMap::new();
        let fetched =
            fetch(wrong_hash, [1; 20], vec![addr], &mut reliability).await;
        assert!(fetched.is_none());
        assert_eq!(reliability[&addr].failures, 1);
    }

    #[test]
    fn test_slice_len() {
        assert_eq!(slice_len(30000, 0), METADATA_PIECE_LEN);
        assert_eq!(slice_len(30000, 1), 30000 - METADATA_PIECE_LEN);
        assert_eq!(slice_len(16384, 0), 16384);
    }

    #[test]
    fn test_reliability_ordering() {
        let mut good = PeerReliability::default();
        good.record_success(Duration::from_millis(50));
        let mut bad = PeerReliability::default();
        bad.record_failure();
        let untried = PeerReliability::default();

        assert!(good.score() < untried.score());
        assert!(untried.score() < bad.score());
    }
}
