#![cfg(test)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use url::Url;

use super::{announce::Announce, announce::Event, http::HttpTracker};
use crate::error::tracker::TrackerError;

fn params(event: Option<Event>) -> Announce {
    Announce {
        info_hash: *b"\xaa\xbb\xcc\xdd\xee\xff\x00\x11\x22\x33\x44\x55\x66\x77\x88\x99\xaa\xbb\xcc\xdd",
        peer_id: *b"-RT0010-123456789012",
        port: 6881,
        ip: None,
        downloaded: 100,
        uploaded: 50,
        left: 900,
        peer_count: Some(10),
        tracker_id: None,
        event,
    }
}

#[tokio::test]
async fn test_http_announce_compact_peers() {
    let mut server = mockito::Server::new_async().await;

    // a bencoded response with an interval and two compact peers
    let body: &[u8] =
        b"d8:intervali1800e12:min intervali60e8:completei5e10:incompletei3e\
          5:peers12:\x0a\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e";
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let url = Url::parse(&server.url()).unwrap();
    let tracker = HttpTracker::new(url);
    let resp = tracker.announce(&params(Some(Event::Started))).await.unwrap();

    mock.assert_async().await;
    assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
    assert_eq!(resp.min_interval, Some(Duration::from_secs(60)));
    assert_eq!(resp.seeder_count, Some(5));
    assert_eq!(resp.leecher_count, Some(3));
    assert_eq!(
        resp.peers,
        vec![
            std::net::SocketAddr::from(([10, 0, 0, 1], 6881)),
            std::net::SocketAddr::from(([10, 0, 0, 2], 6882)),
        ]
    );
}

#[tokio::test]
async fn test_http_announce_peer_list_and_peers6() {
    let mut server = mockito::Server::new_async().await;

    // non-compact peer list plus one compact IPv6 peer
    let mut body = Vec::new();
    body.extend_from_slice(
        b"d8:intervali900e5:peersld2:ip8:10.0.0.34:porti6883eee6:peers618:",
    );
    body.extend_from_slice(&[0u8; 15]);
    body.extend_from_slice(&[1, 0x1a, 0xe4]);
    body.extend_from_slice(b"e");

    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let url = Url::parse(&server.url()).unwrap();
    let tracker = HttpTracker::new(url);
    let resp = tracker.announce(&params(None)).await.unwrap();

    mock.assert_async().await;
    assert_eq!(
        resp.peers,
        vec![std::net::SocketAddr::from(([10, 0, 0, 3], 6883))]
    );
    assert_eq!(resp.peers6.len(), 1);
    assert_eq!(resp.peers6[0].port(), 6884);
    assert_eq!(resp.all_peers().count(), 2);
}

#[tokio::test]
async fn test_http_announce_failure_reason() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(&b"d14:failure reason15:torrent unknowne"[..])
        .create_async()
        .await;

    let url = Url::parse(&server.url()).unwrap();
    let tracker = HttpTracker::new(url);
    let err = tracker.announce(&params(None)).await.unwrap_err();

    mock.assert_async().await;
    match err {
        TrackerError::Failure(reason) => {
            assert_eq!(reason, "torrent unknown");
        }
        other => panic!("expected failure reason, got {:?}", other),
    }
}

#[tokio::test]
async fn test_http_announce_http_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let url = Url::parse(&server.url()).unwrap();
    let tracker = HttpTracker::new(url);
    assert!(tracker.announce(&params(None)).await.is_err());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_info_hash_is_url_encoded() {
    let mut server = mockito::Server::new_async().await;
    // the raw info hash bytes must arrive percent encoded
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .match_query(mockito::Matcher::Regex(
            "info_hash=%AA%BB%CC%DD%EE%FF%00%11%22%33DU".to_string()
        ))
        .with_status(200)
        .with_body(&b"d8:intervali1800e5:peers0:e"[..])
        .create_async()
        .await;

    let url = Url::parse(&server.url()).unwrap();
    let tracker = HttpTracker::new(url);
    let resp = tracker.announce(&params(None)).await.unwrap();
    assert!(resp.peers.is_empty());
    mock.assert_async().await;
}
