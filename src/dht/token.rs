//! Write tokens: a node answering `get_peers` or `get` includes an opaque
//! token derived from the asker's address; a later `announce_peer` or
//! `put` must echo it, proving the announcer can receive at the address
//! it claims.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};

/// Tokens are valid for the current and the previous rotation window,
/// so between 5 and 10 minutes.
const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const TOKEN_LEN: usize = 8;

pub struct TokenStore {
    secret: [u8; 16],
    prev_secret: [u8; 16],
    last_rotate: Instant,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = [0u8; 16];
        rng.fill(&mut secret[..]);
        let mut prev_secret = [0u8; 16];
        rng.fill(&mut prev_secret[..]);
        Self {
            secret,
            prev_secret,
            last_rotate: Instant::now(),
        }
    }

    /// Rotates the secret if the window has passed; called from the DHT
    /// task's periodic tick.
    pub fn maybe_rotate(&mut self) {
        if self.last_rotate.elapsed() >= ROTATE_INTERVAL {
            self.prev_secret = self.secret;
            rand::thread_rng().fill(&mut self.secret[..]);
            self.last_rotate = Instant::now();
        }
    }

    /// The token to hand to a node at the given address.
    pub fn issue(&self, addr: &SocketAddr) -> Vec<u8> {
        Self::derive(&self.secret, addr)
    }

    /// Whether the token is one we issued to this address recently.
    pub fn verify(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        token == Self::derive(&self.secret, addr)
            || token == Self::derive(&self.prev_secret, addr)
    }

    fn derive(secret: &[u8; 16], addr: &SocketAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match addr.ip() {
            std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.finalize()[..TOKEN_LEN].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let store = TokenStore::new();
        let addr: SocketAddr = ([10, 0, 0, 1], 6881).into();
        let other: SocketAddr = ([10, 0, 0, 2], 6881).into();

        let token = store.issue(&addr);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(store.verify(&addr, &token));
        // tokens are bound to the address
        assert!(!store.verify(&other, &token));
        assert!(!store.verify(&addr, b"garbage"));
    }

    #[test]
    fn test_previous_window_tokens_stay_valid() {
        let mut store = TokenStore::new();
        let addr: SocketAddr = ([10, 0, 0, 1], 6881).into();
        let token = store.issue(&addr);

        // force one rotation; the old token must still verify
        store.prev_secret = store.secret;
        rand::thread_rng().fill(&mut store.secret[..]);
        assert!(store.verify(&addr, &token));

        // after a second rotation it no longer does
        store.prev_secret = store.secret;
        rand::thread_rng().fill(&mut store.secret[..]);
        assert!(!store.verify(&addr, &token));
    }

    #[test]
    fn test_token_ignores_port() {
        // announce_peer may come from a different source port than the
        // get_peers that fetched the token
        let store = TokenStore::new();
        let a: SocketAddr = ([10, 0, 0, 1], 1000).into();
        let b: SocketAddr = ([10, 0, 0, 1], 2000).into();
        assert_eq!(store.issue(&a), store.issue(&b));
    }
}
