//! Infohash indexing (BEP 51): publishing small signed samples of known
//! torrents under keys derived from their names, so torrents can be
//! discovered by name without fetching metadata first.
//!
//! An index entry is stored in the DHT as a signed mutable item (BEP 44)
//! holding up to [`MAX_SAMPLES`] recent samples. The key normalization is
//! pinned here: queries are lowercased and stripped of surrounding
//! whitespace before hashing, and both the publish and the query path go
//! through [`index_key`].

use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use sha1::{Digest, Sha1};

use crate::bencode::Value;
use crate::dht::storage::StorageItem;
use crate::error::dht::{DhtError, Result};
use crate::InfoHash;

/// An index entry keeps at most this many samples, newest first.
pub const MAX_SAMPLES: usize = 8;

/// The DHT key of an index entry: SHA-1 of the normalized query.
pub fn index_key(query: &str) -> [u8; 20] {
    let normalized = query.trim().to_lowercase();
    let digest = Sha1::digest(normalized.as_bytes());
    let mut key = [0; 20];
    key.copy_from_slice(&digest);
    key
}

/// One advertised torrent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfohashSample {
    pub info_hash: InfoHash,
    pub name: String,
    pub size: u64,
    /// Unix seconds when the sample was created.
    pub created_at: u64,
}

/// A set of samples stored under one index key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub samples: Vec<InfohashSample>,
    pub updated_at: u64,
}

impl IndexEntry {
    /// Adds a sample, deduplicating by info hash and keeping the newest
    /// [`MAX_SAMPLES`].
    pub fn add_sample(&mut self, sample: InfohashSample) {
        self.samples.retain(|s| s.info_hash != sample.info_hash);
        self.updated_at = self.updated_at.max(sample.created_at);
        self.samples.push(sample);
        self.samples
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.samples.truncate(MAX_SAMPLES);
    }

    pub fn encode(&self) -> Vec<u8> {
        let samples = self
            .samples
            .iter()
            .map(|sample| {
                Value::dict([
                    (
                        b"info_hash".to_vec(),
                        Value::bytes(sample.info_hash.to_vec()),
                    ),
                    (
                        b"name".to_vec(),
                        Value::bytes(sample.name.as_bytes().to_vec()),
                    ),
                    (b"size".to_vec(), Value::Int(sample.size as i64)),
                    (b"time".to_vec(), Value::Int(sample.created_at as i64)),
                ])
            })
            .collect();
        Value::dict([
            (b"samples".to_vec(), Value::List(samples)),
            (b"updated".to_vec(), Value::Int(self.updated_at as i64)),
        ])
        .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = Value::decode(bytes)?;
        let samples = value
            .get(b"samples")
            .and_then(Value::as_list)
            .ok_or(DhtError::InvalidMessage)?
            .iter()
            .map(|sample| {
                let info_hash: InfoHash = sample
                    .get(b"info_hash")
                    .and_then(Value::as_bytes)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(DhtError::InvalidMessage)?;
                Ok(InfohashSample {
                    info_hash,
                    name: sample
                        .get(b"name")
                        .and_then(Value::as_str)
                        .ok_or(DhtError::InvalidMessage)?
                        .to_owned(),
                    size: sample
                        .get(b"size")
                        .and_then(Value::as_int)
                        .unwrap_or_default() as u64,
                    created_at: sample
                        .get(b"time")
                        .and_then(Value::as_int)
                        .unwrap_or_default() as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            samples,
            updated_at: value
                .get(b"updated")
                .and_then(Value::as_int)
                .unwrap_or_default() as u64,
        })
    }

    /// Wraps the entry in a signed mutable storage item keyed by the
    /// index key (as the salt, so one keypair can publish many entries).
    pub fn to_storage_item(
        &self,
        key: &[u8; 20],
        seq: i64,
        signing_key: &SigningKey,
    ) -> StorageItem {
        StorageItem::mutable(self.encode(), key.to_vec(), seq, signing_key)
    }
}

/// How well a sample matches a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Relevance {
    Substring = 1,
    Prefix = 2,
    Exact = 3,
}

fn relevance(name: &str, query: &str) -> Option<Relevance> {
    let name = name.to_lowercase();
    let query = query.trim().to_lowercase();
    if name == query {
        Some(Relevance::Exact)
    } else if name.starts_with(&query) {
        Some(Relevance::Prefix)
    } else if name.contains(&query) {
        Some(Relevance::Substring)
    } else {
        None
    }
}

/// The local index: entries this node published or accepted, keyed by
/// their index key.
#[derive(Default)]
pub struct InfohashIndex {
    entries: HashMap<[u8; 20], IndexEntry>,
    /// The sequence counter per key for re-publishing.
    seqs: HashMap<[u8; 20], i64>,
}

impl InfohashIndex {
    /// Records a torrent under its name's key, returning the key and the
    /// entry's next publish sequence.
    pub fn add(
        &mut self,
        sample: InfohashSample,
    ) -> ([u8; 20], i64) {
        let key = index_key(&sample.name);
        self.update_entry(&key, sample)
    }

    /// Folds a sample into the entry at the given key. The key tags the
    /// entry explicitly, so samples can also be filed under queries other
    /// than their exact name.
    pub fn update_entry(
        &mut self,
        key: &[u8; 20],
        sample: InfohashSample,
    ) -> ([u8; 20], i64) {
        let entry = self.entries.entry(*key).or_default();
        entry.add_sample(sample);
        let seq = self.seqs.entry(*key).or_insert(0);
        *seq += 1;
        (*key, *seq)
    }

    /// Merges an entry received from the network into the local one.
    pub fn merge(&mut self, key: &[u8; 20], remote: IndexEntry) {
        let entry = self.entries.entry(*key).or_default();
        for sample in remote.samples {
            entry.add_sample(sample);
        }
    }

    pub fn entry(&self, key: &[u8; 20]) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Queries the local entries by name: exact matches first, then
    /// prefix, then substring.
    pub fn query(
        &self,
        query: &str,
        max_results: usize,
    ) -> Vec<InfohashSample> {
        let mut matches: Vec<(Relevance, &InfohashSample)> = self
            .entries
            .values()
            .flat_map(|entry| entry.samples.iter())
            .filter_map(|sample| {
                relevance(&sample.name, query).map(|r| (r, sample))
            })
            .collect();
        matches.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        matches.dedup_by(|a, b| a.1.info_hash == b.1.info_hash);
        matches
            .into_iter()
            .take(max_results)
            .map(|(_, sample)| sample.clone())
            .collect()
    }
}
