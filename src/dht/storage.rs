//! Arbitrary data storage in the DHT (BEP 44): immutable items addressed
//! by the hash of their content, and mutable items addressed by the hash
//! of their public key, re-signed with an increasing sequence number on
//! every update.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};

use crate::bencode::Value;
use crate::error::dht::{DhtError, Result};

/// BEP 44 caps the bencoded storage value at 1000 bytes.
pub const MAX_VALUE_LEN: usize = 1000;

/// How long stored items are kept before expiring.
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// The signing metadata of a mutable item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutableMeta {
    pub public_key: [u8; 32],
    pub seq: i64,
    pub signature: [u8; 64],
}

/// A BEP 44 storage item, immutable or mutable.
///
/// The payload is the raw byte string stored under `v`. (BEP 44 permits
/// any bencoded value there; like the storage layers we interoperate
/// with, we store byte strings.)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageItem {
    pub value: Vec<u8>,
    pub salt: Vec<u8>,
    pub mutable: Option<MutableMeta>,
}

impl StorageItem {
    /// Creates an immutable item.
    pub fn immutable(value: Vec<u8>) -> Self {
        Self {
            value,
            salt: Vec::new(),
            mutable: None,
        }
    }

    /// Creates and signs a mutable item.
    pub fn mutable(
        value: Vec<u8>,
        salt: Vec<u8>,
        seq: i64,
        key: &SigningKey,
    ) -> Self {
        let message = signable(&salt, seq, &value);
        let signature = key.sign(&message);
        Self {
            value,
            salt,
            mutable: Some(MutableMeta {
                public_key: key.verifying_key().to_bytes(),
                seq,
                signature: signature.to_bytes(),
            }),
        }
    }

    /// The 20 byte DHT target the item lives at: the hash of the content
    /// for immutable items, of `pubkey ‖ salt` for mutable ones.
    pub fn target(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        match &self.mutable {
            None => {
                hasher.update(&self.value);
            }
            Some(meta) => {
                hasher.update(meta.public_key);
                hasher.update(&self.salt);
            }
        }
        let digest = hasher.finalize();
        let mut target = [0; 20];
        target.copy_from_slice(&digest);
        target
    }

    /// Verifies a mutable item's signature. Immutable items are
    /// self-certifying through their target and always pass.
    pub fn verify(&self) -> Result<()> {
        let Some(meta) = &self.mutable else {
            return Ok(());
        };
        let key = VerifyingKey::from_bytes(&meta.public_key)
            .map_err(|_| DhtError::InvalidSignature)?;
        let signature = Signature::from_bytes(&meta.signature);
        let message = signable(&self.salt, meta.seq, &self.value);
        key.verify(&message, &signature)
            .map_err(|_| DhtError::InvalidSignature)
    }

    /// The bencoded size of the item's wire fields; items over the BEP 44
    /// cap are rejected before transmission.
    pub fn encoded_len(&self) -> usize {
        let mut dict = BTreeMap::new();
        self.encode_into(&mut dict);
        Value::Dict(dict).encode().len()
    }

    /// Validates the item for storing: size cap and signature.
    pub fn validate(&self) -> Result<()> {
        if self.encoded_len() > MAX_VALUE_LEN {
            return Err(DhtError::ValueTooLarge);
        }
        self.verify()
    }

    /// Writes the item's fields into a message dict (`a` of a put, `r` of
    /// a get response).
    pub fn encode_into(&self, dict: &mut BTreeMap<Vec<u8>, Value>) {
        dict.insert(b"v".to_vec(), Value::bytes(self.value.clone()));
        if !self.salt.is_empty() {
            dict.insert(b"salt".to_vec(), Value::bytes(self.salt.clone()));
        }
        if let Some(meta) = &self.mutable {
            dict.insert(
                b"k".to_vec(),
                Value::bytes(meta.public_key.to_vec()),
            );
            dict.insert(b"seq".to_vec(), Value::Int(meta.seq));
            dict.insert(
                b"sig".to_vec(),
                Value::bytes(meta.signature.to_vec()),
            );
        }
    }

    /// Decodes an item from a message dict; `v` must be present.
    pub fn decode_from(dict: &Value) -> Result<Self> {
        Self::maybe_decode_from(dict)?.ok_or(DhtError::InvalidMessage)
    }

    /// Decodes an item if the dict carries one (`v` present).
    pub fn maybe_decode_from(dict: &Value) -> Result<Option<Self>> {
        let Some(value) = dict.get(b"v") else {
            return Ok(None);
        };
        let value = value
            .as_bytes()
            .ok_or(DhtError::InvalidMessage)?
            .to_vec();
        let salt = dict
            .get(b"salt")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        let mutable = match dict.get(b"k") {
            None => None,
            Some(k) => {
                let public_key: [u8; 32] = k
                    .as_bytes()
                    .and_then(|b| b.try_into().ok())
                    .ok_or(DhtError::InvalidMessage)?;
                let seq = dict
                    .get(b"seq")
                    .and_then(Value::as_int)
                    .ok_or(DhtError::InvalidMessage)?;
                let signature: [u8; 64] = dict
                    .get(b"sig")
                    .and_then(Value::as_bytes)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(DhtError::InvalidMessage)?;
                Some(MutableMeta {
                    public_key,
                    seq,
                    signature,
                })
            }
        };

        Ok(Some(Self {
            value,
            salt,
            mutable,
        }))
    }
}

/// The message a mutable item's signature covers: `salt ‖ seq ‖ v`.
fn signable(salt: &[u8], seq: i64, value: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(salt.len() + 8 + value.len());
    message.extend_from_slice(salt);
    message.extend_from_slice(&seq.to_be_bytes());
    message.extend_from_slice(value);
    message
}

struct CacheEntry {
    item: StorageItem,
    expires_at: Instant,
}

/// The local store of BEP 44 items we accepted, with TTL expiry and
/// sequence number monotonicity for mutable items.
pub struct StorageCache {
    items: HashMap<[u8; 20], CacheEntry>,
    ttl: Duration,
}

impl Default for StorageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl StorageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: HashMap::new(),
            ttl,
        }
    }

    /// Validates and stores an item under its target.
    ///
    /// A mutable item must carry a `seq` strictly greater than the stored
    /// one; an equal or lower sequence is rejected as stale.
    pub fn put(&mut self, item: StorageItem) -> Result<[u8; 20]> {
        item.validate()?;
        let target = item.target();

        if let Some(existing) = self.items.get(&target) {
            if let (Some(new), Some(old)) =
                (&item.mutable, &existing.item.mutable)
            {
                if new.seq <= old.seq {
                    return Err(DhtError::StaleSequence);
                }
            }
        }

        self.items.insert(
            target,
            CacheEntry {
                item,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(target)
    }

    pub fn get(&self, target: &[u8; 20]) -> Option<&StorageItem> {
        self.items
            .get(target)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| &entry.item)
    }

    /// Drops expired entries, returning how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.items.len();
        let now = Instant::now();
        self.items.retain(|_, entry| entry.expires_at > now);
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7; 32])
    }

    #[test]
    fn test_immutable_target_is_content_hash() {
        let item = StorageItem::immutable(b"hello world".to_vec());
        let expected = {
            let digest = Sha1::digest(b"hello world");
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };
        assert_eq!(item.target(), expected);
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_mutable_sign_and_verify() {
        let key = signing_key();
        let item =
            StorageItem::mutable(b"value".to_vec(), b"salt".to_vec(), 1, &key);
        assert!(item.verify().is_ok());

        // the target depends on the key and salt, not the value
        let other =
            StorageItem::mutable(b"other".to_vec(), b"salt".to_vec(), 2, &key);
        assert_eq!(item.target(), other.target());

        // tampering breaks the signature
        let mut tampered = item.clone();
        tampered.value = b"evil".to_vec();
        assert!(matches!(
            tampered.verify(),
            Err(DhtError::InvalidSignature)
        ));
    }

    #[test]
    fn test_item_dict_roundtrip() {
        let key = signing_key();
        let item =
            StorageItem::mutable(b"value".to_vec(), b"s".to_vec(), 3, &key);
        let mut dict = BTreeMap::new();
        item.encode_into(&mut dict);
        let decoded =
            StorageItem::decode_from(&Value::Dict(dict)).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_oversized_value_is_rejected_before_transmission() {
        let item = StorageItem::immutable(vec![0; MAX_VALUE_LEN + 1]);
        assert!(matches!(
            item.validate(),
            Err(DhtError::ValueTooLarge)
        ));

        let mut cache = StorageCache::default();
        assert!(cache.put(item).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_seq_monotonicity() {
        let key = signing_key();
        let mut cache = StorageCache::default();

        let v1 = StorageItem::mutable(b"one".to_vec(), vec![], 1, &key);
        let target = cache.put(v1).unwrap();

        // an equal sequence is stale
        let v1_again = StorageItem::mutable(b"one'".to_vec(), vec![], 1, &key);
        assert!(matches!(
            cache.put(v1_again),
            Err(DhtError::StaleSequence)
        ));

        let v2 = StorageItem::mutable(b"two".to_vec(), vec![], 2, &key);
        cache.put(v2).unwrap();
        assert_eq!(cache.get(&target).unwrap().value, b"two");
    }

    #[test]
    fn test_cache_expiry() {
        let key = signing_key();
        let mut cache = StorageCache::new(Duration::from_secs(0));
        let item = StorageItem::mutable(b"v".to_vec(), vec![], 1, &key);
        let target = cache.put(item).unwrap();
        assert!(cache.get(&target).is_none());
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.is_empty());
    }
}
