use url::Url;

use crate::{error::metainfo::MagnetError, InfoHash};

pub type Result<T> = std::result::Result<T, MagnetError>;

/// A parsed magnet URI (BEP 9).
///
/// Only the parameters the engine acts on are retained: the info hash, the
/// display name and the tracker list. Everything else in the URI is
/// ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagnetUri {
    /// The torrent identity, from the `xt=urn:btih:` parameter.
    pub info_hash: InfoHash,
    /// The display name (`dn`), used as the torrent name until the real
    /// metadata arrives.
    pub name: Option<String>,
    /// Tracker URLs (`tr`), each its own tier.
    pub trackers: Vec<Url>,
}

impl MagnetUri {
    /// Parses a `magnet:?xt=urn:btih:...` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    // a magnet may carry several exact topics; we take the
                    // first btih one
                    if info_hash.is_none() {
                        if let Some(digest) =
                            value.strip_prefix("urn:btih:")
                        {
                            info_hash = decode_digest(digest);
                        }
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => {
                    if let Ok(url) = Url::parse(&value) {
                        trackers.push(url);
                    } else {
                        log::debug!("Ignoring invalid tracker in magnet");
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::InvalidInfoHash)?,
            name,
            trackers,
        })
    }
}

/// Decodes a btih digest: 40 hex characters, or 32 base32 characters in
/// older magnets.
fn decode_digest(digest: &str) -> Option<InfoHash> {
    match digest.len() {
        40 => {
            let bytes = hex::decode(digest).ok()?;
            let mut hash = [0; 20];
            hash.copy_from_slice(&bytes);
            Some(hash)
        }
        32 => base32_decode(digest),
        _ => None,
    }
}

/// RFC 4648 base32 without padding, as used by legacy magnet links. 32
/// characters decode to exactly 20 bytes.
fn base32_decode(input: &str) -> Option<InfoHash> {
    let mut hash = [0u8; 20];
    let mut acc: u64 = 0;
    let mut bits = 0;
    let mut out = 0;
    for c in input.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            hash[out] = (acc >> bits) as u8;
            out += 1;
        }
    }
    (out == 20).then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn test_parse_hex_magnet() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=test%20name&tr=http%3A%2F%2Ftracker.test%2Fann",
            HEX_HASH
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), HEX_HASH);
        assert_eq!(magnet.name.as_deref(), Some("test name"));
        assert_eq!(magnet.trackers.len(), 1);
    }

    #[test]
    fn test_parse_base32_magnet() {
        // the same 20 bytes in base32
        let hash: InfoHash = {
            let bytes = hex::decode(HEX_HASH).unwrap();
            let mut h = [0; 20];
            h.copy_from_slice(&bytes);
            h
        };
        let base32 = {
            // encode for the test's sake
            const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
            let mut acc: u64 = 0;
            let mut bits = 0;
            let mut s = String::new();
            for b in hash {
                acc = (acc << 8) | b as u64;
                bits += 8;
                while bits >= 5 {
                    bits -= 5;
                    s.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
                }
            }
            s
        };
        let uri = format!("magnet:?xt=urn:btih:{}", base32);
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, hash);
    }

    #[test]
    fn test_rejects_non_magnet() {
        assert!(matches!(
            MagnetUri::parse("http://example.test/"),
            Err(MagnetError::NotMagnet)
        ));
    }

    #[test]
    fn test_rejects_missing_or_bad_hash() {
        assert!(MagnetUri::parse("magnet:?dn=nothing").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:abcd").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:sha1:whatever").is_err());
    }
}
