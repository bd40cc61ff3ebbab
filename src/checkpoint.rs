//! Durable resume state.
//!
//! A torrent's checkpoint is one file per info hash under the state
//! directory, written atomically (write to a temp file, fsync, rename
//! over). Two formats exist: JSON for debuggability and a compact binary
//! format with a fixed 16 byte header and a deterministically bencoded
//! payload. Loading auto-detects the format, so converting is just
//! loading one and saving the other.

use std::{
    collections::BTreeMap,
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    bencode::Value,
    conf::CheckpointFormat,
    error::checkpoint::{CheckpointError, Result},
    InfoHash, PieceIndex,
};

/// The binary header magic.
const MAGIC: &[u8; 4] = b"RTCP";
/// The current binary format version.
const VERSION: u8 = 1;
/// The only payload encoding so far: bencode.
const FORMAT_BENCODE: u8 = 0;
/// Header: magic (4) + version (1) + format (1) + reserved (2) +
/// payload length (8).
const HEADER_LEN: usize = 16;

/// A snapshot of everything needed to resume a torrent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TorrentCheckpoint {
    #[serde(with = "serde_hex20")]
    pub info_hash: InfoHash,
    pub torrent_name: String,
    /// Unix timestamps, seconds.
    pub created_at: u64,
    pub updated_at: u64,
    pub total_pieces: usize,
    pub piece_length: u32,
    pub total_length: u64,
    /// The pieces that were verified and durably written before this
    /// checkpoint was renamed into place. Sorted.
    pub verified_pieces: Vec<PieceIndex>,
    pub output_dir: PathBuf,
    pub files: Vec<CheckpointFile>,
    pub stats: CheckpointStats,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub path: PathBuf,
    pub length: u64,
    /// The BEP 47 attribute flags, re-applied on resume.
    #[serde(default)]
    pub attr: String,
    #[serde(default)]
    pub symlink_target: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

impl TorrentCheckpoint {
    /// Validates internal consistency; called after every load.
    fn validate(&self) -> Result<()> {
        if self.torrent_name.is_empty()
            || self.piece_length == 0
            || self.total_pieces == 0
        {
            return Err(CheckpointError::InvalidContents);
        }
        if self
            .verified_pieces
            .iter()
            .any(|piece| *piece >= self.total_pieces)
        {
            return Err(CheckpointError::InvalidContents);
        }
        Ok(())
    }

    /// Serializes the checkpoint in the given format.
    pub fn to_bytes(&self, format: CheckpointFormat) -> Result<Vec<u8>> {
        match format {
            CheckpointFormat::Json => {
                Ok(serde_json::to_vec_pretty(self)?)
            }
            CheckpointFormat::Binary => {
                let payload = self.to_bencode().encode();
                let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
                buf.extend_from_slice(MAGIC);
                buf.push(VERSION);
                buf.push(FORMAT_BENCODE);
                buf.extend_from_slice(&[0, 0]);
                buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
                buf.extend_from_slice(&payload);
                Ok(buf)
            }
        }
    }

    /// Deserializes a checkpoint, auto-detecting the format by the magic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let checkpoint = if bytes.starts_with(MAGIC) {
            Self::from_binary(bytes)?
        } else {
            serde_json::from_slice(bytes)?
        };
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    fn from_binary(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CheckpointError::InvalidFormat);
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        if bytes[5] != FORMAT_BENCODE {
            return Err(CheckpointError::InvalidFormat);
        }
        let payload_len = u64::from_be_bytes(
            bytes[8..16].try_into().expect("header slice is 8 bytes"),
        ) as usize;
        if bytes.len() != HEADER_LEN + payload_len {
            return Err(CheckpointError::InvalidFormat);
        }
        Self::from_bencode(&Value::decode(&bytes[HEADER_LEN..])?)
    }

    fn to_bencode(&self) -> Value {
        let files = self
            .files
            .iter()
            .map(|file| {
                let mut dict = BTreeMap::new();
                dict.insert(
                    b"path".to_vec(),
                    Value::bytes(
                        file.path.to_string_lossy().as_bytes().to_vec(),
                    ),
                );
                dict.insert(
                    b"length".to_vec(),
                    Value::Int(file.length as i64),
                );
                if !file.attr.is_empty() {
                    dict.insert(
                        b"attr".to_vec(),
                        Value::bytes(file.attr.as_bytes().to_vec()),
                    );
                }
                if let Some(target) = &file.symlink_target {
                    dict.insert(
                        b"symlink".to_vec(),
                        Value::bytes(
                            target.to_string_lossy().as_bytes().to_vec(),
                        ),
                    );
                }
                Value::Dict(dict)
            })
            .collect();

        Value::dict([
            (b"created_at".to_vec(), Value::Int(self.created_at as i64)),
            (b"files".to_vec(), Value::List(files)),
            (b"info_hash".to_vec(), Value::bytes(self.info_hash.to_vec())),
            (
                b"name".to_vec(),
                Value::bytes(self.torrent_name.as_bytes().to_vec()),
            ),
            (
                b"output_dir".to_vec(),
                Value::bytes(
                    self.output_dir.to_string_lossy().as_bytes().to_vec(),
                ),
            ),
            (
                b"piece_length".to_vec(),
                Value::Int(self.piece_length as i64),
            ),
            (
                b"stats".to_vec(),
                Value::dict([
                    (
                        b"downloaded".to_vec(),
                        Value::Int(self.stats.downloaded as i64),
                    ),
                    (
                        b"uploaded".to_vec(),
                        Value::Int(self.stats.uploaded as i64),
                    ),
                ]),
            ),
            (
                b"total_length".to_vec(),
                Value::Int(self.total_length as i64),
            ),
            (
                b"total_pieces".to_vec(),
                Value::Int(self.total_pieces as i64),
            ),
            (b"updated_at".to_vec(), Value::Int(self.updated_at as i64)),
            (
                b"verified".to_vec(),
                Value::List(
                    self.verified_pieces
                        .iter()
                        .map(|piece| Value::Int(*piece as i64))
                        .collect(),
                ),
            ),
        ])
    }

    fn from_bencode(value: &Value) -> Result<Self> {
        let int = |key: &[u8]| -> Result<i64> {
            value
                .get(key)
                .and_then(Value::as_int)
                .ok_or(CheckpointError::InvalidContents)
        };
        let string = |key: &[u8]| -> Result<String> {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or(CheckpointError::InvalidContents)
        };

        let info_hash_bytes = value
            .get(b"info_hash")
            .and_then(Value::as_bytes)
            .ok_or(CheckpointError::InvalidContents)?;
        if info_hash_bytes.len() != 20 {
            return Err(CheckpointError::InvalidContents);
        }
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(info_hash_bytes);

        let files = value
            .get(b"files")
            .and_then(Value::as_list)
            .ok_or(CheckpointError::InvalidContents)?
            .iter()
            .map(|file| {
                let path = file
                    .get(b"path")
                    .and_then(Value::as_str)
                    .ok_or(CheckpointError::InvalidContents)?;
                let length = file
                    .get(b"length")
                    .and_then(Value::as_int)
                    .ok_or(CheckpointError::InvalidContents)?;
                Ok(CheckpointFile {
                    path: PathBuf::from(path),
                    length: length as u64,
                    attr: file
                        .get(b"attr")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    symlink_target: file
                        .get(b"symlink")
                        .and_then(Value::as_str)
                        .map(PathBuf::from),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let verified_pieces = value
            .get(b"verified")
            .and_then(Value::as_list)
            .ok_or(CheckpointError::InvalidContents)?
            .iter()
            .map(|piece| {
                piece
                    .as_int()
                    .filter(|p| *p >= 0)
                    .map(|p| p as PieceIndex)
                    .ok_or(CheckpointError::InvalidContents)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            info_hash,
            torrent_name: string(b"name")?,
            created_at: int(b"created_at")? as u64,
            updated_at: int(b"updated_at")? as u64,
            total_pieces: int(b"total_pieces")? as usize,
            piece_length: int(b"piece_length")? as u32,
            total_length: int(b"total_length")? as u64,
            verified_pieces,
            output_dir: PathBuf::from(string(b"output_dir")?),
            files,
            stats: CheckpointStats {
                uploaded: value
                    .get(b"stats")
                    .and_then(|s| s.get(b"uploaded"))
                    .and_then(Value::as_int)
                    .unwrap_or_default() as u64,
                downloaded: value
                    .get(b"stats")
                    .and_then(|s| s.get(b"downloaded"))
                    .and_then(Value::as_int)
                    .unwrap_or_default() as u64,
            },
        })
    }
}

/// Writes and loads checkpoint files in a state directory.
pub struct CheckpointStore {
    state_dir: PathBuf,
    format: CheckpointFormat,
}

impl CheckpointStore {
    pub fn new(state_dir: impl Into<PathBuf>, format: CheckpointFormat) -> Self {
        Self {
            state_dir: state_dir.into(),
            format,
        }
    }

    /// The checkpoint file path of a torrent.
    pub fn path_of(&self, info_hash: &InfoHash) -> PathBuf {
        self.state_dir
            .join(format!("{}.resume", hex::encode(info_hash)))
    }

    /// Returns whether a checkpoint exists for the torrent.
    pub fn exists(&self, info_hash: &InfoHash) -> bool {
        self.path_of(info_hash).exists()
    }

    /// Atomically writes the checkpoint: temp file in the same directory,
    /// fsync, rename over the old one, fsync the directory.
    pub fn save(&self, checkpoint: &TorrentCheckpoint) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.state_dir)?;
        let bytes = checkpoint.to_bytes(self.format)?;
        let path = self.path_of(&checkpoint.info_hash);

        let mut temp = tempfile::NamedTempFile::new_in(&self.state_dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| CheckpointError::Io(e.error))?;

        // the rename itself must survive a crash too
        if let Ok(dir) = std::fs::File::open(&self.state_dir) {
            let _ = dir.sync_all();
        }

        log::debug!("Checkpoint saved to {:?}", path);
        Ok(path)
    }

    /// Loads and validates a torrent's checkpoint.
    pub fn load(&self, info_hash: &InfoHash) -> Result<TorrentCheckpoint> {
        let bytes = std::fs::read(self.path_of(info_hash))?;
        let checkpoint = TorrentCheckpoint::from_bytes(&bytes)?;
        if checkpoint.info_hash != *info_hash {
            return Err(CheckpointError::InvalidContents);
        }
        Ok(checkpoint)
    }

    /// Removes a torrent's checkpoint, e.g. when the torrent is deleted.
    pub fn remove(&self, info_hash: &InfoHash) -> Result<()> {
        let path = self.path_of(info_hash);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// The current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

mod serde_hex20 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8; 20],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("info hash must be 20 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn checkpoint() -> TorrentCheckpoint {
        TorrentCheckpoint {
            info_hash: [0xab; 20],
            torrent_name: "example".into(),
            created_at: 1_700_000_000,
            updated_at: 1_700_000_600,
            total_pieces: 16,
            piece_length: 16384,
            total_length: 16 * 16384,
            verified_pieces: vec![0, 2, 7],
            output_dir: PathBuf::from("/downloads"),
            files: vec![
                CheckpointFile {
                    path: PathBuf::from("a/b.bin"),
                    length: 100_000,
                    attr: "x".into(),
                    symlink_target: None,
                },
                CheckpointFile {
                    path: PathBuf::from("link"),
                    length: 0,
                    attr: "l".into(),
                    symlink_target: Some(PathBuf::from("a/b.bin")),
                },
            ],
            stats: CheckpointStats {
                uploaded: 1234,
                downloaded: 5678,
            },
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let original = checkpoint();
        let bytes = original.to_bytes(CheckpointFormat::Json).unwrap();
        // JSON must actually be JSON for debuggability
        assert_eq!(bytes[0], b'{');
        let loaded = TorrentCheckpoint::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_binary_roundtrip() {
        let original = checkpoint();
        let bytes = original.to_bytes(CheckpointFormat::Binary).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        let loaded = TorrentCheckpoint::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_binary_encoding_is_deterministic() {
        let a = checkpoint().to_bytes(CheckpointFormat::Binary).unwrap();
        let b = checkpoint().to_bytes(CheckpointFormat::Binary).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_format_conversion_both_directions() {
        let original = checkpoint();
        let json = original.to_bytes(CheckpointFormat::Json).unwrap();
        let via_json = TorrentCheckpoint::from_bytes(&json).unwrap();
        let binary = via_json.to_bytes(CheckpointFormat::Binary).unwrap();
        let via_binary = TorrentCheckpoint::from_bytes(&binary).unwrap();
        assert_eq!(via_binary, original);
        let json_again =
            via_binary.to_bytes(CheckpointFormat::Json).unwrap();
        assert_eq!(
            TorrentCheckpoint::from_bytes(&json_again).unwrap(),
            original
        );
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes =
            checkpoint().to_bytes(CheckpointFormat::Binary).unwrap();
        bytes[4] = 99;
        assert!(matches!(
            TorrentCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_binary_is_rejected() {
        let bytes = checkpoint().to_bytes(CheckpointFormat::Binary).unwrap();
        assert!(TorrentCheckpoint::from_bytes(&bytes[..HEADER_LEN]).is_err());
        assert!(TorrentCheckpoint::from_bytes(&bytes[..bytes.len() - 1])
            .is_err());
    }

    #[test]
    fn test_out_of_range_verified_piece_is_rejected() {
        let mut bad = checkpoint();
        bad.verified_pieces.push(bad.total_pieces);
        let bytes = bad.to_bytes(CheckpointFormat::Binary).unwrap();
        assert!(matches!(
            TorrentCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::InvalidContents)
        ));
    }

    #[test]
    fn test_store_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            CheckpointStore::new(dir.path(), CheckpointFormat::Binary);
        let original = checkpoint();

        assert!(!store.exists(&original.info_hash));
        let path = store.save(&original).unwrap();
        assert!(path.exists());
        assert!(store.exists(&original.info_hash));

        let loaded = store.load(&original.info_hash).unwrap();
        assert_eq!(loaded, original);

        // a save over an existing checkpoint replaces it atomically
        let mut updated = original.clone();
        updated.verified_pieces.push(9);
        updated.updated_at += 60;
        store.save(&updated).unwrap();
        assert_eq!(store.load(&original.info_hash).unwrap(), updated);

        store.remove(&original.info_hash).unwrap();
        assert!(!store.exists(&original.info_hash));
    }

    #[test]
    fn test_load_rejects_mismatched_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), CheckpointFormat::Json);
        let original = checkpoint();
        let path = store.path_of(&[0xcd; 20]);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            path,
            original.to_bytes(CheckpointFormat::Json).unwrap(),
        )
        .unwrap();
        assert!(store.load(&[0xcd; 20]).is_err());
    }
}
