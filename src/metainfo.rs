use std::fmt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use crate::bencode;
use crate::error::metainfo::MetainfoError;
use crate::storage_info::{FileAttributes, FileInfo};
use crate::{InfoHash, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

/// The validated metadata of a torrent.
#[derive(Clone)]
pub struct Metainfo {
    /// The torrent's name, which also forms the download path.
    pub name: String,
    /// The SHA-1 digest of the raw bencoded `info` dictionary, identifying
    /// the torrent everywhere: handshakes, trackers, the DHT.
    pub info_hash: InfoHash,
    /// The concatenation of each piece's SHA-1 hash; its length is
    /// a multiple of 20 bytes.
    pub pieces: Vec<u8>,
    /// The nominal piece length; the last piece may be shorter.
    pub piece_len: u32,
    /// All files of the torrent in on-wire order, including padding files
    /// (which participate in offset accounting but are never written).
    pub files: Vec<FileInfo>,
    /// The tracker tiers from `announce-list` (BEP 12), falling back to
    /// a single tier holding `announce`. Both http(s) and udp URLs are
    /// kept.
    pub trackers: Vec<Vec<Url>>,
    /// The BEP 27 private flag: when set, peers may only come from the
    /// trackers named here, never from the DHT or PEX.
    pub private: bool,
}

impl fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metainfo")
            .field("name", &self.name)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("piece_count", &self.piece_count())
            .field("piece_len", &self.piece_len)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

impl Metainfo {
    /// Parses and validates a `.torrent` file.
    ///
    /// Rules enforced beyond bencode syntax:
    /// - the length of `pieces` must be a multiple of 20;
    /// - `length` (single file) and `files` (multi file) are mutually
    ///   exclusive and one must be present;
    /// - every path must be relative, non-empty and must not escape the
    ///   download directory;
    /// - a file with the symlink attribute must name a target;
    /// - a per-file `sha1`, if present, must be exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let metainfo: raw::Metainfo = serde_bencode::from_bytes(bytes)?;

        // The info hash must cover the torrent file's raw info bytes, not
        // a re-encoding, or torrents with non-canonical or extra keys
        // would hash differently than the rest of the swarm sees them.
        let info_span = bencode::dict_entry_span(bytes, b"info")
            .ok()
            .flatten()
            .ok_or(MetainfoError::InvalidMetainfo)?;
        let info_hash = sha1_digest(&bytes[info_span]);

        Self::build(metainfo, info_hash)
    }

    /// Constructs a [`Metainfo`] from the raw `info` dictionary obtained
    /// through the BEP 9 metadata exchange, verifying that it hashes to the
    /// info hash the magnet link promised.
    ///
    /// The result has no trackers; the magnet's `tr` params are handled by
    /// the caller.
    pub fn from_info_bytes(
        info_bytes: &[u8],
        expected: InfoHash,
    ) -> Result<Self> {
        let info_hash = sha1_digest(info_bytes);
        if info_hash != expected {
            return Err(MetainfoError::InfoHashMismatch);
        }
        let info: raw::Info = serde_bencode::from_bytes(info_bytes)?;
        Self::build(
            raw::Metainfo {
                info,
                announce: None,
                announce_list: Vec::new(),
            },
            info_hash,
        )
    }

    fn build(metainfo: raw::Metainfo, info_hash: InfoHash) -> Result<Self> {
        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so
        // it must be a multiple of 20
        if metainfo.info.pieces.is_empty()
            || metainfo.info.pieces.len() % 20 != 0
        {
            return Err(MetainfoError::InvalidMetainfo);
        }
        if metainfo.info.piece_len == 0 {
            return Err(MetainfoError::InvalidMetainfo);
        }

        // verify download structure and build up the file metadata
        let mut files = Vec::new();
        if let Some(len) = metainfo.info.len {
            if metainfo.info.files.is_some() {
                log::warn!("Metainfo cannot contain both `length` and `files`");
                return Err(MetainfoError::InvalidMetainfo);
            }
            if len == 0 {
                log::warn!("File length is 0");
                return Err(MetainfoError::InvalidMetainfo);
            }

            // the path of this file is just the torrent name
            files.push(FileInfo {
                path: metainfo.info.name.clone().into(),
                len,
                torrent_offset: 0,
                attributes: FileAttributes::default(),
            });
        } else if let Some(raw_files) = &metainfo.info.files {
            if raw_files.is_empty() {
                log::warn!("Metainfo files must not be empty");
                return Err(MetainfoError::InvalidMetainfo);
            }

            files.reserve_exact(raw_files.len());

            // the running offset of each file within the torrent
            let mut torrent_offset = 0;
            for file in raw_files.iter() {
                let attributes = FileAttributes::parse(
                    file.attr.as_deref(),
                    file.symlink_path.as_deref(),
                    file.sha1.as_ref().map(AsRef::as_ref),
                )?;

                if file.len == 0 && !attributes.padding {
                    log::warn!("File {:?} length is 0", file.path);
                    return Err(MetainfoError::InvalidMetainfo);
                }

                let path: PathBuf = file.path.iter().collect();
                validate_path(&path)?;

                files.push(FileInfo {
                    path,
                    torrent_offset,
                    len: file.len,
                    attributes,
                });

                // padding files advance the offset like any other: that is
                // their whole purpose
                torrent_offset += file.len;
            }

            if files.iter().all(|f| f.attributes.padding) {
                log::warn!("Metainfo contains only padding files");
                return Err(MetainfoError::InvalidMetainfo);
            }
        } else {
            log::warn!("No `length` or `files` key present in metainfo");
            return Err(MetainfoError::InvalidMetainfo);
        }

        // collect tracker tiers, preserving tier boundaries (BEP 12)
        let mut trackers: Vec<Vec<Url>> = Vec::new();
        if !metainfo.announce_list.is_empty() {
            for tier in metainfo.announce_list.iter() {
                let mut urls = Vec::with_capacity(tier.len());
                for tracker in tier.iter() {
                    let url = Url::parse(tracker)?;
                    if matches!(url.scheme(), "http" | "https" | "udp") {
                        urls.push(url);
                    }
                }
                if !urls.is_empty() {
                    trackers.push(urls);
                }
            }
        } else if let Some(tracker) = &metainfo.announce {
            let url = Url::parse(tracker)?;
            if matches!(url.scheme(), "http" | "https" | "udp") {
                trackers.push(vec![url]);
            }
        }

        if trackers.is_empty() {
            log::debug!("No trackers in metainfo");
        }

        Ok(Metainfo {
            name: metainfo.info.name,
            info_hash,
            pieces: metainfo.info.pieces,
            piece_len: metainfo.info.piece_len,
            files,
            trackers,
            private: metainfo.info.private == Some(1),
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected hash of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// The sum of all file lengths, padding included.
    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Returns true if the download is for multiple files.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

fn sha1_digest(bytes: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(bytes);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    hash
}

pub(crate) fn validate_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        log::warn!("Path in metainfo is empty");
        return Err(MetainfoError::InvalidMetainfo);
    }
    if path.is_absolute() || path == Path::new("/") {
        log::warn!("Path {:?} is absolute", path);
        return Err(MetainfoError::InvalidMetainfo);
    }
    // no `..` segments: a hostile torrent must not write outside the
    // download directory
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        log::warn!("Path {:?} escapes the download directory", path);
        return Err(MetainfoError::InvalidMetainfo);
    }
    Ok(())
}

mod raw {
    //! The shapes `serde_bencode` deserializes a torrent file into, before
    //! validation.

    use serde_bytes::ByteBuf;
    use serde_derive::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Metainfo {
        pub info: Info,
        /// The URL of the tracker.
        pub announce: Option<String>,
        #[serde(default)]
        #[serde(rename = "announce-list")]
        pub announce_list: Vec<Vec<String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Info {
        /// Suggested file name (single file) or directory name (archive).
        pub name: String,
        /// The concatenation of each piece's SHA-1 hash.
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_len: u32,
        /// The size of the file in bytes; present iff single file.
        #[serde(rename = "length")]
        pub len: Option<u64>,
        /// One entry per file; present iff multi file.
        pub files: Option<Vec<File>>,
        /// BEP 27.
        pub private: Option<u8>,
    }

    #[derive(Debug, Deserialize)]
    pub struct File {
        /// Subdirectory names, the last of which is the file name.
        pub path: Vec<String>,
        #[serde(rename = "length")]
        pub len: u64,
        /// BEP 47 attribute flags, a string drawn from "plxh".
        pub attr: Option<String>,
        /// BEP 47 symlink target path segments.
        #[serde(rename = "symlink path")]
        pub symlink_path: Option<Vec<String>>,
        /// BEP 47 optional whole-file SHA-1.
        pub sha1: Option<ByteBuf>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A small handcrafted single file torrent. The info hash below is the
    // SHA-1 of exactly the `info` value bytes.
    fn single_file_torrent() -> Vec<u8> {
        let pieces = [0xabu8; 20];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce23:http://tracker.test/ann4:info");
        buf.extend_from_slice(b"d6:lengthi16384e4:name5:t.bin12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "t.bin");
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.total_len(), 16384);
        assert!(!metainfo.is_archive());
        assert!(!metainfo.private);
        assert_eq!(metainfo.trackers.len(), 1);

        // the hash must cover the raw info slice
        let span = bencode::dict_entry_span(&buf, b"info").unwrap().unwrap();
        assert_eq!(metainfo.info_hash, sha1_digest(&buf[span]));
    }

    #[test]
    fn test_from_info_bytes_verifies_hash() {
        let buf = single_file_torrent();
        let span = bencode::dict_entry_span(&buf, b"info").unwrap().unwrap();
        let info_bytes = &buf[span];

        let ok = Metainfo::from_info_bytes(info_bytes, sha1_digest(info_bytes));
        assert!(ok.is_ok());

        let err = Metainfo::from_info_bytes(info_bytes, [0; 20]);
        assert!(matches!(err, Err(MetainfoError::InfoHashMismatch)));
    }

    #[test]
    fn test_multi_file_with_padding_and_attrs() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        // a: regular 10000 byte file
        buf.extend_from_slice(b"d6:lengthi10000e4:pathl1:aee");
        // pad: 6384 byte padding file
        buf.extend_from_slice(b"d4:attr1:p6:lengthi6384e4:pathl4:.pad4:6384ee");
        // b: 16384 byte executable file
        buf.extend_from_slice(b"d4:attr1:x6:lengthi16384e4:pathl1:bee");
        buf.extend_from_slice(b"e4:name3:dir12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&[0u8; 40]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.files.len(), 3);
        assert!(!metainfo.files[0].attributes.padding);
        assert!(metainfo.files[1].attributes.padding);
        assert!(metainfo.files[2].attributes.executable);
        // padding advances the offset accounting
        assert_eq!(metainfo.files[2].torrent_offset, 16384);
        assert_eq!(metainfo.total_len(), 2 * 16384);
    }

    #[test]
    fn test_rejects_path_escape() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi100e4:pathl2:..6:victimee");
        buf.extend_from_slice(b"e4:name3:dir12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_rejects_length_and_files() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi100e4:pathl1:aee");
        buf.extend_from_slice(b"e6:lengthi100e4:name1:t12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_announce_list_tiers_preserved() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d13:announce-listl");
        buf.extend_from_slice(b"l20:http://tier1-a.test/20:http://tier1-b.test/e");
        buf.extend_from_slice(b"l17:udp://tier2.test/ee");
        buf.extend_from_slice(b"4:infod6:lengthi16384e4:name1:t12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.trackers.len(), 2);
        assert_eq!(metainfo.trackers[0].len(), 2);
        assert_eq!(metainfo.trackers[1][0].scheme(), "udp");
    }

    #[test]
    fn test_private_flag() {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi16384e4:name1:t12:piece lengthi16384e6:pieces20:",
        );
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"7:privatei1eee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.private);
    }
}
