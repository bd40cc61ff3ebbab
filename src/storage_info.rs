use std::{ops::Range, path::PathBuf};

use crate::{
    error::metainfo::MetainfoError, metainfo::Metainfo, FileIndex, PieceIndex,
    Sha1Hash,
};

/// The BEP 47 per-file attributes.
///
/// The flag string in the metainfo draws from "plxh": padding, symlink,
/// executable, hidden. Unknown flags are ignored, per the BEP.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// The file exists only to align the next file on a piece boundary; it
    /// is never created on disk.
    pub padding: bool,
    /// The file is a symbolic link to `symlink_target`.
    pub symlink: bool,
    /// Set the executable permission bits after download (unix only).
    pub executable: bool,
    /// Set the hidden attribute after download (windows only; a no-op on
    /// unix).
    pub hidden: bool,
    /// The link target, present iff `symlink` is set. Relative to the
    /// download root.
    pub symlink_target: Option<PathBuf>,
    /// An optional whole-file SHA-1 to verify after the last piece
    /// overlapping the file is written.
    pub sha1: Option<Sha1Hash>,
}

impl FileAttributes {
    /// Parses the raw metainfo fields into validated attributes.
    pub(crate) fn parse(
        attr: Option<&str>,
        symlink_path: Option<&[String]>,
        sha1: Option<&[u8]>,
    ) -> Result<Self, MetainfoError> {
        let mut attrs = FileAttributes::default();
        for flag in attr.unwrap_or_default().chars() {
            match flag {
                'p' => attrs.padding = true,
                'l' => attrs.symlink = true,
                'x' => attrs.executable = true,
                'h' => attrs.hidden = true,
                _ => log::debug!("Ignoring unknown file attribute {:?}", flag),
            }
        }

        if attrs.symlink {
            let target: PathBuf = match symlink_path {
                Some(segments) if !segments.is_empty() => {
                    segments.iter().collect()
                }
                _ => {
                    log::warn!("Symlink attribute without a target");
                    return Err(MetainfoError::InvalidMetainfo);
                }
            };
            crate::metainfo::validate_path(&target)?;
            attrs.symlink_target = Some(target);
        }

        if let Some(sha1) = sha1 {
            if sha1.len() != 20 {
                log::warn!("Per-file sha1 is {} bytes, not 20", sha1.len());
                return Err(MetainfoError::InvalidMetainfo);
            }
            let mut hash = [0; 20];
            hash.copy_from_slice(sha1);
            attrs.sha1 = Some(hash);
        }

        Ok(attrs)
    }
}

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
    /// The file's BEP 47 attributes.
    pub attributes: FileAttributes,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the
    /// last bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at
    /// the given offset.
    ///
    /// # Arguments
    ///
    /// * `torrent_offset` - A byte offset in the entire torrent.
    /// * `len` - The length of the byte range, starting from the offset.
    ///   This may exceed the file length, in which case the returned slice
    ///   length will be smaller.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` is smaller than the file's offset in
    /// torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length, download length, etc.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent, padding
    /// included (pieces are hashed over the padded stream).
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of a single file download, this is the directory where the
    /// file is placed; for archives, this directory is the download
    /// directory joined by the torrent's name, so a multi-entry torrent
    /// doesn't scatter its files across the download directory.
    pub download_dir: PathBuf,
    /// All files in the torrent, in on-wire order, padding entries
    /// included.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let download_len = metainfo.total_len();
        let piece_len = metainfo.piece_len;
        let piece_count = metainfo.piece_count();
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into the torrent's own dir
        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.files.clone(),
        }
    }

    /// Returns the zero-based indices of the files of torrent that
    /// intersect with the piece.
    ///
    /// Padding files are part of the offset accounting but are filtered
    /// from the result: no bytes are ever written to or read from them.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Vec<FileIndex>, crate::error::Error> {
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the indices of the non-padding files that overlap with the
    /// given left-inclusive byte range of the torrent.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Vec<FileIndex> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, file)| {
                !file.attributes.padding
                    && file.torrent_offset < byte_range.end
                    && file.torrent_end_offset() > byte_range.start
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(
        &self,
        index: PieceIndex,
    ) -> Result<u32, crate::error::Error> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(crate::error::Error::InvalidPieceIndex)
        }
    }

    /// The absolute offset of the piece's first byte in the torrent.
    pub fn piece_torrent_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            torrent_offset,
            len,
            attributes: FileAttributes::default(),
        }
    }

    fn padding(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            attributes: FileAttributes {
                padding: true,
                ..Default::default()
            },
            ..file(path, torrent_offset, len)
        }
    }

    #[test]
    fn test_file_get_slice() {
        // the file doesn't need to exist as we're not doing any IO here
        let file = file("/tmp/does/not/exist", 200, 500);

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = file("/tmp/does/not/exist", 200, 500);
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = file("/tmp/does/not/exist", 200, 500);
        file.get_slice(200 + 500, 400);
    }

    #[test]
    fn test_files_intersecting_pieces() {
        // pieces: (index:first byte offset)
        // ----------------------------------------------------------------
        // |0:0         |1:16          |2:32          |3:48      |4:64    |
        // ----------------------------------------------------------------
        // files: (index:first byte offset,last byte offset)
        // ----------------------------------------------------------------
        // |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63   |6:64,71 |
        // ----------------------------------------------------------------
        let files = vec![
            file("/0", 0, 9),
            file("/1", 9, 11),
            file("/2", 20, 7),
            file("/3", 27, 9),
            file("/4", 36, 12),
            file("/5", 48, 16),
            file("/6", 64, 8),
        ];
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let info = StorageInfo {
            piece_count: 5,
            piece_len: 16,
            last_piece_len: 8,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        };

        assert_eq!(info.files_intersecting_piece(0).unwrap(), vec![0, 1]);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), vec![1, 2, 3]);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), vec![3, 4]);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), vec![5]);
        assert_eq!(info.files_intersecting_piece(4).unwrap(), vec![6]);
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn test_padding_files_are_skipped_but_align() {
        // [a: 10000][pad: 6384][b: 16384], piece_len 16384
        let files = vec![
            file("a", 0, 10000),
            padding(".pad/6384", 10000, 6384),
            file("b", 16384, 16384),
        ];
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 16384,
            last_piece_len: 16384,
            download_len: 2 * 16384,
            download_dir: PathBuf::from("/"),
            files,
        };

        // piece 0 covers `a` and the padding run, but only `a` is returned
        assert_eq!(info.files_intersecting_piece(0).unwrap(), vec![0]);
        // piece 1 is exactly `b`
        assert_eq!(info.files_intersecting_piece(1).unwrap(), vec![2]);
    }

    #[test]
    fn test_attribute_parsing() {
        let attrs = FileAttributes::parse(Some("xh"), None, None).unwrap();
        assert!(attrs.executable && attrs.hidden);
        assert!(!attrs.padding && !attrs.symlink);

        // symlink without target is invalid
        assert!(FileAttributes::parse(Some("l"), None, None).is_err());

        let segments = vec!["dir".to_string(), "target".to_string()];
        let attrs =
            FileAttributes::parse(Some("l"), Some(&segments), None).unwrap();
        assert_eq!(
            attrs.symlink_target.as_deref(),
            Some(std::path::Path::new("dir/target"))
        );

        // sha1 must be exactly 20 bytes
        assert!(FileAttributes::parse(None, None, Some(&[0; 19])).is_err());
        assert!(FileAttributes::parse(None, None, Some(&[0; 20])).is_ok());
    }
}
