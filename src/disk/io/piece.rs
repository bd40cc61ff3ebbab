use std::{collections::BTreeMap, sync::Mutex};

use sha1::{Digest, Sha1};

use crate::{
    blockinfo::block_count,
    error::disk::{ReadError, WriteError},
    iovecs,
    storage_info::StorageInfo,
    FileIndex, PieceIndex, Sha1Hash,
};

use super::file::TorrentFile;

/// An in-progress piece download that keeps the so far downloaded blocks
/// in memory, along with the expected hash of the piece.
pub struct Piece {
    /// The expected hash of the whole piece.
    pub expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash
    /// is correct, saved to disk.
    ///
    /// Blocks are mapped to their offset within the piece. A BTreeMap
    /// keeps them sorted by offset, which is important when hashing them
    /// one after the other and when writing them out.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The indices of the non-padding files this piece overlaps with,
    /// into the torrent's file list.
    pub file_indices: Vec<FileIndex>,
}

impl Piece {
    /// Places a block into the piece's write buffer if it isn't there yet.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        use std::collections::btree_map::Entry;
        match self.blocks.entry(offset) {
            Entry::Occupied(_) => {
                log::warn!("Duplicate piece block at offset {}", offset);
            }
            Entry::Vacant(entry) => {
                entry.insert(data);
            }
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes the piece's blocks and compares with the expected hash.
    ///
    /// The hash state is fed block by block, so peak memory stays at the
    /// already buffered blocks; no piece-sized contiguous buffer is made.
    ///
    /// # Important
    ///
    /// This is CPU-heavy for large pieces; it runs on a blocking thread,
    /// never the async executor.
    pub fn matches_hash(&self) -> bool {
        // sanity check that this is only called with all blocks present
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// Byte ranges covered by padding files are skipped: those bytes exist
    /// in the downloaded blocks (the hash covers them) but never on disk.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking; it runs on
    /// a blocking thread, never the async executor.
    pub fn write(
        &self,
        torrent_piece_offset: u64,
        files: &[Option<Mutex<TorrentFile>>],
    ) -> Result<usize, WriteError> {
        let mut slices: Vec<&[u8]> =
            self.blocks.values().map(Vec::as_slice).collect();
        debug_assert_eq!(iovecs::total_len(&slices), self.len as usize);

        let piece_end = torrent_piece_offset + self.len as u64;
        // the torrent offset where the remaining slices begin
        let mut cursor = torrent_piece_offset;
        let mut total_write_count = 0;

        for &file_index in &self.file_indices {
            let file = files[file_index]
                .as_ref()
                .expect("piece write buffer mapped to a padding file")
                .lock()
                .unwrap();

            // skip the bytes of any padding run before this file
            if file.info.torrent_offset > cursor {
                let gap = (file.info.torrent_offset - cursor) as usize;
                slices = iovecs::advance(&slices, gap);
                cursor = file.info.torrent_offset;
            }

            let file_slice = file.info.get_slice(cursor, piece_end - cursor);
            debug_assert!(file_slice.len > 0);

            let (head, tail) =
                iovecs::split_at_byte_bound(&slices, file_slice.len as usize);
            total_write_count += file.write_vectored_at(&head, file_slice)?;

            slices = tail;
            cursor += file_slice.len;
        }

        // anything left in the buffers is trailing padding, dropped by
        // construction
        debug_assert!(
            iovecs::total_len(&slices) as u64 == piece_end.saturating_sub(cursor)
        );

        Ok(total_write_count)
    }
}

/// Reads a whole piece back from disk into a contiguous buffer.
///
/// Byte ranges covered by padding files come back as zeroes, which is
/// exactly what was hashed at download time.
///
/// # Important
///
/// Sync IO; blocking thread only.
pub fn read_piece(
    info: &StorageInfo,
    index: PieceIndex,
    file_indices: &[FileIndex],
    files: &[Option<Mutex<TorrentFile>>],
    len: u32,
) -> Result<Vec<u8>, ReadError> {
    let piece_start = info.piece_torrent_offset(index);
    let piece_end = piece_start + len as u64;
    let mut data = vec![0u8; len as usize];

    for &file_index in file_indices {
        let file = files[file_index]
            .as_ref()
            .expect("piece read mapped to a padding file")
            .lock()
            .unwrap();

        let overlap_start = file.info.torrent_offset.max(piece_start);
        let file_slice =
            file.info.get_slice(overlap_start, piece_end - overlap_start);

        let buf_start = (overlap_start - piece_start) as usize;
        let buf_end = buf_start + file_slice.len as usize;
        file.read_exact_at(&mut data[buf_start..buf_end], file_slice.offset)?;
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage_info::{FileAttributes, FileInfo};
    use crate::BLOCK_LEN;

    fn make_files(
        dir: &std::path::Path,
        specs: &[(&str, u64, bool)],
    ) -> (Vec<FileInfo>, Vec<Option<Mutex<TorrentFile>>>) {
        let mut infos = Vec::new();
        let mut files = Vec::new();
        let mut offset = 0;
        for (name, len, padding) in specs {
            let info = FileInfo {
                path: PathBuf::from(name),
                len: *len,
                torrent_offset: offset,
                attributes: FileAttributes {
                    padding: *padding,
                    ..Default::default()
                },
            };
            offset += len;
            if *padding {
                files.push(None);
            } else {
                files.push(Some(Mutex::new(
                    TorrentFile::new(dir, info.clone()).unwrap(),
                )));
            }
            infos.push(info);
        }
        (infos, files)
    }

    fn piece_with_data(
        data: &[u8],
        file_indices: Vec<FileIndex>,
    ) -> Piece {
        let mut piece = Piece {
            expected_hash: {
                let digest = Sha1::digest(data);
                let mut hash = [0; 20];
                hash.copy_from_slice(&digest);
                hash
            },
            len: data.len() as u32,
            blocks: BTreeMap::new(),
            file_indices,
        };
        for (index, chunk) in data.chunks(BLOCK_LEN as usize).enumerate() {
            piece.enqueue_block(index as u32 * BLOCK_LEN, chunk.to_vec());
        }
        piece
    }

    #[test]
    fn test_duplicate_blocks_are_dropped() {
        let mut piece = Piece {
            expected_hash: [0; 20],
            len: 2 * BLOCK_LEN,
            blocks: BTreeMap::new(),
            file_indices: vec![0],
        };
        piece.enqueue_block(0, vec![1; BLOCK_LEN as usize]);
        piece.enqueue_block(0, vec![2; BLOCK_LEN as usize]);
        assert_eq!(piece.blocks[&0][0], 1);
        assert!(!piece.is_complete());
        piece.enqueue_block(BLOCK_LEN, vec![3; BLOCK_LEN as usize]);
        assert!(piece.is_complete());
    }

    #[test]
    fn test_piece_straddling_two_files() {
        // [a: 10000][b: 6384], one 16384 byte piece
        let dir = tempfile::tempdir().unwrap();
        let (_, files) =
            make_files(dir.path(), &[("a", 10000, false), ("b", 6384, false)]);

        let data: Vec<u8> =
            (0..16384u32).map(|i| (i % 251) as u8).collect();
        let piece = piece_with_data(&data, vec![0, 1]);
        assert!(piece.matches_hash());
        let written = piece.write(0, &files).unwrap();
        assert_eq!(written, 16384);

        let a = std::fs::read(dir.path().join("a")).unwrap();
        let b = std::fs::read(dir.path().join("b")).unwrap();
        assert_eq!(a.len(), 10000);
        assert_eq!(b.len(), 6384);
        assert_eq!(&a[..], &data[..10000]);
        assert_eq!(&b[..], &data[10000..]);
    }

    #[test]
    fn test_padding_file_bytes_are_not_written() {
        // [a: 10000][pad: 6384][b: 16384], two 16384 byte pieces
        let dir = tempfile::tempdir().unwrap();
        let (infos, files) = make_files(
            dir.path(),
            &[("a", 10000, false), (".pad", 6384, true), ("b", 16384, false)],
        );

        // piece 0: the bytes of `a` followed by the padding zeroes
        let mut piece0_data = vec![7u8; 10000];
        piece0_data.extend_from_slice(&[0u8; 6384]);
        let piece0 = piece_with_data(&piece0_data, vec![0]);
        piece0.write(0, &files).unwrap();

        // piece 1: the bytes of `b`
        let piece1_data = vec![9u8; 16384];
        let piece1 = piece_with_data(&piece1_data, vec![2]);
        piece1.write(16384, &files).unwrap();

        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), vec![7u8; 10000]);
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), vec![9u8; 16384]);
        // the padding file was never created
        assert!(!dir.path().join(".pad").exists());

        // reading the pieces back reproduces the hashed bytes, padding
        // included
        let storage = StorageInfo {
            piece_count: 2,
            piece_len: 16384,
            last_piece_len: 16384,
            download_len: 2 * 16384,
            download_dir: dir.path().to_path_buf(),
            files: infos,
        };
        let read0 = read_piece(&storage, 0, &[0], &files, 16384).unwrap();
        assert_eq!(read0, piece0_data);
        let read1 = read_piece(&storage, 1, &[2], &files, 16384).unwrap();
        assert_eq!(read1, piece1_data);
    }

    #[test]
    fn test_single_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (infos, files) =
            make_files(dir.path(), &[("t.bin", 16384, false)]);

        let data = vec![0u8; 16384];
        let piece = piece_with_data(&data, vec![0]);
        assert!(piece.matches_hash());
        piece.write(0, &files).unwrap();

        let on_disk = std::fs::read(dir.path().join("t.bin")).unwrap();
        assert_eq!(on_disk, data);

        let storage = StorageInfo {
            piece_count: 1,
            piece_len: 16384,
            last_piece_len: 16384,
            download_len: 16384,
            download_dir: dir.path().to_path_buf(),
            files: infos,
        };
        let read = read_piece(&storage, 0, &[0], &files, 16384).unwrap();
        assert_eq!(read, data);
    }
}
