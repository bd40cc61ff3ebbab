use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use tokio::task;

use crate::{
    blockinfo::{Block, BlockInfo},
    chunking::ChunkStore,
    conf::DiskConf,
    disk::io::{
        cache::BlockCache,
        file::{self, TorrentFile},
        piece::{read_piece, Piece},
    },
    error::disk::{NewTorrentError, ReadError, WriteError},
    peer,
    storage_info::StorageInfo,
    torrent, FileIndex, PieceIndex,
};

/// Cuts a cached block down to the requested length. Requests are block
/// aligned, so a shorter request is always a prefix of the cached block.
fn trim_block(
    block: crate::blockinfo::CachedBlock,
    len: usize,
) -> crate::blockinfo::CachedBlock {
    if block.len() == len {
        block
    } else {
        Arc::new(block[..len.min(block.len())].to_vec())
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (the write buffer), the file handles,
/// the read cache and the dedup catalog.
pub struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to notify the torrent of piece completions and
    /// read errors.
    torrent_tx: torrent::Sender,
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// The number of blocks currently buffered, across all pieces. This is
    /// the queue depth the backpressure watermarks compare against.
    buffered_block_count: usize,
    /// Handles of all files in the torrent, opened in advance during
    /// torrent creation; `None` for padding entries, which never exist on
    /// disk.
    ///
    /// Writer threads get exclusive access to the file handles they need
    /// through the mutexes, referring to them by index (hence the arc).
    files: Arc<Vec<Option<Mutex<TorrentFile>>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// The pieces verified and handed to the OS. Recording a piece here is
    /// idempotent; a piece is never written twice.
    written_pieces: HashSet<PieceIndex>,
    /// The LRU read cache of recently served pieces.
    cache: BlockCache,
    /// Files written since the last fsync round.
    dirty_files: HashSet<FileIndex>,
    /// The content-defined dedup catalog, when enabled.
    chunks: Option<ChunkStore>,
    /// Disk IO statistics.
    pub stats: Stats,
}

#[derive(Debug, Default)]
pub struct Stats {
    /// The number of bytes successfully written to disk.
    pub write_count: u64,
    /// The number of times writing to disk failed.
    pub write_failure_count: usize,
    /// The number of bytes read from disk (cache misses).
    pub read_count: u64,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the
    /// file handles, skipping padding entries.
    ///
    /// `written_pieces` carries the verified pieces restored from
    /// a checkpoint; an empty set for a fresh download.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_tx: torrent::Sender,
        conf: &DiskConf,
        written_pieces: HashSet<PieceIndex>,
    ) -> Result<Self, NewTorrentError> {
        let mut files = Vec::with_capacity(info.files.len());
        for file_info in info.files.iter() {
            if file_info.attributes.padding {
                files.push(None);
            } else {
                files.push(Some(Mutex::new(TorrentFile::new(
                    &info.download_dir,
                    file_info.clone(),
                )?)));
            }
        }

        let cache = BlockCache::new(conf.cache_size_mib, info.piece_len);
        let chunks = conf
            .xet_chunking
            .enabled
            .then(|| ChunkStore::new(conf.xet_chunking.target_chunk_size));

        Ok(Self {
            info,
            torrent_tx,
            write_buf: HashMap::new(),
            buffered_block_count: 0,
            files: Arc::new(files),
            piece_hashes,
            written_pieces,
            cache,
            dirty_files: HashSet::new(),
            chunks,
            stats: Stats::default(),
        })
    }

    /// The current write queue depth, in blocks.
    pub fn queue_depth(&self) -> usize {
        self.buffered_block_count
    }

    pub fn written_piece_count(&self) -> usize {
        self.written_pieces.len()
    }

    /// Queues a block for writing. When the block completes its piece, the
    /// piece is hashed and, if valid, written out on a blocking thread;
    /// the outcome is reported to the torrent.
    pub async fn write_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<(), crate::error::Error> {
        log::trace!("Saving block {} to disk", block_info);

        let piece_index = block_info.piece_index;
        if self.written_pieces.contains(&piece_index) {
            // the piece already committed; this is a late duplicate
            log::debug!("Dropping block {} of written piece", block_info);
            return Ok(());
        }

        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(piece_index) {
                self.torrent_tx.send(torrent::Command::PieceCompletion {
                    index: piece_index,
                    result: Err(e),
                })?;
                // invalid input shouldn't abort the disk task itself
                return Ok(());
            }
        }
        let piece = self
            .write_buf
            .get_mut(&piece_index)
            .expect("newly started piece not in write buffer");

        let block_count_before = piece.blocks.len();
        piece.enqueue_block(block_info.offset, data);
        if piece.blocks.len() > block_count_before {
            self.buffered_block_count += 1;
        }

        if !piece.is_complete() {
            return Ok(());
        }

        // the piece has all its blocks: hash it and, if valid, write it
        // out, without blocking the async executor
        let piece = self.write_buf.remove(&piece_index).unwrap();
        self.buffered_block_count -= piece.blocks.len();

        let torrent_piece_offset = self.info.piece_torrent_offset(piece_index);
        let files = Arc::clone(&self.files);
        let chunker = self.chunks.as_ref().map(|c| c.chunker());

        let write_result = task::spawn_blocking(move || {
            if !piece.matches_hash() {
                log::warn!("Piece {} is NOT valid", piece_index);
                return Ok((false, 0, None));
            }

            log::debug!("Piece {} is valid", piece_index);
            let write_count =
                piece.write(torrent_piece_offset, &files)?;

            // the dedup digesting is CPU-bound too, so it stays on this
            // thread
            let digests = chunker.map(|chunker| {
                let mut data =
                    Vec::with_capacity(piece.len as usize);
                for block in piece.blocks.values() {
                    data.extend_from_slice(block);
                }
                chunker.digest_chunks(&data)
            });

            Ok::<_, WriteError>((true, write_count, digests))
        })
        .await
        .expect("disk IO write task panicked");

        match write_result {
            Ok((is_valid, write_count, digests)) => {
                if is_valid {
                    self.stats.write_count += write_count as u64;
                    self.written_pieces.insert(piece_index);
                    self.cache.invalidate(piece_index);
                    for file_index in
                        self.info.files_intersecting_piece(piece_index)?
                    {
                        self.dirty_files.insert(file_index);
                    }
                    if let (Some(store), Some(digests)) =
                        (self.chunks.as_mut(), digests)
                    {
                        store.fold(&digests);
                        log::trace!("Dedup stats: {:?}", store.stats());
                    }
                }

                self.torrent_tx.send(torrent::Command::PieceCompletion {
                    index: piece_index,
                    result: Ok(is_valid),
                })?;
            }
            Err(e) => {
                log::warn!("Disk write error: {}", e);
                self.stats.write_failure_count += 1;
                self.torrent_tx.send(torrent::Command::PieceCompletion {
                    index: piece_index,
                    result: Err(e),
                })?;
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, looking up its expected hash,
    /// length and the files it overlaps.
    fn start_new_piece(
        &mut self,
        piece_index: PieceIndex,
    ) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", piece_index);

        let hash_pos = piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }
        let mut expected_hash = [0; 20];
        expected_hash
            .copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);

        let len = self
            .info
            .piece_len(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let file_indices = self
            .info
            .files_intersecting_piece(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;

        let piece = Piece {
            expected_hash,
            len,
            blocks: Default::default(),
            file_indices,
        };
        self.write_buf.insert(piece_index, piece);
        Ok(())
    }

    /// Reads a block to serve an upload request, from the cache if
    /// possible, and sends it to the requesting peer session.
    pub async fn read_block(
        &mut self,
        block_info: BlockInfo,
        result_tx: peer::Sender,
    ) -> Result<(), crate::error::Error> {
        let piece_index = block_info.piece_index;

        let result = self.read_block_inner(block_info).await;
        match result {
            Ok(data) => {
                // the peer session may be gone; that's not an error
                let _ = result_tx.send(peer::Command::Block(Block {
                    piece_index,
                    offset: block_info.offset,
                    data: data.into(),
                }));
            }
            Err(error) => {
                log::warn!("Block {} read error: {}", block_info, error);
                self.torrent_tx.send(torrent::Command::ReadError {
                    block_info,
                    error,
                })?;
            }
        }
        Ok(())
    }

    async fn read_block_inner(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<crate::blockinfo::CachedBlock, ReadError> {
        let piece_index = block_info.piece_index;

        if !self.written_pieces.contains(&piece_index) {
            return Err(ReadError::MissingData);
        }
        let piece_len = self
            .info
            .piece_len(piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        if block_info.offset + block_info.len > piece_len {
            return Err(ReadError::InvalidBlockOffset);
        }

        if let Some(block) = self.cache.get(piece_index, block_info.offset) {
            return Ok(trim_block(block, block_info.len as usize));
        }

        // cache miss: read the whole piece on a blocking thread and
        // populate the cache with it
        let info = self.info.clone();
        let files = Arc::clone(&self.files);
        let file_indices = self
            .info
            .files_intersecting_piece(piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;

        let data = task::spawn_blocking(move || {
            read_piece(&info, piece_index, &file_indices, &files, piece_len)
        })
        .await
        .expect("disk IO read task panicked")?;

        self.stats.read_count += data.len() as u64;
        self.cache.insert_piece(piece_index, &data);

        self.cache
            .get(piece_index, block_info.offset)
            .map(|block| trim_block(block, block_info.len as usize))
            .ok_or(ReadError::InvalidBlockOffset)
    }

    /// Syncs all files written since the last round to disk.
    ///
    /// Called before a checkpoint is renamed into place and at shutdown:
    /// a piece reported verified must never be lost to a crash.
    pub async fn flush_and_sync(&mut self) -> Result<(), WriteError> {
        let dirty: Vec<FileIndex> = self.dirty_files.drain().collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let files = Arc::clone(&self.files);
        task::spawn_blocking(move || {
            for index in dirty {
                if let Some(file) = files[index].as_ref() {
                    let file = file.lock().unwrap();
                    file.handle.sync_all().map_err(WriteError::Io)?;
                }
            }
            Ok::<_, WriteError>(())
        })
        .await
        .expect("disk sync task panicked")
    }

    /// Resume-time consistency pass: every non-padding file must exist
    /// with exactly its final size (files are preallocated at creation).
    /// Returns the indices of files failing the check; all pieces
    /// overlapping them must be invalidated by the caller.
    pub fn verify_files(&self) -> Vec<FileIndex> {
        let mut corrupt = Vec::new();
        for (index, file_info) in self.info.files.iter().enumerate() {
            if file_info.attributes.padding {
                continue;
            }
            let path = self.info.download_dir.join(&file_info.path);
            let ok = std::fs::metadata(&path)
                .map(|m| m.len() == file_info.len)
                .unwrap_or(false);
            if !ok {
                log::warn!(
                    "File {:?} is missing or has the wrong size",
                    path
                );
                corrupt.push(index);
            }
        }
        corrupt
    }

    /// Forgets pieces previously recorded as written, e.g. because the
    /// file backing them turned out corrupt at resume.
    pub fn invalidate_pieces(
        &mut self,
        pieces: &HashSet<PieceIndex>,
    ) {
        for piece in pieces {
            self.written_pieces.remove(piece);
            self.cache.invalidate(*piece);
        }
    }

    /// The pieces overlapping any of the given files.
    pub fn pieces_overlapping_files(
        &self,
        file_indices: &[FileIndex],
    ) -> HashSet<PieceIndex> {
        let mut pieces = HashSet::new();
        for &file_index in file_indices {
            let file = &self.info.files[file_index];
            let first = (file.torrent_offset / self.info.piece_len as u64)
                as PieceIndex;
            let last = ((file.torrent_end_offset().saturating_sub(1))
                / self.info.piece_len as u64)
                as PieceIndex;
            for piece in first..=last.min(self.info.piece_count - 1) {
                pieces.insert(piece);
            }
        }
        pieces
    }

    /// Applies BEP 47 attributes to all files and optionally verifies the
    /// per-file SHA-1s. Returns the indices of files whose hash check
    /// failed.
    ///
    /// Called when the download completes and again on resume; attribute
    /// application is idempotent.
    pub async fn apply_attributes(&self) -> Result<Vec<FileIndex>, WriteError> {
        let info = self.info.clone();
        task::spawn_blocking(move || {
            let mut failed = Vec::new();
            for (index, file_info) in info.files.iter().enumerate() {
                if file_info.attributes.padding {
                    continue;
                }
                file::apply_attributes(&info.download_dir, file_info)?;
                if let Some(expected) = &file_info.attributes.sha1 {
                    let path = info.download_dir.join(&file_info.path);
                    match file::verify_file_sha1(&path, expected) {
                        Ok(true) => {}
                        Ok(false) => {
                            log::warn!("File {:?} failed its sha1", path);
                            failed.push(index);
                        }
                        Err(e) => {
                            log::warn!(
                                "File {:?} sha1 check error: {}",
                                path,
                                e
                            );
                            failed.push(index);
                        }
                    }
                }
            }
            Ok(failed)
        })
        .await
        .expect("disk attribute task panicked")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::storage_info::{FileAttributes, FileInfo};
    use crate::{blockinfo::BlockInfo, torrent::Command, BLOCK_LEN};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    fn storage(dir: &std::path::Path) -> StorageInfo {
        StorageInfo {
            piece_count: 2,
            piece_len: PIECE_LEN,
            last_piece_len: PIECE_LEN,
            download_len: 2 * PIECE_LEN as u64,
            download_dir: dir.to_path_buf(),
            files: vec![FileInfo {
                path: PathBuf::from("t.bin"),
                len: 2 * PIECE_LEN as u64,
                torrent_offset: 0,
                attributes: FileAttributes::default(),
            }],
        }
    }

    fn piece_bytes(seed: u8) -> Vec<u8> {
        (0..PIECE_LEN).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let digest = Sha1::digest(data);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn hashes(pieces: &[&[u8]]) -> Vec<u8> {
        pieces.iter().flat_map(|p| hash_of(p)).collect()
    }

    async fn write_piece(
        torrent: &mut Torrent,
        index: usize,
        data: &[u8],
    ) {
        for (block_index, chunk) in
            data.chunks(BLOCK_LEN as usize).enumerate()
        {
            torrent
                .write_block(
                    BlockInfo {
                        piece_index: index,
                        offset: block_index as u32 * BLOCK_LEN,
                        len: chunk.len() as u32,
                    },
                    chunk.to_vec(),
                )
                .await
                .unwrap();
        }
    }

    /// The full write path: blocks in, hash verification, the completion
    /// notification, the bytes durably in the file and readable back.
    #[tokio::test]
    async fn test_write_verify_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = crate::torrent::channel();
        let piece0 = piece_bytes(0);
        let piece1 = piece_bytes(7);

        let mut torrent = Torrent::new(
            storage(dir.path()),
            hashes(&[&piece0, &piece1]),
            tx,
            &DiskConf::default(),
            HashSet::new(),
        )
        .unwrap();

        write_piece(&mut torrent, 0, &piece0).await;
        match rx.try_recv().unwrap() {
            Command::PieceCompletion { index: 0, result: Ok(true) } => {}
            _ => panic!("expected piece 0 to verify"),
        }
        assert_eq!(torrent.written_piece_count(), 1);

        torrent.flush_and_sync().await.unwrap();
        let on_disk = std::fs::read(dir.path().join("t.bin")).unwrap();
        assert_eq!(&on_disk[..PIECE_LEN as usize], &piece0[..]);

        // the read path serves the verified piece back, via the cache
        let (peer_tx, mut peer_rx) =
            tokio::sync::mpsc::unbounded_channel();
        torrent
            .read_block(
                BlockInfo {
                    piece_index: 0,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN,
                },
                peer_tx,
            )
            .await
            .unwrap();
        match peer_rx.try_recv().unwrap() {
            crate::peer::Command::Block(block) => {
                assert_eq!(block.piece_index, 0);
                assert_eq!(block.offset, BLOCK_LEN);
                assert_eq!(
                    &block.data[..],
                    &piece0[BLOCK_LEN as usize..]
                );
            }
            _ => panic!("expected a block"),
        }

        // unverified pieces are not served
        let (peer_tx, _peer_rx) = tokio::sync::mpsc::unbounded_channel();
        torrent
            .read_block(
                BlockInfo {
                    piece_index: 1,
                    offset: 0,
                    len: BLOCK_LEN,
                },
                peer_tx,
            )
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            Command::ReadError {
                error: crate::error::ReadError::MissingData,
                ..
            } => {}
            _ => panic!("expected a missing data read error"),
        }
    }

    /// A complete piece whose bytes don't match the expected hash is not
    /// written and is reported invalid, so the torrent can re-queue it.
    #[tokio::test]
    async fn test_hash_mismatch_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = crate::torrent::channel();
        let piece0 = piece_bytes(0);

        let mut torrent = Torrent::new(
            storage(dir.path()),
            // expected hashes that the data won't match
            vec![0xee; 40],
            tx,
            &DiskConf::default(),
            HashSet::new(),
        )
        .unwrap();

        write_piece(&mut torrent, 0, &piece0).await;
        match rx.try_recv().unwrap() {
            Command::PieceCompletion { index: 0, result: Ok(false) } => {}
            _ => panic!("expected piece 0 to fail verification"),
        }
        assert_eq!(torrent.written_piece_count(), 0);

        // a subsequent correct delivery verifies fine
        let (tx2, _rx2) = crate::torrent::channel();
        let mut torrent2 = Torrent::new(
            storage(dir.path()),
            hashes(&[&piece0, &piece0]),
            tx2,
            &DiskConf::default(),
            HashSet::new(),
        )
        .unwrap();
        write_piece(&mut torrent2, 0, &piece0).await;
        assert_eq!(torrent2.written_piece_count(), 1);
    }

    /// Resume: verified pieces restored from a checkpoint are served
    /// without re-reading the payload; a mis-sized file invalidates the
    /// pieces overlapping it.
    #[tokio::test]
    async fn test_resume_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = crate::torrent::channel();
        let piece0 = piece_bytes(0);
        let piece1 = piece_bytes(7);

        // first run: download both pieces
        let mut torrent = Torrent::new(
            storage(dir.path()),
            hashes(&[&piece0, &piece1]),
            tx,
            &DiskConf::default(),
            HashSet::new(),
        )
        .unwrap();
        write_piece(&mut torrent, 0, &piece0).await;
        write_piece(&mut torrent, 1, &piece1).await;
        torrent.flush_and_sync().await.unwrap();
        drop(torrent);

        // second run: resume with both pieces recorded as verified
        let (tx, _rx) = crate::torrent::channel();
        let resumed = Torrent::new(
            storage(dir.path()),
            hashes(&[&piece0, &piece1]),
            tx,
            &DiskConf::default(),
            HashSet::from([0, 1]),
        )
        .unwrap();
        assert_eq!(resumed.written_piece_count(), 2);
        assert!(resumed.verify_files().is_empty());
        drop(resumed);

        // a truncated file fails the size check and takes its pieces
        // with it
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("t.bin"))
            .unwrap();
        file.set_len(10).unwrap();
        drop(file);

        let (tx, _rx) = crate::torrent::channel();
        let mut corrupted = Torrent::new(
            storage(dir.path()),
            hashes(&[&piece0, &piece1]),
            tx,
            &DiskConf::default(),
            HashSet::from([0, 1]),
        )
        .unwrap();
        // opening the torrent re-extends the file; shrink it again to
        // simulate discovering the truncation at scan time
        {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(dir.path().join("t.bin"))
                .unwrap();
            file.set_len(10).unwrap();
        }
        let corrupt_files = corrupted.verify_files();
        assert_eq!(corrupt_files, vec![0]);
        let invalid = corrupted.pieces_overlapping_files(&corrupt_files);
        assert_eq!(invalid, HashSet::from([0, 1]));
        corrupted.invalidate_pieces(&invalid);
        assert_eq!(corrupted.written_piece_count(), 0);
    }
}
