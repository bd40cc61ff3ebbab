use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::{blockinfo::CachedBlock, PieceIndex, BLOCK_LEN};

/// A read cache of whole pieces, split into reference counted blocks.
///
/// Serving uploads reads pieces back from disk; peers tend to request the
/// blocks of a piece together and popular pieces repeatedly, so caching at
/// piece granularity with LRU eviction removes most repeat reads. Blocks
/// are handed out as `Arc`s: eviction doesn't invalidate a block a peer
/// session is still sending.
pub struct BlockCache {
    cache: LruCache<PieceIndex, Vec<CachedBlock>>,
}

impl BlockCache {
    /// Creates a cache bounded to roughly `size_mib` of piece data.
    pub fn new(size_mib: usize, piece_len: u32) -> Self {
        let capacity = ((size_mib * 1024 * 1024) / piece_len.max(1) as usize)
            .max(1);
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity is at least 1"),
            ),
        }
    }

    /// Returns the cached block at the offset of the piece, if present.
    pub fn get(
        &mut self,
        index: PieceIndex,
        offset: u32,
    ) -> Option<CachedBlock> {
        let blocks = self.cache.get(&index)?;
        blocks.get((offset / BLOCK_LEN) as usize).cloned()
    }

    /// Inserts a whole piece, splitting it into blocks.
    pub fn insert_piece(&mut self, index: PieceIndex, data: &[u8]) {
        let blocks = data
            .chunks(BLOCK_LEN as usize)
            .map(|chunk| Arc::new(chunk.to_vec()))
            .collect();
        self.cache.put(index, blocks);
    }

    /// Drops a piece, e.g. because its bytes on disk changed.
    pub fn invalidate(&mut self, index: PieceIndex) {
        self.cache.pop(&index);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_and_evict() {
        // room for exactly one 16 KiB piece per MiB... capacity math:
        // 1 MiB / 16 KiB = 64 pieces
        let mut cache = BlockCache::new(1, BLOCK_LEN);

        let piece: Vec<u8> = vec![0xab; 2 * BLOCK_LEN as usize];
        cache.insert_piece(0, &piece);

        let block = cache.get(0, BLOCK_LEN).unwrap();
        assert_eq!(block.len(), BLOCK_LEN as usize);
        assert!(cache.get(0, 4 * BLOCK_LEN).is_none());
        assert!(cache.get(1, 0).is_none());

        cache.invalidate(0);
        assert!(cache.get(0, 0).is_none());
    }

    #[test]
    fn test_lru_eviction_keeps_bound() {
        let mut cache = BlockCache::new(1, 1024 * 1024);
        // capacity is one piece; the second insert evicts the first
        cache.insert_piece(0, &[1u8; 8]);
        cache.insert_piece(1, &[2u8; 8]);
        assert!(cache.get(0, 0).is_none());
        assert!(cache.get(1, 0).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicted_blocks_stay_valid_for_holders() {
        let mut cache = BlockCache::new(1, 1024 * 1024);
        cache.insert_piece(0, &[7u8; 16]);
        let held = cache.get(0, 0).unwrap();
        cache.insert_piece(1, &[8u8; 16]);
        // the arc keeps the evicted block alive
        assert_eq!(held[0], 7);
    }
}
