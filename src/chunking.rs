//! Content-defined chunking for the optional dedup store.
//!
//! Pieces are split at content-dependent boundaries with a gear rolling
//! hash, so identical byte runs produce identical chunks regardless of
//! their alignment within files. Chunks are identified by their BLAKE3
//! digest and reference counted: a duplicate chunk costs a refcount
//! increment instead of another copy of its bytes.

use std::collections::HashMap;
use std::ops::Range;

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// The per-byte random table of the gear hash.
///
/// Derived once from a fixed seed: chunk boundaries must be stable across
/// runs and hosts, or the dedup store would never see a repeat.
static GEAR_TABLE: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x6765_6172_6873_6831);
    let mut table = [0u64; 256];
    for entry in table.iter_mut() {
        *entry = rng.gen();
    }
    table
});

/// A chunk digest.
pub type ChunkId = [u8; 32];

/// The boundary parameters derived from a target chunk size.
#[derive(Clone, Copy, Debug)]
pub struct Chunker {
    /// A boundary is declared where `hash & mask == 0`; the mask has
    /// log2(target) bits set, making the expected chunk size the target.
    mask: u64,
    min_len: usize,
    max_len: usize,
}

impl Chunker {
    pub fn new(target_chunk_size: usize) -> Self {
        let target = target_chunk_size.next_power_of_two().max(256);
        Self {
            mask: (target as u64) - 1,
            min_len: target / 4,
            max_len: target * 4,
        }
    }

    /// Chunks the data and digests each chunk.
    ///
    /// This is the CPU-heavy half of deduplication, separated out so it
    /// can run on a blocking thread while the catalog fold stays with its
    /// owner.
    pub fn digest_chunks(&self, data: &[u8]) -> Vec<(ChunkId, usize)> {
        self.chunk_ranges(data)
            .into_iter()
            .map(|range| {
                let chunk = &data[range];
                (*blake3::hash(chunk).as_bytes(), chunk.len())
            })
            .collect()
    }

    /// Splits data into content-defined chunk ranges covering all of it.
    pub fn chunk_ranges(&self, data: &[u8]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;

        while start < data.len() {
            let mut hash: u64 = 0;
            let mut end = data.len().min(start + self.max_len);

            for (i, byte) in data[start..end].iter().enumerate() {
                hash = (hash << 1).wrapping_add(GEAR_TABLE[*byte as usize]);
                if i + 1 >= self.min_len && hash & self.mask == 0 {
                    end = start + i + 1;
                    break;
                }
            }

            ranges.push(start..end);
            start = end;
        }

        ranges
    }
}

/// One stored chunk.
#[derive(Debug)]
struct ChunkEntry {
    len: usize,
    ref_count: usize,
}

/// Running totals of what the store has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Bytes that created a new chunk.
    pub new_bytes: u64,
    /// Bytes that matched an existing chunk and were not stored again.
    pub dup_bytes: u64,
    /// The number of distinct chunks held.
    pub chunk_count: usize,
}

/// An in-memory chunk catalog with reference counting.
///
/// The catalog records which chunks exist and how often they occur; the
/// chunk bytes themselves stay in the torrent files, so the catalog's
/// memory cost is one digest and two counters per distinct chunk.
pub struct ChunkStore {
    chunker: Chunker,
    chunks: HashMap<ChunkId, ChunkEntry>,
    stats: DedupStats,
}

impl ChunkStore {
    pub fn new(target_chunk_size: usize) -> Self {
        Self {
            chunker: Chunker::new(target_chunk_size),
            chunks: HashMap::new(),
            stats: DedupStats::default(),
        }
    }

    /// The boundary parameters, for digesting off-thread.
    pub fn chunker(&self) -> Chunker {
        self.chunker
    }

    /// Chunks a verified piece and folds its chunks into the catalog.
    pub fn add_piece(&mut self, data: &[u8]) {
        let digests = self.chunker.digest_chunks(data);
        self.fold(&digests);
    }

    /// Folds pre-computed chunk digests into the catalog.
    pub fn fold(&mut self, digests: &[(ChunkId, usize)]) {
        for (id, len) in digests {
            match self.chunks.get_mut(id) {
                Some(entry) => {
                    entry.ref_count += 1;
                    self.stats.dup_bytes += *len as u64;
                }
                None => {
                    self.chunks.insert(
                        *id,
                        ChunkEntry {
                            len: *len,
                            ref_count: 1,
                        },
                    );
                    self.stats.new_bytes += *len as u64;
                    self.stats.chunk_count += 1;
                }
            }
        }
    }

    /// Whether the catalog holds a chunk with this digest.
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    /// Drops one reference of a chunk, removing it at zero.
    pub fn release(&mut self, id: &ChunkId) {
        if let Some(entry) = self.chunks.get_mut(id) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                self.stats.new_bytes =
                    self.stats.new_bytes.saturating_sub(entry.len as u64);
                self.stats.chunk_count -= 1;
                self.chunks.remove(id);
            }
        }
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_cover_input_exactly() {
        let chunker = Chunker::new(1024);
        let data: Vec<u8> =
            (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let ranges = chunker.chunk_ranges(&data);

        let mut expected_start = 0;
        for range in &ranges {
            assert_eq!(range.start, expected_start);
            assert!(range.end > range.start);
            expected_start = range.end;
        }
        assert_eq!(expected_start, data.len());

        // bounds hold for every chunk but the last
        for range in &ranges[..ranges.len() - 1] {
            assert!(range.len() >= 256);
            assert!(range.len() <= 4096);
        }
    }

    #[test]
    fn test_boundaries_are_content_defined() {
        // the same content shifted by an arbitrary prefix must re-align:
        // after the first boundary past the prefix, chunk ids repeat
        let chunker = Chunker::new(1024);
        let mut rng = StdRng::seed_from_u64(42);
        let content: Vec<u8> = (0..32_768).map(|_| rng.gen()).collect();

        let mut shifted = vec![0xaau8; 301];
        shifted.extend_from_slice(&content);

        let ids = |data: &[u8]| -> Vec<ChunkId> {
            chunker
                .chunk_ranges(data)
                .into_iter()
                .map(|r| *blake3::hash(&data[r]).as_bytes())
                .collect()
        };

        let original_ids = ids(&content);
        let shifted_ids = ids(&shifted);

        // at least half of the original chunks must reappear despite the
        // shift; fixed-size chunking would share none of them
        let shared = original_ids
            .iter()
            .filter(|id| shifted_ids.contains(id))
            .count();
        assert!(
            shared * 2 >= original_ids.len(),
            "only {} of {} chunks survived the shift",
            shared,
            original_ids.len()
        );
    }

    #[test]
    fn test_store_counts_duplicates() {
        let mut store = ChunkStore::new(1024);
        let mut rng = StdRng::seed_from_u64(7);
        let piece: Vec<u8> = (0..16_384).map(|_| rng.gen()).collect();

        store.add_piece(&piece);
        let first = store.stats();
        assert_eq!(first.dup_bytes, 0);
        assert_eq!(first.new_bytes, piece.len() as u64);

        // the same piece again: everything deduplicates
        store.add_piece(&piece);
        let second = store.stats();
        assert_eq!(second.new_bytes, first.new_bytes);
        assert_eq!(second.dup_bytes, piece.len() as u64);
        assert_eq!(second.chunk_count, first.chunk_count);
    }
}
