use std::net::SocketAddr;

use crate::{
    blockinfo::{block_count, block_len, BlockInfo},
    PieceIndex, BLOCK_LEN,
};

/// The status of a single block within an in-progress piece download.
#[derive(Clone, Debug, PartialEq, Eq)]
enum BlockStatus {
    /// Not requested from anyone.
    Free,
    /// Requested from the listed peers. Outside endgame the list has one
    /// entry; in endgame the same block may be in flight to several peers.
    Requested(Vec<SocketAddr>),
    /// Received and held in the disk write buffer.
    Received,
}

/// The outcome of offering a received block to a [`PieceDownload`].
#[derive(Debug, PartialEq, Eq)]
pub enum BlockReceipt {
    /// The block was accepted. Any other peers the block was in flight to
    /// are returned so the caller can send them cancels.
    Accepted { duplicates_of: Vec<SocketAddr> },
    /// The block was already received earlier; this copy is waste.
    Duplicate,
    /// The (offset, length) pair does not name a block of this piece, or
    /// nobody requested it. The data must not be written.
    Invalid,
}

/// Tracks a single piece's block-level download state.
///
/// The download does not own block data; received bytes travel straight to
/// the disk task's write buffer. What is tracked here is which blocks are
/// free, which are in flight and to whom, so that request scheduling,
/// endgame duplication and peer-loss cleanup all have one source of truth.
pub struct PieceDownload {
    index: PieceIndex,
    len: u32,
    blocks: Vec<BlockStatus>,
    received_count: usize,
    /// The peers whose block deliveries were accepted into this piece,
    /// for reliability accounting when the assembled piece fails its
    /// hash.
    contributors: Vec<SocketAddr>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockStatus::Free; block_count(len)],
            received_count: 0,
            contributors: Vec::new(),
        }
    }

    /// The peers that contributed accepted blocks to this piece.
    pub fn contributors(&self) -> &[SocketAddr] {
        &self.contributors
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `n` blocks for the peer and appends them to `buf`,
    /// marking them in flight. Returns how many were picked.
    ///
    /// Free blocks are picked first. In endgame, blocks already in flight
    /// to other peers are eligible too (each peer at most once per block).
    pub fn pick_blocks(
        &mut self,
        n: usize,
        peer: SocketAddr,
        in_endgame: bool,
        buf: &mut Vec<BlockInfo>,
    ) -> usize {
        let mut picked = 0;

        for pass_requested in [false, true] {
            if pass_requested && !in_endgame {
                break;
            }
            for (block_index, block) in self.blocks.iter_mut().enumerate() {
                if picked == n {
                    break;
                }
                let eligible = match block {
                    BlockStatus::Free => !pass_requested,
                    BlockStatus::Requested(peers) => {
                        pass_requested && !peers.contains(&peer)
                    }
                    BlockStatus::Received => false,
                };
                if !eligible {
                    continue;
                }

                match block {
                    BlockStatus::Free => {
                        *block = BlockStatus::Requested(vec![peer]);
                    }
                    BlockStatus::Requested(peers) => peers.push(peer),
                    BlockStatus::Received => unreachable!(),
                }
                buf.push(BlockInfo {
                    piece_index: self.index,
                    offset: block_index as u32 * BLOCK_LEN,
                    len: block_len(self.len, block_index),
                });
                picked += 1;
            }
            if picked == n {
                break;
            }
        }

        picked
    }

    /// Records a block delivery from a peer.
    ///
    /// Only blocks that are actually in flight are accepted; anything else
    /// is rejected so that an unsolicited or repeated `piece` message can
    /// never advance the received byte count past the piece length.
    pub fn received_block(
        &mut self,
        block: &BlockInfo,
        from: SocketAddr,
    ) -> BlockReceipt {
        debug_assert_eq!(block.piece_index, self.index);

        // validate the block against the piece geometry
        if block.offset % BLOCK_LEN != 0 {
            return BlockReceipt::Invalid;
        }
        let block_index = (block.offset / BLOCK_LEN) as usize;
        if block_index >= self.blocks.len()
            || block.len != block_len(self.len, block_index)
        {
            return BlockReceipt::Invalid;
        }

        match std::mem::replace(
            &mut self.blocks[block_index],
            BlockStatus::Received,
        ) {
            BlockStatus::Requested(peers) => {
                self.received_count += 1;
                if !self.contributors.contains(&from) {
                    self.contributors.push(from);
                }
                BlockReceipt::Accepted {
                    duplicates_of: peers
                        .into_iter()
                        .filter(|peer| *peer != from)
                        .collect(),
                }
            }
            BlockStatus::Received => BlockReceipt::Duplicate,
            BlockStatus::Free => {
                // nobody asked for this block; restore and reject
                self.blocks[block_index] = BlockStatus::Free;
                BlockReceipt::Invalid
            }
        }
    }

    /// Releases all blocks in flight to the given peer, e.g. on disconnect
    /// or cancellation.
    ///
    /// A block becomes free again only when no other peer has it in
    /// flight. Returns exactly the blocks that were freed, so they can be
    /// re-scheduled; blocks still in flight elsewhere are not returned and
    /// not double-released.
    pub fn cancel_blocks(&mut self, peer: SocketAddr) -> Vec<BlockInfo> {
        let mut freed = Vec::new();
        for (block_index, block) in self.blocks.iter_mut().enumerate() {
            if let BlockStatus::Requested(peers) = block {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *block = BlockStatus::Free;
                    freed.push(BlockInfo {
                        piece_index: self.index,
                        offset: block_index as u32 * BLOCK_LEN,
                        len: block_len(self.len, block_index),
                    });
                }
            }
        }
        freed
    }

    /// Returns all blocks to the free state, discarding receipt bookkeeping.
    /// Used when the assembled piece failed its hash check.
    pub fn free_all_blocks(&mut self) {
        for block in self.blocks.iter_mut() {
            *block = BlockStatus::Free;
        }
        self.received_count = 0;
        self.contributors.clear();
    }

    /// Returns true if all blocks of the piece were received.
    pub fn is_complete(&self) -> bool {
        self.received_count == self.blocks.len()
    }

    /// The number of blocks neither in flight nor received.
    pub fn free_block_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockStatus::Free))
            .count()
    }

    /// The peers that currently have blocks of this piece in flight.
    pub fn requesting_peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                BlockStatus::Requested(peers) => Some(peers.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN + 1000;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn block(offset: u32, len: u32) -> BlockInfo {
        BlockInfo {
            piece_index: 0,
            offset,
            len,
        }
    }

    #[test]
    fn test_pick_blocks_in_order() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut buf = Vec::new();
        assert_eq!(download.pick_blocks(2, addr(1), false, &mut buf), 2);
        assert_eq!(buf[0], block(0, BLOCK_LEN));
        assert_eq!(buf[1], block(BLOCK_LEN, BLOCK_LEN));

        // the last block is shorter
        buf.clear();
        assert_eq!(download.pick_blocks(5, addr(1), false, &mut buf), 1);
        assert_eq!(buf[0], block(2 * BLOCK_LEN, 1000));

        // everything in flight now
        buf.clear();
        assert_eq!(download.pick_blocks(1, addr(2), false, &mut buf), 0);
    }

    #[test]
    fn test_received_block_accounting() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut buf = Vec::new();
        download.pick_blocks(3, addr(1), false, &mut buf);

        assert_eq!(
            download.received_block(&block(0, BLOCK_LEN), addr(1)),
            BlockReceipt::Accepted {
                duplicates_of: vec![]
            }
        );
        // receiving the same block twice is waste
        assert_eq!(
            download.received_block(&block(0, BLOCK_LEN), addr(1)),
            BlockReceipt::Duplicate
        );

        // misaligned offset, bad length, out of bounds index
        assert_eq!(
            download.received_block(&block(3, BLOCK_LEN), addr(1)),
            BlockReceipt::Invalid
        );
        assert_eq!(
            download.received_block(&block(BLOCK_LEN, 5), addr(1)),
            BlockReceipt::Invalid
        );
        assert_eq!(
            download.received_block(&block(8 * BLOCK_LEN, BLOCK_LEN), addr(1)),
            BlockReceipt::Invalid
        );

        assert!(!download.is_complete());
        assert_eq!(
            download.received_block(&block(BLOCK_LEN, BLOCK_LEN), addr(1)),
            BlockReceipt::Accepted {
                duplicates_of: vec![]
            }
        );
        assert_eq!(
            download.received_block(&block(2 * BLOCK_LEN, 1000), addr(1)),
            BlockReceipt::Accepted {
                duplicates_of: vec![]
            }
        );
        assert!(download.is_complete());
        assert_eq!(download.contributors(), &[addr(1)]);
    }

    #[test]
    fn test_unrequested_block_is_rejected() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        // nothing was picked: a structurally valid block must be refused
        assert_eq!(
            download.received_block(&block(0, BLOCK_LEN), addr(1)),
            BlockReceipt::Invalid
        );
        assert!(!download.is_complete());
        assert_eq!(download.free_block_count(), 3);
    }

    #[test]
    fn test_cancel_releases_exactly_own_blocks() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut buf = Vec::new();
        download.pick_blocks(2, addr(1), false, &mut buf);
        download.pick_blocks(1, addr(2), false, &mut buf);

        let freed = download.cancel_blocks(addr(1));
        assert_eq!(
            freed,
            vec![block(0, BLOCK_LEN), block(BLOCK_LEN, BLOCK_LEN)]
        );
        // a second cancel must not double-release
        assert!(download.cancel_blocks(addr(1)).is_empty());
        // the other peer's block stays in flight
        assert_eq!(download.free_block_count(), 2);
    }

    #[test]
    fn test_endgame_duplicate_requests() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut buf = Vec::new();
        download.pick_blocks(3, addr(1), false, &mut buf);

        // outside endgame a second peer gets nothing
        buf.clear();
        assert_eq!(download.pick_blocks(3, addr(2), false, &mut buf), 0);
        // in endgame it may duplicate the in-flight blocks, once
        assert_eq!(download.pick_blocks(3, addr(2), true, &mut buf), 3);
        assert_eq!(download.pick_blocks(3, addr(2), true, &mut buf), 0);

        // when the block arrives, the other requester is reported for
        // cancellation (the deliverer itself is not)
        match download.received_block(&block(0, BLOCK_LEN), addr(2)) {
            BlockReceipt::Accepted { duplicates_of } => {
                assert_eq!(duplicates_of, vec![addr(1)]);
            }
            other => panic!("unexpected receipt: {:?}", other),
        }

        // canceling one endgame requester must not free a block the other
        // still has in flight
        let freed = download.cancel_blocks(addr(2));
        assert!(freed.is_empty());
        let freed = download.cancel_blocks(addr(1));
        assert_eq!(freed.len(), 2);
    }

    #[test]
    fn test_free_all_blocks_on_hash_failure() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut buf = Vec::new();
        download.pick_blocks(3, addr(1), false, &mut buf);
        for info in &buf {
            download.received_block(info, addr(1));
        }
        assert!(download.is_complete());

        download.free_all_blocks();
        assert!(!download.is_complete());
        assert_eq!(download.free_block_count(), 3);
    }
}
