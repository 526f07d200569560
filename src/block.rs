use std::time::Instant;

use crate::{storage_info::StorageInfo, BlockInfo};

/// Where a block is in its download lifecycle.
///
/// The status only ever advances: not requested, requested, downloaded.
/// `Downloaded` is terminal; a block delivered twice keeps its first payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    NotRequested,
    Requested,
    Downloaded,
}

/// A single entry of the coordinator's block table: the block's identity, its
/// download status, and, once downloaded, its payload.
#[derive(Debug)]
pub(crate) struct Block {
    pub info: BlockInfo,
    pub status: BlockStatus,
    /// Empty until the block is downloaded, then exactly `info.len` bytes.
    pub data: Vec<u8>,
    /// When the block was last handed to the request queue. Used to detect
    /// requests stranded by silently dropped peers.
    pub requested_at: Option<Instant>,
}

impl Block {
    fn new(info: BlockInfo) -> Self {
        Self {
            info,
            status: BlockStatus::NotRequested,
            data: Vec::new(),
            requested_at: None,
        }
    }
}

/// Splits the download into its blocks, ordered by piece index and then by
/// offset within the piece.
///
/// Every piece is cut into `block_size` long chunks, except that the last
/// block of a piece stops at the piece boundary and the last piece stops at
/// the download length. For pieces shorter than `block_size` this degenerates
/// to one block per piece.
pub(crate) fn partition(
    storage: &StorageInfo,
    block_size: u32,
) -> Vec<Block> {
    let mut blocks = Vec::new();
    for piece_index in 0..storage.piece_count {
        let piece_start = piece_index as u64 * storage.piece_len as u64;
        let piece_end =
            std::cmp::min(piece_start + storage.piece_len as u64, storage.download_len);
        let piece_len = (piece_end - piece_start) as u32;

        let mut offset = 0;
        while offset < piece_len {
            let len = std::cmp::min(block_size, piece_len - offset);
            blocks.push(Block::new(BlockInfo {
                piece_index,
                offset,
                len,
            }));
            offset += len;
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::test_storage;
    use pretty_assertions::assert_eq;

    fn infos(blocks: &[Block]) -> Vec<(usize, u32, u32)> {
        blocks
            .iter()
            .map(|b| (b.info.piece_index, b.info.offset, b.info.len))
            .collect()
    }

    // Checks the partition invariants: blocks tile the download without gaps
    // or overlaps, in (piece, offset) order.
    fn assert_tiles(storage: &StorageInfo, block_size: u32, blocks: &[Block]) {
        let mut absolute = 0u64;
        for block in blocks {
            let start = block.info.piece_index as u64
                * storage.piece_len as u64
                + block.info.offset as u64;
            assert_eq!(start, absolute, "gap or overlap at {:?}", block.info);
            assert!(block.info.len >= 1 && block.info.len <= block_size);
            absolute += block.info.len as u64;
        }
        assert_eq!(absolute, storage.download_len);

        let expected_count: usize = (0..storage.piece_count)
            .map(|index| {
                let piece_len = storage.piece_len(index).unwrap();
                ((piece_len + block_size - 1) / block_size) as usize
            })
            .sum();
        assert_eq!(blocks.len(), expected_count);
    }

    #[test]
    fn test_partition_tiny() {
        // 3 pieces of 8/8/1 bytes, cut into 4 byte blocks
        let storage = test_storage(8, 17);
        let blocks = partition(&storage, 4);

        assert_eq!(
            infos(&blocks),
            vec![(0, 0, 4), (0, 4, 4), (1, 0, 4), (1, 4, 4), (2, 0, 1)]
        );
        assert_tiles(&storage, 4, &blocks);
    }

    #[test]
    fn test_partition_block_aligned() {
        // every piece is exactly one block
        let storage = test_storage(16384, 65536);
        let blocks = partition(&storage, 16384);

        assert_eq!(
            infos(&blocks),
            vec![(0, 0, 16384), (1, 0, 16384), (2, 0, 16384), (3, 0, 16384)]
        );
        assert_tiles(&storage, 16384, &blocks);
    }

    #[test]
    fn test_partition_piece_smaller_than_block() {
        // the block size clamps to the piece length
        let storage = test_storage(4, 9);
        let blocks = partition(&storage, 16384);

        assert_eq!(infos(&blocks), vec![(0, 0, 4), (1, 0, 4), (2, 0, 1)]);
        assert_tiles(&storage, 4, &blocks);
    }

    #[test]
    fn test_partition_single_byte() {
        let storage = test_storage(16384, 1);
        let blocks = partition(&storage, 16384);

        assert_eq!(infos(&blocks), vec![(0, 0, 1)]);
    }

    #[test]
    fn test_partition_uneven_last_blocks() {
        // a piece length that is not a multiple of the block size: every
        // piece ends in a short block, and the last piece is shorter still
        let storage = test_storage(10, 25);
        let blocks = partition(&storage, 4);

        assert_eq!(
            infos(&blocks),
            vec![
                (0, 0, 4),
                (0, 4, 4),
                (0, 8, 2),
                (1, 0, 4),
                (1, 4, 4),
                (1, 8, 2),
                (2, 0, 4),
                (2, 4, 1),
            ]
        );
        assert_tiles(&storage, 4, &blocks);
    }
}
