use std::sync::atomic::{AtomicU32, Ordering};

use rand::seq::SliceRandom;

use crate::{Bitfield, BlockInfo, PieceIndex};

/// Tracks how many connected peers advertise each piece.
///
/// Peer sessions feed the counters from bitfield and have messages; the
/// request producer reads them to hand out the rarest pieces first. The
/// counters are atomic so sessions can bump them without going through the
/// coordinator.
#[derive(Debug)]
pub(crate) struct PiecePicker {
    avail: Vec<AtomicU32>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        let mut avail = Vec::with_capacity(piece_count);
        avail.resize_with(piece_count, AtomicU32::default);
        Self { avail }
    }

    pub fn piece_count(&self) -> usize {
        self.avail.len()
    }

    /// Registers every piece the peer's bitfield advertises. The caller has
    /// already truncated the bitfield to the piece count, so padding bits at
    /// the end of the last byte are not counted.
    pub fn register_bitfield(&self, bitfield: &Bitfield) {
        debug_assert!(bitfield.len() <= self.avail.len());
        for (index, have) in bitfield.iter().enumerate() {
            if *have {
                self.avail[index].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Registers a single announced piece. Indices past the end of the
    /// torrent are ignored.
    pub fn register_have(&self, index: PieceIndex) {
        match self.avail.get(index) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                log::trace!("Peer announced out of bounds piece {}", index);
            }
        }
    }

    pub fn availability(&self, index: PieceIndex) -> u32 {
        self.avail
            .get(index)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Orders request candidates so that blocks of the rarest pieces come
    /// first. Candidates of equal availability end up in random order, which
    /// spreads concurrent sessions across the torrent instead of having them
    /// all chase the same piece.
    pub fn order_rarest_first(&self, candidates: &mut [BlockInfo]) {
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        // stable sort: the shuffled order survives within each rarity class
        candidates.sort_by_key(|block| self.availability(block.piece_index));
    }
}
