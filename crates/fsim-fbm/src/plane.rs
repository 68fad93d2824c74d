//! Per-plane bookkeeping: page counters, the free-block pool, and write
//! frontiers.

use crate::block::BlockRecord;
use fsim_types::StreamId;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Which write frontier an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierKind {
    /// Ordinary user-data writes.
    Data,
    /// GC-relocated data.
    Gc,
    /// Translation (mapping) pages.
    Translation,
}

/// Bookkeeping for one plane.
///
/// The free pool is an ordered multimap keyed by erase count, which supports
/// both wear-aware allocation (pop the least-erased block) and "coldest
/// block" queries for static wear-leveling. When dynamic wear-leveling is
/// disabled every block keys at zero and the pool degenerates to FIFO reuse.
#[derive(Debug)]
pub struct PlaneBookkeeping {
    pub total_pages: u64,
    pub free_pages: u64,
    pub valid_pages: u64,
    pub invalid_pages: u64,
    pub blocks: Vec<BlockRecord>,
    free_pool: BTreeMap<u32, VecDeque<u32>>,
    free_count: usize,
    /// One frontier per stream per purpose, indexed by stream id.
    data_frontiers: Vec<u32>,
    gc_frontiers: Vec<u32>,
    translation_frontiers: Vec<u32>,
    /// Blocks in the order they were rotated out of a frontier (FIFO victims).
    pub usage_history: VecDeque<u32>,
    /// Blocks with an erase currently in flight.
    pub erasing_blocks: HashSet<u32>,
    dynamic_wearleveling: bool,
}

impl PlaneBookkeeping {
    /// Build a fresh plane: every block free, then one block drafted per
    /// stream for each of the three frontiers.
    ///
    /// Panics if the plane has too few blocks for its frontiers; the
    /// configuration layer validates this before construction.
    #[must_use]
    pub fn new(
        blocks_per_plane: u32,
        pages_per_block: u32,
        stream_count: u8,
        dynamic_wearleveling: bool,
    ) -> Self {
        let total_pages = u64::from(blocks_per_plane) * u64::from(pages_per_block);
        let blocks = (0..blocks_per_plane)
            .map(|id| BlockRecord::new(id, pages_per_block))
            .collect::<Vec<_>>();
        let mut plane = Self {
            total_pages,
            free_pages: total_pages,
            valid_pages: 0,
            invalid_pages: 0,
            blocks,
            free_pool: BTreeMap::new(),
            free_count: 0,
            data_frontiers: Vec::new(),
            gc_frontiers: Vec::new(),
            translation_frontiers: Vec::new(),
            usage_history: VecDeque::new(),
            erasing_blocks: HashSet::new(),
            dynamic_wearleveling,
        };
        for id in 0..blocks_per_plane {
            plane.push_free_block(id);
        }
        for stream in 0..stream_count {
            let stream = StreamId(stream);
            let data = plane.pop_free_block().expect("frontier seed");
            plane.blocks[data as usize].stream = stream;
            plane.data_frontiers.push(data);

            let gc = plane.pop_free_block().expect("frontier seed");
            plane.blocks[gc as usize].stream = stream;
            plane.gc_frontiers.push(gc);

            let translation = plane.pop_free_block().expect("frontier seed");
            plane.blocks[translation as usize].stream = stream;
            plane.blocks[translation as usize].holds_mapping_data = true;
            plane.translation_frontiers.push(translation);
        }
        plane
    }

    fn pool_key(&self, block_id: u32) -> u32 {
        if self.dynamic_wearleveling {
            self.blocks[block_id as usize].erase_count
        } else {
            0
        }
    }

    pub fn push_free_block(&mut self, block_id: u32) {
        let key = self.pool_key(block_id);
        self.free_pool.entry(key).or_default().push_back(block_id);
        self.free_count += 1;
    }

    /// Pop the least-erased free block (or the oldest-returned one when
    /// dynamic wear-leveling is off).
    pub fn pop_free_block(&mut self) -> Option<u32> {
        let (&key, _) = self.free_pool.iter().next()?;
        let bucket = self.free_pool.get_mut(&key)?;
        let block_id = bucket.pop_front()?;
        if bucket.is_empty() {
            self.free_pool.remove(&key);
        }
        self.free_count -= 1;
        Some(block_id)
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_count
    }

    #[must_use]
    pub fn frontier(&self, kind: FrontierKind, stream: StreamId) -> u32 {
        match kind {
            FrontierKind::Data => self.data_frontiers[stream.0 as usize],
            FrontierKind::Gc => self.gc_frontiers[stream.0 as usize],
            FrontierKind::Translation => self.translation_frontiers[stream.0 as usize],
        }
    }

    pub fn set_frontier(&mut self, kind: FrontierKind, stream: StreamId, block_id: u32) {
        match kind {
            FrontierKind::Data => self.data_frontiers[stream.0 as usize] = block_id,
            FrontierKind::Gc => self.gc_frontiers[stream.0 as usize] = block_id,
            FrontierKind::Translation => self.translation_frontiers[stream.0 as usize] = block_id,
        }
    }

    /// True when `block_id` is any stream's active write frontier.
    #[must_use]
    pub fn is_write_frontier(&self, block_id: u32) -> bool {
        self.data_frontiers.contains(&block_id)
            || self.gc_frontiers.contains(&block_id)
            || self.translation_frontiers.contains(&block_id)
    }

    /// Erase-count spread over all blocks of the plane.
    #[must_use]
    pub fn min_max_erase_difference(&self) -> u32 {
        let min = self.blocks.iter().map(|b| b.erase_count).min().unwrap_or(0);
        let max = self.blocks.iter().map(|b| b.erase_count).max().unwrap_or(0);
        max - min
    }

    /// Least-erased block of the plane (static wear-leveling candidate).
    #[must_use]
    pub fn coldest_block_id(&self) -> u32 {
        self.blocks
            .iter()
            .min_by_key(|b| b.erase_count)
            .map(|b| b.block_id)
            .unwrap_or(0)
    }

    /// `free + valid + invalid == total` must hold at every step.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        self.free_pages + self.valid_pages + self.invalid_pages == self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontiers_are_seeded_per_stream_and_purpose() {
        let plane = PlaneBookkeeping::new(16, 32, 2, true);
        assert_eq!(plane.free_block_count(), 16 - 6);
        let mut frontiers = HashSet::new();
        for stream in [StreamId(0), StreamId(1)] {
            for kind in [FrontierKind::Data, FrontierKind::Gc, FrontierKind::Translation] {
                assert!(frontiers.insert(plane.frontier(kind, stream)));
                assert!(plane.is_write_frontier(plane.frontier(kind, stream)));
            }
        }
        assert!(plane.blocks[plane.frontier(FrontierKind::Translation, StreamId(0)) as usize]
            .holds_mapping_data);
        assert!(plane.counters_consistent());
    }

    #[test]
    fn free_pool_pops_least_erased_first() {
        let mut plane = PlaneBookkeeping::new(8, 16, 1, true);
        // Drain the pool and re-insert with skewed erase counts.
        let mut drained = Vec::new();
        while let Some(id) = plane.pop_free_block() {
            drained.push(id);
        }
        for &id in &drained {
            plane.blocks[id as usize].erase_count = 10 + id;
        }
        plane.blocks[drained[2] as usize].erase_count = 1;
        for &id in &drained {
            plane.push_free_block(id);
        }
        assert_eq!(plane.pop_free_block(), Some(drained[2]));
    }

    #[test]
    fn round_robin_reuse_without_dynamic_wearleveling() {
        let mut plane = PlaneBookkeeping::new(8, 16, 1, false);
        let first = plane.pop_free_block().unwrap();
        plane.blocks[first as usize].erase_count = 99;
        plane.push_free_block(first);
        // Erase count is ignored: the pool is FIFO, so `first` comes out last.
        let mut seen = Vec::new();
        while let Some(id) = plane.pop_free_block() {
            seen.push(id);
        }
        assert_eq!(seen.last(), Some(&first));
    }

    #[test]
    fn erase_difference_and_coldest_block() {
        let mut plane = PlaneBookkeeping::new(4, 16, 1, true);
        plane.blocks[0].erase_count = 7;
        plane.blocks[2].erase_count = 3;
        assert_eq!(plane.min_max_erase_difference(), 7);
        assert_eq!(plane.coldest_block_id(), 1);
    }
}
