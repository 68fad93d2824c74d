#![forbid(unsafe_code)]
//! Flash Block Manager.
//!
//! Owns per-plane block bookkeeping: the free-block pool, one write frontier
//! per stream for each of {user data, GC-relocated data, translation pages},
//! valid/invalid page counters, and the per-block service-state machine that
//! keeps user I/O and background relocation from racing on the same block.
//!
//! Failure policy: an empty free pool at allocation time is fatal
//! ([`FtlError::FreePoolExhausted`]) — GC back-pressure is supposed to make
//! that state unreachable, so hitting it means the GC thresholds cannot
//! sustain the workload.

pub mod block;
pub mod plane;

pub use block::{BlockRecord, BlockServiceState};
pub use plane::{FrontierKind, PlaneBookkeeping};

use fsim_error::{FtlError, Result};
use fsim_types::{Geometry, Lpa, PhysicalPageAddress, StreamId, TxHandle};
use tracing::trace;

/// Device-wide block manager; one [`PlaneBookkeeping`] per plane.
#[derive(Debug)]
pub struct FlashBlockManager {
    geometry: Geometry,
    planes: Vec<PlaneBookkeeping>,
}

impl FlashBlockManager {
    #[must_use]
    pub fn new(geometry: Geometry, stream_count: u8, dynamic_wearleveling: bool) -> Self {
        let planes = (0..geometry.plane_count())
            .map(|_| {
                PlaneBookkeeping::new(
                    geometry.blocks_per_plane,
                    geometry.pages_per_block,
                    stream_count,
                    dynamic_wearleveling,
                )
            })
            .collect();
        Self { geometry, planes }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn plane(&self, addr: &PhysicalPageAddress) -> &PlaneBookkeeping {
        &self.planes[self.geometry.plane_index(addr)]
    }

    pub fn plane_mut(&mut self, addr: &PhysicalPageAddress) -> &mut PlaneBookkeeping {
        let idx = self.geometry.plane_index(addr);
        &mut self.planes[idx]
    }

    #[must_use]
    pub fn plane_by_index(&self, index: usize) -> &PlaneBookkeeping {
        &self.planes[index]
    }

    #[must_use]
    pub fn block(&self, addr: &PhysicalPageAddress) -> &BlockRecord {
        &self.plane(addr).blocks[addr.block as usize]
    }

    fn block_mut(&mut self, addr: &PhysicalPageAddress) -> &mut BlockRecord {
        let block = addr.block as usize;
        &mut self.plane_mut(addr).blocks[block]
    }

    // -- page allocation ----------------------------------------------------

    /// Allocate the next page of the stream's user-data frontier into
    /// `addr.block`/`addr.page`. `addr` must already carry the plane
    /// coordinates chosen by the plane allocator.
    pub fn allocate_page_for_user_write(
        &mut self,
        stream: StreamId,
        addr: &mut PhysicalPageAddress,
    ) -> Result<()> {
        self.allocate_page(FrontierKind::Data, stream, addr)
    }

    /// Allocate from the GC frontier (relocation target pages).
    pub fn allocate_page_for_gc_write(
        &mut self,
        stream: StreamId,
        addr: &mut PhysicalPageAddress,
    ) -> Result<()> {
        self.allocate_page(FrontierKind::Gc, stream, addr)
    }

    /// Allocate from the translation-page frontier. `is_for_gc` marks
    /// write-backs generated on behalf of translation-page relocation.
    pub fn allocate_page_for_translation_write(
        &mut self,
        stream: StreamId,
        addr: &mut PhysicalPageAddress,
        is_for_gc: bool,
    ) -> Result<()> {
        trace!(
            target: "fsim::fbm",
            stream = stream.0,
            is_for_gc,
            "translation page allocation"
        );
        self.allocate_page(FrontierKind::Translation, stream, addr)
    }

    fn allocate_page(
        &mut self,
        kind: FrontierKind,
        stream: StreamId,
        addr: &mut PhysicalPageAddress,
    ) -> Result<()> {
        let pages_per_block = self.geometry.pages_per_block;
        let plane_idx = self.geometry.plane_index(addr);
        let plane = &mut self.planes[plane_idx];

        let mut frontier = plane.frontier(kind, stream);
        if plane.blocks[frontier as usize].write_index >= pages_per_block {
            // Frontier exhausted: rotate in a fresh block from the pool.
            plane.usage_history.push_back(frontier);
            let fresh = plane.pop_free_block().ok_or(FtlError::FreePoolExhausted {
                channel: addr.channel,
                chip: addr.chip,
                die: addr.die,
                plane: addr.plane,
            })?;
            let record = &mut plane.blocks[fresh as usize];
            record.stream = stream;
            record.holds_mapping_data = kind == FrontierKind::Translation;
            plane.set_frontier(kind, stream, fresh);
            trace!(
                target: "fsim::fbm",
                plane = plane_idx,
                retired = frontier,
                fresh,
                ?kind,
                "write frontier rotated"
            );
            frontier = fresh;
        }

        let record = &mut plane.blocks[frontier as usize];
        addr.block = frontier;
        addr.page = record.write_index;
        record.write_index += 1;
        plane.free_pages -= 1;
        plane.valid_pages += 1;
        debug_assert!(plane.counters_consistent());
        Ok(())
    }

    /// Record the LPA programmed into a just-allocated page (page metadata
    /// consulted later by relocation).
    pub fn record_mapped_lpa(&mut self, addr: &PhysicalPageAddress, lpa: Lpa) {
        let page = addr.page;
        self.block_mut(addr).record_mapped_lpa(page, lpa);
    }

    #[must_use]
    pub fn mapped_lpa(&self, addr: &PhysicalPageAddress) -> Option<Lpa> {
        self.block(addr).mapped_lpa(addr.page)
    }

    // -- invalidation and erase ---------------------------------------------

    /// Mark the page at `addr` invalid. Idempotent: a page already invalid
    /// leaves the bitmap and counters untouched.
    pub fn invalidate_page(&mut self, stream: StreamId, addr: &PhysicalPageAddress) -> Result<()> {
        let plane_idx = self.geometry.plane_index(addr);
        let plane = &mut self.planes[plane_idx];
        let record = &mut plane.blocks[addr.block as usize];
        if record.stream != stream && !record.holds_mapping_data {
            return Err(FtlError::BlockBookkeeping {
                detail: format!(
                    "stream {} invalidating page {addr} owned by stream {}",
                    stream.0, record.stream.0
                ),
            });
        }
        if addr.page >= record.write_index {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("invalidating unwritten page {addr}"),
            });
        }
        if record.invalidate_page(addr.page) {
            plane.valid_pages -= 1;
            plane.invalid_pages += 1;
        }
        debug_assert!(plane.counters_consistent());
        Ok(())
    }

    /// Return an erased block to the free pool, resetting its record.
    pub fn add_erased_block_to_pool(&mut self, addr: &PhysicalPageAddress) -> Result<()> {
        let plane_idx = self.geometry.plane_index(addr);
        let plane = &mut self.planes[plane_idx];
        let record = &mut plane.blocks[addr.block as usize];
        if record.valid_page_count() != 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!(
                    "erasing block {} with {} valid pages",
                    addr.block,
                    record.valid_page_count()
                ),
            });
        }
        if record.ongoing_background_programs != 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!(
                    "erasing block {} with {} background programs in flight",
                    addr.block, record.ongoing_background_programs
                ),
            });
        }
        let written = u64::from(record.write_index);
        let invalidated = u64::from(record.invalid_page_count);
        record.reset_after_erase();
        plane.free_pages += written;
        plane.invalid_pages -= invalidated;
        plane.erasing_blocks.remove(&addr.block);
        plane.usage_history.retain(|&id| id != addr.block);
        plane.push_free_block(addr.block);
        if !plane.counters_consistent() {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("plane {plane_idx} page counters diverged after erase"),
            });
        }
        trace!(target: "fsim::fbm", plane = plane_idx, block = addr.block, "block reclaimed");
        Ok(())
    }

    // -- user I/O tracking ---------------------------------------------------

    pub fn start_user_read(&mut self, addr: &PhysicalPageAddress) {
        let record = self.block_mut(addr);
        record.ongoing_user_reads += 1;
        record.note_user_io_started();
    }

    /// Returns `true` when a GC relocation parked on this block may now begin.
    pub fn finish_user_read(&mut self, addr: &PhysicalPageAddress) -> Result<bool> {
        let record = self.block_mut(addr);
        if record.ongoing_user_reads == 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("finish_user_read underflow on block {}", addr.block),
            });
        }
        record.ongoing_user_reads -= 1;
        Ok(record.note_user_io_finished())
    }

    pub fn start_user_program(&mut self, addr: &PhysicalPageAddress) {
        let record = self.block_mut(addr);
        record.ongoing_user_programs += 1;
        record.note_user_io_started();
    }

    pub fn finish_user_program(&mut self, addr: &PhysicalPageAddress) -> Result<bool> {
        let record = self.block_mut(addr);
        if record.ongoing_user_programs == 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("finish_user_program underflow on block {}", addr.block),
            });
        }
        record.ongoing_user_programs -= 1;
        Ok(record.note_user_io_finished())
    }

    /// Count a relocation or mapping write-back program landing on `addr`'s
    /// block. The block stays off the victim list until it finishes.
    pub fn start_background_program(&mut self, addr: &PhysicalPageAddress) {
        self.block_mut(addr).ongoing_background_programs += 1;
    }

    pub fn finish_background_program(&mut self, addr: &PhysicalPageAddress) -> Result<()> {
        let record = self.block_mut(addr);
        if record.ongoing_background_programs == 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("finish_background_program underflow on block {}", addr.block),
            });
        }
        record.ongoing_background_programs -= 1;
        Ok(())
    }

    // -- GC support ----------------------------------------------------------

    /// GC/WL claims the block at `addr`. Returns `true` when relocation may
    /// start now, `false` when it must wait for in-flight user reads.
    pub fn gc_claim_block(&mut self, addr: &PhysicalPageAddress, erase_tx: TxHandle) -> Result<bool> {
        let plane_idx = self.geometry.plane_index(addr);
        let plane = &mut self.planes[plane_idx];
        let record = &mut plane.blocks[addr.block as usize];
        if record.ongoing_user_programs > 0
            || record.ongoing_background_programs > 0
            || record.state.gc_in_progress()
        {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("block {} is not a legal GC victim", addr.block),
            });
        }
        record.erase_tx = Some(erase_tx);
        let ready = record.note_gc_started();
        plane.erasing_blocks.insert(addr.block);
        Ok(ready)
    }

    #[must_use]
    pub fn is_write_frontier(&self, addr: &PhysicalPageAddress, block_id: u32) -> bool {
        self.plane(addr).is_write_frontier(block_id)
    }

    #[must_use]
    pub fn free_block_count(&self, addr: &PhysicalPageAddress) -> usize {
        self.plane(addr).free_block_count()
    }

    /// A claim or erase is already in flight somewhere on this plane.
    #[must_use]
    pub fn reclamation_in_progress(&self, addr: &PhysicalPageAddress) -> bool {
        !self.plane(addr).erasing_blocks.is_empty()
    }

    #[must_use]
    pub fn min_max_erase_difference(&self, addr: &PhysicalPageAddress) -> u32 {
        self.plane(addr).min_max_erase_difference()
    }

    #[must_use]
    pub fn coldest_block_id(&self, addr: &PhysicalPageAddress) -> u32 {
        self.plane(addr).coldest_block_id()
    }

    /// Verify the plane page-count invariant; fatal when broken.
    pub fn check_consistency(&self, addr: &PhysicalPageAddress) -> Result<()> {
        let plane = self.plane(addr);
        if plane.counters_consistent() {
            Ok(())
        } else {
            Err(FtlError::BlockBookkeeping {
                detail: format!(
                    "plane {} counters: free {} + valid {} + invalid {} != total {}",
                    self.geometry.plane_index(addr),
                    plane.free_pages,
                    plane.valid_pages,
                    plane.invalid_pages,
                    plane.total_pages
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry {
            channels: 1,
            chips_per_channel: 1,
            dies_per_chip: 1,
            planes_per_die: 1,
            blocks_per_plane: 8,
            pages_per_block: 4,
            sectors_per_page: 8,
        }
    }

    fn addr() -> PhysicalPageAddress {
        PhysicalPageAddress::default()
    }

    #[test]
    fn allocation_walks_the_frontier_and_rotates() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let stream = StreamId(0);
        let mut last_block = None;
        for i in 0..5 {
            let mut a = addr();
            fbm.allocate_page_for_user_write(stream, &mut a).unwrap();
            if i < 4 {
                assert_eq!(a.page, i);
                last_block.get_or_insert(a.block);
                assert_eq!(Some(a.block), last_block);
            } else {
                // Fifth allocation lands on a freshly rotated block.
                assert_eq!(a.page, 0);
                assert_ne!(Some(a.block), last_block);
            }
        }
        fbm.check_consistency(&addr()).unwrap();
    }

    #[test]
    fn counters_track_allocation_invalidation_erase() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let stream = StreamId(0);
        let mut pages = Vec::new();
        for _ in 0..4 {
            let mut a = addr();
            fbm.allocate_page_for_user_write(stream, &mut a).unwrap();
            pages.push(a);
        }
        let plane = fbm.plane(&addr());
        assert_eq!(plane.valid_pages, 4);
        assert_eq!(plane.free_pages, plane.total_pages - 4);

        for page in &pages {
            fbm.invalidate_page(stream, page).unwrap();
        }
        // Idempotent re-invalidation.
        fbm.invalidate_page(stream, &pages[0]).unwrap();
        let plane = fbm.plane(&addr());
        assert_eq!(plane.valid_pages, 0);
        assert_eq!(plane.invalid_pages, 4);

        // Force a rotation so the filled block leaves the frontier, then
        // reclaim it.
        let mut a = addr();
        fbm.allocate_page_for_user_write(stream, &mut a).unwrap();
        let victim = pages[0];
        assert!(!fbm.is_write_frontier(&victim, victim.block));
        fbm.add_erased_block_to_pool(&victim).unwrap();
        let plane = fbm.plane(&addr());
        assert_eq!(plane.invalid_pages, 0);
        assert_eq!(fbm.block(&victim).erase_count, 1);
        fbm.check_consistency(&addr()).unwrap();
    }

    #[test]
    fn pool_exhaustion_is_fatal() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let stream = StreamId(0);
        // 8 blocks, 3 seeded as frontiers, 5 in the pool; 8 * 4 pages total.
        // Writing more pages than (5 + 1 frontier) * 4 without any GC must
        // eventually exhaust the pool.
        let mut result = Ok(());
        for _ in 0..33 {
            let mut a = addr();
            result = fbm.allocate_page_for_user_write(stream, &mut a);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(FtlError::FreePoolExhausted { .. })));
    }

    #[test]
    fn erase_with_valid_pages_is_rejected() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let mut a = addr();
        fbm.allocate_page_for_user_write(StreamId(0), &mut a).unwrap();
        assert!(matches!(
            fbm.add_erased_block_to_pool(&a),
            Err(FtlError::BlockBookkeeping { .. })
        ));
    }

    #[test]
    fn gc_claim_rejects_active_or_claimed_blocks() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let mut a = addr();
        fbm.allocate_page_for_user_write(StreamId(0), &mut a).unwrap();
        let handle = {
            let mut arena = fsim_types::TransactionArena::new();
            arena.insert(fsim_types::Transaction::new_gc_erase(StreamId(0), a, 0))
        };

        fbm.start_user_program(&a);
        assert!(fbm.gc_claim_block(&a, handle).is_err());
        fbm.finish_user_program(&a).unwrap();

        assert!(fbm.gc_claim_block(&a, handle).unwrap());
        // Second claim on the same block is illegal.
        assert!(fbm.gc_claim_block(&a, handle).is_err());
    }

    #[test]
    fn background_program_tracking_balances_or_faults() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let mut a = addr();
        fbm.allocate_page_for_gc_write(StreamId(0), &mut a).unwrap();
        fbm.start_background_program(&a);
        assert_eq!(fbm.block(&a).ongoing_background_programs, 1);
        fbm.finish_background_program(&a).unwrap();
        assert!(matches!(
            fbm.finish_background_program(&a),
            Err(FtlError::BlockBookkeeping { .. })
        ));
    }

    #[test]
    fn erase_with_inflight_background_program_is_rejected() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let mut a = addr();
        fbm.allocate_page_for_gc_write(StreamId(0), &mut a).unwrap();
        fbm.start_background_program(&a);
        fbm.invalidate_page(StreamId(0), &a).unwrap();
        assert!(matches!(
            fbm.add_erased_block_to_pool(&a),
            Err(FtlError::BlockBookkeeping { .. })
        ));
        fbm.finish_background_program(&a).unwrap();
        fbm.add_erased_block_to_pool(&a).unwrap();
    }

    #[test]
    fn waiting_gc_resumes_when_reads_drain() {
        let mut fbm = FlashBlockManager::new(geom(), 1, true);
        let mut a = addr();
        fbm.allocate_page_for_user_write(StreamId(0), &mut a).unwrap();
        let handle = {
            let mut arena = fsim_types::TransactionArena::new();
            arena.insert(fsim_types::Transaction::new_gc_erase(StreamId(0), a, 0))
        };
        fbm.start_user_read(&a);
        assert!(!fbm.gc_claim_block(&a, handle).unwrap());
        assert!(fbm.finish_user_read(&a).unwrap());
        assert_eq!(fbm.block(&a).state, BlockServiceState::GcWl);
    }
}
