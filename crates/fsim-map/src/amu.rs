//! Address Mapping Unit.
//!
//! Orchestrates translation (through the per-stream domains and the CMT),
//! page allocation for writes, and the barrier protocol that protects
//! in-flight GC relocations. The AMU never talks to the scheduler directly:
//! [`translate_and_dispatch`](AddressMappingUnit::translate_and_dispatch)
//! returns the transactions that became dispatchable plus any mapping
//! transactions it generated, and the caller submits both.

use crate::barrier::BarrierControl;
use crate::cmt::{CachedMappingTable, SlotStatus};
use crate::domain::DomainState;
use crate::plane_allocator::allocate_plane;
use fsim_config::{CmtSharingMode, PlaneAllocationScheme, SimConfig};
use fsim_error::{FtlError, Result};
use fsim_fbm::FlashBlockManager;
use fsim_types::{
    Geometry, Lpa, Mvpn, PhysicalPageAddress, Ppa, SectorBitmap, StreamId, Transaction,
    TransactionArena, TransactionKind, TxHandle,
};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Per-stream translation counters, exported into the run report.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingStats {
    pub translations: u64,
    pub cmt_hits: u64,
    pub cmt_misses: u64,
}

/// Result of a translation pass.
#[derive(Debug, Default)]
pub struct TranslationOutcome {
    /// Transactions whose physical address is now final; submit to the TSU.
    pub ready: Vec<TxHandle>,
    /// Mapping reads/writes generated along the way; also submit to the TSU.
    pub generated: Vec<TxHandle>,
}

impl TranslationOutcome {
    pub fn merge(&mut self, other: TranslationOutcome) {
        self.ready.extend(other.ready);
        self.generated.extend(other.generated);
    }
}

#[derive(Debug)]
pub struct AddressMappingUnit {
    geometry: Geometry,
    scheme: PlaneAllocationScheme,
    ideal: bool,
    sharing: CmtSharingMode,
    cmts: Vec<CachedMappingTable>,
    /// Misses deferred because their CMT was full of in-flight reservations,
    /// one queue per table. Replayed when the next fetch lands.
    stalled: Vec<VecDeque<TxHandle>>,
    domains: Vec<DomainState>,
    barrier: BarrierControl,
    write_stamp: u64,
    stats: Vec<MappingStats>,
}

impl AddressMappingUnit {
    pub fn new(config: &SimConfig) -> Result<Self> {
        let geometry = config.device.geometry();
        let stream_count = config.ftl.stream_count;
        let max_lpa = config.logical_pages_per_stream();
        if max_lpa == 0 {
            return Err(FtlError::InvalidMappingScheme(
                "logical space is empty after over-provisioning".into(),
            ));
        }
        let page_size = geometry.page_size_bytes();
        let domains = (0..stream_count)
            .map(|_| DomainState::new(max_lpa, page_size))
            .collect();
        let cmts = if config.ftl.ideal_mapping {
            Vec::new()
        } else {
            match config.ftl.cmt_sharing_mode {
                CmtSharingMode::Shared => vec![CachedMappingTable::new(config.ftl.cmt_capacity)],
                CmtSharingMode::EqualSizePartitioning => (0..stream_count)
                    .map(|_| {
                        CachedMappingTable::new(
                            config.ftl.cmt_capacity / usize::from(stream_count),
                        )
                    })
                    .collect(),
            }
        };
        let stalled = vec![VecDeque::new(); cmts.len()];
        Ok(Self {
            geometry,
            scheme: config.ftl.plane_allocation_scheme,
            ideal: config.ftl.ideal_mapping,
            sharing: config.ftl.cmt_sharing_mode,
            cmts,
            stalled,
            domains,
            barrier: BarrierControl::new(),
            write_stamp: 1,
            stats: vec![MappingStats::default(); usize::from(stream_count)],
        })
    }

    #[must_use]
    pub fn max_lpa(&self) -> u64 {
        self.domains[0].max_lpa
    }

    #[must_use]
    pub fn stats(&self) -> &[MappingStats] {
        &self.stats
    }

    #[must_use]
    pub fn mvpn_of(&self, stream: StreamId, lpa: Lpa) -> Mvpn {
        self.domains[usize::from(stream.0)].mvpn_of(lpa)
    }

    fn cmt_index(&self, stream: StreamId) -> usize {
        match self.sharing {
            CmtSharingMode::Shared => 0,
            CmtSharingMode::EqualSizePartitioning => usize::from(stream.0),
        }
    }

    fn next_stamp(&mut self) -> u64 {
        let stamp = self.write_stamp;
        self.write_stamp += 1;
        stamp
    }

    // -- translation ---------------------------------------------------------

    /// Translate each transaction, finalizing physical addresses on CMT hits
    /// and deferring misses behind translation-page fetches. Barrier-locked
    /// LPAs are parked; they replay when the relocation write completes.
    pub fn translate_and_dispatch(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handles: Vec<TxHandle>,
    ) -> Result<TranslationOutcome> {
        let mut out = TranslationOutcome::default();
        let mut worklist: VecDeque<TxHandle> = handles.into();
        while let Some(handle) = worklist.pop_front() {
            self.translate_one(arena, fbm, handle, &mut out)?;
        }
        Ok(out)
    }

    fn translate_one(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handle: TxHandle,
        out: &mut TranslationOutcome,
    ) -> Result<()> {
        let (stream, lpa, is_read, bitmap) = {
            let tx = arena.get(handle).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("translate on retired slot {}", handle.index()),
            })?;
            let is_read = matches!(tx.kind, TransactionKind::Read(_));
            (tx.stream, tx.lpa, is_read, tx.bitmap)
        };
        let d = usize::from(stream.0);
        if lpa.0 >= self.domains[d].max_lpa {
            return Err(FtlError::AddressOutOfRange {
                stream: stream.0,
                lpa: lpa.0,
                limit: self.domains[d].max_lpa,
            });
        }
        if self.barrier.is_lpa_locked(stream, lpa) {
            trace!(target: "fsim::amu", stream = stream.0, lpa = lpa.0, "parked behind lpa barrier");
            return self.barrier.queue_on_lpa(stream, lpa, handle);
        }
        self.stats[d].translations += 1;

        if self.ideal {
            return self.resolve_ideal(arena, fbm, handle, stream, lpa, is_read, bitmap, out);
        }

        let c = self.cmt_index(stream);
        match self.cmts[c].slot_status(stream, lpa) {
            Some(SlotStatus::Valid) => {
                self.stats[d].cmt_hits += 1;
                self.resolve_hit(arena, fbm, handle, stream, lpa, is_read, bitmap)?;
                out.ready.push(handle);
                Ok(())
            }
            Some(SlotStatus::Waiting) => {
                // A fetch for this LPA's translation page is already in
                // flight; join its queue.
                self.stats[d].cmt_misses += 1;
                let mvpn = self.domains[d].mvpn_of(lpa);
                self.domains[d].queue_behind_fetch(mvpn, handle);
                Ok(())
            }
            None => {
                self.stats[d].cmt_misses += 1;
                self.handle_miss(arena, fbm, handle, stream, lpa, is_read, bitmap, out)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_ideal(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handle: TxHandle,
        stream: StreamId,
        lpa: Lpa,
        is_read: bool,
        bitmap: SectorBitmap,
        out: &mut TranslationOutcome,
    ) -> Result<()> {
        let d = usize::from(stream.0);
        let current = self.domains[d].global(lpa).ppa;
        if is_read && current.is_assigned() {
            let addr = self.geometry.decompose(current);
            fbm.start_user_read(&addr);
            finalize(arena, handle, current, addr)?;
        } else {
            // Writes, and reads of never-written LPAs (which bind a page on
            // first access).
            if current.is_assigned() {
                fbm.invalidate_page(stream, &self.geometry.decompose(current))?;
            }
            let addr = self.allocate_user_page(fbm, stream, lpa)?;
            let new_ppa = self.geometry.compose(&addr);
            let stamp = self.next_stamp();
            let entry = self.domains[d].global_mut(lpa);
            entry.ppa = new_ppa;
            entry.bitmap = entry.bitmap.union(bitmap);
            entry.timestamp = stamp;
            if is_read {
                fbm.start_user_read(&addr);
            } else {
                fbm.start_user_program(&addr);
            }
            finalize(arena, handle, new_ppa, addr)?;
        }
        out.ready.push(handle);
        Ok(())
    }

    fn resolve_hit(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handle: TxHandle,
        stream: StreamId,
        lpa: Lpa,
        is_read: bool,
        bitmap: SectorBitmap,
    ) -> Result<()> {
        let c = self.cmt_index(stream);
        let current = self.cmts[c].retrieve_ppa(stream, lpa)?;
        if is_read && current.is_assigned() {
            let addr = self.geometry.decompose(current);
            fbm.start_user_read(&addr);
            return finalize(arena, handle, current, addr);
        }
        let old_bitmap = self.cmts[c].get_written_bitmap(stream, lpa)?;
        if current.is_assigned() {
            fbm.invalidate_page(stream, &self.geometry.decompose(current))?;
        }
        let addr = self.allocate_user_page(fbm, stream, lpa)?;
        let new_ppa = self.geometry.compose(&addr);
        self.cmts[c].update_mapping_info(stream, lpa, new_ppa, old_bitmap.union(bitmap))?;
        if is_read {
            fbm.start_user_read(&addr);
        } else {
            fbm.start_user_program(&addr);
        }
        finalize(arena, handle, new_ppa, addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_miss(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handle: TxHandle,
        stream: StreamId,
        lpa: Lpa,
        is_read: bool,
        bitmap: SectorBitmap,
        out: &mut TranslationOutcome,
    ) -> Result<()> {
        let d = usize::from(stream.0);
        let mvpn = self.domains[d].mvpn_of(lpa);
        if self.barrier.is_mvpn_locked(stream, mvpn) {
            // The translation page itself is being relocated; replay once it
            // settles.
            return self.barrier.queue_on_mvpn(stream, mvpn, handle);
        }
        let c = self.cmt_index(stream);
        if !self.cmts[c].has_free_slot() {
            if !self.cmts[c].has_evictable_slot() {
                // Every slot is a reservation with its fetch still in
                // flight; defer until one lands.
                trace!(
                    target: "fsim::amu",
                    stream = stream.0,
                    lpa = lpa.0,
                    "cmt full of reservations, miss deferred"
                );
                self.stalled[c].push_back(handle);
                return Ok(());
            }
            let evicted = self.cmts[c].evict_one_slot()?;
            if evicted.dirty {
                self.write_back(arena, fbm, evicted.stream, evicted.lpa, evicted.ppa, evicted.bitmap, out)?;
            }
        }
        self.cmts[c].reserve_slot(stream, lpa)?;

        let gtd_ppa = self.domains[d].gtd_ppa(mvpn);
        if !gtd_ppa.is_assigned() {
            // The translation page has never been written to flash; the
            // authoritative entry is immediately available.
            let entry = *self.domains[d].global(lpa);
            self.cmts[c].insert_new_mapping_info(stream, lpa, entry.ppa, entry.bitmap)?;
            self.resolve_hit(arena, fbm, handle, stream, lpa, is_read, bitmap)?;
            out.ready.push(handle);
            return Ok(());
        }

        self.domains[d].queue_behind_fetch(mvpn, handle);
        if !self.domains[d].fetch_in_flight(mvpn) {
            self.domains[d].mark_fetch_in_flight(mvpn);
            let full = SectorBitmap::full_page(self.geometry.sectors_per_page);
            let mut fetch = Transaction::new_mapping_read(stream, Lpa(mvpn.0), full);
            fetch.ppa = gtd_ppa;
            fetch.address = self.geometry.decompose(gtd_ppa);
            fetch.physical_address_determined = true;
            let fetch_handle = arena.insert(fetch);
            debug!(
                target: "fsim::amu",
                stream = stream.0,
                mvpn = mvpn.0,
                "translation page fetch issued"
            );
            out.generated.push(fetch_handle);
        }
        Ok(())
    }

    /// Write a dirty evicted entry back into the authoritative table and
    /// issue the translation-page flash write.
    #[allow(clippy::too_many_arguments)]
    fn write_back(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        stream: StreamId,
        lpa: Lpa,
        ppa: Ppa,
        bitmap: SectorBitmap,
        out: &mut TranslationOutcome,
    ) -> Result<()> {
        let d = usize::from(stream.0);
        let stamp = self.next_stamp();
        let entry = self.domains[d].global_mut(lpa);
        entry.ppa = ppa;
        entry.bitmap = bitmap;
        entry.timestamp = stamp;

        let mvpn = self.domains[d].mvpn_of(lpa);
        if self.barrier.is_mvpn_locked(stream, mvpn) {
            // The translation page is mid-relocation; the relocation write
            // re-emits the page from the (now updated) authoritative table,
            // so a separate flash write would be redundant.
            return Ok(());
        }
        let old = self.domains[d].gtd_ppa(mvpn);
        if old.is_assigned() {
            fbm.invalidate_page(stream, &self.geometry.decompose(old))?;
        }
        let mut addr = allocate_plane(self.scheme, Lpa(mvpn.0), &self.geometry);
        fbm.allocate_page_for_translation_write(stream, &mut addr, false)?;
        fbm.record_mapped_lpa(&addr, Lpa(mvpn.0));
        fbm.start_background_program(&addr);
        let new_ppa = self.geometry.compose(&addr);
        self.domains[d].set_gtd_ppa(mvpn, new_ppa);

        let full = SectorBitmap::full_page(self.geometry.sectors_per_page);
        let mut write = Transaction::new_mapping_write(stream, Lpa(mvpn.0), full);
        write.ppa = new_ppa;
        write.address = addr;
        write.physical_address_determined = true;
        out.generated.push(arena.insert(write));
        Ok(())
    }

    fn allocate_user_page(
        &mut self,
        fbm: &mut FlashBlockManager,
        stream: StreamId,
        lpa: Lpa,
    ) -> Result<PhysicalPageAddress> {
        let mut addr = allocate_plane(self.scheme, lpa, &self.geometry);
        fbm.allocate_page_for_user_write(stream, &mut addr)?;
        fbm.record_mapped_lpa(&addr, lpa);
        Ok(addr)
    }

    /// A translation-page fetch landed: install the fetched entries for every
    /// parked transaction and replay them in arrival order.
    pub fn on_mapping_read_complete(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        handle: TxHandle,
    ) -> Result<TranslationOutcome> {
        let (stream, mvpn) = {
            let tx = arena.get(handle).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("mapping read completion on retired slot {}", handle.index()),
            })?;
            (tx.stream, Mvpn(tx.lpa.0))
        };
        let d = usize::from(stream.0);
        let mut waiting = self.domains[d].complete_fetch(mvpn);
        let c = self.cmt_index(stream);
        for &parked in &waiting {
            let Some(tx) = arena.get(parked) else { continue };
            let lpa = tx.lpa;
            if self.cmts[c].slot_status(stream, lpa) == Some(SlotStatus::Waiting) {
                let entry = *self.domains[d].global(lpa);
                self.cmts[c].insert_new_mapping_info(stream, lpa, entry.ppa, entry.bitmap)?;
            }
        }
        // Deferred misses retry now that the installed entries are evictable.
        waiting.extend(self.stalled[c].drain(..));
        debug!(
            target: "fsim::amu",
            stream = stream.0,
            mvpn = mvpn.0,
            released = waiting.len(),
            "translation page fetch complete"
        );
        self.translate_and_dispatch(arena, fbm, waiting)
    }

    // -- GC / wear-leveling support -----------------------------------------

    /// Authoritative current mapping (CMT first, then the global table).
    #[must_use]
    pub fn current_ppa_of(&self, stream: StreamId, lpa: Lpa) -> Ppa {
        if !self.ideal {
            let c = self.cmt_index(stream);
            if let Some(ppa) = self.cmts[c].peek_ppa(stream, lpa) {
                return ppa;
            }
        }
        self.domains[usize::from(stream.0)].global(lpa).ppa
    }

    /// Current flash home of a translation page (GTD lookup).
    #[must_use]
    pub fn current_translation_ppa(&self, stream: StreamId, mvpn: Mvpn) -> Ppa {
        self.domains[usize::from(stream.0)].gtd_ppa(mvpn)
    }

    /// Relocation staleness check: is `ppa` still where `lpa` lives?
    #[must_use]
    pub fn is_mapping_current(&self, stream: StreamId, lpa: Lpa, ppa: Ppa) -> bool {
        self.current_ppa_of(stream, lpa) == ppa
    }

    #[must_use]
    pub fn written_bitmap_of(&self, stream: StreamId, lpa: Lpa) -> SectorBitmap {
        if !self.ideal {
            let c = self.cmt_index(stream);
            if let Some(bitmap) = self.cmts[c].peek_bitmap(stream, lpa) {
                return bitmap;
            }
        }
        self.domains[usize::from(stream.0)].global(lpa).bitmap
    }

    /// Point `lpa` at its relocated page. Goes through the CMT when the entry
    /// is resident (marking it dirty), directly to the authoritative table
    /// otherwise.
    pub fn update_mapping_for_relocation(
        &mut self,
        stream: StreamId,
        lpa: Lpa,
        new_ppa: Ppa,
    ) -> Result<()> {
        if !self.ideal {
            let c = self.cmt_index(stream);
            if self.cmts[c].exists(stream, lpa) {
                let bitmap = self.cmts[c].get_written_bitmap(stream, lpa)?;
                return self.cmts[c].update_mapping_info(stream, lpa, new_ppa, bitmap);
            }
        }
        let stamp = self.next_stamp();
        let entry = self.domains[usize::from(stream.0)].global_mut(lpa);
        entry.ppa = new_ppa;
        entry.timestamp = stamp;
        Ok(())
    }

    /// Point a relocated translation page's GTD entry at its new home.
    pub fn update_gtd_for_relocation(&mut self, stream: StreamId, mvpn: Mvpn, new_ppa: Ppa) {
        self.domains[usize::from(stream.0)].set_gtd_ppa(mvpn, new_ppa);
    }

    /// Pre-populate a mapping without generating any flash traffic
    /// (preconditioning).
    pub fn seed_mapping(&mut self, stream: StreamId, lpa: Lpa, ppa: Ppa, bitmap: SectorBitmap) {
        let stamp = self.next_stamp();
        let entry = self.domains[usize::from(stream.0)].global_mut(lpa);
        entry.ppa = ppa;
        entry.bitmap = bitmap;
        entry.timestamp = stamp;
    }

    // -- barrier passthroughs ------------------------------------------------

    pub fn start_servicing_block(&mut self, plane_index: usize, block_id: u32) -> Result<()> {
        self.barrier.start_servicing_block(plane_index, block_id)
    }

    pub fn stop_servicing_block(&mut self, plane_index: usize, block_id: u32) {
        self.barrier.stop_servicing_block(plane_index, block_id);
    }

    pub fn lock_lpa(&mut self, stream: StreamId, lpa: Lpa) -> Result<()> {
        self.barrier.lock_lpa(stream, lpa)
    }

    pub fn lock_mvpn(&mut self, stream: StreamId, mvpn: Mvpn) -> Result<()> {
        self.barrier.lock_mvpn(stream, mvpn)
    }

    #[must_use]
    pub fn is_lpa_locked(&self, stream: StreamId, lpa: Lpa) -> bool {
        self.barrier.is_lpa_locked(stream, lpa)
    }

    /// Release an LPA lock; the returned transactions must be replayed
    /// through [`translate_and_dispatch`](Self::translate_and_dispatch).
    pub fn unlock_lpa(&mut self, stream: StreamId, lpa: Lpa) -> Vec<TxHandle> {
        self.barrier.unlock_lpa(stream, lpa)
    }

    pub fn unlock_mvpn(&mut self, stream: StreamId, mvpn: Mvpn) -> Vec<TxHandle> {
        self.barrier.unlock_mvpn(stream, mvpn)
    }
}

fn finalize(
    arena: &mut TransactionArena,
    handle: TxHandle,
    ppa: Ppa,
    addr: PhysicalPageAddress,
) -> Result<()> {
    let tx = arena.get_mut(handle).ok_or_else(|| FtlError::StaleHandle {
        detail: format!("finalize on retired slot {}", handle.index()),
    })?;
    tx.ppa = ppa;
    tx.address = addr;
    tx.physical_address_determined = true;
    Ok(())
}
