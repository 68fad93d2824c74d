#![forbid(unsafe_code)]
//! Garbage collection and wear-leveling.
//!
//! The [`GcWlUnit`] watches each plane's free-block pool, claims victim
//! blocks through the flash block manager's service-state machine, and turns
//! each claim into a relocation: one movement per valid page (a read/write
//! pair, or a single copyback write) plus one erase gated on an explicit
//! pending-movement counter. Mapping state is kept consistent through the
//! address mapping unit's relocation APIs and its two-level barrier.

pub mod victim;

pub use victim::{is_legal_victim, select_victim};

use fsim_config::{GcPolicy, SimConfig};
use fsim_error::{FtlError, Result};
use fsim_fbm::FlashBlockManager;
use fsim_map::AddressMappingUnit;
use fsim_types::{
    Geometry, Lpa, Mvpn, PhysicalPageAddress, SectorBitmap, StreamId, Transaction,
    TransactionArena, TxHandle,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

/// How badly the plane needs reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcUrgency {
    /// Free pool above the soft threshold; no GC.
    None,
    /// Below the soft threshold: GC runs but yields to user traffic.
    Soft,
    /// At or below the hard threshold: GC traffic takes priority and
    /// suspension of in-flight programs/erases becomes worthwhile.
    Urgent,
}

/// Counters exported into the run report.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub gc_invocations: u64,
    pub static_wl_invocations: u64,
    pub relocated_pages: u64,
    pub erased_blocks: u64,
    /// Movements dropped because a user write overtook the relocation
    /// before its target was resolved.
    pub dropped_stale_movements: u64,
}

/// Transactions produced by a claim that is ready to relocate.
///
/// `erase` is present once the movement count is final; the caller must not
/// schedule an erase for a claim that is still waiting on user reads.
#[derive(Debug, Default)]
pub struct RelocationBatch {
    pub erase: Option<TxHandle>,
    /// Dispatchable movements: relocation reads, or copyback writes.
    pub movements: Vec<TxHandle>,
}

/// Outcome of a relocation read completing.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadCompletion {
    /// The mapping is still current: the companion write now has its target
    /// page and may be scheduled.
    WriteReady(TxHandle),
    /// A user write overtook the read; the movement was dropped and the
    /// erase's pending-movement counter decremented.
    Dropped {
        /// The erase whose last movement just dropped, now dispatchable.
        erase_ready: Option<TxHandle>,
    },
}

/// Outcome of a relocation write completing.
#[derive(Debug, Default)]
pub struct WriteCompletion {
    /// Transactions that were parked behind the page's barrier lock; replay
    /// them through translation.
    pub replay: Vec<TxHandle>,
    /// The erase whose last movement just finished, now dispatchable.
    pub erase_ready: Option<TxHandle>,
}

#[derive(Debug)]
pub struct GcWlUnit {
    geometry: Geometry,
    policy: GcPolicy,
    rga_set_size: u32,
    random_pp_threshold: u32,
    use_copyback: bool,
    /// Free-block counts (per plane) translating the configured fractions.
    soft_free_blocks: usize,
    hard_free_blocks: usize,
    static_wl_threshold: u32,
    rng: SmallRng,
    stats: GcStats,
}

impl GcWlUnit {
    #[must_use]
    pub fn new(config: &SimConfig) -> Self {
        let geometry = config.device.geometry();
        let blocks = f64::from(geometry.blocks_per_plane);
        let soft = (blocks * config.ftl.gc_soft_threshold).ceil() as usize;
        let hard = (blocks * config.ftl.gc_hard_threshold).ceil() as usize;
        Self {
            geometry,
            policy: config.ftl.gc_policy,
            rga_set_size: config.ftl.rga_set_size,
            random_pp_threshold: (f64::from(geometry.pages_per_block) * config.ftl.rho) as u32,
            use_copyback: config.ftl.use_copyback,
            soft_free_blocks: soft.max(1),
            hard_free_blocks: hard.max(1),
            static_wl_threshold: config.ftl.static_wearleveling_threshold,
            rng: SmallRng::seed_from_u64(config.ftl.seed),
            stats: GcStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Reclamation pressure for the plane holding `addr`.
    #[must_use]
    pub fn urgency(&self, fbm: &FlashBlockManager, addr: &PhysicalPageAddress) -> GcUrgency {
        let free = fbm.free_block_count(addr);
        if free <= self.hard_free_blocks {
            GcUrgency::Urgent
        } else if free < self.soft_free_blocks {
            GcUrgency::Soft
        } else {
            GcUrgency::None
        }
    }

    // -- claim ---------------------------------------------------------------

    /// Run the GC trigger for the plane holding `addr`: check the free pool,
    /// select a victim, and claim it. Returns an empty batch when no GC is
    /// needed, no legal victim exists, or the claim must wait for in-flight
    /// user reads (the erase handle is then parked in the block record and
    /// surfaces later through [`resume_relocation`](Self::resume_relocation)).
    pub fn check_gc_required(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        addr: &PhysicalPageAddress,
    ) -> Result<RelocationBatch> {
        if self.urgency(fbm, addr) == GcUrgency::None {
            return Ok(RelocationBatch::default());
        }
        // One reclamation at a time per plane: stacked claims would drain
        // the relocation frontier faster than their erases replenish the
        // pool.
        if fbm.reclamation_in_progress(addr) {
            return Ok(RelocationBatch::default());
        }
        let plane = fbm.plane(addr);
        let Some(block_id) = select_victim(
            self.policy,
            plane,
            self.geometry.pages_per_block,
            self.rga_set_size,
            self.random_pp_threshold,
            &mut self.rng,
        ) else {
            return Ok(RelocationBatch::default());
        };
        self.stats.gc_invocations += 1;
        self.claim(arena, fbm, amu, addr, block_id)
    }

    /// Trigger static wear-leveling for the plane when the erase-count spread
    /// exceeds the configured threshold: the coldest block's data is
    /// relocated so the block can rejoin the pool and absorb hot writes.
    pub fn check_static_wearleveling(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        addr: &PhysicalPageAddress,
    ) -> Result<RelocationBatch> {
        if fbm.min_max_erase_difference(addr) <= self.static_wl_threshold {
            return Ok(RelocationBatch::default());
        }
        if fbm.reclamation_in_progress(addr) {
            return Ok(RelocationBatch::default());
        }
        let coldest = fbm.coldest_block_id(addr);
        if !is_legal_victim(fbm.plane(addr), coldest, self.geometry.pages_per_block) {
            return Ok(RelocationBatch::default());
        }
        self.stats.static_wl_invocations += 1;
        debug!(target: "fsim::gc", block = coldest, "static wear-leveling relocation");
        self.claim(arena, fbm, amu, addr, coldest)
    }

    fn claim(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        addr: &PhysicalPageAddress,
        block_id: u32,
    ) -> Result<RelocationBatch> {
        let victim = PhysicalPageAddress {
            block: block_id,
            page: 0,
            ..*addr
        };
        let stream = fbm.block(&victim).stream;
        // Movement count is finalized when relocation actually starts.
        let erase = arena.insert(Transaction::new_gc_erase(stream, victim, 0));
        let ready = fbm.gc_claim_block(&victim, erase)?;
        amu.start_servicing_block(self.geometry.plane_index(&victim), block_id)?;
        debug!(
            target: "fsim::gc",
            block = block_id,
            plane = self.geometry.plane_index(&victim),
            ready,
            "victim claimed"
        );
        if ready {
            self.start_relocation(arena, fbm, amu, erase)
        } else {
            Ok(RelocationBatch::default())
        }
    }

    /// A parked claim's user reads have drained; start its relocation. `addr`
    /// names the block whose service state just transitioned to `GcWl`.
    pub fn resume_relocation(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        addr: &PhysicalPageAddress,
    ) -> Result<RelocationBatch> {
        let erase = fbm.block(addr).erase_tx.ok_or_else(|| FtlError::BlockBookkeeping {
            detail: format!("no parked erase on block {}", addr.block),
        })?;
        self.start_relocation(arena, fbm, amu, erase)
    }

    // -- relocation ----------------------------------------------------------

    /// Enumerate the victim's still-valid pages and emit one movement per
    /// page, setting the erase's pending-movement counter to the number of
    /// movements created.
    ///
    /// Copyback movements resolve their target, lock the logical address,
    /// and invalidate the source up front. Read/write pairs defer all of
    /// that to [`on_relocation_read_complete`](Self::on_relocation_read_complete):
    /// the page stays unlocked until its read lands, and a user write that
    /// overtakes the read turns the movement into a stale drop.
    fn start_relocation(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        erase: TxHandle,
    ) -> Result<RelocationBatch> {
        let victim = arena
            .get(erase)
            .and_then(Transaction::as_erase)
            .ok_or_else(|| FtlError::UnknownTransaction {
                detail: format!("erase slot {} is gone", erase.index()),
            })?
            .victim;
        let (stream, is_mapping_block, pages) = {
            let record = fbm.block(&victim);
            let pages: Vec<(u32, Option<Lpa>)> = (0..record.write_index)
                .filter(|&page| !record.is_page_invalid(page))
                .map(|page| (page, record.mapped_lpa(page)))
                .collect();
            (record.stream, record.holds_mapping_data, pages)
        };

        let mut batch = RelocationBatch::default();
        let mut movements = 0usize;
        for (page, lpa) in pages {
            let src = PhysicalPageAddress { page, ..victim };
            let lpa = lpa.ok_or_else(|| FtlError::BlockBookkeeping {
                detail: format!("valid page {src} has no recorded logical address"),
            })?;
            let src_ppa = self.geometry.compose(&src);
            let bitmap = if is_mapping_block {
                SectorBitmap::full_page(self.geometry.sectors_per_page)
            } else {
                amu.written_bitmap_of(stream, lpa)
            };
            let mut write = Transaction::new_gc_write(stream, bitmap);
            write.lpa = lpa;
            if let Some(wtx) = write.as_write_mut() {
                wtx.related_erase = Some(erase);
            }

            if self.use_copyback {
                // A page can go stale between claim and relocation start
                // (user writes while GC waited on reads). Drop the movement.
                let current = if is_mapping_block {
                    amu.current_translation_ppa(stream, Mvpn(lpa.0))
                } else {
                    amu.current_ppa_of(stream, lpa)
                };
                if current != src_ppa {
                    fbm.invalidate_page(stream, &src)?;
                    self.stats.dropped_stale_movements += 1;
                    trace!(target: "fsim::gc", lpa = lpa.0, "stale page dropped from relocation");
                    continue;
                }
                if is_mapping_block {
                    amu.lock_mvpn(stream, Mvpn(lpa.0))?;
                } else {
                    amu.lock_lpa(stream, lpa)?;
                }
                fbm.invalidate_page(stream, &src)?;
                let target = self.allocate_target(fbm, stream, lpa, is_mapping_block, &victim)?;
                write.ppa = self.geometry.compose(&target);
                write.address = target;
                write.physical_address_determined = true;
                batch.movements.push(arena.insert(write));
            } else {
                let write_handle = arena.insert(write);
                let mut read = Transaction::new_gc_read(stream, bitmap);
                read.lpa = lpa;
                read.ppa = src_ppa;
                read.address = src;
                read.physical_address_determined = true;
                if let Some(rtx) = read.as_read_mut() {
                    rtx.related_write = Some(write_handle);
                }
                let read = arena.insert(read);
                if let Some(wtx) = arena.get_mut(write_handle).and_then(Transaction::as_write_mut) {
                    wtx.related_read = Some(read);
                }
                batch.movements.push(read);
            }
            movements += 1;
        }

        if let Some(etx) = arena.get_mut(erase).and_then(Transaction::as_erase_mut) {
            etx.pending_movements = movements;
        }
        debug!(
            target: "fsim::gc",
            block = victim.block,
            movements,
            copyback = self.use_copyback,
            "relocation started"
        );
        batch.erase = Some(erase);
        Ok(batch)
    }

    /// Relocation targets stay on the victim's plane.
    fn allocate_target(
        &self,
        fbm: &mut FlashBlockManager,
        stream: StreamId,
        lpa: Lpa,
        is_mapping_block: bool,
        victim: &PhysicalPageAddress,
    ) -> Result<PhysicalPageAddress> {
        let mut target = PhysicalPageAddress {
            page: 0,
            block: 0,
            ..*victim
        };
        if is_mapping_block {
            fbm.allocate_page_for_translation_write(stream, &mut target, true)?;
        } else {
            fbm.allocate_page_for_gc_write(stream, &mut target)?;
        }
        fbm.record_mapped_lpa(&target, lpa);
        fbm.start_background_program(&target);
        Ok(target)
    }

    // -- completions ---------------------------------------------------------

    /// A relocation read finished: its data is in hand. The mapping is
    /// re-checked here, since the page stayed unlocked while the read was in
    /// flight. A still-current movement locks the logical address,
    /// invalidates the source, resolves the companion write's target, and
    /// hands the write back for scheduling; a movement overtaken by a user
    /// write is dropped and the erase's counter decremented. The read is
    /// retired here.
    pub fn on_relocation_read_complete(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        read: TxHandle,
    ) -> Result<ReadCompletion> {
        let (stream, lpa, src, src_ppa, write) = {
            let tx = arena.get(read).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("relocation read slot {} is gone", read.index()),
            })?;
            let write = tx.as_read().and_then(|rtx| rtx.related_write).ok_or_else(|| {
                FtlError::UnknownTransaction {
                    detail: format!("relocation read slot {} has no companion write", read.index()),
                }
            })?;
            (tx.stream, tx.lpa, tx.address, tx.ppa, write)
        };
        arena.remove(read);
        let erase = arena
            .get(write)
            .and_then(Transaction::as_write)
            .and_then(|wtx| wtx.related_erase)
            .ok_or_else(|| FtlError::UnknownTransaction {
                detail: format!("relocation write slot {} has no erase", write.index()),
            })?;
        let victim = arena
            .get(erase)
            .and_then(Transaction::as_erase)
            .ok_or_else(|| FtlError::StaleHandle {
                detail: format!("erase slot {} is gone", erase.index()),
            })?
            .victim;
        let is_mapping_block = fbm.block(&victim).holds_mapping_data;

        let current = if is_mapping_block {
            amu.current_translation_ppa(stream, Mvpn(lpa.0))
        } else {
            amu.current_ppa_of(stream, lpa)
        };
        if current != src_ppa {
            // The overtaking user write already invalidated the source page.
            arena.remove(write);
            self.stats.dropped_stale_movements += 1;
            trace!(target: "fsim::gc", lpa = lpa.0, "movement dropped at read completion");
            let etx = arena
                .get_mut(erase)
                .and_then(Transaction::as_erase_mut)
                .ok_or_else(|| FtlError::StaleHandle {
                    detail: format!("erase slot {} is gone", erase.index()),
                })?;
            if etx.pending_movements == 0 {
                return Err(FtlError::BlockBookkeeping {
                    detail: format!("movement underflow on erase of block {}", victim.block),
                });
            }
            etx.pending_movements -= 1;
            return Ok(ReadCompletion::Dropped {
                erase_ready: (etx.pending_movements == 0).then_some(erase),
            });
        }

        if is_mapping_block {
            amu.lock_mvpn(stream, Mvpn(lpa.0))?;
        } else {
            amu.lock_lpa(stream, lpa)?;
        }
        fbm.invalidate_page(stream, &src)?;
        let target = self.allocate_target(fbm, stream, lpa, is_mapping_block, &victim)?;
        let tx = arena.get_mut(write).ok_or_else(|| FtlError::StaleHandle {
            detail: format!("companion write slot {} is gone", write.index()),
        })?;
        tx.ppa = self.geometry.compose(&target);
        tx.address = target;
        tx.physical_address_determined = true;
        if let Some(wtx) = tx.as_write_mut() {
            wtx.related_read = None;
        }
        Ok(ReadCompletion::WriteReady(write))
    }

    /// A relocation write landed: repoint the mapping, release the page's
    /// barrier lock, and decrement the erase's pending-movement counter. The
    /// write is retired here.
    pub fn on_relocation_write_complete(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        write: TxHandle,
    ) -> Result<WriteCompletion> {
        let (stream, lpa, new_ppa, target, erase) = {
            let tx = arena.get(write).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("relocation write slot {} is gone", write.index()),
            })?;
            let erase = tx.as_write().and_then(|wtx| wtx.related_erase).ok_or_else(|| {
                FtlError::UnknownTransaction {
                    detail: format!("relocation write slot {} has no erase", write.index()),
                }
            })?;
            (tx.stream, tx.lpa, tx.ppa, tx.address, erase)
        };
        let victim = arena
            .get(erase)
            .and_then(Transaction::as_erase)
            .ok_or_else(|| FtlError::StaleHandle {
                detail: format!("erase slot {} is gone", erase.index()),
            })?
            .victim;
        let is_mapping_block = fbm.block(&victim).holds_mapping_data;

        let mut completion = WriteCompletion::default();
        if is_mapping_block {
            amu.update_gtd_for_relocation(stream, Mvpn(lpa.0), new_ppa);
            completion.replay = amu.unlock_mvpn(stream, Mvpn(lpa.0));
        } else {
            amu.update_mapping_for_relocation(stream, lpa, new_ppa)?;
            completion.replay = amu.unlock_lpa(stream, lpa);
        }
        arena.remove(write);
        fbm.finish_background_program(&target)?;
        self.stats.relocated_pages += 1;

        let etx = arena
            .get_mut(erase)
            .and_then(Transaction::as_erase_mut)
            .ok_or_else(|| FtlError::StaleHandle {
                detail: format!("erase slot {} is gone", erase.index()),
            })?;
        if etx.pending_movements == 0 {
            return Err(FtlError::BlockBookkeeping {
                detail: format!("movement underflow on erase of block {}", victim.block),
            });
        }
        etx.pending_movements -= 1;
        if etx.pending_movements == 0 {
            completion.erase_ready = Some(erase);
        }
        Ok(completion)
    }

    /// The erase command finished on the chip: return the block to the free
    /// pool and drop the whole-block barrier. The erase is retired here.
    pub fn on_erase_complete(
        &mut self,
        arena: &mut TransactionArena,
        fbm: &mut FlashBlockManager,
        amu: &mut AddressMappingUnit,
        erase: TxHandle,
    ) -> Result<()> {
        let victim = arena
            .get(erase)
            .and_then(Transaction::as_erase)
            .ok_or_else(|| FtlError::StaleHandle {
                detail: format!("erase slot {} is gone", erase.index()),
            })?
            .victim;
        let pending = arena
            .get(erase)
            .and_then(Transaction::as_erase)
            .map_or(0, |etx| etx.pending_movements);
        if pending != 0 {
            warn!(
                target: "fsim::gc",
                block = victim.block,
                pending,
                "erase completed with pending movements"
            );
            return Err(FtlError::BlockBookkeeping {
                detail: format!("erase of block {} completed with {pending} movements", victim.block),
            });
        }
        fbm.add_erased_block_to_pool(&victim)?;
        amu.stop_servicing_block(self.geometry.plane_index(&victim), victim.block);
        arena.remove(erase);
        self.stats.erased_blocks += 1;
        Ok(())
    }
}
