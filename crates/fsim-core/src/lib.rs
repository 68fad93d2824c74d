#![forbid(unsafe_code)]
//! FTL orchestration.
//!
//! [`FtlCore`] owns every component — transaction arena, address mapping
//! unit, flash block manager, GC/WL unit, scheduler — plus the PHY it was
//! constructed with, and routes control flow between them: host requests go
//! through translation and into the scheduler; command completions come back
//! from the PHY and fan out to the component that was waiting on them. The
//! core is single-threaded by construction; components communicate through
//! return values, never callbacks.

pub mod host;
pub mod phy;
pub mod precondition;
pub mod report;
pub mod stats;

pub use phy::{ModelPhy, PhyTiming};
pub use report::XmlWriter;
pub use stats::StreamStats;

use fsim_config::SimConfig;
use fsim_error::{FtlError, Result};
use fsim_fbm::FlashBlockManager;
use fsim_gc::{GcStats, GcUrgency, GcWlUnit, ReadCompletion, RelocationBatch};
use fsim_map::{AddressMappingUnit, MappingStats, TranslationOutcome};
use fsim_tsu::{GcUrgencyProbe, NvmPhy, TransactionSchedulingUnit, TsuStats};
use fsim_types::{
    Geometry, PhysicalPageAddress, SimTime, StreamId, Transaction, TransactionArena,
    TransactionCategory, TransactionKind, TxHandle,
};
use tracing::debug;

/// Scheduler-side urgency view: worst pressure over a chip's planes.
struct UrgencyProbe<'a> {
    gc: &'a GcWlUnit,
    fbm: &'a FlashBlockManager,
    geometry: Geometry,
}

impl GcUrgencyProbe for UrgencyProbe<'_> {
    fn urgency(&self, channel: u32, chip: u32) -> GcUrgency {
        let mut worst = GcUrgency::None;
        for die in 0..self.geometry.dies_per_chip {
            for plane in 0..self.geometry.planes_per_die {
                let addr = PhysicalPageAddress {
                    channel,
                    chip,
                    die,
                    plane,
                    ..PhysicalPageAddress::default()
                };
                worst = worst.max(self.gc.urgency(self.fbm, &addr));
            }
        }
        worst
    }
}

pub struct FtlCore<P: NvmPhy> {
    config: SimConfig,
    geometry: Geometry,
    arena: TransactionArena,
    amu: AddressMappingUnit,
    fbm: FlashBlockManager,
    gc: GcWlUnit,
    tsu: TransactionSchedulingUnit,
    phy: P,
    stream_stats: Vec<StreamStats>,
}

impl<P: NvmPhy> FtlCore<P> {
    pub fn new(config: SimConfig, phy: P) -> Result<Self> {
        config.validate()?;
        let geometry = config.device.geometry();
        let amu = AddressMappingUnit::new(&config)?;
        let fbm = FlashBlockManager::new(
            geometry,
            config.ftl.stream_count,
            config.ftl.dynamic_wearleveling,
        );
        let gc = GcWlUnit::new(&config);
        let tsu = TransactionSchedulingUnit::new(&config);
        let stream_stats = vec![StreamStats::default(); usize::from(config.ftl.stream_count)];
        Ok(Self {
            config,
            geometry,
            arena: TransactionArena::new(),
            amu,
            fbm,
            gc,
            tsu,
            phy,
            stream_stats,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    #[must_use]
    pub fn now(&self) -> SimTime {
        self.phy.now()
    }

    /// Transactions alive anywhere in the pipeline.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.arena.len()
    }

    /// Seed a synthetic used-device state before timed simulation.
    pub fn precondition(&mut self, fill_ratio: f64, rewrite_ratio: f64) -> Result<()> {
        precondition::precondition(
            &self.config,
            &mut self.fbm,
            &mut self.amu,
            fill_ratio,
            rewrite_ratio,
        )
    }

    // -- host entry points ---------------------------------------------------

    pub fn submit_user_read(
        &mut self,
        stream: StreamId,
        start_lha: u64,
        sector_count: u32,
    ) -> Result<()> {
        self.submit_user(stream, start_lha, sector_count, false)
    }

    pub fn submit_user_write(
        &mut self,
        stream: StreamId,
        start_lha: u64,
        sector_count: u32,
    ) -> Result<()> {
        self.submit_user(stream, start_lha, sector_count, true)
    }

    fn submit_user(
        &mut self,
        stream: StreamId,
        start_lha: u64,
        sector_count: u32,
        is_write: bool,
    ) -> Result<()> {
        let now = self.phy.now();
        let mut handles = Vec::new();
        for (lpa, bitmap) in host::split_request(&self.geometry, start_lha, sector_count) {
            let mut tx = if is_write {
                Transaction::new_user_write(stream, lpa, bitmap)
            } else {
                Transaction::new_user_read(stream, lpa, bitmap)
            };
            tx.issue_time = now;
            handles.push(self.arena.insert(tx));
            let s = &mut self.stream_stats[usize::from(stream.0)];
            if is_write {
                s.writes_submitted += 1;
            } else {
                s.reads_submitted += 1;
            }
        }
        let outcome = self
            .amu
            .translate_and_dispatch(&mut self.arena, &mut self.fbm, handles)?;
        self.submit_outcome(outcome)?;
        self.pump()
    }

    // -- scheduling glue -----------------------------------------------------

    /// Hand a translation pass's output to the scheduler, then run the GC
    /// trigger for every plane that consumed a page.
    fn submit_outcome(&mut self, outcome: TranslationOutcome) -> Result<()> {
        let mut touched: Vec<PhysicalPageAddress> = Vec::new();
        for &handle in outcome.ready.iter().chain(&outcome.generated) {
            if let Some(tx) = self.arena.get(handle) {
                if matches!(tx.kind, TransactionKind::Write(_))
                    && !touched.iter().any(|a| a.same_plane(&tx.address))
                {
                    touched.push(tx.address);
                }
            }
        }
        // One submission frame around the pass and its GC fallout, so user,
        // mapping, and relocation traffic enter the queues together.
        self.tsu.prepare_for_submit();
        self.tsu.submit(&self.arena, &outcome.ready)?;
        self.tsu.submit(&self.arena, &outcome.generated)?;
        for addr in touched {
            self.collect_if_needed(&addr)?;
        }
        self.tsu.schedule(&self.arena)
    }

    fn collect_if_needed(&mut self, addr: &PhysicalPageAddress) -> Result<()> {
        let batch =
            self.gc
                .check_gc_required(&mut self.arena, &mut self.fbm, &mut self.amu, addr)?;
        self.submit_relocation(batch)?;
        let batch = self.gc.check_static_wearleveling(
            &mut self.arena,
            &mut self.fbm,
            &mut self.amu,
            addr,
        )?;
        self.submit_relocation(batch)
    }

    /// Queue a relocation's movements and its erase. The erase sits in the
    /// scheduler until its pending-movement counter reaches zero; companion
    /// writes of read/write pairs are queued when their read completes.
    fn submit_relocation(&mut self, batch: RelocationBatch) -> Result<()> {
        self.tsu.prepare_for_submit();
        self.tsu.submit(&self.arena, &batch.movements)?;
        if let Some(erase) = batch.erase {
            self.tsu.submit(&self.arena, &[erase])?;
        }
        self.tsu.schedule(&self.arena)
    }

    /// Dispatch until no channel can make progress.
    pub fn pump(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            for channel in 0..self.geometry.channels {
                let probe = UrgencyProbe {
                    gc: &self.gc,
                    fbm: &self.fbm,
                    geometry: self.geometry,
                };
                progressed |=
                    self.tsu
                        .on_channel_idle(&mut self.arena, &mut self.phy, &probe, channel)?;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    // -- completion routing --------------------------------------------------

    /// A command batch finished on the PHY; route each transaction's
    /// completion to the component waiting on it.
    pub fn on_transaction_serviced(&mut self, handle: TxHandle) -> Result<()> {
        let (category, stream, address, sectors) = {
            let tx = self.arena.get(handle).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("completion for retired slot {}", handle.index()),
            })?;
            let category = tx.category().ok_or_else(|| FtlError::UnknownTransaction {
                detail: format!("completed slot {} has no category", handle.index()),
            })?;
            (
                category,
                tx.stream,
                tx.address,
                u64::from(tx.bitmap.count_sectors()),
            )
        };
        match category {
            TransactionCategory::UserRead => {
                let gc_ready = self.fbm.finish_user_read(&address)?;
                self.arena.remove(handle);
                let s = &mut self.stream_stats[usize::from(stream.0)];
                s.reads_completed += 1;
                s.sectors_read += sectors;
                if gc_ready {
                    self.resume_parked_relocation(&address)?;
                }
            }
            TransactionCategory::UserWrite => {
                let gc_ready = self.fbm.finish_user_program(&address)?;
                self.arena.remove(handle);
                let s = &mut self.stream_stats[usize::from(stream.0)];
                s.writes_completed += 1;
                s.sectors_written += sectors;
                if gc_ready {
                    self.resume_parked_relocation(&address)?;
                }
            }
            TransactionCategory::MappingRead => {
                let outcome =
                    self.amu
                        .on_mapping_read_complete(&mut self.arena, &mut self.fbm, handle)?;
                self.arena.remove(handle);
                self.submit_outcome(outcome)?;
            }
            TransactionCategory::MappingWrite => {
                self.fbm.finish_background_program(&address)?;
                self.arena.remove(handle);
            }
            TransactionCategory::GcRead => {
                match self.gc.on_relocation_read_complete(
                    &mut self.arena,
                    &mut self.fbm,
                    &mut self.amu,
                    handle,
                )? {
                    ReadCompletion::WriteReady(write) => {
                        self.tsu.submit(&self.arena, &[write])?;
                    }
                    // The erase is already queued; the scheduler sees its
                    // counter hit zero on its own.
                    ReadCompletion::Dropped { .. } => {}
                }
            }
            TransactionCategory::GcWrite => {
                let done = self.gc.on_relocation_write_complete(
                    &mut self.arena,
                    &mut self.fbm,
                    &mut self.amu,
                    handle,
                )?;
                // The erase is already queued; the scheduler sees its counter
                // hit zero on its own.
                if !done.replay.is_empty() {
                    let outcome = self.amu.translate_and_dispatch(
                        &mut self.arena,
                        &mut self.fbm,
                        done.replay,
                    )?;
                    self.submit_outcome(outcome)?;
                }
            }
            TransactionCategory::GcErase => {
                self.gc
                    .on_erase_complete(&mut self.arena, &mut self.fbm, &mut self.amu, handle)?;
                // Pressure can outlive a single reclamation; chain the next
                // claim off the completed erase rather than waiting for the
                // next user write to trigger it.
                self.collect_if_needed(&address)?;
            }
        }
        Ok(())
    }

    fn resume_parked_relocation(&mut self, addr: &PhysicalPageAddress) -> Result<()> {
        debug!(
            target: "fsim::core",
            block = addr.block,
            "user traffic drained, parked relocation resumes"
        );
        let batch =
            self.gc
                .resume_relocation(&mut self.arena, &mut self.fbm, &mut self.amu, addr)?;
        self.submit_relocation(batch)
    }

    /// The PHY reported a chip going idle; keep it fed.
    pub fn on_chip_idle(&mut self, channel: u32, chip: u32) -> Result<()> {
        let probe = UrgencyProbe {
            gc: &self.gc,
            fbm: &self.fbm,
            geometry: self.geometry,
        };
        self.tsu
            .on_chip_idle(&mut self.arena, &mut self.phy, &probe, channel, chip)?;
        Ok(())
    }

    // -- statistics ----------------------------------------------------------

    #[must_use]
    pub fn mapping_stats(&self) -> &[MappingStats] {
        self.amu.stats()
    }

    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    #[must_use]
    pub fn tsu_stats(&self) -> TsuStats {
        self.tsu.stats()
    }

    #[must_use]
    pub fn stream_stats(&self) -> &[StreamStats] {
        &self.stream_stats
    }

    #[must_use]
    pub fn report(&self) -> String {
        report::render_report(
            self.phy.now(),
            &self.stream_stats,
            self.amu.stats(),
            self.gc.stats(),
            self.tsu.stats(),
        )
    }

    /// Verify the page-count invariant on every plane.
    pub fn check_consistency(&self) -> Result<()> {
        for channel in 0..self.geometry.channels {
            for chip in 0..self.geometry.chips_per_channel {
                for die in 0..self.geometry.dies_per_chip {
                    for plane in 0..self.geometry.planes_per_die {
                        let addr = PhysicalPageAddress {
                            channel,
                            chip,
                            die,
                            plane,
                            ..PhysicalPageAddress::default()
                        };
                        self.fbm.check_consistency(&addr)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl FtlCore<ModelPhy> {
    /// Drive the timing model until every chip is idle and nothing further
    /// can be dispatched.
    pub fn run_until_quiescent(&mut self) -> Result<()> {
        self.pump()?;
        while let Some((channel, chip, batch)) = self.phy.pop_next_completion() {
            for handle in batch {
                self.on_transaction_serviced(handle)?;
            }
            self.on_chip_idle(channel, chip)?;
            self.pump()?;
        }
        Ok(())
    }
}
