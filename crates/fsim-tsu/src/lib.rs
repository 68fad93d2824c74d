#![forbid(unsafe_code)]
//! Out-of-order transaction scheduling.
//!
//! One [`ChipQueues`] per (channel, chip) pair holds the seven dispatch
//! categories. Scheduling is event-driven: the orchestrating layer calls
//! [`on_channel_idle`](TransactionSchedulingUnit::on_channel_idle) /
//! [`on_chip_idle`](TransactionSchedulingUnit::on_chip_idle) and the unit
//! dispatches at most one batch per call — reads first, then writes, then
//! erases. Within a batch every transaction shares the chip and die, targets
//! a distinct plane, and (for reads and writes) the same page index, which is
//! what the multi-plane command set requires.
//!
//! Priorities invert under GC pressure: normally mapping traffic goes first
//! and relocation traffic last, but when the probed urgency is `Urgent` the
//! relocation queue jumps ahead so the free pool recovers.

pub mod phy;
pub mod queues;

pub use phy::{ChannelStatus, ChipStatus, GcUrgencyProbe, NvmPhy};
pub use queues::ChipQueues;

use fsim_config::{SchedulingConfig, SimConfig};
use fsim_error::{FtlError, Result};
use fsim_gc::GcUrgency;
use fsim_types::{Geometry, Transaction, TransactionArena, TransactionCategory, TxHandle};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Read,
    Write,
    Erase,
}

/// Counters exported into the run report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TsuStats {
    pub dispatched_batches: u64,
    pub multiplane_batches: u64,
    pub suspensions_requested: u64,
    pub issued: IssuedCounters,
}

/// Commands issued, broken out per scheduler category.
#[derive(Debug, Default, Clone, Copy)]
pub struct IssuedCounters {
    pub user_reads: u64,
    pub user_writes: u64,
    pub mapping_reads: u64,
    pub mapping_writes: u64,
    pub gc_reads: u64,
    pub gc_writes: u64,
    pub gc_erases: u64,
}

impl IssuedCounters {
    fn bump(&mut self, category: TransactionCategory, count: u64) {
        let slot = match category {
            TransactionCategory::UserRead => &mut self.user_reads,
            TransactionCategory::UserWrite => &mut self.user_writes,
            TransactionCategory::MappingRead => &mut self.mapping_reads,
            TransactionCategory::MappingWrite => &mut self.mapping_writes,
            TransactionCategory::GcRead => &mut self.gc_reads,
            TransactionCategory::GcWrite => &mut self.gc_writes,
            TransactionCategory::GcErase => &mut self.gc_erases,
        };
        *slot += count;
    }
}

#[derive(Debug)]
pub struct TransactionSchedulingUnit {
    geometry: Geometry,
    sched: SchedulingConfig,
    queues: Vec<ChipQueues>,
    /// Open submission frames; see [`prepare_for_submit`](Self::prepare_for_submit).
    prepare_depth: u32,
    /// Transactions held back until the outermost frame closes.
    staged: Vec<TxHandle>,
    /// Round-robin position per channel.
    chip_cursor: Vec<u32>,
    /// Die rotation position per chip.
    die_cursor: Vec<u32>,
    stats: TsuStats,
}

impl TransactionSchedulingUnit {
    #[must_use]
    pub fn new(config: &SimConfig) -> Self {
        let geometry = config.device.geometry();
        let chip_count = (geometry.channels * geometry.chips_per_channel) as usize;
        Self {
            geometry,
            sched: config.scheduling.clone(),
            queues: (0..chip_count).map(|_| ChipQueues::default()).collect(),
            prepare_depth: 0,
            staged: Vec::new(),
            chip_cursor: vec![0; geometry.channels as usize],
            die_cursor: vec![0; chip_count],
            stats: TsuStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> TsuStats {
        self.stats
    }

    /// Total transactions waiting across all queues.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.iter().map(ChipQueues::len).sum()
    }

    /// Open a submission frame. Frames nest: transactions submitted while
    /// any frame is open are held back and enter the dispatch queues
    /// together when the outermost [`schedule`](Self::schedule) closes.
    pub fn prepare_for_submit(&mut self) {
        self.prepare_depth += 1;
    }

    /// Close the innermost submission frame, flushing staged transactions
    /// into the dispatch queues once no frame remains open.
    pub fn schedule(&mut self, arena: &TransactionArena) -> Result<()> {
        if self.prepare_depth == 0 {
            return Err(FtlError::SchedulingProtocol {
                detail: "schedule without a matching prepare_for_submit".into(),
            });
        }
        self.prepare_depth -= 1;
        if self.prepare_depth == 0 {
            for handle in std::mem::take(&mut self.staged) {
                self.enqueue(arena, handle)?;
            }
        }
        Ok(())
    }

    /// Enqueue finalized transactions for dispatch, or stage them while a
    /// submission frame is open.
    ///
    /// Submission requires a determined physical address; translation must
    /// have finished first.
    pub fn submit(&mut self, arena: &TransactionArena, handles: &[TxHandle]) -> Result<()> {
        for &handle in handles {
            if self.prepare_depth > 0 {
                // Validate at the submit site so protocol violations do not
                // surface only when the frame closes.
                self.check(arena, handle)?;
                self.staged.push(handle);
            } else {
                self.enqueue(arena, handle)?;
            }
        }
        Ok(())
    }

    fn check(
        &self,
        arena: &TransactionArena,
        handle: TxHandle,
    ) -> Result<(TransactionCategory, usize)> {
        let tx = arena.get(handle).ok_or_else(|| FtlError::StaleHandle {
            detail: format!("submitting retired slot {}", handle.index()),
        })?;
        if !tx.physical_address_determined {
            return Err(FtlError::MappingProtocol {
                detail: format!("slot {} submitted before translation", handle.index()),
            });
        }
        let category = tx.category().ok_or_else(|| FtlError::UnknownTransaction {
            detail: format!("slot {} has no scheduler category", handle.index()),
        })?;
        let qi = self.geometry.chip_index(tx.address.channel, tx.address.chip);
        Ok((category, qi))
    }

    fn enqueue(&mut self, arena: &TransactionArena, handle: TxHandle) -> Result<()> {
        let (category, qi) = self.check(arena, handle)?;
        self.queues[qi].queue_mut(category).push_back(handle);
        Ok(())
    }

    // -- dispatch ------------------------------------------------------------

    /// The channel bus went idle: service its chips round-robin, dispatching
    /// at most one batch. Returns whether anything was dispatched.
    pub fn on_channel_idle<P: NvmPhy>(
        &mut self,
        arena: &mut TransactionArena,
        phy: &mut P,
        probe: &impl GcUrgencyProbe,
        channel: u32,
    ) -> Result<bool> {
        let chips = self.geometry.chips_per_channel;
        let start = self.chip_cursor[channel as usize];
        for offset in 0..chips {
            let chip = (start + offset) % chips;
            if self.service_chip(arena, phy, probe, channel, chip)? {
                self.chip_cursor[channel as usize] = (chip + 1) % chips;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A chip finished (or suspended) its command: try to keep it busy.
    pub fn on_chip_idle<P: NvmPhy>(
        &mut self,
        arena: &mut TransactionArena,
        phy: &mut P,
        probe: &impl GcUrgencyProbe,
        channel: u32,
        chip: u32,
    ) -> Result<bool> {
        self.service_chip(arena, phy, probe, channel, chip)
    }

    fn service_chip<P: NvmPhy>(
        &mut self,
        arena: &mut TransactionArena,
        phy: &mut P,
        probe: &impl GcUrgencyProbe,
        channel: u32,
        chip: u32,
    ) -> Result<bool> {
        if phy.channel_status(channel) != ChannelStatus::Idle {
            return Ok(false);
        }
        for service in [Service::Read, Service::Write, Service::Erase] {
            if self.try_service(service, arena, phy, probe, channel, chip)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_service<P: NvmPhy>(
        &mut self,
        service: Service,
        arena: &mut TransactionArena,
        phy: &mut P,
        probe: &impl GcUrgencyProbe,
        channel: u32,
        chip: u32,
    ) -> Result<bool> {
        let Some(suspend) = self.gate(service, phy, channel, chip) else {
            return Ok(false);
        };
        let qi = self.geometry.chip_index(channel, chip);
        let urgent = probe.urgency(channel, chip) == GcUrgency::Urgent;
        use TransactionCategory as C;
        let categories: &[TransactionCategory] = match service {
            Service::Read => {
                if urgent && !self.queues[qi].gc_read.is_empty() {
                    &[C::GcRead, C::UserRead, C::MappingRead]
                } else {
                    &[C::MappingRead, C::UserRead, C::GcRead]
                }
            }
            Service::Write => {
                if urgent && !self.queues[qi].gc_write.is_empty() {
                    &[C::GcWrite, C::UserWrite, C::MappingWrite]
                } else {
                    &[C::MappingWrite, C::UserWrite, C::GcWrite]
                }
            }
            Service::Erase => &[C::GcErase],
        };

        let dies = self.geometry.dies_per_chip;
        let start_die = self.die_cursor[qi];
        for &category in categories {
            for offset in 0..dies {
                let die = (start_die + offset) % dies;
                let batch = self.build_batch(arena, qi, category, die);
                if batch.is_empty() {
                    continue;
                }
                self.die_cursor[qi] = (die + 1) % dies;
                self.dispatch(arena, phy, qi, category, batch, suspend)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether this service class may touch the chip right now, and whether
    /// doing so requires suspending the in-flight command. Each chip-state
    /// case decides on its own threshold; there is no fallthrough between
    /// the program and erase cases.
    fn gate<P: NvmPhy>(
        &self,
        service: Service,
        phy: &P,
        channel: u32,
        chip: u32,
    ) -> Option<bool> {
        let status = phy.chip_status(channel, chip);
        if status == ChipStatus::Idle {
            return Some(false);
        }
        let remaining = || phy.expected_finish_time(channel, chip).saturating_sub(phy.now());
        let suspendable = !phy.has_suspended_command(channel, chip);
        match (service, status) {
            (Service::Read, ChipStatus::Writing) => (self.sched.program_suspension_enabled
                && suspendable
                && remaining() > self.sched.write_reasonable_suspension_time_for_read)
                .then_some(true),
            (Service::Read, ChipStatus::Erasing) => (self.sched.erase_suspension_enabled
                && suspendable
                && remaining() > self.sched.erase_reasonable_suspension_time_for_read)
                .then_some(true),
            (Service::Write, ChipStatus::Erasing) => (self.sched.erase_suspension_enabled
                && suspendable
                && remaining() > self.sched.erase_reasonable_suspension_time_for_write)
                .then_some(true),
            _ => None,
        }
    }

    /// Collect a multi-plane batch from one queue: same die, at most one
    /// transaction per plane, and a common page index for reads and writes
    /// (erases have no page anchor). Queue order is preserved; the first
    /// eligible transaction on the die anchors the page.
    fn build_batch(
        &self,
        arena: &TransactionArena,
        qi: usize,
        category: TransactionCategory,
        die: u32,
    ) -> Vec<TxHandle> {
        let planes = self.geometry.planes_per_die as usize;
        let mut batch = Vec::new();
        let mut planes_used = vec![false; planes];
        let mut anchor_page: Option<u32> = None;
        for &handle in self.queues[qi].queue(category) {
            let Some(tx) = arena.get(handle) else { continue };
            if tx.address.die != die || !eligible(tx) {
                continue;
            }
            let plane = tx.address.plane as usize;
            if planes_used[plane] {
                continue;
            }
            if category != TransactionCategory::GcErase {
                match anchor_page {
                    None => anchor_page = Some(tx.address.page),
                    Some(page) if page != tx.address.page => continue,
                    Some(_) => {}
                }
            }
            planes_used[plane] = true;
            batch.push(handle);
            if batch.len() == planes {
                break;
            }
        }
        batch
    }

    fn dispatch<P: NvmPhy>(
        &mut self,
        arena: &mut TransactionArena,
        phy: &mut P,
        qi: usize,
        category: TransactionCategory,
        batch: Vec<TxHandle>,
        suspend: bool,
    ) -> Result<()> {
        self.queues[qi]
            .queue_mut(category)
            .retain(|handle| !batch.contains(handle));
        if suspend {
            self.stats.suspensions_requested += 1;
            for &handle in &batch {
                if let Some(tx) = arena.get_mut(handle) {
                    tx.suspend_required = true;
                }
            }
        }
        self.stats.dispatched_batches += 1;
        if batch.len() > 1 {
            self.stats.multiplane_batches += 1;
        }
        self.stats.issued.bump(category, batch.len() as u64);
        trace!(
            target: "fsim::tsu",
            ?category,
            size = batch.len(),
            suspend,
            "batch dispatched"
        );
        phy.send_command(arena, &batch)
    }
}

/// A write waiting on its companion read has no data yet; an erase with
/// outstanding movements would destroy pages still being relocated.
fn eligible(tx: &Transaction) -> bool {
    if let Some(wtx) = tx.as_write() {
        return wtx.related_read.is_none();
    }
    if let Some(etx) = tx.as_erase() {
        return etx.pending_movements == 0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsim_config::DeviceConfig;
    use fsim_types::{Lpa, PhysicalPageAddress, Ppa, SectorBitmap, SimTime, StreamId};
    use std::collections::HashMap;

    const S: StreamId = StreamId(0);
    const FULL: SectorBitmap = SectorBitmap(0xff);

    fn config() -> SimConfig {
        let mut config = SimConfig::default();
        config.device = DeviceConfig {
            channel_count: 1,
            chips_per_channel: 1,
            dies_per_chip: 2,
            planes_per_die: 2,
            blocks_per_plane: 8,
            pages_per_block: 4,
            sectors_per_page: 8,
            overprovisioning_ratio: 0.07,
        };
        config
    }

    #[derive(Default)]
    struct MockPhy {
        now: u64,
        channel_busy: bool,
        chips: HashMap<(u32, u32), (ChipStatus, u64, bool)>,
        sent: Vec<Vec<TxHandle>>,
    }

    impl MockPhy {
        fn set_chip(&mut self, channel: u32, chip: u32, status: ChipStatus, finish: u64) {
            self.chips.insert((channel, chip), (status, finish, false));
        }
    }

    impl NvmPhy for MockPhy {
        fn now(&self) -> SimTime {
            SimTime(self.now)
        }
        fn channel_status(&self, _channel: u32) -> ChannelStatus {
            if self.channel_busy {
                ChannelStatus::Busy
            } else {
                ChannelStatus::Idle
            }
        }
        fn chip_status(&self, channel: u32, chip: u32) -> ChipStatus {
            self.chips
                .get(&(channel, chip))
                .map_or(ChipStatus::Idle, |&(status, _, _)| status)
        }
        fn expected_finish_time(&self, channel: u32, chip: u32) -> SimTime {
            SimTime(self.chips.get(&(channel, chip)).map_or(0, |&(_, t, _)| t))
        }
        fn has_suspended_command(&self, channel: u32, chip: u32) -> bool {
            self.chips
                .get(&(channel, chip))
                .is_some_and(|&(_, _, suspended)| suspended)
        }
        fn send_command(&mut self, _arena: &mut TransactionArena, batch: &[TxHandle]) -> Result<()> {
            self.sent.push(batch.to_vec());
            Ok(())
        }
    }

    struct FixedUrgency(GcUrgency);

    impl GcUrgencyProbe for FixedUrgency {
        fn urgency(&self, _channel: u32, _chip: u32) -> GcUrgency {
            self.0
        }
    }

    fn place(mut tx: Transaction, die: u32, plane: u32, page: u32) -> Transaction {
        tx.address = PhysicalPageAddress {
            channel: 0,
            chip: 0,
            die,
            plane,
            block: 1,
            page,
        };
        tx.ppa = Ppa(u64::from(die * 1000 + plane * 100 + page));
        tx.physical_address_determined = true;
        tx
    }

    fn user_read(arena: &mut TransactionArena, die: u32, plane: u32, page: u32) -> TxHandle {
        arena.insert(place(Transaction::new_user_read(S, Lpa(0), FULL), die, plane, page))
    }

    fn harness() -> (TransactionSchedulingUnit, TransactionArena, MockPhy) {
        (
            TransactionSchedulingUnit::new(&config()),
            TransactionArena::new(),
            MockPhy::default(),
        )
    }

    const CALM: FixedUrgency = FixedUrgency(GcUrgency::None);
    const URGENT: FixedUrgency = FixedUrgency(GcUrgency::Urgent);

    #[test]
    fn multiplane_batch_needs_same_die_and_page() {
        let (mut tsu, mut arena, mut phy) = harness();
        let a = user_read(&mut arena, 0, 0, 3);
        let b = user_read(&mut arena, 0, 1, 3); // same die, other plane, same page
        let c = user_read(&mut arena, 0, 1, 2); // page mismatch
        let d = user_read(&mut arena, 1, 0, 3); // other die
        tsu.submit(&arena, &[a, b, c, d]).unwrap();

        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![a, b]);
        assert_eq!(tsu.stats().multiplane_batches, 1);

        // Die rotation moves to die 1 for the next batch.
        assert!(tsu.on_chip_idle(&mut arena, &mut phy, &CALM, 0, 0).unwrap());
        assert_eq!(phy.sent[1], vec![d]);
        assert!(tsu.on_chip_idle(&mut arena, &mut phy, &CALM, 0, 0).unwrap());
        assert_eq!(phy.sent[2], vec![c]);
        assert_eq!(tsu.queued(), 0);
    }

    #[test]
    fn mapping_reads_outrank_user_reads_until_gc_is_urgent() {
        let (mut tsu, mut arena, mut phy) = harness();
        let user = user_read(&mut arena, 0, 0, 0);
        let mapping =
            arena.insert(place(Transaction::new_mapping_read(S, Lpa(0), FULL), 0, 0, 1));
        let gc = {
            let mut tx = Transaction::new_gc_read(S, FULL);
            tx = place(tx, 0, 0, 2);
            arena.insert(tx)
        };
        tsu.submit(&arena, &[user, mapping, gc]).unwrap();

        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![mapping]);

        // Under urgent pressure the relocation read jumps the queue.
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &URGENT, 0).unwrap());
        assert_eq!(phy.sent[1], vec![gc]);
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[2], vec![user]);
    }

    #[test]
    fn writes_wait_for_their_companion_read() {
        let (mut tsu, mut arena, mut phy) = harness();
        let write = arena.insert(place(Transaction::new_gc_write(S, FULL), 0, 0, 0));
        let read = arena.insert(place(Transaction::new_gc_read(S, FULL), 0, 0, 0));
        arena.get_mut(write).unwrap().as_write_mut().unwrap().related_read = Some(read);
        tsu.submit(&arena, &[write]).unwrap();

        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());

        arena.get_mut(write).unwrap().as_write_mut().unwrap().related_read = None;
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![write]);
    }

    #[test]
    fn erase_waits_for_movements_and_an_idle_chip() {
        let (mut tsu, mut arena, mut phy) = harness();
        let victim = PhysicalPageAddress {
            die: 0,
            plane: 0,
            block: 5,
            ..PhysicalPageAddress::default()
        };
        let erase = arena.insert(Transaction::new_gc_erase(S, victim, 2));
        tsu.submit(&arena, &[erase]).unwrap();

        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());

        arena.get_mut(erase).unwrap().as_erase_mut().unwrap().pending_movements = 0;
        phy.set_chip(0, 0, ChipStatus::Writing, 10);
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());

        phy.set_chip(0, 0, ChipStatus::Idle, 0);
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![erase]);
    }

    #[test]
    fn reads_suspend_long_programs_when_enabled() {
        let mut config = config();
        config.scheduling.program_suspension_enabled = true;
        config.scheduling.write_reasonable_suspension_time_for_read = SimTime(1_000);
        let mut tsu = TransactionSchedulingUnit::new(&config);
        let mut arena = TransactionArena::new();
        let mut phy = MockPhy::default();

        let read = user_read(&mut arena, 0, 0, 0);
        tsu.submit(&arena, &[read]).unwrap();

        // Remaining time below the threshold: waiting is cheaper.
        phy.now = 0;
        phy.set_chip(0, 0, ChipStatus::Writing, 900);
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());

        // Long remaining program: suspend it.
        phy.set_chip(0, 0, ChipStatus::Writing, 5_000);
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert!(arena.get(read).unwrap().suspend_required);
        assert_eq!(tsu.stats().suspensions_requested, 1);
    }

    #[test]
    fn suspension_is_off_by_default() {
        let (mut tsu, mut arena, mut phy) = harness();
        let read = user_read(&mut arena, 0, 0, 0);
        tsu.submit(&arena, &[read]).unwrap();
        phy.set_chip(0, 0, ChipStatus::Writing, u64::MAX);
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
    }

    #[test]
    fn each_chip_state_uses_its_own_erase_threshold() {
        let mut config = config();
        config.scheduling.erase_suspension_enabled = true;
        config.scheduling.erase_reasonable_suspension_time_for_read = SimTime(1_000);
        config.scheduling.erase_reasonable_suspension_time_for_write = SimTime(4_000);
        let mut tsu = TransactionSchedulingUnit::new(&config);
        let mut arena = TransactionArena::new();
        let mut phy = MockPhy::default();

        // Remaining erase time 2_000: above the read threshold, below the
        // write threshold.
        phy.set_chip(0, 0, ChipStatus::Erasing, 2_000);

        let write = arena.insert(place(Transaction::new_user_write(S, Lpa(0), FULL), 0, 0, 0));
        tsu.submit(&arena, &[write]).unwrap();
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());

        let read = user_read(&mut arena, 0, 0, 0);
        tsu.submit(&arena, &[read]).unwrap();
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![read]);
        assert!(arena.get(read).unwrap().suspend_required);
    }

    #[test]
    fn at_most_one_suspension_per_chip() {
        let mut config = config();
        config.scheduling.program_suspension_enabled = true;
        config.scheduling.write_reasonable_suspension_time_for_read = SimTime(1);
        let mut tsu = TransactionSchedulingUnit::new(&config);
        let mut arena = TransactionArena::new();
        let mut phy = MockPhy::default();

        let read = user_read(&mut arena, 0, 0, 0);
        tsu.submit(&arena, &[read]).unwrap();
        phy.chips.insert((0, 0), (ChipStatus::Writing, 1_000_000, true));
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
    }

    #[test]
    fn busy_channel_blocks_dispatch() {
        let (mut tsu, mut arena, mut phy) = harness();
        let read = user_read(&mut arena, 0, 0, 0);
        tsu.submit(&arena, &[read]).unwrap();
        phy.channel_busy = true;
        assert!(!tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        phy.channel_busy = false;
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
    }

    #[test]
    fn nested_frames_flush_on_the_outermost_schedule() {
        let (mut tsu, mut arena, mut phy) = harness();
        let a = user_read(&mut arena, 0, 0, 0);
        let b = user_read(&mut arena, 0, 1, 0);

        tsu.prepare_for_submit();
        tsu.submit(&arena, &[a]).unwrap();
        tsu.prepare_for_submit();
        tsu.submit(&arena, &[b]).unwrap();
        tsu.schedule(&arena).unwrap();
        assert_eq!(tsu.queued(), 0, "inner frame must not flush");
        tsu.schedule(&arena).unwrap();
        assert_eq!(tsu.queued(), 2);

        // Both staged reads land together as one multi-plane batch.
        assert!(tsu.on_channel_idle(&mut arena, &mut phy, &CALM, 0).unwrap());
        assert_eq!(phy.sent[0], vec![a, b]);
    }

    #[test]
    fn schedule_without_an_open_frame_is_rejected() {
        let (mut tsu, arena, _) = harness();
        assert!(matches!(
            tsu.schedule(&arena),
            Err(FtlError::SchedulingProtocol { .. })
        ));
    }

    #[test]
    fn submission_requires_translation_and_a_category() {
        let (mut tsu, arena, _) = harness();
        let mut arena = arena;
        let untranslated = arena.insert(Transaction::new_user_read(S, Lpa(0), FULL));
        assert!(matches!(
            tsu.submit(&arena, &[untranslated]),
            Err(FtlError::MappingProtocol { .. })
        ));

        let mut bogus = Transaction::new_gc_erase(S, PhysicalPageAddress::default(), 0);
        bogus.source = fsim_types::TransactionSource::UserIo;
        let bogus = arena.insert(bogus);
        assert!(matches!(
            tsu.submit(&arena, &[bogus]),
            Err(FtlError::UnknownTransaction { .. })
        ));
    }
}
