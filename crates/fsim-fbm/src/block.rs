//! Per-block bookkeeping and the block service-state machine.

use fsim_types::{Lpa, StreamId, TxHandle};

/// Service state of a physical block.
///
/// The machine exists to serialize user I/O against background relocation:
/// GC may start moving a block's pages only once the block has no in-flight
/// user programs and no in-flight user reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockServiceState {
    /// No user I/O, no GC/WL activity.
    Idle,
    /// GC/WL is relocating this block; no user I/O in flight.
    GcWl,
    /// User I/O in flight; no GC/WL interest.
    User,
    /// GC/WL relocation in progress while user reads of not-yet-moved pages
    /// are still being serviced.
    GcUser,
    /// GC/WL selected this block but is waiting for pre-existing user I/O to
    /// drain before relocating.
    GcWaitingForUser,
    /// As `GcWaitingForUser`, with additional user I/O having arrived while
    /// GC was already waiting.
    GcUserWaitingForUser,
}

impl BlockServiceState {
    /// GC/WL has claimed this block in some form.
    #[must_use]
    pub fn gc_in_progress(self) -> bool {
        !matches!(self, Self::Idle | Self::User)
    }

    /// GC is parked until user I/O drains.
    #[must_use]
    pub fn gc_waiting(self) -> bool {
        matches!(self, Self::GcWaitingForUser | Self::GcUserWaitingForUser)
    }
}

/// Bookkeeping record for one physical block.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub block_id: u32,
    /// Stream whose frontier last owned this block.
    pub stream: StreamId,
    pub erase_count: u32,
    /// Next page program index; equals `pages_per_block` when full.
    pub write_index: u32,
    pub state: BlockServiceState,
    /// This block stores translation pages rather than user data.
    pub holds_mapping_data: bool,
    /// Erase transaction reclaiming this block, if one is in flight.
    pub erase_tx: Option<TxHandle>,
    pub ongoing_user_reads: u32,
    pub ongoing_user_programs: u32,
    /// Relocation and mapping write-back programs in flight on this block.
    /// Nonzero keeps the block out of victim selection.
    pub ongoing_background_programs: u32,
    /// One bit per page; set = invalid.
    invalid_bitmap: Vec<u64>,
    pub invalid_page_count: u32,
    /// LPA programmed into each page (page metadata), used by relocation.
    page_lpas: Vec<Option<Lpa>>,
}

impl BlockRecord {
    #[must_use]
    pub fn new(block_id: u32, pages_per_block: u32) -> Self {
        let words = (pages_per_block as usize).div_ceil(64);
        Self {
            block_id,
            stream: StreamId(0),
            erase_count: 0,
            write_index: 0,
            state: BlockServiceState::Idle,
            holds_mapping_data: false,
            erase_tx: None,
            ongoing_user_reads: 0,
            ongoing_user_programs: 0,
            ongoing_background_programs: 0,
            invalid_bitmap: vec![0; words],
            invalid_page_count: 0,
            page_lpas: vec![None; pages_per_block as usize],
        }
    }

    #[must_use]
    pub fn is_page_invalid(&self, page: u32) -> bool {
        let word = (page / 64) as usize;
        (self.invalid_bitmap[word] >> (page % 64)) & 1 == 1
    }

    /// Flip the page's invalid bit. Returns `false` when the page was already
    /// invalid, so counters are updated exactly once per page.
    pub fn invalidate_page(&mut self, page: u32) -> bool {
        if self.is_page_invalid(page) {
            return false;
        }
        let word = (page / 64) as usize;
        self.invalid_bitmap[word] |= 1 << (page % 64);
        self.invalid_page_count += 1;
        true
    }

    #[must_use]
    pub fn mapped_lpa(&self, page: u32) -> Option<Lpa> {
        self.page_lpas.get(page as usize).copied().flatten()
    }

    pub fn record_mapped_lpa(&mut self, page: u32, lpa: Lpa) {
        self.page_lpas[page as usize] = Some(lpa);
    }

    /// Valid (written and not invalidated) page count.
    #[must_use]
    pub fn valid_page_count(&self) -> u32 {
        self.write_index - self.invalid_page_count
    }

    #[must_use]
    pub fn has_ongoing_user_io(&self) -> bool {
        self.ongoing_user_reads > 0 || self.ongoing_user_programs > 0
    }

    /// Reset after a completed erase; the block returns to the free pool.
    pub fn reset_after_erase(&mut self) {
        self.erase_count += 1;
        self.write_index = 0;
        self.invalid_page_count = 0;
        self.invalid_bitmap.fill(0);
        self.page_lpas.fill(None);
        self.holds_mapping_data = false;
        self.erase_tx = None;
        self.state = BlockServiceState::Idle;
    }

    // -- service-state transitions ------------------------------------------

    /// User read or program started on this block.
    pub fn note_user_io_started(&mut self) {
        use BlockServiceState as S;
        self.state = match self.state {
            S::Idle => S::User,
            S::User => S::User,
            S::GcWl | S::GcUser => S::GcUser,
            S::GcWaitingForUser | S::GcUserWaitingForUser => S::GcUserWaitingForUser,
        };
    }

    /// Last in-flight user operation finished. Returns `true` when a parked
    /// GC relocation may now begin.
    pub fn note_user_io_finished(&mut self) -> bool {
        use BlockServiceState as S;
        if self.has_ongoing_user_io() {
            return false;
        }
        let (next, gc_ready) = match self.state {
            S::Idle | S::GcWl => (self.state, false),
            S::User => (S::Idle, false),
            S::GcUser => (S::GcWl, false),
            S::GcWaitingForUser | S::GcUserWaitingForUser => (S::GcWl, true),
        };
        self.state = next;
        gc_ready
    }

    /// GC/WL claims this block. Returns `true` when relocation may start
    /// immediately, `false` when GC must wait for user I/O to drain.
    ///
    /// Callers must have verified `ongoing_user_programs == 0` before
    /// selecting the block as a victim.
    pub fn note_gc_started(&mut self) -> bool {
        use BlockServiceState as S;
        debug_assert_eq!(self.ongoing_user_programs, 0);
        if self.ongoing_user_reads > 0 {
            self.state = S::GcWaitingForUser;
            false
        } else {
            self.state = S::GcWl;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_counts_each_page_once() {
        let mut block = BlockRecord::new(0, 128);
        assert!(block.invalidate_page(5));
        assert!(!block.invalidate_page(5));
        assert_eq!(block.invalid_page_count, 1);
        assert!(block.is_page_invalid(5));
        assert!(!block.is_page_invalid(6));
    }

    #[test]
    fn erase_resets_everything_but_the_erase_count() {
        let mut block = BlockRecord::new(3, 64);
        block.write_index = 64;
        block.invalidate_page(0);
        block.record_mapped_lpa(0, Lpa(42));
        block.holds_mapping_data = true;
        block.reset_after_erase();
        assert_eq!(block.erase_count, 1);
        assert_eq!(block.write_index, 0);
        assert_eq!(block.invalid_page_count, 0);
        assert!(!block.is_page_invalid(0));
        assert!(block.mapped_lpa(0).is_none());
        assert!(!block.holds_mapping_data);
        assert_eq!(block.state, BlockServiceState::Idle);
    }

    #[test]
    fn gc_waits_for_inflight_reads_then_proceeds() {
        let mut block = BlockRecord::new(0, 64);
        block.ongoing_user_reads = 2;
        block.note_user_io_started();
        assert_eq!(block.state, BlockServiceState::User);

        assert!(!block.note_gc_started());
        assert_eq!(block.state, BlockServiceState::GcWaitingForUser);

        // Another read arrives while GC is parked.
        block.ongoing_user_reads += 1;
        block.note_user_io_started();
        assert_eq!(block.state, BlockServiceState::GcUserWaitingForUser);

        block.ongoing_user_reads = 1;
        assert!(!block.note_user_io_finished());
        block.ongoing_user_reads = 0;
        assert!(block.note_user_io_finished());
        assert_eq!(block.state, BlockServiceState::GcWl);
    }

    #[test]
    fn reads_during_relocation_move_through_gc_user() {
        let mut block = BlockRecord::new(0, 64);
        assert!(block.note_gc_started());
        assert_eq!(block.state, BlockServiceState::GcWl);

        block.ongoing_user_reads = 1;
        block.note_user_io_started();
        assert_eq!(block.state, BlockServiceState::GcUser);

        block.ongoing_user_reads = 0;
        assert!(!block.note_user_io_finished());
        assert_eq!(block.state, BlockServiceState::GcWl);
    }
}
