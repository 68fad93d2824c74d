//! The scheduler's view of the flash back end.
//!
//! The scheduler never owns timing; it asks the PHY what each channel and
//! chip is doing and hands over finalized batches. Production code plugs in
//! a timing model; tests plug in mocks.

use fsim_error::Result;
use fsim_gc::GcUrgency;
use fsim_types::{SimTime, TransactionArena, TxHandle};

/// Channel bus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Busy,
}

/// Chip command state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipStatus {
    Idle,
    Reading,
    Writing,
    Erasing,
}

/// Flash back-end abstraction the scheduler dispatches into.
pub trait NvmPhy {
    /// Current simulated time.
    fn now(&self) -> SimTime;

    fn channel_status(&self, channel: u32) -> ChannelStatus;

    fn chip_status(&self, channel: u32, chip: u32) -> ChipStatus;

    /// When the chip's in-flight command is expected to finish. Meaningless
    /// for an idle chip.
    fn expected_finish_time(&self, channel: u32, chip: u32) -> SimTime;

    /// A previously suspended command is parked on the chip. At most one
    /// command may be suspended per chip, so no further suspension is
    /// reasonable until it resumes.
    fn has_suspended_command(&self, channel: u32, chip: u32) -> bool;

    /// Issue a finalized batch. Every transaction targets the same chip and
    /// die; multi-plane batches carry at most one transaction per plane.
    fn send_command(&mut self, arena: &mut TransactionArena, batch: &[TxHandle]) -> Result<()>;
}

/// Scheduler-side view of GC pressure, answered by the orchestrating layer.
pub trait GcUrgencyProbe {
    /// Worst urgency over the planes of the given chip.
    fn urgency(&self, channel: u32, chip: u32) -> GcUrgency;
}
