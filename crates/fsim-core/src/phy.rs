//! A coarse timing-model PHY.
//!
//! Chips execute one command at a time with fixed latencies; channel transfer
//! time is not modeled (the bus reports idle whenever asked). Suspension is
//! honored: a batch flagged `suspend_required` parks the in-flight command
//! and the parked command resumes, with its remaining time, once the
//! preempting command finishes.

use fsim_error::{FtlError, Result};
use fsim_tsu::{ChannelStatus, ChipStatus, NvmPhy};
use fsim_types::{Geometry, SimTime, TransactionArena, TransactionKind, TxHandle};
use tracing::trace;

/// Command latencies in simulated nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct PhyTiming {
    pub read_ns: u64,
    pub program_ns: u64,
    pub erase_ns: u64,
}

impl Default for PhyTiming {
    fn default() -> Self {
        Self {
            read_ns: 50_000,
            program_ns: 700_000,
            erase_ns: 3_500_000,
        }
    }
}

#[derive(Debug)]
struct Suspended {
    status: ChipStatus,
    remaining: SimTime,
    batch: Vec<TxHandle>,
}

#[derive(Debug)]
struct ChipState {
    status: ChipStatus,
    finish: SimTime,
    batch: Vec<TxHandle>,
    suspended: Option<Suspended>,
}

impl Default for ChipState {
    fn default() -> Self {
        Self {
            status: ChipStatus::Idle,
            finish: SimTime::ZERO,
            batch: Vec::new(),
            suspended: None,
        }
    }
}

/// Fixed-latency flash back end driving the simulated clock.
#[derive(Debug)]
pub struct ModelPhy {
    geometry: Geometry,
    timing: PhyTiming,
    now: SimTime,
    chips: Vec<ChipState>,
}

impl ModelPhy {
    #[must_use]
    pub fn new(geometry: Geometry, timing: PhyTiming) -> Self {
        let chip_count = (geometry.channels * geometry.chips_per_channel) as usize;
        Self {
            geometry,
            timing,
            now: SimTime::ZERO,
            chips: (0..chip_count).map(|_| ChipState::default()).collect(),
        }
    }

    #[must_use]
    pub fn busy_chips(&self) -> usize {
        self.chips.iter().filter(|c| c.status != ChipStatus::Idle).count()
    }

    /// Advance the clock to the next command completion and return it as
    /// `(channel, chip, batch)`. A suspended command resumes automatically.
    /// `None` when every chip is idle.
    pub fn pop_next_completion(&mut self) -> Option<(u32, u32, Vec<TxHandle>)> {
        let (index, _) = self
            .chips
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status != ChipStatus::Idle)
            .min_by_key(|(_, c)| c.finish)?;
        let finish = self.chips[index].finish;
        self.now = finish;
        let batch = std::mem::take(&mut self.chips[index].batch);
        if let Some(parked) = self.chips[index].suspended.take() {
            self.chips[index].status = parked.status;
            self.chips[index].finish = SimTime(finish.0 + parked.remaining.0);
            self.chips[index].batch = parked.batch;
        } else {
            self.chips[index].status = ChipStatus::Idle;
            self.chips[index].finish = SimTime::ZERO;
        }
        let chips_per_channel = self.geometry.chips_per_channel;
        let channel = index as u32 / chips_per_channel;
        let chip = index as u32 % chips_per_channel;
        Some((channel, chip, batch))
    }

    fn latency(&self, kind: &TransactionKind) -> (ChipStatus, u64) {
        match kind {
            TransactionKind::Read(_) => (ChipStatus::Reading, self.timing.read_ns),
            TransactionKind::Write(_) => (ChipStatus::Writing, self.timing.program_ns),
            TransactionKind::Erase(_) => (ChipStatus::Erasing, self.timing.erase_ns),
        }
    }
}

impl NvmPhy for ModelPhy {
    fn now(&self) -> SimTime {
        self.now
    }

    fn channel_status(&self, _channel: u32) -> ChannelStatus {
        ChannelStatus::Idle
    }

    fn chip_status(&self, channel: u32, chip: u32) -> ChipStatus {
        self.chips[self.geometry.chip_index(channel, chip)].status
    }

    fn expected_finish_time(&self, channel: u32, chip: u32) -> SimTime {
        self.chips[self.geometry.chip_index(channel, chip)].finish
    }

    fn has_suspended_command(&self, channel: u32, chip: u32) -> bool {
        self.chips[self.geometry.chip_index(channel, chip)]
            .suspended
            .is_some()
    }

    fn send_command(&mut self, arena: &mut TransactionArena, batch: &[TxHandle]) -> Result<()> {
        let first = batch.first().ok_or_else(|| FtlError::UnknownTransaction {
            detail: "empty command batch".into(),
        })?;
        let (address, kind, suspend) = {
            let tx = arena.get(*first).ok_or_else(|| FtlError::StaleHandle {
                detail: format!("command for retired slot {}", first.index()),
            })?;
            (tx.address, tx.kind, tx.suspend_required)
        };
        let index = self.geometry.chip_index(address.channel, address.chip);
        let (status, latency) = self.latency(&kind);

        let chip = &mut self.chips[index];
        if chip.status != ChipStatus::Idle {
            if !suspend || chip.suspended.is_some() {
                return Err(FtlError::SlotOccupied {
                    detail: format!(
                        "chip {}/{} is busy and the batch cannot suspend it",
                        address.channel, address.chip
                    ),
                });
            }
            chip.suspended = Some(Suspended {
                status: chip.status,
                remaining: chip.finish.saturating_sub(self.now),
                batch: std::mem::take(&mut chip.batch),
            });
            trace!(
                target: "fsim::phy",
                channel = address.channel,
                chip = address.chip,
                "command suspended"
            );
        }
        chip.status = status;
        chip.finish = SimTime(self.now.0 + latency);
        chip.batch = batch.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsim_types::{Lpa, PhysicalPageAddress, SectorBitmap, StreamId, Transaction};

    fn geom() -> Geometry {
        Geometry {
            channels: 2,
            chips_per_channel: 2,
            dies_per_chip: 1,
            planes_per_die: 1,
            blocks_per_plane: 8,
            pages_per_block: 4,
            sectors_per_page: 8,
        }
    }

    fn read_tx(arena: &mut TransactionArena, channel: u32, chip: u32) -> TxHandle {
        let mut tx = Transaction::new_user_read(StreamId(0), Lpa(0), SectorBitmap(0xff));
        tx.address = PhysicalPageAddress {
            channel,
            chip,
            ..PhysicalPageAddress::default()
        };
        tx.physical_address_determined = true;
        arena.insert(tx)
    }

    #[test]
    fn completions_come_back_in_time_order() {
        let mut phy = ModelPhy::new(geom(), PhyTiming::default());
        let mut arena = TransactionArena::new();
        let slow = {
            let mut tx = Transaction::new_user_write(StreamId(0), Lpa(0), SectorBitmap(0xff));
            tx.address = PhysicalPageAddress::default();
            tx.physical_address_determined = true;
            arena.insert(tx)
        };
        phy.send_command(&mut arena, &[slow]).unwrap();
        let fast = read_tx(&mut arena, 1, 0);
        phy.send_command(&mut arena, &[fast]).unwrap();

        let (channel, _, batch) = phy.pop_next_completion().unwrap();
        assert_eq!(channel, 1);
        assert_eq!(batch, vec![fast]);
        assert_eq!(phy.now(), SimTime(50_000));

        let (channel, _, batch) = phy.pop_next_completion().unwrap();
        assert_eq!(channel, 0);
        assert_eq!(batch, vec![slow]);
        assert_eq!(phy.now(), SimTime(700_000));
        assert!(phy.pop_next_completion().is_none());
    }

    #[test]
    fn busy_chip_rejects_non_suspending_batches() {
        let mut phy = ModelPhy::new(geom(), PhyTiming::default());
        let mut arena = TransactionArena::new();
        let a = read_tx(&mut arena, 0, 0);
        let b = read_tx(&mut arena, 0, 0);
        phy.send_command(&mut arena, &[a]).unwrap();
        assert!(matches!(
            phy.send_command(&mut arena, &[b]),
            Err(FtlError::SlotOccupied { .. })
        ));
    }

    #[test]
    fn suspended_program_resumes_with_remaining_time() {
        let mut phy = ModelPhy::new(geom(), PhyTiming::default());
        let mut arena = TransactionArena::new();
        let write = {
            let mut tx = Transaction::new_user_write(StreamId(0), Lpa(0), SectorBitmap(0xff));
            tx.address = PhysicalPageAddress::default();
            tx.physical_address_determined = true;
            arena.insert(tx)
        };
        phy.send_command(&mut arena, &[write]).unwrap();
        assert_eq!(phy.chip_status(0, 0), ChipStatus::Writing);

        let read = {
            let handle = read_tx(&mut arena, 0, 0);
            arena.get_mut(handle).unwrap().suspend_required = true;
            handle
        };
        phy.send_command(&mut arena, &[read]).unwrap();
        assert!(phy.has_suspended_command(0, 0));
        assert_eq!(phy.chip_status(0, 0), ChipStatus::Reading);

        // The read completes first; the program resumes and finishes at
        // read latency + full program latency (it had barely started).
        let (_, _, batch) = phy.pop_next_completion().unwrap();
        assert_eq!(batch, vec![read]);
        assert_eq!(phy.chip_status(0, 0), ChipStatus::Writing);
        let (_, _, batch) = phy.pop_next_completion().unwrap();
        assert_eq!(batch, vec![write]);
        assert_eq!(phy.now(), SimTime(50_000 + 700_000));
    }
}
