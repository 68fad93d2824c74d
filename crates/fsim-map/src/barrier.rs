//! The two-level GC barrier.
//!
//! When GC starts relocating a block the whole block is marked barriered;
//! individual LPAs (or translation-page numbers, for mapping blocks) are then
//! locked one by one as each page's LPA becomes known. Only the per-LPA lock
//! actually blocks traffic: transactions arriving for a locked LPA/MVPN are
//! parked on a waiting list and replayed in arrival order when the
//! relocation write for that page completes. Accesses to pages whose
//! relocation has not yet begun flow through untouched — that is the point
//! of the two levels.

use fsim_error::{FtlError, Result};
use fsim_types::{Lpa, Mvpn, StreamId, TxHandle};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct BarrierControl {
    /// (plane index, block id) pairs under relocation.
    barriered_blocks: HashSet<(usize, u32)>,
    lpa_locks: HashMap<(u8, u64), VecDeque<TxHandle>>,
    mvpn_locks: HashMap<(u8, u64), VecDeque<TxHandle>>,
}

impl BarrierControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- block level ---------------------------------------------------------

    pub fn start_servicing_block(&mut self, plane_index: usize, block_id: u32) -> Result<()> {
        if !self.barriered_blocks.insert((plane_index, block_id)) {
            return Err(FtlError::SlotOccupied {
                detail: format!("block {block_id} on plane {plane_index} is already barriered"),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_block_barriered(&self, plane_index: usize, block_id: u32) -> bool {
        self.barriered_blocks.contains(&(plane_index, block_id))
    }

    pub fn stop_servicing_block(&mut self, plane_index: usize, block_id: u32) {
        self.barriered_blocks.remove(&(plane_index, block_id));
    }

    // -- LPA level -----------------------------------------------------------

    /// Lock an LPA whose relocation write is now in flight. Double-locking is
    /// an invariant violation: two relocations of the same page cannot
    /// coexist.
    pub fn lock_lpa(&mut self, stream: StreamId, lpa: Lpa) -> Result<()> {
        match self.lpa_locks.entry((stream.0, lpa.0)) {
            std::collections::hash_map::Entry::Occupied(_) => Err(FtlError::SlotOccupied {
                detail: format!("lpa {} of stream {} is already locked", lpa.0, stream.0),
            }),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_lpa_locked(&self, stream: StreamId, lpa: Lpa) -> bool {
        self.lpa_locks.contains_key(&(stream.0, lpa.0))
    }

    /// Park a transaction behind a locked LPA; replayed on unlock in arrival
    /// order.
    pub fn queue_on_lpa(&mut self, stream: StreamId, lpa: Lpa, handle: TxHandle) -> Result<()> {
        self.lpa_locks
            .get_mut(&(stream.0, lpa.0))
            .ok_or_else(|| FtlError::MappingProtocol {
                detail: format!("queueing on unlocked lpa {} of stream {}", lpa.0, stream.0),
            })?
            .push_back(handle);
        Ok(())
    }

    /// Release the lock, returning parked transactions in arrival order.
    pub fn unlock_lpa(&mut self, stream: StreamId, lpa: Lpa) -> Vec<TxHandle> {
        self.lpa_locks
            .remove(&(stream.0, lpa.0))
            .map(Vec::from)
            .unwrap_or_default()
    }

    // -- MVPN level (translation-page relocation) ----------------------------

    pub fn lock_mvpn(&mut self, stream: StreamId, mvpn: Mvpn) -> Result<()> {
        match self.mvpn_locks.entry((stream.0, mvpn.0)) {
            std::collections::hash_map::Entry::Occupied(_) => Err(FtlError::SlotOccupied {
                detail: format!("mvpn {} of stream {} is already locked", mvpn.0, stream.0),
            }),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_mvpn_locked(&self, stream: StreamId, mvpn: Mvpn) -> bool {
        self.mvpn_locks.contains_key(&(stream.0, mvpn.0))
    }

    pub fn queue_on_mvpn(&mut self, stream: StreamId, mvpn: Mvpn, handle: TxHandle) -> Result<()> {
        self.mvpn_locks
            .get_mut(&(stream.0, mvpn.0))
            .ok_or_else(|| FtlError::MappingProtocol {
                detail: format!("queueing on unlocked mvpn {} of stream {}", mvpn.0, stream.0),
            })?
            .push_back(handle);
        Ok(())
    }

    pub fn unlock_mvpn(&mut self, stream: StreamId, mvpn: Mvpn) -> Vec<TxHandle> {
        self.mvpn_locks
            .remove(&(stream.0, mvpn.0))
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsim_types::{SectorBitmap, Transaction, TransactionArena};

    #[test]
    fn waiters_replay_in_arrival_order() {
        let mut arena = TransactionArena::new();
        let mut barrier = BarrierControl::new();
        let stream = StreamId(0);
        barrier.lock_lpa(stream, Lpa(5)).unwrap();

        let first = arena.insert(Transaction::new_user_write(
            stream,
            Lpa(5),
            SectorBitmap::full_page(8),
        ));
        let second = arena.insert(Transaction::new_user_read(
            stream,
            Lpa(5),
            SectorBitmap::full_page(8),
        ));
        barrier.queue_on_lpa(stream, Lpa(5), first).unwrap();
        barrier.queue_on_lpa(stream, Lpa(5), second).unwrap();

        assert!(barrier.is_lpa_locked(stream, Lpa(5)));
        assert_eq!(barrier.unlock_lpa(stream, Lpa(5)), vec![first, second]);
        assert!(!barrier.is_lpa_locked(stream, Lpa(5)));
        assert!(barrier.unlock_lpa(stream, Lpa(5)).is_empty());
    }

    #[test]
    fn double_lock_is_an_invariant_violation() {
        let mut barrier = BarrierControl::new();
        barrier.lock_lpa(StreamId(0), Lpa(1)).unwrap();
        assert!(matches!(
            barrier.lock_lpa(StreamId(0), Lpa(1)),
            Err(FtlError::SlotOccupied { .. })
        ));
        // Same LPA under a different stream is a distinct lock.
        barrier.lock_lpa(StreamId(1), Lpa(1)).unwrap();
    }

    #[test]
    fn block_barrier_is_independent_of_lpa_locks() {
        let mut barrier = BarrierControl::new();
        barrier.start_servicing_block(3, 17).unwrap();
        assert!(barrier.is_block_barriered(3, 17));
        assert!(!barrier.is_lpa_locked(StreamId(0), Lpa(17)));
        barrier.stop_servicing_block(3, 17);
        assert!(!barrier.is_block_barriered(3, 17));
    }
}
