//! Arena allocation for in-flight transactions.
//!
//! Transactions are created by the mapping unit and the GC/WL unit, queued by
//! the scheduler, and retired by their creator on PHY completion. Components
//! hold [`TxHandle`]s — generation-checked indices into the arena — instead of
//! references, so a retired transaction's slot can be reused without any risk
//! of a stale queue entry resolving to the wrong transaction: the generation
//! check turns use-after-free into `None`.

use crate::transaction::Transaction;

/// Stable, generation-checked handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle {
    index: u32,
    generation: u32,
}

impl TxHandle {
    /// Raw slot index; for diagnostics only.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
struct ArenaSlot {
    generation: u32,
    tx: Option<Transaction>,
}

/// Pool of in-flight transactions with O(1) insert/remove and handle reuse.
#[derive(Debug, Default)]
pub struct TransactionArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    live: usize,
}

impl TransactionArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, tx: Transaction) -> TxHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.tx.is_none());
            slot.tx = Some(tx);
            TxHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(ArenaSlot {
                generation: 0,
                tx: Some(tx),
            });
            TxHandle {
                index,
                generation: 0,
            }
        }
    }

    #[must_use]
    pub fn get(&self, handle: TxHandle) -> Option<&Transaction> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.tx.as_ref()
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: TxHandle) -> Option<&mut Transaction> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.tx.as_mut()
    }

    #[must_use]
    pub fn contains(&self, handle: TxHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Retire a transaction, returning it. The slot's generation advances so
    /// outstanding copies of `handle` resolve to `None` from now on.
    pub fn remove(&mut self, handle: TxHandle) -> Option<Transaction> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.tx.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        slot.tx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Lpa, SectorBitmap, StreamId};

    fn tx(lpa: u64) -> Transaction {
        Transaction::new_user_read(StreamId(0), Lpa(lpa), SectorBitmap::full_page(8))
    }

    #[test]
    fn insert_get_remove() {
        let mut arena = TransactionArena::new();
        let a = arena.insert(tx(1));
        let b = arena.insert(tx(2));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a).unwrap().lpa, Lpa(1));
        assert_eq!(arena.get(b).unwrap().lpa, Lpa(2));

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.lpa, Lpa(1));
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn stale_handles_do_not_resolve_after_reuse() {
        let mut arena = TransactionArena::new();
        let a = arena.insert(tx(1));
        arena.remove(a).unwrap();

        // Slot is reused for a different transaction.
        let b = arena.insert(tx(9));
        assert_eq!(a.index(), b.index());
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.get(b).unwrap().lpa, Lpa(9));
    }

    #[test]
    fn double_remove_is_a_no_op() {
        let mut arena = TransactionArena::new();
        let a = arena.insert(tx(1));
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(arena.is_empty());
    }
}
