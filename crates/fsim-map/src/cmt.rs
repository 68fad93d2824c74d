//! The Cached Mapping Table: a bounded, LRU-managed translation cache.
//!
//! Slots live in a slab; the LRU list is intrusive (prev/next slot indices),
//! so a hit promotes to MRU in O(1) and eviction pops the tail in O(1)
//! without any allocation. Keys compact (stream, LPA) into a single `u64`
//! with the stream id in the top byte, which is what lets up to 256 streams
//! share one table in `Shared` mode.

use fsim_error::{FtlError, Result};
use fsim_types::{Lpa, Ppa, SectorBitmap, StreamId};
use std::collections::HashMap;

/// Compact (stream, LPA) into the table key. LPAs are below 2^56.
#[must_use]
pub fn cmt_key(stream: StreamId, lpa: Lpa) -> u64 {
    debug_assert!(lpa.0 < 1 << 56);
    (u64::from(stream.0) << 56) | lpa.0
}

/// Recover (stream, LPA) from a table key.
#[must_use]
pub fn split_key(key: u64) -> (StreamId, Lpa) {
    (StreamId((key >> 56) as u8), Lpa(key & ((1 << 56) - 1)))
}

/// Slot lifecycle: reserved while the mapping read is in flight, then usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Waiting,
    Valid,
}

#[derive(Debug)]
struct CmtSlot {
    key: u64,
    ppa: Ppa,
    bitmap: SectorBitmap,
    dirty: bool,
    status: SlotStatus,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Contents of an evicted slot, handed back for write-back decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictedSlot {
    pub stream: StreamId,
    pub lpa: Lpa,
    pub ppa: Ppa,
    pub bitmap: SectorBitmap,
    pub dirty: bool,
}

/// Bounded LRU cache of logical→physical mappings.
#[derive(Debug)]
pub struct CachedMappingTable {
    capacity: usize,
    slots: Vec<CmtSlot>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    /// Waiting reservations currently occupying slots.
    waiting: usize,
    /// MRU end of the intrusive list.
    head: Option<usize>,
    /// LRU end.
    tail: Option<usize>,
}

impl CachedMappingTable {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity.min(4096)),
            free: Vec::new(),
            index: HashMap::new(),
            waiting: 0,
            head: None,
            tail: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// A new slot can be created without evicting first.
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.index.len() < self.capacity
    }

    /// At least one Valid entry exists to evict. A table whose every slot is
    /// a Waiting reservation has nothing to give up until a fetch lands.
    #[must_use]
    pub fn has_evictable_slot(&self) -> bool {
        self.index.len() > self.waiting
    }

    /// `true` only for Valid (usable) entries; a Waiting reservation does not
    /// count as present.
    #[must_use]
    pub fn exists(&self, stream: StreamId, lpa: Lpa) -> bool {
        self.index
            .get(&cmt_key(stream, lpa))
            .is_some_and(|&slot| self.slots[slot].status == SlotStatus::Valid)
    }

    #[must_use]
    pub fn slot_status(&self, stream: StreamId, lpa: Lpa) -> Option<SlotStatus> {
        self.index
            .get(&cmt_key(stream, lpa))
            .map(|&slot| self.slots[slot].status)
    }

    /// Read the cached PPA without disturbing LRU order. `None` unless the
    /// entry is Valid. Used by relocation paths, which must not perturb
    /// recency.
    #[must_use]
    pub fn peek_ppa(&self, stream: StreamId, lpa: Lpa) -> Option<Ppa> {
        self.index
            .get(&cmt_key(stream, lpa))
            .map(|&slot| &self.slots[slot])
            .filter(|slot| slot.status == SlotStatus::Valid)
            .map(|slot| slot.ppa)
    }

    /// Non-touching companion to [`peek_ppa`](Self::peek_ppa) for the
    /// written-sector bitmap.
    #[must_use]
    pub fn peek_bitmap(&self, stream: StreamId, lpa: Lpa) -> Option<SectorBitmap> {
        self.index
            .get(&cmt_key(stream, lpa))
            .map(|&slot| &self.slots[slot])
            .filter(|slot| slot.status == SlotStatus::Valid)
            .map(|slot| slot.bitmap)
    }

    /// Fetch the cached PPA and promote the entry to MRU.
    ///
    /// Callers must have checked [`exists`](Self::exists); anything else is a
    /// protocol violation.
    pub fn retrieve_ppa(&mut self, stream: StreamId, lpa: Lpa) -> Result<Ppa> {
        let slot = self.valid_slot(stream, lpa, "retrieve_ppa")?;
        self.touch(slot);
        Ok(self.slots[slot].ppa)
    }

    pub fn get_written_bitmap(&self, stream: StreamId, lpa: Lpa) -> Result<SectorBitmap> {
        let slot = self.valid_slot(stream, lpa, "get_written_bitmap")?;
        Ok(self.slots[slot].bitmap)
    }

    /// Mutate an entry in place: mark dirty and promote to MRU.
    pub fn update_mapping_info(
        &mut self,
        stream: StreamId,
        lpa: Lpa,
        ppa: Ppa,
        bitmap: SectorBitmap,
    ) -> Result<()> {
        let slot = self.valid_slot(stream, lpa, "update_mapping_info")?;
        let entry = &mut self.slots[slot];
        entry.ppa = ppa;
        entry.bitmap = bitmap;
        entry.dirty = true;
        self.touch(slot);
        Ok(())
    }

    /// Create a Waiting reservation for a mapping fetch in flight.
    ///
    /// Fails if the key is already present or the table is full (the caller
    /// must evict first — eviction always precedes reservation on a full
    /// table).
    pub fn reserve_slot(&mut self, stream: StreamId, lpa: Lpa) -> Result<()> {
        let key = cmt_key(stream, lpa);
        if self.index.contains_key(&key) {
            return Err(FtlError::SlotOccupied {
                detail: format!("cmt reservation for stream {} lpa {}", stream.0, lpa.0),
            });
        }
        if !self.has_free_slot() {
            return Err(FtlError::MappingProtocol {
                detail: "reserve_slot on a full table without prior eviction".into(),
            });
        }
        let slot = self.alloc_slot(CmtSlot {
            key,
            ppa: Ppa::UNASSIGNED,
            bitmap: SectorBitmap::EMPTY,
            dirty: false,
            status: SlotStatus::Waiting,
            prev: None,
            next: None,
        });
        self.index.insert(key, slot);
        self.push_front(slot);
        self.waiting += 1;
        Ok(())
    }

    /// Promote a Waiting reservation to Valid with the fetched mapping.
    pub fn insert_new_mapping_info(
        &mut self,
        stream: StreamId,
        lpa: Lpa,
        ppa: Ppa,
        bitmap: SectorBitmap,
    ) -> Result<()> {
        let key = cmt_key(stream, lpa);
        let &slot = self.index.get(&key).ok_or_else(|| FtlError::MappingProtocol {
            detail: format!("insert without reservation: stream {} lpa {}", stream.0, lpa.0),
        })?;
        let entry = &mut self.slots[slot];
        if entry.status != SlotStatus::Waiting {
            return Err(FtlError::SlotOccupied {
                detail: format!("double insert for stream {} lpa {}", stream.0, lpa.0),
            });
        }
        entry.status = SlotStatus::Valid;
        entry.ppa = ppa;
        entry.bitmap = bitmap;
        entry.dirty = false;
        self.waiting -= 1;
        self.touch(slot);
        Ok(())
    }

    /// Remove and return the LRU-most Valid entry, collapsing it out of the
    /// index so its slot can be reused.
    ///
    /// Waiting reservations are skipped — their fetch is still in flight.
    pub fn evict_one_slot(&mut self) -> Result<EvictedSlot> {
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            if self.slots[slot].status == SlotStatus::Valid {
                self.unlink(slot);
                let entry = &self.slots[slot];
                let (stream, lpa) = split_key(entry.key);
                let evicted = EvictedSlot {
                    stream,
                    lpa,
                    ppa: entry.ppa,
                    bitmap: entry.bitmap,
                    dirty: entry.dirty,
                };
                self.index.remove(&entry.key);
                self.free.push(slot);
                return Ok(evicted);
            }
            cursor = self.slots[slot].prev;
        }
        Err(FtlError::MappingProtocol {
            detail: "evict_one_slot with no valid entries".into(),
        })
    }

    // -- intrusive LRU plumbing ---------------------------------------------

    fn valid_slot(&self, stream: StreamId, lpa: Lpa, op: &str) -> Result<usize> {
        let key = cmt_key(stream, lpa);
        match self.index.get(&key) {
            Some(&slot) if self.slots[slot].status == SlotStatus::Valid => Ok(slot),
            Some(_) => Err(FtlError::MappingProtocol {
                detail: format!("{op} on a waiting slot: stream {} lpa {}", stream.0, lpa.0),
            }),
            None => Err(FtlError::MappingProtocol {
                detail: format!("{op} on an absent slot: stream {} lpa {}", stream.0, lpa.0),
            }),
        }
    }

    fn alloc_slot(&mut self, slot: CmtSlot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = None;
        self.slots[slot].next = self.head;
        if let Some(old_head) = self.head {
            self.slots[old_head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: StreamId = StreamId(0);

    #[test]
    fn key_compaction_round_trips() {
        let key = cmt_key(StreamId(255), Lpa((1 << 56) - 1));
        assert_eq!(split_key(key), (StreamId(255), Lpa((1 << 56) - 1)));
        assert_ne!(cmt_key(StreamId(1), Lpa(7)), cmt_key(StreamId(2), Lpa(7)));
    }

    #[test]
    fn reserve_insert_retrieve() {
        let mut cmt = CachedMappingTable::new(4);
        cmt.reserve_slot(S, Lpa(10)).unwrap();
        assert!(!cmt.exists(S, Lpa(10)));
        assert_eq!(cmt.slot_status(S, Lpa(10)), Some(SlotStatus::Waiting));

        cmt.insert_new_mapping_info(S, Lpa(10), Ppa(99), SectorBitmap(0xf0))
            .unwrap();
        assert!(cmt.exists(S, Lpa(10)));
        assert_eq!(cmt.retrieve_ppa(S, Lpa(10)).unwrap(), Ppa(99));
        assert_eq!(cmt.get_written_bitmap(S, Lpa(10)).unwrap(), SectorBitmap(0xf0));
    }

    #[test]
    fn double_reservation_is_rejected() {
        let mut cmt = CachedMappingTable::new(4);
        cmt.reserve_slot(S, Lpa(1)).unwrap();
        assert!(matches!(
            cmt.reserve_slot(S, Lpa(1)),
            Err(FtlError::SlotOccupied { .. })
        ));
    }

    #[test]
    fn retrieval_without_exists_check_is_a_protocol_error() {
        let mut cmt = CachedMappingTable::new(4);
        assert!(matches!(
            cmt.retrieve_ppa(S, Lpa(5)),
            Err(FtlError::MappingProtocol { .. })
        ));
    }

    #[test]
    fn lru_eviction_order_follows_access_order() {
        // Capacity 2, shared mode, L1 then L2 then L3: L3 needs an eviction
        // and the LRU tail is L1.
        let mut cmt = CachedMappingTable::new(2);
        for (lpa, ppa) in [(1, 11), (2, 22)] {
            cmt.reserve_slot(S, Lpa(lpa)).unwrap();
            cmt.insert_new_mapping_info(S, Lpa(lpa), Ppa(ppa), SectorBitmap::EMPTY)
                .unwrap();
        }
        assert!(!cmt.has_free_slot());

        let evicted = cmt.evict_one_slot().unwrap();
        assert_eq!(evicted.lpa, Lpa(1));
        assert!(!evicted.dirty);
        assert!(!cmt.exists(S, Lpa(1)));
        assert!(cmt.has_free_slot());

        cmt.reserve_slot(S, Lpa(3)).unwrap();
        cmt.insert_new_mapping_info(S, Lpa(3), Ppa(33), SectorBitmap::EMPTY)
            .unwrap();
        assert!(cmt.exists(S, Lpa(2)));
        assert!(cmt.exists(S, Lpa(3)));
    }

    #[test]
    fn touching_an_entry_saves_it_from_eviction() {
        let mut cmt = CachedMappingTable::new(2);
        for (lpa, ppa) in [(1, 11), (2, 22)] {
            cmt.reserve_slot(S, Lpa(lpa)).unwrap();
            cmt.insert_new_mapping_info(S, Lpa(lpa), Ppa(ppa), SectorBitmap::EMPTY)
                .unwrap();
        }
        // L1 becomes MRU; L2 is now the LRU tail.
        cmt.retrieve_ppa(S, Lpa(1)).unwrap();
        assert_eq!(cmt.evict_one_slot().unwrap().lpa, Lpa(2));
    }

    #[test]
    fn update_marks_dirty_for_writeback() {
        let mut cmt = CachedMappingTable::new(2);
        cmt.reserve_slot(S, Lpa(1)).unwrap();
        cmt.insert_new_mapping_info(S, Lpa(1), Ppa(11), SectorBitmap::EMPTY)
            .unwrap();
        cmt.update_mapping_info(S, Lpa(1), Ppa(12), SectorBitmap(0x3))
            .unwrap();
        let evicted = cmt.evict_one_slot().unwrap();
        assert!(evicted.dirty);
        assert_eq!(evicted.ppa, Ppa(12));
    }

    #[test]
    fn eviction_skips_waiting_reservations() {
        let mut cmt = CachedMappingTable::new(2);
        cmt.reserve_slot(S, Lpa(1)).unwrap();
        cmt.reserve_slot(S, Lpa(2)).unwrap();
        assert!(!cmt.has_evictable_slot());
        assert!(matches!(
            cmt.evict_one_slot(),
            Err(FtlError::MappingProtocol { .. })
        ));

        cmt.insert_new_mapping_info(S, Lpa(1), Ppa(11), SectorBitmap::EMPTY)
            .unwrap();
        assert!(cmt.has_evictable_slot());
        assert_eq!(cmt.evict_one_slot().unwrap().lpa, Lpa(1));
    }
}
