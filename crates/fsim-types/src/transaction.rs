//! The transaction sum type.
//!
//! A transaction is the unit of work exchanged between the address mapping
//! unit, the GC/WL unit, the scheduler, and the PHY. The kind-specific
//! payloads live in the [`TransactionKind`] variants so that, e.g., only an
//! erase carries a pending-movement counter and only a relocation write
//! carries back-references to its companion read and its erase.

use crate::address::{Lpa, PhysicalPageAddress, Ppa, SectorBitmap, SimTime, StreamId};
use crate::arena::TxHandle;

/// Who created the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionSource {
    /// Host I/O arriving through the front end.
    UserIo,
    /// DRAM data-cache destage traffic (scheduled with user priority).
    Cache,
    /// Translation-page traffic generated by the mapping unit.
    Mapping,
    /// Relocation and erase traffic generated by GC / wear-leveling.
    GcWl,
}

/// Read payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTx {
    /// For a relocation read: the write this read feeds. The write stays
    /// ineligible for dispatch until this read completes.
    pub related_write: Option<TxHandle>,
}

/// Write payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteTx {
    /// Companion read whose data must arrive before this write has content.
    /// Cleared when the read completes; a write with a live companion is
    /// excluded from scheduling.
    pub related_read: Option<TxHandle>,
    /// For a relocation write: the erase it feeds. Completion decrements the
    /// erase's pending-movement counter.
    pub related_erase: Option<TxHandle>,
}

/// Erase payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseTx {
    /// Outstanding page movements that must complete (or be dropped as
    /// stale) before this erase may be dispatched.
    pub pending_movements: usize,
    /// The victim block being reclaimed (page field unused).
    pub victim: PhysicalPageAddress,
}

/// Kind-specific transaction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read(ReadTx),
    Write(WriteTx),
    Erase(EraseTx),
}

/// Scheduler queue category, derived from (source, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionCategory {
    UserRead,
    UserWrite,
    GcRead,
    GcWrite,
    GcErase,
    MappingRead,
    MappingWrite,
}

/// One flash transaction moving through the FTL.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub source: TransactionSource,
    pub stream: StreamId,
    /// Logical page for reads/writes. For mapping transactions this holds the
    /// virtual translation-page number instead.
    pub lpa: Lpa,
    /// Flat physical page, [`Ppa::UNASSIGNED`] until translation resolves it.
    pub ppa: Ppa,
    /// Decomposed physical target. Plane coordinates are valid once the plane
    /// allocator has run; block/page only once `physical_address_determined`.
    pub address: PhysicalPageAddress,
    /// Sectors of the page touched by this transaction.
    pub bitmap: SectorBitmap,
    /// Block and page coordinates of `address` are final.
    pub physical_address_determined: bool,
    /// Set by the scheduler when this command should preempt an in-flight
    /// program or erase on its chip.
    pub suspend_required: bool,
    /// Creation time on the simulated timeline (statistics only).
    pub issue_time: SimTime,
    pub kind: TransactionKind,
}

impl Transaction {
    #[must_use]
    pub fn new_user_read(stream: StreamId, lpa: Lpa, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::UserIo, stream, lpa, bitmap, TransactionKind::Read(ReadTx::default()))
    }

    #[must_use]
    pub fn new_user_write(stream: StreamId, lpa: Lpa, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::UserIo, stream, lpa, bitmap, TransactionKind::Write(WriteTx::default()))
    }

    #[must_use]
    pub fn new_mapping_read(stream: StreamId, mvpn: Lpa, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::Mapping, stream, mvpn, bitmap, TransactionKind::Read(ReadTx::default()))
    }

    #[must_use]
    pub fn new_mapping_write(stream: StreamId, mvpn: Lpa, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::Mapping, stream, mvpn, bitmap, TransactionKind::Write(WriteTx::default()))
    }

    #[must_use]
    pub fn new_gc_read(stream: StreamId, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::GcWl, stream, Lpa(0), bitmap, TransactionKind::Read(ReadTx::default()))
    }

    #[must_use]
    pub fn new_gc_write(stream: StreamId, bitmap: SectorBitmap) -> Self {
        Self::new(TransactionSource::GcWl, stream, Lpa(0), bitmap, TransactionKind::Write(WriteTx::default()))
    }

    #[must_use]
    pub fn new_gc_erase(stream: StreamId, victim: PhysicalPageAddress, movements: usize) -> Self {
        let mut tx = Self::new(
            TransactionSource::GcWl,
            stream,
            Lpa(0),
            SectorBitmap::EMPTY,
            TransactionKind::Erase(EraseTx {
                pending_movements: movements,
                victim,
            }),
        );
        tx.address = victim;
        tx.physical_address_determined = true;
        tx
    }

    fn new(
        source: TransactionSource,
        stream: StreamId,
        lpa: Lpa,
        bitmap: SectorBitmap,
        kind: TransactionKind,
    ) -> Self {
        Self {
            source,
            stream,
            lpa,
            ppa: Ppa::UNASSIGNED,
            address: PhysicalPageAddress::default(),
            bitmap,
            physical_address_determined: false,
            suspend_required: false,
            issue_time: SimTime::ZERO,
            kind,
        }
    }

    /// Scheduler category for this (source, kind) combination, or `None` for
    /// combinations the scheduler must treat as a fatal logic error.
    #[must_use]
    pub fn category(&self) -> Option<TransactionCategory> {
        match (&self.kind, self.source) {
            (TransactionKind::Read(_), TransactionSource::UserIo | TransactionSource::Cache) => {
                Some(TransactionCategory::UserRead)
            }
            (TransactionKind::Write(_), TransactionSource::UserIo | TransactionSource::Cache) => {
                Some(TransactionCategory::UserWrite)
            }
            (TransactionKind::Read(_), TransactionSource::Mapping) => {
                Some(TransactionCategory::MappingRead)
            }
            (TransactionKind::Write(_), TransactionSource::Mapping) => {
                Some(TransactionCategory::MappingWrite)
            }
            (TransactionKind::Read(_), TransactionSource::GcWl) => {
                Some(TransactionCategory::GcRead)
            }
            (TransactionKind::Write(_), TransactionSource::GcWl) => {
                Some(TransactionCategory::GcWrite)
            }
            (TransactionKind::Erase(_), TransactionSource::GcWl) => {
                Some(TransactionCategory::GcErase)
            }
            (TransactionKind::Erase(_), _) => None,
        }
    }

    /// Accessor for the erase payload; `None` for other kinds.
    #[must_use]
    pub fn as_erase(&self) -> Option<&EraseTx> {
        match &self.kind {
            TransactionKind::Erase(erase) => Some(erase),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_erase_mut(&mut self) -> Option<&mut EraseTx> {
        match &mut self.kind {
            TransactionKind::Erase(erase) => Some(erase),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_write(&self) -> Option<&WriteTx> {
        match &self.kind {
            TransactionKind::Write(write) => Some(write),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_write_mut(&mut self) -> Option<&mut WriteTx> {
        match &mut self.kind {
            TransactionKind::Write(write) => Some(write),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_read(&self) -> Option<&ReadTx> {
        match &self.kind {
            TransactionKind::Read(read) => Some(read),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_read_mut(&mut self) -> Option<&mut ReadTx> {
        match &mut self.kind {
            TransactionKind::Read(read) => Some(read),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_source_and_kind() {
        let stream = StreamId(0);
        let bitmap = SectorBitmap::full_page(8);
        assert_eq!(
            Transaction::new_user_read(stream, Lpa(1), bitmap).category(),
            Some(TransactionCategory::UserRead)
        );
        assert_eq!(
            Transaction::new_mapping_write(stream, Lpa(1), bitmap).category(),
            Some(TransactionCategory::MappingWrite)
        );
        assert_eq!(
            Transaction::new_gc_erase(stream, PhysicalPageAddress::default(), 0).category(),
            Some(TransactionCategory::GcErase)
        );

        // A cache-sourced write schedules with user priority.
        let mut destage = Transaction::new_user_write(stream, Lpa(2), bitmap);
        destage.source = TransactionSource::Cache;
        assert_eq!(destage.category(), Some(TransactionCategory::UserWrite));

        // An erase from a non-GC source is nonsense the scheduler must reject.
        let mut bogus = Transaction::new_gc_erase(stream, PhysicalPageAddress::default(), 0);
        bogus.source = TransactionSource::UserIo;
        assert_eq!(bogus.category(), None);
    }

    #[test]
    fn erase_starts_with_movement_count() {
        let erase = Transaction::new_gc_erase(StreamId(3), PhysicalPageAddress::default(), 7);
        assert_eq!(erase.as_erase().unwrap().pending_movements, 7);
        assert!(erase.physical_address_determined);
    }
}
