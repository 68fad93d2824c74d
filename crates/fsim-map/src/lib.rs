#![forbid(unsafe_code)]
//! Address translation: DFTL-style cached mapping over per-stream domains.
//!
//! The [`AddressMappingUnit`] is the only public entry point the rest of the
//! FTL needs; the submodules hold its moving parts:
//!
//! * [`cmt`] — the bounded LRU cache of logical→physical mappings,
//! * [`domain`] — the per-stream authoritative table and GTD,
//! * [`barrier`] — the two-level relocation barrier,
//! * [`plane_allocator`] — LPA→plane striping.

pub mod amu;
pub mod barrier;
pub mod cmt;
pub mod domain;
pub mod plane_allocator;

pub use amu::{AddressMappingUnit, MappingStats, TranslationOutcome};
pub use barrier::BarrierControl;
pub use cmt::{CachedMappingTable, EvictedSlot, SlotStatus};
pub use domain::{DomainState, GlobalMappingEntry, MAPPING_ENTRY_BYTES};
pub use plane_allocator::allocate_plane;
