//! Per-stream mapping domain: the authoritative mapping table and the
//! Global Translation Directory (GTD).
//!
//! The authoritative table holds one entry per LPA — the fallback truth when
//! ideal (always-resident) mapping is configured, and the backing store the
//! CMT pages in and out of otherwise. The GTD maps each virtual
//! translation-page number (MVPN) to the physical page currently holding
//! that slice of the table on flash.

use fsim_types::{Lpa, Mvpn, Ppa, SectorBitmap, TxHandle};
use std::collections::{HashMap, HashSet, VecDeque};

/// Bytes per on-flash mapping entry (packed PPA + written-sector bitmap).
pub const MAPPING_ENTRY_BYTES: u64 = 8;

/// One authoritative mapping-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalMappingEntry {
    pub ppa: Ppa,
    pub bitmap: SectorBitmap,
    /// Monotonic write stamp; newer stamps win during relocation staleness
    /// checks.
    pub timestamp: u64,
}

impl Default for GlobalMappingEntry {
    fn default() -> Self {
        Self {
            ppa: Ppa::UNASSIGNED,
            bitmap: SectorBitmap::EMPTY,
            timestamp: 0,
        }
    }
}

/// Mapping state for one stream.
#[derive(Debug)]
pub struct DomainState {
    pub max_lpa: u64,
    pub entries_per_translation_page: u64,
    global: Vec<GlobalMappingEntry>,
    gtd: Vec<Ppa>,
    /// Transactions parked behind an in-flight translation-page read.
    waiting_on_mvpn: HashMap<u64, VecDeque<TxHandle>>,
    reads_in_flight: HashSet<u64>,
}

impl DomainState {
    #[must_use]
    pub fn new(max_lpa: u64, page_size_bytes: u64) -> Self {
        let entries_per_translation_page = (page_size_bytes / MAPPING_ENTRY_BYTES).max(1);
        let translation_pages = max_lpa.div_ceil(entries_per_translation_page) as usize;
        Self {
            max_lpa,
            entries_per_translation_page,
            global: vec![GlobalMappingEntry::default(); max_lpa as usize],
            gtd: vec![Ppa::UNASSIGNED; translation_pages],
            waiting_on_mvpn: HashMap::new(),
            reads_in_flight: HashSet::new(),
        }
    }

    #[must_use]
    pub fn mvpn_of(&self, lpa: Lpa) -> Mvpn {
        Mvpn(lpa.0 / self.entries_per_translation_page)
    }

    #[must_use]
    pub fn translation_page_count(&self) -> usize {
        self.gtd.len()
    }

    #[must_use]
    pub fn global(&self, lpa: Lpa) -> &GlobalMappingEntry {
        &self.global[lpa.0 as usize]
    }

    pub fn global_mut(&mut self, lpa: Lpa) -> &mut GlobalMappingEntry {
        &mut self.global[lpa.0 as usize]
    }

    #[must_use]
    pub fn gtd_ppa(&self, mvpn: Mvpn) -> Ppa {
        self.gtd[mvpn.0 as usize]
    }

    pub fn set_gtd_ppa(&mut self, mvpn: Mvpn, ppa: Ppa) {
        self.gtd[mvpn.0 as usize] = ppa;
    }

    // -- translation-fetch waiting lists ------------------------------------

    #[must_use]
    pub fn fetch_in_flight(&self, mvpn: Mvpn) -> bool {
        self.reads_in_flight.contains(&mvpn.0)
    }

    pub fn mark_fetch_in_flight(&mut self, mvpn: Mvpn) {
        self.reads_in_flight.insert(mvpn.0);
    }

    pub fn queue_behind_fetch(&mut self, mvpn: Mvpn, handle: TxHandle) {
        self.waiting_on_mvpn.entry(mvpn.0).or_default().push_back(handle);
    }

    /// Fetch landed: clear the in-flight marker and return the parked
    /// transactions in arrival order.
    pub fn complete_fetch(&mut self, mvpn: Mvpn) -> Vec<TxHandle> {
        self.reads_in_flight.remove(&mvpn.0);
        self.waiting_on_mvpn
            .remove(&mvpn.0)
            .map(Vec::from)
            .unwrap_or_default()
    }
}
