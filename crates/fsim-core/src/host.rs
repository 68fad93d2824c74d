//! Host-address arithmetic.
//!
//! The host addresses 512-byte sectors (LHAs); the FTL works in pages. A
//! host request is split into one transaction per touched page, each with a
//! sector bitmap marking the slice of the page it covers.

use fsim_types::{Geometry, Lpa, SectorBitmap};

/// Logical page holding the given host sector address.
#[must_use]
pub fn lha_to_lpa(geometry: &Geometry, lha: u64) -> Lpa {
    Lpa(lha / u64::from(geometry.sectors_per_page))
}

/// Access bitmap for the sectors `[lha, lha + count)` within the page
/// holding `lha`. `count` must not cross the page boundary.
#[must_use]
pub fn subunit_access_bitmap(geometry: &Geometry, lha: u64, count: u32) -> SectorBitmap {
    let start = (lha % u64::from(geometry.sectors_per_page)) as u32;
    debug_assert!(start + count <= geometry.sectors_per_page);
    SectorBitmap::for_range(start, count)
}

/// Split a sector-addressed host request into per-page (LPA, bitmap) pieces,
/// in ascending page order.
#[must_use]
pub fn split_request(geometry: &Geometry, start_lha: u64, sector_count: u32) -> Vec<(Lpa, SectorBitmap)> {
    let sectors_per_page = u64::from(geometry.sectors_per_page);
    let mut pieces = Vec::new();
    let mut lha = start_lha;
    let mut remaining = u64::from(sector_count);
    while remaining > 0 {
        let offset = lha % sectors_per_page;
        let in_page = (sectors_per_page - offset).min(remaining) as u32;
        pieces.push((
            lha_to_lpa(geometry, lha),
            subunit_access_bitmap(geometry, lha, in_page),
        ));
        lha += u64::from(in_page);
        remaining -= u64::from(in_page);
    }
    pieces
}
