//! Logical/physical addressing and device geometry.
//!
//! A [`Ppa`] is a flat page index over the whole device; it decomposes into a
//! [`PhysicalPageAddress`] positionally, most-significant dimension first:
//! channel, chip, die, plane, block, page. The reserved value
//! [`Ppa::UNASSIGNED`] means "no physical page bound to this mapping yet".

use serde::{Deserialize, Serialize};
use std::fmt;

/// NVM subunit (sector) size used for partial-page access bitmaps.
pub const SECTOR_SIZE_BYTES: u32 = 512;

/// Logical Page Address — per-stream logical namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lpa(pub u64);

/// Physical Page Address — flat page index over the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ppa(pub u64);

impl Ppa {
    /// Sentinel: mapping exists but no physical page has been assigned.
    pub const UNASSIGNED: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

/// Virtual translation-page number (index into the Global Translation
/// Directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mvpn(pub u64);

/// I/O stream (NVMe namespace / flow) identifier. At most 256 streams share
/// one cached mapping table, so a `u8` is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u8);

/// Simulation timestamp in nanoseconds on the discrete-event timeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

/// Per-sector access bitmap for partial-page reads and writes.
///
/// Bit `i` set means sector `i` of the page participates. Pages have at most
/// 64 sectors (32 KiB pages at 512-byte sectors), so a `u64` covers every
/// geometry this simulator models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorBitmap(pub u64);

impl SectorBitmap {
    pub const EMPTY: Self = Self(0);

    /// Bitmap covering every sector of a page with `sectors_per_page` sectors.
    #[must_use]
    pub fn full_page(sectors_per_page: u32) -> Self {
        debug_assert!(sectors_per_page <= 64);
        if sectors_per_page >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << sectors_per_page) - 1)
        }
    }

    /// Bitmap for `count` sectors starting at in-page sector `start`.
    #[must_use]
    pub fn for_range(start: u32, count: u32) -> Self {
        let mut bits = 0u64;
        for sector in start..start + count {
            if sector < 64 {
                bits |= 1 << sector;
            }
        }
        Self(bits)
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn count_sectors(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Decomposed physical page location. Equality is structural.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalPageAddress {
    pub channel: u32,
    pub chip: u32,
    pub die: u32,
    pub plane: u32,
    pub block: u32,
    pub page: u32,
}

impl PhysicalPageAddress {
    /// True when both addresses name the same plane (block/page ignored).
    #[must_use]
    pub fn same_plane(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.chip == other.chip
            && self.die == other.die
            && self.plane == other.plane
    }
}

impl fmt::Display for PhysicalPageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "c{}/w{}/d{}/p{}/b{}/pg{}",
            self.channel, self.chip, self.die, self.plane, self.block, self.page
        )
    }
}

/// Immutable device geometry, shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub channels: u32,
    pub chips_per_channel: u32,
    pub dies_per_chip: u32,
    pub planes_per_die: u32,
    pub blocks_per_plane: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
}

impl Geometry {
    #[must_use]
    pub fn plane_count(&self) -> u64 {
        u64::from(self.channels)
            * u64::from(self.chips_per_channel)
            * u64::from(self.dies_per_chip)
            * u64::from(self.planes_per_die)
    }

    #[must_use]
    pub fn pages_per_plane(&self) -> u64 {
        u64::from(self.blocks_per_plane) * u64::from(self.pages_per_block)
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.plane_count() * self.pages_per_plane()
    }

    #[must_use]
    pub fn page_size_bytes(&self) -> u64 {
        u64::from(self.sectors_per_page) * u64::from(SECTOR_SIZE_BYTES)
    }

    /// Flat index of the plane holding `addr` (channel-major order).
    #[must_use]
    pub fn plane_index(&self, addr: &PhysicalPageAddress) -> usize {
        let idx = ((u64::from(addr.channel) * u64::from(self.chips_per_channel)
            + u64::from(addr.chip))
            * u64::from(self.dies_per_chip)
            + u64::from(addr.die))
            * u64::from(self.planes_per_die)
            + u64::from(addr.plane);
        idx as usize
    }

    /// Flat index of the (channel, chip) pair holding `addr`.
    #[must_use]
    pub fn chip_index(&self, channel: u32, chip: u32) -> usize {
        (channel * self.chips_per_channel + chip) as usize
    }

    /// Compose a flat [`Ppa`] from a decomposed address.
    #[must_use]
    pub fn compose(&self, addr: &PhysicalPageAddress) -> Ppa {
        let flat = ((((u64::from(addr.channel) * u64::from(self.chips_per_channel)
            + u64::from(addr.chip))
            * u64::from(self.dies_per_chip)
            + u64::from(addr.die))
            * u64::from(self.planes_per_die)
            + u64::from(addr.plane))
            * u64::from(self.blocks_per_plane)
            + u64::from(addr.block))
            * u64::from(self.pages_per_block)
            + u64::from(addr.page);
        Ppa(flat)
    }

    /// Decompose a flat [`Ppa`] into its positional coordinates.
    ///
    /// Must not be called with [`Ppa::UNASSIGNED`].
    #[must_use]
    pub fn decompose(&self, ppa: Ppa) -> PhysicalPageAddress {
        debug_assert!(ppa.is_assigned(), "decomposing the unassigned sentinel");
        let mut rest = ppa.0;
        let page = (rest % u64::from(self.pages_per_block)) as u32;
        rest /= u64::from(self.pages_per_block);
        let block = (rest % u64::from(self.blocks_per_plane)) as u32;
        rest /= u64::from(self.blocks_per_plane);
        let plane = (rest % u64::from(self.planes_per_die)) as u32;
        rest /= u64::from(self.planes_per_die);
        let die = (rest % u64::from(self.dies_per_chip)) as u32;
        rest /= u64::from(self.dies_per_chip);
        let chip = (rest % u64::from(self.chips_per_channel)) as u32;
        rest /= u64::from(self.chips_per_channel);
        let channel = rest as u32;
        PhysicalPageAddress {
            channel,
            chip,
            die,
            plane,
            block,
            page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry {
            channels: 2,
            chips_per_channel: 2,
            dies_per_chip: 2,
            planes_per_die: 2,
            blocks_per_plane: 8,
            pages_per_block: 16,
            sectors_per_page: 8,
        }
    }

    #[test]
    fn ppa_round_trips_through_decomposition() {
        let geom = geom();
        let addr = PhysicalPageAddress {
            channel: 1,
            chip: 0,
            die: 1,
            plane: 1,
            block: 5,
            page: 11,
        };
        let ppa = geom.compose(&addr);
        assert_eq!(geom.decompose(ppa), addr);
    }

    #[test]
    fn compose_is_dense_and_ordered() {
        let geom = geom();
        // Page 0 of block 0 of the very first plane is PPA 0; the last page of
        // the device is total_pages - 1.
        let first = PhysicalPageAddress::default();
        assert_eq!(geom.compose(&first), Ppa(0));
        let last = PhysicalPageAddress {
            channel: 1,
            chip: 1,
            die: 1,
            plane: 1,
            block: 7,
            page: 15,
        };
        assert_eq!(geom.compose(&last).0, geom.total_pages() - 1);
    }

    #[test]
    fn sector_bitmap_ranges() {
        assert_eq!(SectorBitmap::full_page(8).0, 0xff);
        assert_eq!(SectorBitmap::for_range(2, 3).0, 0b1_1100);
        assert_eq!(SectorBitmap::for_range(0, 64).0, u64::MAX);
        assert_eq!(SectorBitmap::full_page(8).count_sectors(), 8);
    }

    #[test]
    fn unassigned_sentinel_is_distinct() {
        assert!(!Ppa::UNASSIGNED.is_assigned());
        assert!(Ppa(0).is_assigned());
    }

    #[test]
    fn plane_index_covers_all_planes_once() {
        let geom = geom();
        let mut seen = vec![false; geom.plane_count() as usize];
        for channel in 0..geom.channels {
            for chip in 0..geom.chips_per_channel {
                for die in 0..geom.dies_per_chip {
                    for plane in 0..geom.planes_per_die {
                        let addr = PhysicalPageAddress {
                            channel,
                            chip,
                            die,
                            plane,
                            ..Default::default()
                        };
                        let idx = geom.plane_index(&addr);
                        assert!(!seen[idx]);
                        seen[idx] = true;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
