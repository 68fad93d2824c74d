//! Plane allocation: striping logical pages across the physical hierarchy.
//!
//! A pure function of the LPA and the configured dimension priority. The
//! highest-priority dimension varies fastest, so `Cwdp` sends consecutive
//! LPAs to consecutive channels first, then ways, dies, and planes.

use fsim_config::{AddressDimension, PlaneAllocationScheme};
use fsim_types::{Geometry, Lpa, PhysicalPageAddress};

/// Map `lpa` to its (channel, chip, die, plane) home. Block and page are left
/// zero; the flash block manager assigns them from the write frontier.
#[must_use]
pub fn allocate_plane(
    scheme: PlaneAllocationScheme,
    lpa: Lpa,
    geometry: &Geometry,
) -> PhysicalPageAddress {
    let mut addr = PhysicalPageAddress::default();
    let mut rest = lpa.0;
    for dimension in scheme.priority() {
        let extent = match dimension {
            AddressDimension::Channel => geometry.channels,
            AddressDimension::Way => geometry.chips_per_channel,
            AddressDimension::Die => geometry.dies_per_chip,
            AddressDimension::Plane => geometry.planes_per_die,
        };
        let index = (rest % u64::from(extent)) as u32;
        rest /= u64::from(extent);
        match dimension {
            AddressDimension::Channel => addr.channel = index,
            AddressDimension::Way => addr.chip = index,
            AddressDimension::Die => addr.die = index,
            AddressDimension::Plane => addr.plane = index,
        }
    }
    addr
}
