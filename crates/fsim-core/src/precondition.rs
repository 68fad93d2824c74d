//! Steady-state preconditioning.
//!
//! Installs a synthetic used-device state before timed simulation: a fraction
//! of each stream's logical space is written once, and a seeded random subset
//! is rewritten so the planes carry invalid pages the way a device does after
//! sustained use. No transactions are generated; the block manager and the
//! authoritative mapping table are seeded directly.

use fsim_config::SimConfig;
use fsim_error::{FtlError, Result};
use fsim_fbm::FlashBlockManager;
use fsim_map::{allocate_plane, AddressMappingUnit};
use fsim_types::{Lpa, SectorBitmap, StreamId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::info;

/// Seed `fill_ratio` of every stream's logical space, then rewrite a
/// `rewrite_ratio` subset of it.
///
/// The combined page demand must fit the physical space; over-committing
/// surfaces as [`FtlError::FreePoolExhausted`].
pub fn precondition(
    config: &SimConfig,
    fbm: &mut FlashBlockManager,
    amu: &mut AddressMappingUnit,
    fill_ratio: f64,
    rewrite_ratio: f64,
) -> Result<()> {
    for (value, field) in [(fill_ratio, "fill_ratio"), (rewrite_ratio, "rewrite_ratio")] {
        if !(0.0..=1.0).contains(&value) {
            return Err(FtlError::Config {
                field,
                reason: format!("{value} is outside [0, 1]"),
            });
        }
    }
    let geometry = config.device.geometry();
    let scheme = config.ftl.plane_allocation_scheme;
    let full = SectorBitmap::full_page(geometry.sectors_per_page);
    let per_stream = (config.logical_pages_per_stream() as f64 * fill_ratio) as u64;
    let mut rng = SmallRng::seed_from_u64(config.ftl.seed);

    for stream in 0..config.ftl.stream_count {
        let stream = StreamId(stream);
        for lpa in (0..per_stream).map(Lpa) {
            let mut addr = allocate_plane(scheme, lpa, &geometry);
            fbm.allocate_page_for_user_write(stream, &mut addr)?;
            fbm.record_mapped_lpa(&addr, lpa);
            amu.seed_mapping(stream, lpa, geometry.compose(&addr), full);
        }
        for lpa in (0..per_stream).map(Lpa) {
            if rng.gen::<f64>() >= rewrite_ratio {
                continue;
            }
            let old = amu.current_ppa_of(stream, lpa);
            fbm.invalidate_page(stream, &geometry.decompose(old))?;
            let mut addr = allocate_plane(scheme, lpa, &geometry);
            fbm.allocate_page_for_user_write(stream, &mut addr)?;
            fbm.record_mapped_lpa(&addr, lpa);
            amu.seed_mapping(stream, lpa, geometry.compose(&addr), full);
        }
    }
    info!(
        target: "fsim::precondition",
        pages_per_stream = per_stream,
        fill_ratio,
        rewrite_ratio,
        "device preconditioned"
    );
    Ok(())
}
