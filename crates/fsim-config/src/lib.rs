#![forbid(unsafe_code)]
//! Simulation configuration.
//!
//! One immutable [`SimConfig`] is constructed at simulation start (from JSON
//! or from [`Default`]) and passed by shared reference to every component.
//! There is deliberately no global mutable configuration state.

use fsim_error::{FtlError, Result};
use fsim_types::{Geometry, SimTime};
use serde::{Deserialize, Serialize};

/// Dimension of the physical hierarchy, used by plane-allocation priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressDimension {
    Channel,
    Way,
    Die,
    Plane,
}

/// The 24 orderings of {Channel, Way, Die, Plane} priority for striping
/// logical pages across the device. `Cwdp` stripes across channels fastest,
/// then ways (chips), then dies, then planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum PlaneAllocationScheme {
    Cwdp, Cwpd, Cdwp, Cdpw, Cpwd, Cpdw,
    Wcdp, Wcpd, Wdcp, Wdpc, Wpcd, Wpdc,
    Dcwp, Dcpw, Dwcp, Dwpc, Dpcw, Dpwc,
    Pcwd, Pcdw, Pwcd, Pwdc, Pdcw, Pdwc,
}

impl PlaneAllocationScheme {
    /// Dimension priority, highest (fastest-varying) first.
    #[must_use]
    pub fn priority(self) -> [AddressDimension; 4] {
        use AddressDimension::{Channel as C, Die as D, Plane as P, Way as W};
        match self {
            Self::Cwdp => [C, W, D, P],
            Self::Cwpd => [C, W, P, D],
            Self::Cdwp => [C, D, W, P],
            Self::Cdpw => [C, D, P, W],
            Self::Cpwd => [C, P, W, D],
            Self::Cpdw => [C, P, D, W],
            Self::Wcdp => [W, C, D, P],
            Self::Wcpd => [W, C, P, D],
            Self::Wdcp => [W, D, C, P],
            Self::Wdpc => [W, D, P, C],
            Self::Wpcd => [W, P, C, D],
            Self::Wpdc => [W, P, D, C],
            Self::Dcwp => [D, C, W, P],
            Self::Dcpw => [D, C, P, W],
            Self::Dwcp => [D, W, C, P],
            Self::Dwpc => [D, W, P, C],
            Self::Dpcw => [D, P, C, W],
            Self::Dpwc => [D, P, W, C],
            Self::Pcwd => [P, C, W, D],
            Self::Pcdw => [P, C, D, W],
            Self::Pwcd => [P, W, C, D],
            Self::Pwdc => [P, W, D, C],
            Self::Pdcw => [P, D, C, W],
            Self::Pdwc => [P, D, W, C],
        }
    }
}

/// How streams share the cached mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmtSharingMode {
    /// One CMT instance and one free-slot accounting shared by all streams;
    /// keys are disambiguated by stream-id/LPA compaction.
    Shared,
    /// One CMT per stream with capacity = total / stream count.
    EqualSizePartitioning,
}

/// GC victim-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcPolicy {
    /// Minimum valid-page count over the whole plane.
    Greedy,
    /// Randomized-greedy: sample `rga_set_size` candidates, pick the best.
    Rga,
    /// First random legal candidate.
    Random,
    /// Random candidate with at least one invalid page.
    RandomP,
    /// Random candidate with invalid count above the rho-derived threshold.
    RandomPp,
    /// Oldest-allocated block first.
    Fifo,
}

/// Physical device shape and capacity parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub channel_count: u32,
    pub chips_per_channel: u32,
    pub dies_per_chip: u32,
    pub planes_per_die: u32,
    pub blocks_per_plane: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    /// Fraction of physical capacity hidden from the logical space.
    pub overprovisioning_ratio: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channel_count: 4,
            chips_per_channel: 2,
            dies_per_chip: 2,
            planes_per_die: 2,
            blocks_per_plane: 256,
            pages_per_block: 256,
            sectors_per_page: 8,
            overprovisioning_ratio: 0.07,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            channels: self.channel_count,
            chips_per_channel: self.chips_per_channel,
            dies_per_chip: self.dies_per_chip,
            planes_per_die: self.planes_per_die,
            blocks_per_plane: self.blocks_per_plane,
            pages_per_block: self.pages_per_block,
            sectors_per_page: self.sectors_per_page,
        }
    }
}

/// Translation, GC, and wear-leveling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtlConfig {
    /// Number of host I/O streams (at most 256).
    pub stream_count: u8,
    /// Unbounded always-resident mapping (no CMT machinery).
    pub ideal_mapping: bool,
    /// Total CMT capacity in mapping entries.
    pub cmt_capacity: usize,
    pub cmt_sharing_mode: CmtSharingMode,
    pub plane_allocation_scheme: PlaneAllocationScheme,
    pub gc_policy: GcPolicy,
    /// Candidate sample size for the RGA policy.
    pub rga_set_size: u32,
    /// Target occupancy ratio parameterizing Random++ victim filtering.
    pub rho: f64,
    /// Free-block-pool fraction below which preemptible GC starts.
    pub gc_soft_threshold: f64,
    /// Free-block-pool fraction below which GC becomes urgent.
    pub gc_hard_threshold: f64,
    /// Use hardware copy-back for relocation instead of read-then-write.
    pub use_copyback: bool,
    /// Order the free pool by erase count (dynamic wear-leveling); otherwise
    /// blocks recycle round-robin.
    pub dynamic_wearleveling: bool,
    /// Max-minus-min erase-count gap that triggers static wear-leveling.
    pub static_wearleveling_threshold: u32,
    /// Seed for every randomized policy; fixed seed gives reproducible runs.
    pub seed: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            stream_count: 1,
            ideal_mapping: false,
            cmt_capacity: 16 * 1024,
            cmt_sharing_mode: CmtSharingMode::Shared,
            plane_allocation_scheme: PlaneAllocationScheme::Cwdp,
            gc_policy: GcPolicy::Greedy,
            rga_set_size: 10,
            rho: 0.9,
            gc_soft_threshold: 0.05,
            gc_hard_threshold: 0.005,
            use_copyback: false,
            dynamic_wearleveling: true,
            static_wearleveling_threshold: 100,
            seed: 0x5eed,
        }
    }
}

/// Scheduler parameters: suspension enablement and thresholds.
///
/// A suspension is "reasonable" only when the remaining execution time of the
/// in-flight command exceeds the matching threshold; each chip-state case
/// decides independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub program_suspension_enabled: bool,
    pub erase_suspension_enabled: bool,
    pub write_reasonable_suspension_time_for_read: SimTime,
    pub erase_reasonable_suspension_time_for_read: SimTime,
    pub erase_reasonable_suspension_time_for_write: SimTime,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            program_suspension_enabled: false,
            erase_suspension_enabled: false,
            write_reasonable_suspension_time_for_read: SimTime(700_000),
            erase_reasonable_suspension_time_for_read: SimTime(700_000),
            erase_reasonable_suspension_time_for_write: SimTime(700_000),
        }
    }
}

/// Complete, validated simulation configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub device: DeviceConfig,
    pub ftl: FtlConfig,
    pub scheduling: SchedulingConfig,
}

impl SimConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| FtlError::Config {
            field: "json",
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Logical pages per stream after over-provisioning.
    #[must_use]
    pub fn logical_pages_per_stream(&self) -> u64 {
        let total = self.device.geometry().total_pages() as f64;
        let logical = (total * (1.0 - self.device.overprovisioning_ratio)).floor() as u64;
        logical / u64::from(self.ftl.stream_count.max(1))
    }

    /// Validate every cross-field constraint; called once at start-up.
    pub fn validate(&self) -> Result<()> {
        fn nonzero(value: u32, field: &'static str) -> Result<()> {
            if value == 0 {
                return Err(FtlError::Config {
                    field,
                    reason: "must be nonzero".into(),
                });
            }
            Ok(())
        }

        nonzero(self.device.channel_count, "channel_count")?;
        nonzero(self.device.chips_per_channel, "chips_per_channel")?;
        nonzero(self.device.dies_per_chip, "dies_per_chip")?;
        nonzero(self.device.planes_per_die, "planes_per_die")?;
        nonzero(self.device.blocks_per_plane, "blocks_per_plane")?;
        nonzero(self.device.pages_per_block, "pages_per_block")?;
        nonzero(self.device.sectors_per_page, "sectors_per_page")?;

        if self.device.sectors_per_page > 64 {
            return Err(FtlError::Config {
                field: "sectors_per_page",
                reason: "at most 64 sectors per page".into(),
            });
        }
        if !(0.0..1.0).contains(&self.device.overprovisioning_ratio) {
            return Err(FtlError::Config {
                field: "overprovisioning_ratio",
                reason: "must be in [0, 1)".into(),
            });
        }
        if self.ftl.stream_count == 0 {
            return Err(FtlError::Config {
                field: "stream_count",
                reason: "must be nonzero".into(),
            });
        }
        if !self.ftl.ideal_mapping && self.ftl.cmt_capacity == 0 {
            return Err(FtlError::InvalidMappingScheme(
                "cached mapping requires cmt_capacity > 0".into(),
            ));
        }
        if self.ftl.cmt_sharing_mode == CmtSharingMode::EqualSizePartitioning
            && !self.ftl.ideal_mapping
            && self.ftl.cmt_capacity < usize::from(self.ftl.stream_count)
        {
            return Err(FtlError::InvalidMappingScheme(format!(
                "cmt_capacity {} cannot be partitioned across {} streams",
                self.ftl.cmt_capacity, self.ftl.stream_count
            )));
        }
        if self.ftl.gc_policy == GcPolicy::Rga && self.ftl.rga_set_size == 0 {
            return Err(FtlError::Config {
                field: "rga_set_size",
                reason: "RGA requires a nonzero candidate sample".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.ftl.rho) {
            return Err(FtlError::Config {
                field: "rho",
                reason: "must be in [0, 1]".into(),
            });
        }
        if self.ftl.gc_hard_threshold > self.ftl.gc_soft_threshold {
            return Err(FtlError::Config {
                field: "gc_hard_threshold",
                reason: "hard threshold must not exceed the soft threshold".into(),
            });
        }
        // Each plane must be able to seed its write frontiers (user, GC, and
        // translation per stream) and still leave reclaim headroom.
        let frontiers = u64::from(self.ftl.stream_count) * 3;
        if u64::from(self.device.blocks_per_plane) <= frontiers {
            return Err(FtlError::Config {
                field: "blocks_per_plane",
                reason: format!("need more than {frontiers} blocks per plane for write frontiers"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn json_round_trip() {
        let config = SimConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SimConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let parsed =
            SimConfig::from_json_str(r#"{"ftl": {"gc_policy": "Rga", "rga_set_size": 4}}"#)
                .unwrap();
        assert_eq!(parsed.ftl.gc_policy, GcPolicy::Rga);
        assert_eq!(parsed.device, DeviceConfig::default());
    }

    #[test]
    fn rejects_zero_capacity_cached_mapping() {
        let mut config = SimConfig::default();
        config.ftl.cmt_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(FtlError::InvalidMappingScheme(_))
        ));
    }

    #[test]
    fn rejects_inverted_gc_thresholds() {
        let mut config = SimConfig::default();
        config.ftl.gc_soft_threshold = 0.001;
        config.ftl.gc_hard_threshold = 0.01;
        assert!(matches!(config.validate(), Err(FtlError::Config { .. })));
    }

    #[test]
    fn rejects_too_few_blocks_for_frontiers() {
        let mut config = SimConfig::default();
        config.device.blocks_per_plane = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_24_allocation_schemes_are_permutations() {
        use PlaneAllocationScheme::*;
        let schemes = [
            Cwdp, Cwpd, Cdwp, Cdpw, Cpwd, Cpdw, Wcdp, Wcpd, Wdcp, Wdpc, Wpcd, Wpdc, Dcwp, Dcpw,
            Dwcp, Dwpc, Dpcw, Dpwc, Pcwd, Pcdw, Pwcd, Pwdc, Pdcw, Pdwc,
        ];
        let mut seen = std::collections::HashSet::new();
        for scheme in schemes {
            let priority = scheme.priority();
            let mut dims: Vec<_> = priority.to_vec();
            dims.sort_by_key(|d| format!("{d:?}"));
            assert_eq!(dims.len(), 4);
            dims.dedup();
            assert_eq!(dims.len(), 4, "{scheme:?} is not a permutation");
            assert!(seen.insert(priority.map(|d| format!("{d:?}")).join("")));
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn logical_space_reflects_overprovisioning() {
        let mut config = SimConfig::default();
        config.device = DeviceConfig {
            channel_count: 1,
            chips_per_channel: 1,
            dies_per_chip: 1,
            planes_per_die: 1,
            blocks_per_plane: 100,
            pages_per_block: 10,
            sectors_per_page: 8,
            overprovisioning_ratio: 0.1,
        };
        assert_eq!(config.logical_pages_per_stream(), 900);
    }
}
