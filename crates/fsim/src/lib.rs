#![forbid(unsafe_code)]
//! FlashSim public API facade.
//!
//! Re-exports the orchestrating core through a stable external interface.
//! This is the crate downstream consumers (CLI, harnesses) depend on.

pub use fsim_config::SimConfig;
pub use fsim_core::*;
pub use fsim_error::{FtlError, Result};
pub use fsim_types::{Lpa, SectorBitmap, SimTime, StreamId};
