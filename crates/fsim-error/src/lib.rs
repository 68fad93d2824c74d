#![forbid(unsafe_code)]
//! Error types for FlashSim.
//!
//! # Error Taxonomy
//!
//! The FTL core distinguishes three classes of trouble, and only one of them
//! is an `Err`:
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | Configuration / invariant violation | bad mapping scheme, free-pool exhaustion, inconsistent plane counters, occupied slot overwrite | `FtlError`, fatal — the run aborts with a diagnostic |
//! | Benign race | GC relocation read finds the page was overwritten | dropped locally, never an error |
//! | Resource contention | CMT full, chip busy, suspension not justified | deferral — re-evaluated on the next PHY idle signal |
//!
//! A fatal error means the configured GC thresholds or capacities cannot
//! sustain the workload; there is no degraded operating mode, so no variant
//! here is retryable.
//!
//! `fsim-error` deliberately depends on nothing but `thiserror`, so every
//! other crate can use it without cycles.

use thiserror::Error;

/// Unified fatal error type for all FlashSim core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FtlError {
    /// A configuration field failed validation at simulation start.
    #[error("invalid configuration: {field}: {reason}")]
    Config {
        field: &'static str,
        reason: String,
    },

    /// The selected address-mapping scheme/sharing mode combination is not
    /// implementable (e.g., partitioned CMT with zero streams).
    #[error("invalid address mapping scheme: {0}")]
    InvalidMappingScheme(String),

    /// Translation was requested for an LPA outside the logical space.
    /// This is a programming error in the host front end, not a retryable
    /// condition.
    #[error("lpa {lpa} out of range for stream {stream} (limit {limit})")]
    AddressOutOfRange { stream: u8, lpa: u64, limit: u64 },

    /// A free page/block was requested from an empty pool. GC back-pressure
    /// must prevent this state; reaching it is a resource-management defect.
    #[error("free block pool exhausted on plane c{channel}/w{chip}/d{die}/p{plane}")]
    FreePoolExhausted {
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    },

    /// Plane or block bookkeeping became inconsistent (page counters, service
    /// state machine, frontier accounting).
    #[error("block bookkeeping violation: {detail}")]
    BlockBookkeeping { detail: String },

    /// An already-occupied CMT slot or queue slot would have been overwritten.
    #[error("slot already occupied: {detail}")]
    SlotOccupied { detail: String },

    /// The CMT access protocol was violated (lookup without `exists` check,
    /// reserve on a full table without a prior eviction, evicting from an
    /// all-waiting table).
    #[error("mapping cache protocol violation: {detail}")]
    MappingProtocol { detail: String },

    /// A transaction handle no longer resolves where a live transaction was
    /// required.
    #[error("stale transaction handle: {detail}")]
    StaleHandle { detail: String },

    /// A transaction with an unknown source/type combination reached the
    /// scheduler.
    #[error("unknown transaction reached the scheduler: {detail}")]
    UnknownTransaction { detail: String },

    /// The scheduler's two-phase submission protocol was violated (a
    /// `schedule` with no open `prepare_for_submit` frame).
    #[error("scheduler protocol violation: {detail}")]
    SchedulingProtocol { detail: String },
}

/// Result alias using `FtlError`.
pub type Result<T> = std::result::Result<T, FtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_identifies_subsystem_and_invariant() {
        let err = FtlError::FreePoolExhausted {
            channel: 1,
            chip: 0,
            die: 2,
            plane: 3,
        };
        assert_eq!(
            err.to_string(),
            "free block pool exhausted on plane c1/w0/d2/p3"
        );

        let err = FtlError::AddressOutOfRange {
            stream: 4,
            lpa: 100,
            limit: 64,
        };
        assert_eq!(err.to_string(), "lpa 100 out of range for stream 4 (limit 64)");

        let err = FtlError::Config {
            field: "cmt_capacity",
            reason: "must be nonzero".into(),
        };
        assert!(err.to_string().contains("cmt_capacity"));
    }
}
