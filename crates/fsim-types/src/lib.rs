#![forbid(unsafe_code)]
//! Core types for the FlashSim flash-translation-layer.
//!
//! This crate is dependency-light by design: every other FlashSim crate
//! builds on the newtypes, the transaction sum type, and the transaction
//! arena defined here. Nothing in this crate performs I/O or owns policy.

pub mod address;
pub mod arena;
pub mod transaction;

pub use address::{
    Geometry, Lpa, Mvpn, PhysicalPageAddress, Ppa, SectorBitmap, SimTime, StreamId,
    SECTOR_SIZE_BYTES,
};
pub use arena::{TransactionArena, TxHandle};
pub use transaction::{
    EraseTx, ReadTx, Transaction, TransactionCategory, TransactionKind, TransactionSource, WriteTx,
};
