//! Core types for the idweld identity-consolidation engine
//!
//! This crate holds everything that can be computed without a database in
//! hand: input normalization, the in-memory cluster model, merge planning,
//! novelty detection, and the consolidated projection. The storage-facing
//! engine in `idweld-db` feeds snapshots in and writes the planned
//! mutations back out inside one transaction.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;

pub use cluster::{ContactSnapshot, Linkage, MergePlan};
pub use error::{Error, Result};
pub use identity::{ConsolidatedContact, IdentityInput};
