//! TrackProof Backend Library
//!
//! Exposes the ledger core, HTTP surface, and configuration for use by
//! binaries and tests.

pub mod api;
pub mod config;
pub mod ledger;
