//! MarketSnap core: batch extraction of market listings from screenshots.
//!
//! Uploads are hashed, deduplicated against a day-scoped ledger, dispatched
//! to a vision provider under its concurrency and rate profile, retried
//! serially on failure, and reported over a replayable event stream. The
//! server crate wires these services to HTTP.

pub mod config;
pub mod error;
pub mod services;

pub use error::AppError;
