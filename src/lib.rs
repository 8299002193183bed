//! Incremental SMART sitrep extraction with idempotent partition loads.
//!
//! A run plans week-sized date windows ending at the configured date, fetches
//! each `(window, site)` partition from the SMART API and replaces that
//! partition in a DuckDB table with a delete followed by chunked inserts.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod storage;
pub mod utils;

pub use error::{Result, SmartError};
