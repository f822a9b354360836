//! Fetcher adapters.
//!
//! Fetcher adapters can be layered on fetchers.

pub mod fault_injection;
pub mod fetch_metrics;
