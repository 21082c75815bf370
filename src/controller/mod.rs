//! # Controller
//!
//! The per-environment reconciliation machinery: the polling watcher loop,
//! the pipeline it drives, and the backoff applied when a loop keeps
//! failing.

pub mod backoff;
pub mod pipeline;
pub mod watcher;
