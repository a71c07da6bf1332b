//! Construction-time errors.
//!
//! Every per-element operation in this crate returns `bool`/`Option` by
//! design (see spec §7) — `Result` only shows up here, at the one place an
//! invalid argument can be rejected before any lock-free algorithm runs.

use thiserror::Error;

/// Failure building a distributed container.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstructError {
    /// `Lldd::new` was called with `segment_capacity == 0`, which can never
    /// hold a single backend and would make every `put` fail immediately.
    #[error("segment_capacity must be at least 1")]
    ZeroCapacity,
}
