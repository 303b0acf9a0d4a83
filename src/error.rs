// Licensed under the Apache License, Version 2.0.

//! The one place in this crate that returns a recoverable [`Result`]: spawning a
//! CPU's dedicated executor thread. Everything on the dispatch hot path (registry
//! mutation, work queueing, the barrier) either always succeeds or signals a
//! programmer error via `panic!`/`assert!` instead — there is nothing a caller could
//! usefully recover from when, say, an exclusive item also requests the BQL.

use thiserror::Error;

/// Failure to spawn a CPU's executor thread.
#[derive(Debug, Error)]
#[error("failed to spawn cpu executor thread {index}")]
pub struct CpuThreadSpawnError {
    /// The registry index the CPU would have been registered under.
    pub index: i64,
    #[source]
    source: std::io::Error,
}

impl CpuThreadSpawnError {
    pub(crate) fn new(index: i64, source: std::io::Error) -> Self {
        Self { index, source }
    }
}
