// Licensed under the Apache License, Version 2.0.

//! Test/example-only logging setup.
//!
//! This crate emits its diagnostics through `tracing` (see the `tracing::debug!`/
//! `tracing::trace!` calls throughout [`crate::registry`] and [`crate::barrier`]) but
//! never installs a subscriber itself — that choice belongs to the host process. This
//! module only exists to give tests and doc examples a one-line way to see that
//! output, the way a host would wire up `tracing-subscriber` in its own `main`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing-subscriber` `fmt` subscriber filtered by `RUST_LOG` (defaulting
/// to `warn`), once per process. Safe to call from multiple tests; later calls are
/// no-ops.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}
