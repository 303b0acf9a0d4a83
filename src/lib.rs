// Licensed under the Apache License, Version 2.0.

//! CPU coordination core for a machine emulator.
//!
//! This crate owns three things, mirroring a single-process emulator's CPU
//! coordination layer:
//!
//! - [`registry`]: the ordered set of live [`registry::Cpu`] contexts ([`registry::CpuRegistry`]).
//! - [`dispatcher`]: posting work onto a CPU and running it with the right BQL/barrier
//!   discipline ([`dispatcher::Coordinator`]).
//! - [`barrier`]: the exclusive-execution barrier that halts every other CPU for a
//!   critical section.
//!
//! It does not translate guest instructions, emulate devices, or run a host event
//! loop — those are the caller's job. This crate only coordinates access to CPU
//! contexts across threads.

pub mod barrier;
pub mod bql;
pub mod current_cpu;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod work_queue;

#[cfg(test)]
pub(crate) mod logging;

pub use bql::{Bql, BqlGuard};
pub use current_cpu::CurrentCpuGuard;
pub use dispatcher::Coordinator;
pub use error::CpuThreadSpawnError;
pub use registry::{Cpu, CpuRegistry, RegistryGuard};

use std::sync::Arc;

/// Spawns `cpu`'s dedicated executor thread, binding it as that thread's
/// [`current_cpu`] for the duration of `body`.
///
/// The only fallible ambient operation in this crate: everything else either always
/// succeeds or signals a programmer error via `panic!`.
///
/// # Errors
///
/// Returns [`CpuThreadSpawnError`] if the OS fails to spawn the thread (e.g. the
/// process is out of threads).
pub fn spawn_cpu_executor(
    cpu: Arc<Cpu>,
    body: impl FnOnce(&Arc<Cpu>) + Send + 'static,
) -> Result<std::thread::JoinHandle<()>, CpuThreadSpawnError> {
    let index = cpu.index();
    std::thread::Builder::new()
        .name(format!("cpu-{index}"))
        .spawn(move || {
            let _binding = current_cpu::bind_current(cpu.clone());
            body(&cpu);
        })
        .map_err(|source| CpuThreadSpawnError::new(index, source))
}
