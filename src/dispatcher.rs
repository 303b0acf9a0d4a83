// Licensed under the Apache License, Version 2.0.

//! The work dispatcher: the public operations that post work onto a CPU and the
//! drain routine that executes it with the right BQL/barrier discipline.
//!
//! A C coordination core would model a work item's payload as a `(func, data)` pair so
//! it can cross the ABI as an opaque pointer. In Rust a closure already carries its
//! captured data, so `run_on_cpu` and friends below take
//! `impl FnOnce(&Arc<Cpu>) + Send` directly instead of reconstructing that calling
//! convention.

use crate::bql::Bql;
use crate::current_cpu;
use crate::registry::{Cpu, CpuRegistry};
use crate::work_queue::{self, Completion, WorkItem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

/// Bundles the CPU registry and the BQL — the two pieces of shared state every
/// dispatch operation touches — behind one facade, the way a host embeds a single
/// "emulator core" singleton rather than threading two separate globals through
/// every call site.
#[derive(Debug, Default)]
pub struct Coordinator {
    pub registry: CpuRegistry,
    pub bql: Bql,
}

impl Coordinator {
    /// Creates an empty coordinator with an unlocked BQL. `const fn` so it can back
    /// a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registry: CpuRegistry::new(),
            bql: Bql::new(),
        }
    }

    /// Synchronous dispatch: blocks the caller until `f` has run on `cpu` with the
    /// BQL held.
    ///
    /// If the caller is already executing on `cpu`'s own thread, `f` runs inline (the
    /// BQL is acquired only if not already held) — no enqueue, no wait. Otherwise, if
    /// the calling thread holds the BQL, it is released before the wait below (it
    /// must never be held across a sleep) and reacquired once `f` has run.
    pub fn run_on_cpu(&self, cpu: &Arc<Cpu>, f: impl FnOnce(&Arc<Cpu>) + Send + 'static) {
        if let Some(current) = current_cpu::current()
            && Arc::ptr_eq(&current, cpu)
        {
            let _guard = (!self.bql.is_held()).then(|| self.bql.lock());
            f(cpu);
            return;
        }

        let done = Arc::new(AtomicBool::new(false));
        work_queue::enqueue(
            cpu,
            WorkItem {
                func: Box::new(f),
                exclusive: false,
                bql: true,
                completion: Completion::Awaited(done.clone()),
            },
        );

        let held = self.bql.is_held();
        if held {
            self.bql.raw_unlock();
        }

        let mut guard = cpu.work.lock().unwrap_or_else(PoisonError::into_inner);
        while !done.load(Ordering::Acquire) {
            guard = cpu
                .work_cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(guard);

        if held {
            self.bql.raw_lock();
        }
    }

    /// Fire-and-forget dispatch: `f` runs on `cpu` with the BQL held, in submission
    /// order relative to other items queued on the same CPU.
    pub fn async_run_on_cpu(&self, cpu: &Arc<Cpu>, f: impl FnOnce(&Arc<Cpu>) + Send + 'static) {
        work_queue::enqueue(
            cpu,
            WorkItem {
                func: Box::new(f),
                exclusive: false,
                bql: true,
                completion: Completion::Owned,
            },
        );
    }

    /// Fire-and-forget dispatch: `f` runs on `cpu` *without* the BQL held.
    pub fn async_run_on_cpu_no_bql(
        &self,
        cpu: &Arc<Cpu>,
        f: impl FnOnce(&Arc<Cpu>) + Send + 'static,
    ) {
        work_queue::enqueue(
            cpu,
            WorkItem {
                func: Box::new(f),
                exclusive: false,
                bql: false,
                completion: Completion::Owned,
            },
        );
    }

    /// Fire-and-forget dispatch: `f` runs on `cpu` inside an exclusive barrier (every
    /// other CPU suspended for its duration). An exclusive item never also requests
    /// the BQL — `execute` releases it for the duration of the barrier regardless of
    /// whether the drain loop was holding it, since the barrier already excludes every
    /// other CPU.
    pub fn async_safe_run_on_cpu(
        &self,
        cpu: &Arc<Cpu>,
        f: impl FnOnce(&Arc<Cpu>) + Send + 'static,
    ) {
        work_queue::enqueue(
            cpu,
            WorkItem {
                func: Box::new(f),
                exclusive: true,
                bql: false,
                completion: Completion::Owned,
            },
        );
    }

    /// Drains `cpu`'s work queue, executing each item with the BQL/barrier discipline
    /// its flags call for. Called by `cpu`'s own executor thread when it reaches a
    /// safe point.
    ///
    /// `has_bql` is the BQL state *on entry* — fixed for the whole drain call, not
    /// re-queried per item, since an item's callback could itself change whether the
    /// calling thread holds the BQL and drain must not get confused about its own
    /// starting state as a result.
    pub fn drain(&self, cpu: &Arc<Cpu>, has_bql: bool) {
        while let Some(item) = work_queue::pop_front(cpu) {
            self.execute(cpu, item, has_bql);
            work_queue::notify_waiters(cpu);
        }
    }

    fn execute(&self, cpu: &Arc<Cpu>, item: WorkItem, has_bql: bool) {
        let WorkItem {
            func,
            exclusive,
            bql,
            completion,
        } = item;

        assert!(
            !(exclusive && bql),
            "an exclusive work item must not also request the BQL"
        );

        if exclusive {
            // Release before entering the barrier: holding the BQL here while another
            // CPU enters the barrier would deadlock against it.
            if has_bql {
                self.bql.raw_unlock();
            }
            let guard = self.registry.start_exclusive();
            tracing::trace!("drain: running exclusive work item");
            func(cpu);
            guard.end();
            if has_bql {
                self.bql.raw_lock();
            }
        } else if bql && !has_bql {
            let guard = self.bql.lock();
            func(cpu);
            drop(guard);
        } else if !bql && has_bql {
            self.bql.raw_unlock();
            func(cpu);
            self.bql.raw_lock();
        } else {
            func(cpu);
        }

        if let Completion::Awaited(done) = completion {
            done.store(true, Ordering::Release);
        }
    }
}
