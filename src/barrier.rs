// Licensed under the Apache License, Version 2.0.

//! The exclusive-execution barrier: one thread ("the initiator") halts every CPU so
//! it can run a critical section while guaranteeing no CPU is executing guest code.
//!
//! # The `running`/`pending_cpus` Handshake
//!
//! Each CPU publishes `running` around its guest-execution window; the initiator
//! publishes its intent via `pending_cpus`. Both sides place a full fence between
//! writing their own flag and reading the other's, which is what rules out the
//! interleaving where neither side observes the other: without it, a CPU could read
//! `pending_cpus == 0` and enter guest code at the same moment the initiator reads
//! `running == false` and proceeds, and the two would overlap.
//!
//! `pending_cpus` itself is written only while holding [`CpuRegistry`]'s mutex; it is
//! also exposed as an [`AtomicI64`] so `exec_start`/`exec_end` can peek it without
//! locking on the common case where no barrier is in progress.

use crate::registry::{Cpu, CpuRegistry};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

thread_local! {
    /// True only on the thread that currently holds an exclusive barrier it started
    /// itself. Not tied to any particular [`Cpu`] — the initiator need not be a
    /// registered CPU's executor thread at all.
    static IN_EXCLUSIVE_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread currently holds an exclusive barrier.
#[must_use]
pub fn in_exclusive_context() -> bool {
    IN_EXCLUSIVE_CONTEXT.with(Cell::get)
}

/// RAII handle for an in-progress exclusive barrier, returned by
/// [`CpuRegistry::start_exclusive`]. Dropping it calls
/// [`CpuRegistry::end_exclusive`], so a panic inside the critical section still
/// releases every suspended CPU instead of deadlocking the process.
#[must_use = "the barrier ends when this guard drops"]
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    registry: &'a CpuRegistry,
}

impl ExclusiveGuard<'_> {
    /// Ends the barrier. Equivalent to `drop(self)`; spelled out as its own method so
    /// `start_exclusive`/`end_exclusive` reads as a pair at call sites.
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_exclusive_inner();
    }
}

impl CpuRegistry {
    /// Starts an exclusive barrier: waits out any barrier already in progress, then
    /// forces every currently-`running` CPU to stop before returning.
    ///
    /// Returns only once every CPU that was running at the start of this call has
    /// either reached `exec_end` or self-suspended inside `exec_start`. The registry
    /// mutex is not held across the critical section — `pending_cpus` staying nonzero
    /// is what blocks new barriers and new executors while this one is active.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds an exclusive barrier it started
    /// itself — barriers do not nest.
    pub fn start_exclusive(&self) -> ExclusiveGuard<'_> {
        assert!(
            !in_exclusive_context(),
            "start_exclusive called while this thread already holds a barrier"
        );

        // A CPU's own executor thread may request an exclusive section while still
        // marked running (e.g. to invalidate its own translation cache before calling
        // exec_end) — it must not wait on itself, so it's excluded from the scan below.
        let caller_cpu = crate::current_cpu::current();

        let mut inner = self.lock_inner();
        while self.pending_cpus.load(Ordering::SeqCst) != 0 {
            inner = self
                .resume_cond
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }

        // Announcing: claim our own contribution before anyone else can observe
        // pending_cpus == 0 again.
        self.pending_cpus.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let mut counted = 0i64;
        for cpu in &inner.cpus {
            if caller_cpu.as_ref().is_some_and(|c| Arc::ptr_eq(c, cpu)) {
                continue;
            }
            if cpu.running.load(Ordering::SeqCst) {
                cpu.has_waiter.store(true, Ordering::SeqCst);
                counted += 1;
                cpu.thread_kick();
            }
        }
        tracing::debug!(counted, "start_exclusive: counting running cpus");

        // Counting: now wait for every counted CPU's exec_end to decrement us back
        // down to our own contribution.
        self.pending_cpus.store(1 + counted, Ordering::SeqCst);
        while self.pending_cpus.load(Ordering::SeqCst) > 1 {
            inner = self
                .exclusive_cond
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(inner);

        IN_EXCLUSIVE_CONTEXT.with(|f| f.set(true));
        tracing::debug!("start_exclusive: entered exclusive context");
        ExclusiveGuard { registry: self }
    }

    fn end_exclusive_inner(&self) {
        IN_EXCLUSIVE_CONTEXT.with(|f| f.set(false));
        let inner = self.lock_inner();
        self.pending_cpus.store(0, Ordering::SeqCst);
        drop(inner);
        self.resume_cond.notify_all();
        tracing::debug!("end_exclusive: released");
    }

    /// Entry to a guest-execution window. Publishes `cpu.running = true`, then either
    /// returns immediately (no barrier in progress) or participates in one: if a
    /// barrier's scan already counted this CPU, it proceeds (the barrier is waiting
    /// for this CPU's *next* `exec_end`); otherwise it arrived after the scan and
    /// must self-suspend until the barrier ends.
    pub fn exec_start(&self, cpu: &Arc<Cpu>) {
        cpu.running.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if self.pending_cpus.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut inner = self.lock_inner();
        if cpu.has_waiter.load(Ordering::SeqCst) {
            // Already counted by start_exclusive's scan; it's waiting for our
            // exec_end, not for us to suspend here.
            return;
        }
        cpu.running.store(false, Ordering::SeqCst);
        while self.pending_cpus.load(Ordering::SeqCst) != 0 {
            inner = self
                .resume_cond
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(inner);
        cpu.running.store(true, Ordering::SeqCst);
    }

    /// Exit from a guest-execution window. Publishes `cpu.running = false`; if this
    /// CPU was counted into an in-progress barrier, clears that and decrements
    /// `pending_cpus`, waking the initiator once the count reaches its own
    /// contribution.
    pub fn exec_end(&self, cpu: &Arc<Cpu>) {
        cpu.running.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if self.pending_cpus.load(Ordering::SeqCst) == 0 {
            return;
        }

        let inner = self.lock_inner();
        if cpu.has_waiter.load(Ordering::SeqCst) {
            cpu.has_waiter.store(false, Ordering::SeqCst);
            let remaining = self.pending_cpus.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 1 {
                self.exclusive_cond.notify_one();
            }
        }
        drop(inner);
    }
}
