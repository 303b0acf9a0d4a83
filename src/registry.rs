// Licensed under the Apache License, Version 2.0.

//! The CPU registry: the ordered list of live CPU contexts, plus per-CPU state that
//! is meaningful even outside any barrier (`index`, `running`, the work queue).
//!
//! Barrier-specific registry state (`pending_cpus`, `exclusive_cond`, `resume_cond`)
//! lives on [`CpuRegistry`] too, but its behavior is implemented in
//! [`crate::barrier`] — this module only owns membership and index assignment.

use crate::work_queue::WorkItem;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Sentinel for "this CPU has no registry index" — before registration and after
/// removal.
pub const UNASSIGNED: i64 = -1;

/// A host-supplied callback that nudges a CPU's executor thread out of any blocking
/// wait, so it notices newly enqueued work or a barrier request. Must be
/// non-blocking and safe to call repeatedly.
pub type ThreadKick = Box<dyn Fn() + Send + Sync>;

/// A CPU execution context.
///
/// The host is expected to hold this behind an `Arc<Cpu>` alongside its own
/// CPU-specific state (registers, translation cache, whatever the emulator proper
/// needs) — this type only carries what the coordination core needs to track.
pub struct Cpu {
    index: AtomicI64,
    pub(crate) running: AtomicBool,
    pub(crate) has_waiter: AtomicBool,
    pub(crate) work: Mutex<VecDeque<WorkItem>>,
    pub(crate) work_cond: Condvar,
    kick: ThreadKick,
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("index", &self.index())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Cpu {
    /// Creates a new, unregistered CPU context. `kick` is called by
    /// [`crate::work_queue::enqueue`] and by [`crate::barrier`] to wake this CPU's
    /// executor thread out of a blocking wait.
    pub fn new(kick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            index: AtomicI64::new(UNASSIGNED),
            running: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            work: Mutex::new(VecDeque::new()),
            work_cond: Condvar::new(),
            kick: Box::new(kick),
        }
    }

    /// This CPU's registry index, or [`UNASSIGNED`] if it isn't currently
    /// registered.
    #[must_use]
    pub fn index(&self) -> i64 {
        self.index.load(Ordering::Acquire)
    }

    /// Whether this CPU is currently executing guest code (between a matched
    /// `exec_start`/`exec_end` pair).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn thread_kick(&self) {
        (self.kick)();
    }
}

pub(crate) struct RegistryInner {
    pub(crate) cpus: Vec<Arc<Cpu>>,
    /// `None` until the first [`CpuRegistry::add`]; then sticky for the life of the
    /// registry (until [`CpuRegistry::init`]): `Some(true)` once any index has been
    /// auto-assigned, `Some(false)` once any caller-supplied index has been
    /// accepted. A registry may not mix the two disciplines over its lifetime.
    index_auto_assigned: Option<bool>,
}

/// The CPU registry: ordered membership plus the shared barrier state in
/// [`crate::barrier`].
///
/// Intended to be a single process-wide instance (a `static`, constructed with the
/// `const` [`CpuRegistry::new`]), initialized once and reset via [`CpuRegistry::init`]
/// in a post-fork child.
pub struct CpuRegistry {
    inner: Mutex<RegistryInner>,
    pub(crate) pending_cpus: AtomicI64,
    pub(crate) exclusive_cond: Condvar,
    pub(crate) resume_cond: Condvar,
}

impl fmt::Debug for CpuRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuRegistry")
            .field("pending_cpus", &self.pending_cpus.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Held while iterating or mutating registry membership. Returned by
/// [`CpuRegistry::lock`]; dropping it (or calling [`RegistryGuard::unlock`]) releases
/// the registry mutex.
#[must_use = "the registry mutex is released when this guard drops"]
pub struct RegistryGuard<'a> {
    inner: MutexGuard<'a, RegistryInner>,
}

impl fmt::Debug for RegistryGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryGuard")
            .field("cpus", &self.cpus().len())
            .finish()
    }
}

impl RegistryGuard<'_> {
    /// The currently registered CPUs, in registration order.
    #[must_use]
    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.inner.cpus
    }

    /// Releases the registry mutex. Equivalent to `drop(self)`; spelled out as its own
    /// method so lock/unlock reads as a pair at call sites.
    pub fn unlock(self) {
        drop(self);
    }
}

impl CpuRegistry {
    /// The current value of `pending_cpus`: `0` when no exclusive barrier is in
    /// progress, otherwise `1 + (CPUs still owed a decrement)`. Exposed for
    /// introspection and testing; the barrier protocol itself lives in
    /// [`crate::barrier`].
    #[must_use]
    pub fn pending_cpus(&self) -> i64 {
        self.pending_cpus.load(Ordering::SeqCst)
    }

    /// Creates an empty registry with no barrier in progress. `const fn` so it can
    /// back a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                cpus: Vec::new(),
                index_auto_assigned: None,
            }),
            pending_cpus: AtomicI64::new(0),
            exclusive_cond: Condvar::new(),
            resume_cond: Condvar::new(),
        }
    }

    /// (Re)initializes all state owned by this registry: drops membership, clears
    /// the sticky auto/explicit-index flag, and unconditionally resets
    /// `pending_cpus` to zero.
    ///
    /// Safe to call in a post-fork child: the parent's in-progress barrier (if any)
    /// does not carry over, by design.
    pub fn init(&self) {
        let mut inner = self.lock_inner();
        inner.cpus.clear();
        inner.index_auto_assigned = None;
        drop(inner);
        self.pending_cpus.store(0, Ordering::SeqCst);
        tracing::debug!("cpu registry reinitialized");
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the registry for external iteration, serialized against membership
    /// changes.
    #[must_use = "dropping the guard immediately releases the registry mutex"]
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            inner: self.lock_inner(),
        }
    }

    /// Registers `cpu`.
    ///
    /// If `cpu` has no index yet, assigns the smallest integer strictly greater than
    /// every currently-registered index (starting at 0) — monotonic, not
    /// gap-filling, so indices already handed out as debugging identifiers are never
    /// reused. If `cpu` already has an index, it is taken as caller-supplied.
    ///
    /// # Panics
    ///
    /// Panics if this call would mix auto-assigned and caller-supplied indices
    /// among currently-tracked CPUs.
    pub fn add(&self, cpu: Arc<Cpu>) {
        let mut inner = self.lock_inner();

        if cpu.index() == UNASSIGNED {
            assert!(
                inner.index_auto_assigned != Some(false),
                "cannot auto-assign a CPU index: a prior CPU was registered with an \
                 explicit index"
            );
            let next = inner
                .cpus
                .iter()
                .map(|c| c.index())
                .max()
                .map_or(0, |max| max + 1);
            cpu.index.store(next, Ordering::Release);
            inner.index_auto_assigned = Some(true);
        } else {
            assert!(
                inner.index_auto_assigned != Some(true),
                "cannot register a CPU with an explicit index: a prior CPU index was \
                 auto-assigned"
            );
            inner.index_auto_assigned = Some(false);
        }

        tracing::debug!(cpu_index = cpu.index(), "registered cpu");
        inner.cpus.push(cpu);
    }

    /// Unregisters `cpu` if it is currently linked, resetting its index to
    /// [`UNASSIGNED`]. A no-op if `cpu` isn't registered (idempotent).
    pub fn remove(&self, cpu: &Arc<Cpu>) {
        let mut inner = self.lock_inner();
        let Some(pos) = inner.cpus.iter().position(|c| Arc::ptr_eq(c, cpu)) else {
            return;
        };
        inner.cpus.remove(pos);
        cpu.index.store(UNASSIGNED, Ordering::Release);
        tracing::debug!("unregistered cpu");
    }
}

impl Default for CpuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Cpu, CpuRegistry, UNASSIGNED};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn noop_cpu() -> Arc<Cpu> {
        Arc::new(Cpu::new(|| {}))
    }

    #[test]
    fn indices_are_monotonic_max_plus_one_not_gap_filling() {
        let registry = CpuRegistry::new();
        let a = noop_cpu();
        let b = noop_cpu();
        let c = noop_cpu();
        registry.add(a.clone());
        registry.add(b.clone());
        registry.add(c.clone());
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        registry.remove(&b);
        assert_eq!(b.index(), UNASSIGNED);

        // b's old index (1) is not reused even though it's now a gap.
        let d = noop_cpu();
        registry.add(d.clone());
        assert_eq!(d.index(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = CpuRegistry::new();
        let a = noop_cpu();
        registry.add(a.clone());
        registry.remove(&a);
        assert_eq!(a.index(), UNASSIGNED);
        registry.remove(&a); // no panic, no-op
    }

    #[test]
    #[should_panic(expected = "explicit index")]
    fn mixing_auto_then_explicit_index_panics() {
        let registry = CpuRegistry::new();
        registry.add(noop_cpu());

        let explicit = noop_cpu();
        explicit
            .index
            .store(7, std::sync::atomic::Ordering::Relaxed);
        registry.add(explicit);
    }

    #[test]
    fn init_resets_pending_cpus_and_membership() {
        let registry = CpuRegistry::new();
        registry.add(noop_cpu());
        registry
            .pending_cpus
            .store(3, std::sync::atomic::Ordering::SeqCst);

        registry.init();

        assert_eq!(
            registry
                .pending_cpus
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert!(registry.lock().cpus().is_empty());
    }

    #[test]
    fn lock_exposes_registration_order() {
        let registry = CpuRegistry::new();
        let a = noop_cpu();
        let b = noop_cpu();
        registry.add(a.clone());
        registry.add(b.clone());

        let guard = registry.lock();
        let indices: Vec<_> = guard.cpus().iter().map(|c| c.index()).collect();
        assert_eq!(indices, vec![0, 1]);
        guard.unlock();
    }
}
