// Licensed under the Apache License, Version 2.0.

//! The per-CPU work queue: a FIFO of callbacks attached to each [`Cpu`], plus the
//! completion signal a synchronous caller waits on.
//!
//! Dispatch *rules* (which of these items need the BQL, which need the exclusive
//! barrier) live in [`crate::dispatcher`]; this module only owns the queue mechanics:
//! enqueue-and-kick, and popping one item at a time under the per-CPU lock.

use crate::registry::Cpu;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError};

/// Who observes completion of a work item.
///
/// A plain pair of `free`/`done` flags would let a caller construct a contradiction
/// (say, "nobody owns this item" and "nobody is waiting on it either"). A sum type
/// makes the two real states exhaustive instead: either the core owns the item, or a
/// waiter holds the flag it polls.
pub(crate) enum Completion {
    /// The core owns this item; nothing observes when it finishes beyond the
    /// callback itself running.
    Owned,
    /// The submitter is waiting; set to `true` (release) once the callback returns.
    Awaited(Arc<AtomicBool>),
}

/// The callback a [`WorkItem`] carries.
pub(crate) type CpuCallback = Box<dyn FnOnce(&Arc<Cpu>) + Send>;

/// A single unit of work queued onto a [`Cpu`].
pub(crate) struct WorkItem {
    pub(crate) func: CpuCallback,
    /// Must run inside an exclusive barrier. Mutually exclusive with `bql`: a barrier
    /// item never also asks for the BQL, since the barrier already excludes every
    /// other CPU and holding the BQL through it besides would gain nothing but risk
    /// deadlocking against whatever else wants the BQL while suspended.
    pub(crate) exclusive: bool,
    /// Must run with the BQL held.
    pub(crate) bql: bool,
    pub(crate) completion: Completion,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("exclusive", &self.exclusive)
            .field("bql", &self.bql)
            .finish_non_exhaustive()
    }
}

/// Appends `item` to `cpu`'s queue and kicks its executor thread, all while holding
/// `cpu`'s per-CPU lock so the kick is never missed even if the thread is currently
/// blocked in a wait.
pub(crate) fn enqueue(cpu: &Arc<Cpu>, item: WorkItem) {
    let mut queue = cpu.work.lock().unwrap_or_else(PoisonError::into_inner);
    queue.push_back(item);
    // Kick while still holding the lock: cheap and non-blocking by contract, and
    // guarantees the enqueue is visible before the target thread wakes.
    cpu.thread_kick();
}

/// Pops the head item off `cpu`'s queue, if any, releasing the per-CPU lock
/// immediately afterward so other threads may keep enqueueing while this item runs.
pub(crate) fn pop_front(cpu: &Arc<Cpu>) -> Option<WorkItem> {
    cpu.work
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

/// Wakes every thread blocked in [`crate::dispatcher::Coordinator::run_on_cpu`] on
/// `cpu`, called once per drained item regardless of whether anyone was waiting on
/// it specifically.
pub(crate) fn notify_waiters(cpu: &Arc<Cpu>) {
    cpu.work_cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::{Completion, WorkItem, enqueue, pop_front};
    use crate::registry::Cpu;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn fifo_order_is_preserved() {
        let kicks = Arc::new(AtomicUsize::new(0));
        let cpu = Arc::new(Cpu::new({
            let kicks = kicks.clone();
            move || {
                kicks.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let order = order.clone();
            enqueue(
                &cpu,
                WorkItem {
                    func: Box::new(move |_| order.lock().unwrap().push(i)),
                    exclusive: false,
                    bql: false,
                    completion: Completion::Owned,
                },
            );
        }
        assert_eq!(kicks.load(Ordering::SeqCst), 3);

        while let Some(item) = pop_front(&cpu) {
            (item.func)(&cpu);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(pop_front(&cpu).is_none());
    }
}
