// Licensed under the Apache License, Version 2.0.

//! Thread-local binding from an OS thread to the [`Cpu`] it is currently executing.
//!
//! `run_on_cpu`'s fast path ("am I already running on the target CPU's thread?")
//! needs this, and so does `exec_start`/`exec_end`'s caller (the CPU's own dedicated
//! executor thread). The host binds this once, when a CPU's executor thread starts,
//! via [`bind_current`].
//!
//! Save-and-restore across a wait: a thread that waits on a CPU's condition variable
//! inside [`crate::dispatcher::Coordinator::run_on_cpu`] keeps its own
//! `current_cpu` value untouched by that wait — each thread's binding is private to
//! it, so there's nothing to save here. The note belongs to the host's thread loop,
//! not this module: if a host thread temporarily binds to a *different* CPU (e.g. to
//! help drain it) it must restore its own binding afterward, which is exactly what
//! [`bind_current`]'s guard does on drop.

use crate::registry::Cpu;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
}

/// Returns the [`Cpu`] bound to the calling thread, or `None` if this thread isn't a
/// CPU executor thread (or hasn't called [`bind_current`] yet).
#[must_use]
pub fn current() -> Option<Arc<Cpu>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// RAII handle returned by [`bind_current`]. Restores the thread's previous binding
/// when dropped.
#[derive(Debug)]
pub struct CurrentCpuGuard {
    previous: Option<Arc<Cpu>>,
}

impl Drop for CurrentCpuGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.previous.take());
    }
}

/// Binds `cpu` as the calling thread's current CPU for the lifetime of the returned
/// guard. A CPU's dedicated executor thread calls this once before entering its main
/// loop.
pub fn bind_current(cpu: Arc<Cpu>) -> CurrentCpuGuard {
    let previous = CURRENT.with(|c| c.borrow_mut().replace(cpu));
    CurrentCpuGuard { previous }
}

#[cfg(test)]
mod tests {
    use super::{bind_current, current};
    use crate::registry::Cpu;
    use std::sync::Arc;

    #[test]
    fn unbound_thread_has_no_current_cpu() {
        assert!(current().is_none());
    }

    #[test]
    fn bind_then_drop_restores_previous() {
        let a = Arc::new(Cpu::new(|| {}));
        let b = Arc::new(Cpu::new(|| {}));

        assert!(current().is_none());
        let outer = bind_current(a.clone());
        assert!(Arc::ptr_eq(&current().unwrap(), &a));
        {
            let _inner = bind_current(b.clone());
            assert!(Arc::ptr_eq(&current().unwrap(), &b));
        }
        assert!(Arc::ptr_eq(&current().unwrap(), &a));
        drop(outer);
        assert!(current().is_none());
    }
}
