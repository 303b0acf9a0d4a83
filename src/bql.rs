// Licensed under the Apache License, Version 2.0.

//! The "big emulator lock" (BQL): a single process-wide mutex that most dispatched
//! work runs under.
//!
//! # Why Not Just Wrap [`Mutex`]?
//!
//! The dispatcher needs two things a plain [`Mutex<()>`] guard can't give it: an
//! answer to "does *this* thread currently hold the BQL?" ([`Bql::is_held`]), and a
//! way to release the lock from one call and reacquire it from another without
//! passing a guard object between them (`run_on_cpu`'s release-around-the-wait
//! dance). So `Bql` is built on a `Mutex<bool>` + [`Condvar`] pair acting as the
//! actual lock, with a thread-local flag recording which thread owns it; the
//! optional [`BqlGuard`] is a thin RAII convenience over the same `lock`/`unlock`
//! pair for call sites that don't need to split them across function boundaries.
//!
//! [`Mutex`]: std::sync::Mutex
//! [`Mutex<()>`]: std::sync::Mutex

use std::cell::Cell;
use std::sync::{Condvar, Mutex, PoisonError};

thread_local! {
    static HELD_BY_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Process-wide big lock.
///
/// Construct exactly one instance per process (typically a `static`) and share it by
/// reference; the host's main loop and every dispatched work item serialize on it.
#[derive(Debug)]
pub struct Bql {
    locked: Mutex<bool>,
    cond: Condvar,
}

/// RAII guard returned by [`Bql::lock`]. Dropping it releases the lock and clears the
/// calling thread's "holds it" flag, mirroring the rest of this crate's guard-on-drop
/// idiom (see [`crate::barrier::ExclusiveGuard`]).
#[must_use = "the BQL is released when this guard drops"]
#[derive(Debug)]
pub struct BqlGuard<'a> {
    bql: &'a Bql,
}

impl Drop for BqlGuard<'_> {
    fn drop(&mut self) {
        self.bql.raw_unlock();
    }
}

impl Bql {
    /// Creates an unlocked BQL. `const fn` so it can sit in a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Acquires the BQL, blocking the calling thread until it is free, and returns a
    /// guard that releases it on drop.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the BQL — this lock is not
    /// reentrant, and the dispatcher never calls `lock` from a thread that already
    /// has it (every call site tracks its own `has_bql` explicitly instead).
    pub fn lock(&self) -> BqlGuard<'_> {
        self.raw_lock();
        BqlGuard { bql: self }
    }

    /// Releases the BQL by dropping its guard. Provided for callers that prefer an
    /// explicit call over relying on scope exit; equivalent to `drop(guard)`.
    pub fn unlock(&self, guard: BqlGuard<'_>) {
        drop(guard);
    }

    /// Returns whether the *calling thread* currently holds the BQL.
    #[must_use]
    pub fn is_held(&self) -> bool {
        HELD_BY_THIS_THREAD.with(Cell::get)
    }

    /// Locks the BQL without producing a guard, for call sites that release and
    /// reacquire it from different points in the control flow (`run_on_cpu`'s
    /// "release around the wait" step, for instance).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the BQL.
    pub(crate) fn raw_lock(&self) {
        assert!(
            !self.is_held(),
            "Bql::lock called by a thread that already holds the BQL"
        );
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            locked = self
                .cond
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        HELD_BY_THIS_THREAD.with(|held| held.set(true));
    }

    /// Counterpart to [`Bql::raw_lock`]: unlocks without a guard.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not currently hold the BQL.
    pub(crate) fn raw_unlock(&self) {
        assert!(
            self.is_held(),
            "Bql::raw_unlock called by a thread not holding the BQL"
        );
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        *locked = false;
        drop(locked);
        HELD_BY_THIS_THREAD.with(|held| held.set(false));
        self.cond.notify_one();
    }
}

impl Default for Bql {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Bql;

    #[test]
    fn lock_then_unlock_clears_is_held() {
        let bql = Bql::new();
        assert!(!bql.is_held());
        let guard = bql.lock();
        assert!(bql.is_held());
        drop(guard);
        assert!(!bql.is_held());
    }

    #[test]
    #[should_panic(expected = "already holds the BQL")]
    fn reentrant_lock_panics() {
        let bql = Bql::new();
        let _g1 = bql.lock();
        let _g2 = bql.lock();
    }

    #[test]
    fn is_held_is_per_thread() {
        let bql = std::sync::Arc::new(Bql::new());
        let _guard = bql.lock();
        let other = std::thread::spawn({
            let bql = bql.clone();
            move || bql.is_held()
        })
        .join()
        .unwrap();
        assert!(
            !other,
            "a different thread must not observe our lock as its own"
        );
    }

    #[test]
    fn raw_lock_unlock_round_trip_allows_a_different_thread_in() {
        let bql = std::sync::Arc::new(Bql::new());
        bql.raw_lock();
        assert!(bql.is_held());
        bql.raw_unlock();
        assert!(!bql.is_held());

        let other_saw_it_free = std::thread::spawn({
            let bql = bql.clone();
            move || {
                bql.raw_lock();
                bql.raw_unlock();
            }
        })
        .join();
        assert!(other_saw_it_free.is_ok());
    }
}
