//! Locking primitives without lock poisoning.
//!
//! Task panics are caught and turned into [`TaskFailure::Panicked`][crate::TaskFailure], and
//! panicking continuations are caught and logged, so a poisoned lock carries no information this
//! crate doesn't already report. These wrappers ignore poisoning instead of forcing an `unwrap` on
//! every lock.

use std::{
    ops::{Deref, DerefMut},
    sync::{self, PoisonError},
    time::Duration,
};

#[derive(Debug, Default)]
pub(crate) struct Mutex<T> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: sync::Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

pub(crate) struct MutexGuard<'a, T> {
    inner: sync::MutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[derive(Debug, Default)]
pub(crate) struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub(crate) const fn new() -> Self {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        MutexGuard {
            inner: self
                .inner
                .wait(guard.inner)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Waits for at most `dur`. Spurious wakeups are possible; callers re-check their condition.
    pub(crate) fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> MutexGuard<'a, T> {
        let (inner, _) = self
            .inner
            .wait_timeout(guard.inner, dur)
            .unwrap_or_else(PoisonError::into_inner);
        MutexGuard { inner }
    }

    pub(crate) fn notify_all(&self) {
        self.inner.notify_all();
    }
}
