//! Leveled mutexes enforcing the pipeline lock order
//!
//! Every pipeline lock belongs to a [`LockLevel`]. A thread may only acquire a
//! lock whose level is strictly deeper than every level it already holds:
//!
//! ```text
//! Mixer -> Input -> Backend -> OutputFifo -> InputRegistry
//! ```
//!
//! Debug builds keep a per-thread stack of held levels and panic on an
//! out-of-order acquisition, which would otherwise be a latent deadlock
//! between decoder threads and the mixing thread. Release builds skip the
//! bookkeeping.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Position of a lock in the global acquisition order (lower first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Mixer = 0,
    Input = 1,
    Backend = 2,
    OutputFifo = 3,
    InputRegistry = 4,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn enter(level: LockLevel) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(deepest) = held.iter().max() {
            assert!(
                *deepest < level,
                "lock order violation: acquiring {:?} while holding {:?}",
                level,
                held
            );
        }
        held.push(level);
    });
}

#[cfg(debug_assertions)]
fn leave(level: LockLevel) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|l| *l == level) {
            held.remove(pos);
        }
    });
}

/// Levels currently held by this thread (always empty in release builds)
pub fn held_levels() -> Vec<LockLevel> {
    #[cfg(debug_assertions)]
    {
        HELD.with(|held| held.borrow().clone())
    }
    #[cfg(not(debug_assertions))]
    {
        Vec::new()
    }
}

/// Mutex tagged with its place in the lock order
#[derive(Debug)]
pub struct LeveledMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> LeveledMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Block until the lock is acquired
    ///
    /// A poisoned lock is recovered: the panicking thread already reported
    /// its failure and the protected state stays structurally valid.
    ///
    /// # Panics
    ///
    /// In debug builds, when this thread already holds a lock at the same or a
    /// deeper level.
    pub fn lock(&self) -> LeveledGuard<'_, T> {
        #[cfg(debug_assertions)]
        enter(self.level);
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        LeveledGuard {
            guard,
            level: self.level,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard releasing the mutex and its level on drop
pub struct LeveledGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
}

impl<T> Deref for LeveledGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LeveledGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        leave(self.level);
        #[cfg(not(debug_assertions))]
        let _ = self.level;
    }
}
