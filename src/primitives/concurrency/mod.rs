use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

/// Position of a lock in the global acquisition order.
///
/// Keys compare by `order` first and break ties with `id`, so every pair of
/// locks has a defined order. Blocking acquisitions must be made in strictly
/// increasing key order; [`OrderedMutex::try_lock`] may be used to step outside
/// that order because it never waits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LockKey {
    /// Coarse order assigned from the node's position in its hierarchy.
    pub order: u64,
    /// Tie breaker, unique per lock.
    pub id: u64,
}

impl LockKey {
    /// Creates a key.
    pub const fn new(order: u64, id: u64) -> Self {
        Self { order, id }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.order, self.id)
    }
}

thread_local! {
    static HELD: RefCell<Vec<LockKey>> = const { RefCell::new(Vec::new()) };
}

fn note_acquire(key: LockKey, ordered: bool) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if ordered {
            if let Some(max) = held.iter().max() {
                assert!(
                    *max < key,
                    "lock order violation: acquiring {key} while holding {max}"
                );
            }
        }
        held.push(key);
    });
}

fn note_release(key: LockKey) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|k| *k == key) {
            held.swap_remove(pos);
        }
    });
}

/// Number of ordered locks the current thread holds (debug builds only).
pub fn held_lock_count() -> usize {
    HELD.with(|held| held.borrow().len())
}

/// Mutex tagged with a [`LockKey`] whose guards are owned (`'static`).
///
/// Guards can be stored in collections and moved between stack frames, which
/// lets a caller hold a whole path of locks at once.
pub struct OrderedMutex<T> {
    key: LockKey,
    inner: Arc<Mutex<T>>,
}

impl<T> OrderedMutex<T> {
    /// Wraps `value` behind a lock with the given key.
    pub fn new(key: LockKey, value: T) -> Self {
        Self {
            key,
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Wraps `value` and returns the lock already held by the caller.
    ///
    /// Nobody else can reach a lock that does not exist yet, so this is exempt
    /// from the ordering check like [`OrderedMutex::try_lock`].
    pub fn new_locked(key: LockKey, value: T) -> (Self, OrderedGuard<T>) {
        let inner = Arc::new(Mutex::new(value));
        let guard = inner.lock_arc();
        note_acquire(key, false);
        (Self { key, inner }, OrderedGuard { key, guard })
    }

    /// Returns this lock's key.
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Blocks until the lock is acquired.
    ///
    /// In debug builds this asserts that every lock already held by the
    /// thread has a smaller key.
    pub fn lock(&self) -> OrderedGuard<T> {
        note_acquire(self.key, true);
        OrderedGuard {
            key: self.key,
            guard: self.inner.lock_arc(),
        }
    }

    /// Acquires the lock only if it is free. Never waits, so it is exempt from
    /// the ordering check.
    pub fn try_lock(&self) -> Option<OrderedGuard<T>> {
        let guard = self.inner.try_lock_arc()?;
        note_acquire(self.key, false);
        Some(OrderedGuard {
            key: self.key,
            guard,
        })
    }
}

/// Owned guard returned by [`OrderedMutex`].
pub struct OrderedGuard<T> {
    key: LockKey,
    guard: ArcMutexGuard<RawMutex, T>,
}

impl<T> OrderedGuard<T> {
    /// Key of the held lock.
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl<T> Deref for OrderedGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<T> {
    fn drop(&mut self) {
        note_release(self.key);
    }
}
