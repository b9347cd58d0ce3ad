//! A process-wide lock that the owning thread may take again.
//!
//! Everything in `heaptrap` is serialized through one of these. It has to be
//! re-entrant because the tracked path ends up back in a public entry point
//! whenever bookkeeping (formatting a diagnostic, loading the configuration)
//! allocates through the very allocator being instrumented. It must also never
//! allocate itself, so it is a bare futex word plus an owner thread id, not a
//! `parking_lot` or `std` mutex.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicU32, Ordering},
};

use linux_futex::{Futex, Private};

use crate::{os::thread::current_tid, util::hint::cold};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, nobody is waiting
const FUTEX_LOCKED: u32 = 1;

/// This futex represents a lock that is locked, and somebody may be asleep on
/// it, so the releasing thread has to `wake()`
const FUTEX_CONTENDED: u32 = 2;

/// No thread owns the lock
const NO_OWNER: u32 = 0;

pub struct ReentrantLock<T> {
    futex: Futex<Private>,
    /// tid of the holder, or `NO_OWNER`
    owner: AtomicU32,
    /// How many times the owner has acquired the lock. Only touched by the
    /// owner.
    depth: UnsafeCell<usize>,
    data: T,
}

// SAFETY: `data` is only reachable through a guard, and guards only exist on
// the thread that owns the futex. Several guards may exist at once, but only
// on that one thread, hence `T: Send` and not `T: Sync`.
unsafe impl<T> Sync for ReentrantLock<T> where T: Send {}
unsafe impl<T> Send for ReentrantLock<T> where T: Send {}

impl<T> ReentrantLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
            owner: AtomicU32::new(NO_OWNER),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    /// Block until this thread holds the lock. Returns immediately if it
    /// already does.
    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let tid = current_tid();
        // Only this thread can ever store `tid`, so a stale read of somebody
        // else's id is harmless
        if self.owner.load(Ordering::Relaxed) != tid {
            self.acquire();
            self.owner.store(tid, Ordering::Relaxed);
        }
        // SAFETY: we are the owner
        unsafe { *self.depth.get() += 1 };
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Is the lock held by any thread right now?
    pub fn is_locked(&self) -> bool {
        self.futex.value.load(Ordering::Acquire) != FUTEX_UNLOCKED
    }

    fn acquire(&self) {
        if self
            .futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }
        cold(|| {
            // Mark the lock contended before sleeping so the holder knows to
            // wake us. Whoever takes it from here on also leaves it contended,
            // which costs at most one spurious `wake()`.
            while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
                _ = self.futex.wait(FUTEX_CONTENDED);
            }
        })
    }

    fn release(&self) {
        // SAFETY: only the owner holds guards
        let depth = unsafe {
            let depth = &mut *self.depth.get();
            *depth -= 1;
            *depth
        };
        if depth == 0 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
                self.futex.wake(1);
            }
        }
    }
}

/// RAII guard. Releases one level of the lock on drop.
pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    /// Must be dropped on the thread that acquired it
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, sync::Arc, thread};

    use super::*;

    #[test]
    fn same_thread_can_relock() {
        let lock = ReentrantLock::new(Cell::new(0));
        let outer = lock.lock();
        outer.set(1);
        {
            let inner = lock.lock();
            inner.set(inner.get() + 1);
        }
        assert!(lock.is_locked());
        assert_eq!(outer.get(), 2);
        drop(outer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn excludes_other_threads() {
        struct Counter(UnsafeCell<usize>);
        // SAFETY: only touched under the lock
        unsafe impl Send for Counter {}

        let lock = Arc::new(ReentrantLock::new(Counter(UnsafeCell::new(0))));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let guard = lock.lock();
                        let _again = lock.lock();
                        // SAFETY: we hold the lock
                        unsafe { *guard.0.get() += 1 };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = lock.lock();
        assert_eq!(unsafe { *guard.0.get() }, 80_000);
    }
}
