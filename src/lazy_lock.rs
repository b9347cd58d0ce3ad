use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. This is only really useful
    /// when checking the state inside the initializer...
    Initializing,
}

impl LazyLockState {
    const fn from_u8(state: u8) -> Self {
        match state {
            1 => Self::Init,
            2 => Self::Initializing,
            _ => Self::Uninit,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InitError<E> {
    /// `get_or_try_init()` was called while an initializer was already
    /// running, either from inside that initializer or from another thread
    Reentered,
    /// The initializer itself failed. The lock goes back to `Uninit`.
    Failed(E),
}

/// A lazily initialized value that lets you poll its initialization state
/// (including mid-init), and that refuses to run its initializer twice at once
/// instead of blocking. Blocking would deadlock when the initializer calls back
/// into whatever is waiting on it.
pub struct LazyLock<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
}

// SAFETY: the cell is only written by the single caller that moved `state`
// from `Uninit` to `Initializing`, and only read after `Init` is published with
// `Release`.
unsafe impl<T> Sync for LazyLock<T> where T: Send + Sync {}

impl<T> LazyLock<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
        }
    }

    pub fn state(&self) -> LazyLockState {
        LazyLockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The value, if initialization has completed
    pub fn get(&self) -> Option<&T> {
        if self.state() == LazyLockState::Init {
            // SAFETY: `Init` is only stored after the cell was written
            Some(unsafe { (*self.cell.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<&T, InitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        cold(|| {
            if self
                .state
                .compare_exchange(
                    LazyLockState::Uninit as u8,
                    LazyLockState::Initializing as u8,
                    Ordering::Acquire,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // Either somebody beat us to it between `get()` and here, or
                // we are inside the initializer
                return self.get().ok_or(InitError::Reentered);
            }
            match init() {
                Ok(value) => {
                    // SAFETY: we own the `Initializing` state, so nobody else
                    // touches the cell
                    unsafe { (*self.cell.get()).write(value) };
                    self.state
                        .store(LazyLockState::Init as u8, Ordering::Release);
                    // SAFETY: just written
                    Ok(unsafe { (*self.cell.get()).assume_init_ref() })
                }
                Err(e) => {
                    self.state
                        .store(LazyLockState::Uninit as u8, Ordering::Release);
                    Err(InitError::Failed(e))
                }
            }
        })
    }
}

impl<T> Default for LazyLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazyLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and we have exclusive access
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}
