//! Per-thread nesting depth.
//!
//! A call into the allocator that happens while this thread is already inside
//! the tracked path is bookkeeping (ours, or of whatever we called into), and
//! goes straight to the real allocator.

use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub fn is_nested() -> bool {
    DEPTH.with(|depth| depth.get() != 0)
}

pub fn enter_nested() {
    DEPTH.with(|depth| depth.set(depth.get() + 1));
}

pub fn leave_nested() {
    DEPTH.with(|depth| {
        debug_assert!(depth.get() != 0, "leave_nested() without enter_nested()");
        depth.set(depth.get().saturating_sub(1))
    });
}

/// Marks this thread as nested until dropped, so every early return out of
/// the tracked path leaves the depth where it found it.
pub struct NestedScope {
    _not_send: PhantomData<*const ()>,
}

impl NestedScope {
    pub fn enter() -> Self {
        enter_nested();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for NestedScope {
    fn drop(&mut self) {
        leave_nested();
    }
}
