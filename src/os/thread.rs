use std::cell::Cell;

thread_local! {
    /// Cached kernel thread id, 0 until first asked for. `const` init with no
    /// destructor, so touching it never allocates or registers a dtor.
    static TID: Cell<u32> = const { Cell::new(0) };
}

/// The kernel thread id of the calling thread. Never 0.
pub fn current_tid() -> u32 {
    TID.with(|tid| {
        if tid.get() == 0 {
            // SAFETY: `gettid` has no preconditions and cannot fail
            let raw = unsafe { libc::syscall(libc::SYS_gettid) };
            tid.set(raw as u32);
        }
        tid.get()
    })
}
