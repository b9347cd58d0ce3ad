/// End the process with `EXIT_FAILURE`, running `atexit` handlers like the C
/// `exit()` would.
pub fn exit_failure() -> ! {
    // SAFETY: `exit` is always safe to call; handlers that free memory go back
    // through the allocator, which no longer holds its lock at this point
    unsafe { libc::exit(libc::EXIT_FAILURE) }
}
