use std::{
    fmt,
    io::{Cursor, Write},
};

/// Longest line `eprint_line()` writes; anything longer is cut off
pub const LINE_CAPACITY: usize = 256;

/// Format `args` into a stack buffer, always ending in a newline. Output that
/// does not fit is truncated. Returns the number of bytes used.
pub fn format_line(buf: &mut [u8; LINE_CAPACITY], args: fmt::Arguments<'_>) -> usize {
    let mut cursor = Cursor::new(&mut buf[..LINE_CAPACITY - 1]);
    // Running out of room is fine, we keep what fit
    _ = cursor.write_fmt(args);
    let len = cursor.position() as usize;
    buf[len] = b'\n';
    len + 1
}

/// `eprintln!()`... but doesn't use the allocator, and doesn't take the
/// `stderr` lock (which a fatal diagnostic may be racing with)
pub fn eprint_line(args: fmt::Arguments<'_>) {
    let mut buf = [0u8; LINE_CAPACITY];
    let len = format_line(&mut buf, args);
    let mut written = 0;
    while written < len {
        // SAFETY: the range is inside `buf`
        let n = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                buf[written..len].as_ptr() as *const libc::c_void,
                len - written,
            )
        };
        if n <= 0 {
            // Nowhere left to complain to
            break;
        }
        written += n as usize;
    }
}
