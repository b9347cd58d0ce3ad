#![allow(dead_code)]

use std::{
    cell::Cell,
    ffi::{c_void, CStr},
    fmt,
    ptr::NonNull,
    sync::Mutex,
};

use heaptrap::{Config, DiagnosticSink, DlError, LinkedSymbols, SymbolSource, Trap};
use libc::size_t;

thread_local! {
    static MALLOCS: Cell<usize> = const { Cell::new(0) };
    static REALLOCS: Cell<usize> = const { Cell::new(0) };
    static FREES: Cell<usize> = const { Cell::new(0) };
}

/// How often the real allocator was called on this thread
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub malloc: usize,
    pub realloc: usize,
    pub free: usize,
}

pub fn calls() -> Calls {
    Calls {
        malloc: MALLOCS.get(),
        realloc: REALLOCS.get(),
        free: FREES.get(),
    }
}

/// Calls made by `f` on this thread
pub fn calls_during<R>(f: impl FnOnce() -> R) -> (R, Calls) {
    let before = calls();
    let result = f();
    let after = calls();
    (
        result,
        Calls {
            malloc: after.malloc - before.malloc,
            realloc: after.realloc - before.realloc,
            free: after.free - before.free,
        },
    )
}

fn bump(counter: &'static std::thread::LocalKey<Cell<usize>>) {
    counter.set(counter.get() + 1);
}

unsafe extern "C" fn counting_malloc(size: size_t) -> *mut c_void {
    bump(&MALLOCS);
    libc::malloc(size)
}

unsafe extern "C" fn counting_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    bump(&REALLOCS);
    libc::realloc(ptr, size)
}

unsafe extern "C" fn counting_free(ptr: *mut c_void) {
    bump(&FREES);
    libc::free(ptr)
}

/// The libc allocator, counting calls per thread
pub struct CountingSymbols;

impl SymbolSource for CountingSymbols {
    fn lookup(&self, name: &CStr) -> Result<NonNull<c_void>, DlError> {
        let f = match name.to_bytes() {
            b"malloc" => counting_malloc as *mut c_void,
            b"realloc" => counting_realloc as *mut c_void,
            b"free" => counting_free as *mut c_void,
            _ => return LinkedSymbols.lookup(name),
        };
        NonNull::new(f).ok_or_else(|| DlError::from_c_str(c"null"))
    }
}

/// Byte every block from `PoisonedSymbols` starts out filled with
pub const POISON: u8 = 0xab;

thread_local! {
    static LAST_FREED: Cell<Option<u8>> = const { Cell::new(None) };
}

/// First byte of the last non-null block `PoisonedSymbols` freed on this
/// thread, as it was just before the free
pub fn last_freed_first_byte() -> Option<u8> {
    LAST_FREED.get()
}

unsafe extern "C" fn poisoned_malloc(size: size_t) -> *mut c_void {
    let ptr = libc::malloc(size);
    if !ptr.is_null() {
        ptr.write_bytes(POISON, size);
    }
    ptr
}

unsafe extern "C" fn poisoned_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if ptr.is_null() {
        return poisoned_malloc(size);
    }
    libc::realloc(ptr, size)
}

unsafe extern "C" fn poisoned_free(ptr: *mut c_void) {
    if !ptr.is_null() {
        LAST_FREED.set(Some(*(ptr as *const u8)));
    }
    libc::free(ptr)
}

/// The libc allocator, but fresh blocks are full of `POISON` and frees are
/// inspected, so we can tell what was sanitized
pub struct PoisonedSymbols;

impl SymbolSource for PoisonedSymbols {
    fn lookup(&self, name: &CStr) -> Result<NonNull<c_void>, DlError> {
        let f = match name.to_bytes() {
            b"malloc" => poisoned_malloc as *mut c_void,
            b"realloc" => poisoned_realloc as *mut c_void,
            b"free" => poisoned_free as *mut c_void,
            _ => return LinkedSymbols.lookup(name),
        };
        NonNull::new(f).ok_or_else(|| DlError::from_c_str(c"null"))
    }
}

/// Keeps every line it is sent
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap())
    }

    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

impl DiagnosticSink for RecordingSink {
    fn trace(&self, args: fmt::Arguments<'_>) {
        self.push(format!("trace: {args}"));
    }

    fn report(&self, args: fmt::Arguments<'_>) {
        self.push(format!("report: {args}"));
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        self.push(format!("fatal: {args}"));
    }
}

pub type TestTrap = Trap<CountingSymbols, RecordingSink>;

pub fn trap(config: Config) -> TestTrap {
    Trap::with_config(CountingSymbols, RecordingSink::new(), config)
}
