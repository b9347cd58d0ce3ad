//! The allocator underneath us, and how we find it.

use std::{
    ffi::{c_void, CStr},
    mem,
    ptr::NonNull,
};

use libc::size_t;

use crate::error::{DlError, Fatal};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Smallest alignment every `malloc()` result is guaranteed to have
pub const MIN_ALIGN: usize = 2 * mem::size_of::<usize>();

/// Handles on the real `malloc`, `realloc` and `free`. Calling through these
/// bypasses all tracking.
#[derive(Clone, Copy, Debug)]
pub struct RealAlloc {
    malloc: MallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

impl RealAlloc {
    pub const fn new(malloc: MallocFn, realloc: ReallocFn, free: FreeFn) -> Self {
        Self {
            malloc,
            realloc,
            free,
        }
    }

    /// # Safety
    ///
    /// Same contract as `malloc()`.
    pub unsafe fn alloc(&self, size: usize) -> *mut u8 {
        (self.malloc)(size) as _
    }

    /// # Safety
    ///
    /// Same contract as `realloc()`: `ptr` is null or a live allocation of
    /// this allocator.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        (self.realloc)(ptr as _, size) as _
    }

    /// # Safety
    ///
    /// Same contract as `free()`.
    pub unsafe fn release(&self, ptr: *mut u8) {
        (self.free)(ptr as _)
    }
}

/// Where the real allocator's entry points come from.
pub trait SymbolSource {
    /// Look up `name`. On failure, report why.
    fn lookup(&self, name: &CStr) -> Result<NonNull<c_void>, DlError>;
}

/// The next definition in dynamic-link search order, i.e. whatever `malloc`
/// the process would have used had we not been preloaded.
#[derive(Clone, Copy, Debug, Default)]
pub struct DlsymNext;

impl SymbolSource for DlsymNext {
    fn lookup(&self, name: &CStr) -> Result<NonNull<c_void>, DlError> {
        // SAFETY: `name` is NUL-terminated and RTLD_NEXT is always a valid
        // handle
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        NonNull::new(sym).ok_or_else(DlError::last)
    }
}

/// The libc allocator this binary is linked against. For running as a Rust
/// `#[global_allocator]`, where nothing is interposed and calling `malloc`
/// directly is correct.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkedSymbols;

impl SymbolSource for LinkedSymbols {
    fn lookup(&self, name: &CStr) -> Result<NonNull<c_void>, DlError> {
        let sym = match name.to_bytes() {
            b"malloc" => libc::malloc as MallocFn as *mut c_void,
            b"realloc" => libc::realloc as ReallocFn as *mut c_void,
            b"free" => libc::free as FreeFn as *mut c_void,
            _ => return Err(DlError::from_c_str(c"not a linked allocator symbol")),
        };
        NonNull::new(sym).ok_or_else(|| DlError::from_c_str(c"null symbol"))
    }
}

fn symbol<S>(symbols: &S, name: &'static CStr) -> Result<NonNull<c_void>, Fatal>
where
    S: SymbolSource + ?Sized,
{
    symbols.lookup(name).map_err(|reason| Fatal::Resolution {
        symbol: name.to_str().unwrap_or("?"),
        reason,
    })
}

/// Bind all three entry points, or say which one is missing.
pub fn resolve<S>(symbols: &S) -> Result<RealAlloc, Fatal>
where
    S: SymbolSource + ?Sized,
{
    let malloc = symbol(symbols, c"malloc")?;
    let realloc = symbol(symbols, c"realloc")?;
    let free = symbol(symbols, c"free")?;
    // SAFETY: the symbols are what their names say; a source handing back
    // something else is broken beyond what we can check
    unsafe {
        Ok(RealAlloc::new(
            mem::transmute::<*mut c_void, MallocFn>(malloc.as_ptr()),
            mem::transmute::<*mut c_void, ReallocFn>(realloc.as_ptr()),
            mem::transmute::<*mut c_void, FreeFn>(free.as_ptr()),
        ))
    }
}
