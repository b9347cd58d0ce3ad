//! The C allocator ABI. Only built with the `preload` feature: anything that
//! links these symbols has its own `malloc()` replaced, test binaries included.

use libc::{c_void, size_t};

use crate::{
    alloc::{real::DlsymNext, trap::Trap},
    config::Config,
    diag::StderrSink,
};

pub static HEAPTRAP: Trap<DlsymNext, StderrSink> =
    Trap::new(DlsymNext, StderrSink, Config::from_env);

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    HEAPTRAP
        .alloc(size)
        .unwrap_or_else(|fatal| HEAPTRAP.terminate(fatal)) as _
}

#[no_mangle]
pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    HEAPTRAP
        .alloc_zeroed(count, size)
        .unwrap_or_else(|fatal| HEAPTRAP.terminate(fatal)) as _
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    HEAPTRAP
        .resize(ptr as _, size)
        .unwrap_or_else(|fatal| HEAPTRAP.terminate(fatal)) as _
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    HEAPTRAP
        .release(ptr as _)
        .unwrap_or_else(|fatal| HEAPTRAP.terminate(fatal))
}

/// Live blocks right now, for programs that want to check on themselves
#[no_mangle]
pub extern "C" fn heaptrap_tracked_count() -> size_t {
    HEAPTRAP.stats().tracked_count
}

#[no_mangle]
pub extern "C" fn heaptrap_tracked_bytes() -> size_t {
    HEAPTRAP.stats().tracked_bytes
}
