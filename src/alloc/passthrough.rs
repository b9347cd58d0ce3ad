use std::{alloc::Layout, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::util::hint::cold;

use super::real::{RealAlloc, MIN_ALIGN};

/// Storage for our own bookkeeping, straight from the real allocator. Nothing
/// allocated through here is ever tracked, limited or sanitized, and it never
/// re-enters the instrumented entry points.
#[derive(Clone, Copy, Debug)]
pub struct Passthrough {
    real: RealAlloc,
}

impl Passthrough {
    pub const fn new(real: RealAlloc) -> Self {
        Self { real }
    }
}

// SAFETY: blocks come from `malloc()`, stay valid until `deallocate()`, and
// over-aligned layouts are refused rather than handed misaligned memory.
unsafe impl Allocator for Passthrough {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > MIN_ALIGN {
            return cold(|| Err(AllocError));
        }
        if layout.size() == 0 {
            // SAFETY: alignments are never zero
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        // SAFETY: plain `malloc()` of a non-zero size
        let data = unsafe { self.real.alloc(layout.size()) };
        match NonNull::new(data) {
            Some(data) => Ok(NonNull::slice_from_raw_parts(data, layout.size())),
            None => cold(|| Err(AllocError)),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: identical contract to caller, which is described in
            // `Allocator` docs
            unsafe { self.real.release(ptr.as_ptr()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use allocator_api2::boxed::Box;

    use super::*;
    use crate::alloc::real::{resolve, LinkedSymbols};

    #[test]
    fn boxes_live_in_passthrough_memory() {
        let alloc = Passthrough::new(resolve(&LinkedSymbols).unwrap());
        let n = Box::new_in(42u64, alloc);
        assert_eq!(*n, 42);
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        let alloc = Passthrough::new(resolve(&LinkedSymbols).unwrap());
        let layout = Layout::from_size_align(64, MIN_ALIGN * 4).unwrap();
        assert!(alloc.allocate(layout).is_err());
    }
}
