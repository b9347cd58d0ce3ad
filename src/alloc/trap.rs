//! The instrumented allocator.
//!
//! Every entry point follows the same shape:
//!
//! ```plaintext
//! lock ─┬─ nested? ── forward to the real allocator ──────────────────┐
//!       └─ resolve ─ single-size check ─ real call ─ record ─ limits ─┴─ unlock
//!                                                   │          │
//!                                                   │          └─ undo on violation
//!                                                   └─ sanitize what was approved
//! ```
//!
//! `resize` checks the limits before the real call instead: once `realloc()`
//! has run, the old block may already be gone and there is nothing to undo.
//!
//! Fatal limit violations are handed back as [`Fatal`] once the lock and the
//! nesting mark are released; only the ABI shims decide to end the process.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::{RefCell, RefMut},
    fmt,
    ptr::null_mut,
};

use once_cell::sync::OnceCell;

use crate::{
    config::{Config, ConfigLoader},
    diag::{DiagnosticSink, StderrSink},
    error::Fatal,
    lazy_lock::LazyLockState,
    os::process::exit_failure,
};

use super::{
    lock::ReentrantLock,
    nest::{self, NestedScope},
    policy::{Disposition, Limits, Verdict},
    real::{DlsymNext, RealAlloc, SymbolSource, MIN_ALIGN},
    registry::{Registry, Stats},
    resolve::Resolver,
    sanitize::Sanitizer,
};

/// Mutable state, created on the first outermost call
struct Engine {
    registry: Registry,
    limits: Limits,
    sanitizer: Sanitizer,
    trace: bool,
    track_resize: bool,
}

impl Engine {
    fn new(real: RealAlloc, config: &Config) -> Self {
        Self {
            registry: Registry::new(real),
            limits: Limits::from_config(config),
            sanitizer: Sanitizer::new(config.reset, config.seed),
            trace: config.trace,
            track_resize: config.tracks_resize(),
        }
    }
}

/// A call as it shows up in the trace
#[derive(Clone, Copy)]
enum Call {
    Malloc(usize),
    Calloc(usize, usize),
    Realloc(*mut u8, usize),
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Call::Malloc(size) => write!(f, "malloc({size})"),
            Call::Calloc(count, size) => write!(f, "calloc({count}, {size})"),
            Call::Realloc(ptr, size) => write!(f, "realloc({ptr:p}, {size})"),
        }
    }
}

/// What goes into a freshly approved block
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Whatever the sanitizer is configured to do
    Policy,
    /// Zeroes, whatever the sanitizer says
    Zero,
}

/// The allocation trap: one instance per instrumented allocator, usually a
/// `static`. `S` says where the real allocator comes from, `K` where
/// diagnostics go.
pub struct Trap<S = DlsymNext, K = StderrSink> {
    symbols: S,
    sink: K,
    load_config: ConfigLoader,
    config: OnceCell<Config>,
    resolver: Resolver,
    state: ReentrantLock<RefCell<Option<Engine>>>,
}

impl<S, K> Trap<S, K> {
    /// A trap that reads its configuration with `load_config` on first use.
    /// Nothing is resolved or allocated until then, so this can initialize a
    /// `static`.
    pub const fn new(symbols: S, sink: K, load_config: ConfigLoader) -> Self {
        Self {
            symbols,
            sink,
            load_config,
            config: OnceCell::new(),
            resolver: Resolver::new(),
            state: ReentrantLock::new(RefCell::new(None)),
        }
    }

    /// The configuration in effect, once the first call has loaded it
    pub fn config(&self) -> Option<&Config> {
        self.config.get()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Whether the real allocator has been found yet
    pub fn resolver_state(&self) -> LazyLockState {
        self.resolver.state()
    }
}

impl<S, K> Trap<S, K>
where
    S: SymbolSource,
    K: DiagnosticSink,
{
    /// A trap with a fixed configuration
    pub fn with_config(symbols: S, sink: K, config: Config) -> Self {
        let trap = Self::new(symbols, sink, Config::from_env);
        // Fresh cell, cannot already be set
        _ = trap.config.set(config);
        trap
    }

    /// `malloc()`. Null when refused by a limit or by the real allocator.
    pub fn alloc(&self, size: usize) -> Result<*mut u8, Fatal> {
        let state = self.state.lock();
        if nest::is_nested() {
            // SAFETY: plain `malloc()`
            return self.forward(|real| unsafe { real.alloc(size) });
        }
        let _scope = NestedScope::enter();
        let (real, mut engine) = self.enter(&state)?;
        self.alloc_tracked(&mut engine, real, Call::Malloc(size), size, Fill::Policy)
    }

    /// `calloc()`: `count * size` zeroed bytes, null on overflow.
    pub fn alloc_zeroed(&self, count: usize, size: usize) -> Result<*mut u8, Fatal> {
        let Some(total) = count.checked_mul(size) else {
            return Ok(null_mut());
        };
        let state = self.state.lock();
        if nest::is_nested() {
            // SAFETY: plain `malloc()`, then a fill of the block it returned
            return self.forward(|real| unsafe {
                let ptr = real.alloc(total);
                if !ptr.is_null() {
                    ptr.write_bytes(0, total);
                }
                ptr
            });
        }
        let _scope = NestedScope::enter();
        let (real, mut engine) = self.enter(&state)?;
        self.alloc_tracked(&mut engine, real, Call::Calloc(count, size), total, Fill::Zero)
    }

    /// `realloc()`. A null `ptr` allocates, a zero `size` frees and returns
    /// null. Any other null result, from a limit or from the real
    /// `realloc()`, leaves `ptr` live and tracked as before.
    ///
    /// # Safety
    ///
    /// `ptr` is null or a live block from this allocator (or from the real
    /// allocator underneath it).
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> Result<*mut u8, Fatal> {
        let state = self.state.lock();
        if nest::is_nested() {
            return self.forward(|real| real.resize(ptr, size));
        }
        let _scope = NestedScope::enter();
        let (real, mut engine) = self.enter(&state)?;
        let engine = &mut *engine;
        let call = Call::Realloc(ptr, size);

        if size == 0 && !ptr.is_null() {
            engine.registry.forget(ptr);
            real.release(ptr);
            self.trace_call(engine, call, null_mut());
            self.trace_total(engine);
            return Ok(null_mut());
        }
        if self.refuse_single(engine, call, size) {
            return Ok(null_mut());
        }

        // A refusal must leave `ptr` exactly as the caller had it, so the
        // limits are held against the totals the resize would produce before
        // `realloc()` gets to move anything
        let old_size = engine.registry.lookup(ptr);
        if engine.track_resize {
            let count = engine.registry.len() + usize::from(old_size.is_none());
            let bytes = (engine.registry.bytes() - old_size.unwrap_or(0)).saturating_add(size);
            let verdict = engine.limits.check_aggregate(count, bytes);
            match engine.limits.disposition(verdict) {
                Disposition::Allow => {}
                Disposition::Terminate(fatal) => return Err(fatal),
                Disposition::Deny => {
                    self.trace_call(engine, call, null_mut());
                    self.trace_denied(engine, verdict);
                    return Ok(null_mut());
                }
            }
        }
        if engine.registry.reserve().is_err() {
            self.report_registry_full(size);
            return Ok(null_mut());
        }

        engine.registry.forget(ptr);
        let new = real.resize(ptr, size);
        self.trace_call(engine, call, new);
        if new.is_null() {
            if let Some(old_size) = old_size {
                // Room was reserved above
                _ = engine.registry.record(ptr, old_size);
            }
            return Ok(new);
        }

        if engine.track_resize {
            // As above
            _ = engine.registry.record(new, size);
            engine.registry.commit_peaks();
            self.trace_total(engine);
        } else if old_size.is_some() {
            self.trace_total(engine);
        }
        // Only the tail is new. A null `ptr` makes the whole block new; an
        // old block we never saw has a tail we can't locate, so leave it.
        let grown_from = if ptr.is_null() { Some(0) } else { old_size };
        if let Some(old_size) = grown_from {
            if size > old_size {
                engine.sanitizer.sanitize(new.add(old_size), size - old_size);
            }
        }
        Ok(new)
    }

    /// `free()`. Untracked and null pointers are fine.
    ///
    /// # Safety
    ///
    /// `ptr` is null or a live block from this allocator (or from the real
    /// allocator underneath it).
    pub unsafe fn release(&self, ptr: *mut u8) -> Result<(), Fatal> {
        if ptr.is_null() {
            return Ok(());
        }
        let state = self.state.lock();
        if nest::is_nested() {
            return self.forward(|real| real.release(ptr));
        }
        let _scope = NestedScope::enter();
        let (real, mut engine) = self.enter(&state)?;
        let engine = &mut *engine;
        let forgotten = engine.registry.forget(ptr);
        if engine.trace {
            self.sink.trace(format_args!("free({ptr:p})"));
        }
        real.release(ptr);
        if forgotten.is_some() {
            self.trace_total(engine);
        }
        Ok(())
    }

    /// Counters as of now. All zero before the first call.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock();
        let Ok(slot) = state.try_borrow() else {
            return Stats::default();
        };
        let stats = slot.as_ref().map(|engine| engine.registry.stats());
        stats.unwrap_or_default()
    }

    /// The size `ptr` was recorded with, if it is tracked
    pub fn tracked_size(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        let slot = state.try_borrow().ok()?;
        let size = slot.as_ref()?.registry.lookup(ptr);
        size
    }

    /// Report `fatal` and end the process.
    pub fn terminate(&self, fatal: Fatal) -> ! {
        self.sink.fatal(format_args!("{fatal}"));
        exit_failure()
    }

    /// The nested path: no tracking, no limits, but the real allocator has to
    /// exist already.
    fn forward<R>(&self, call: impl FnOnce(&RealAlloc) -> R) -> Result<R, Fatal> {
        self.resolver.resolved().map(call).ok_or(Fatal::Reentrancy)
    }

    /// Resolve, load the config and build the engine, whichever of those has
    /// not happened yet. Must be called with the thread marked nested, so that
    /// allocations made while doing so are forwarded.
    fn enter<'g>(
        &'g self,
        state: &'g RefCell<Option<Engine>>,
    ) -> Result<(&'g RealAlloc, RefMut<'g, Engine>), Fatal> {
        let real = self.resolver.ensure_resolved(&self.symbols)?;
        let config = self.config.get_or_init(|| (self.load_config)(&self.sink));
        // Only fails if a sink called back into us with the engine borrowed
        let slot = state.try_borrow_mut().map_err(|_| Fatal::Reentrancy)?;
        let engine = RefMut::map(slot, |slot| {
            slot.get_or_insert_with(|| Engine::new(*real, config))
        });
        Ok((real, engine))
    }

    fn alloc_tracked(
        &self,
        engine: &mut Engine,
        real: &RealAlloc,
        call: Call,
        size: usize,
        fill: Fill,
    ) -> Result<*mut u8, Fatal> {
        if self.refuse_single(engine, call, size) {
            return Ok(null_mut());
        }
        // SAFETY: plain `malloc()`
        let ptr = unsafe { real.alloc(size) };
        self.trace_call(engine, call, ptr);
        if ptr.is_null() || !self.admit(engine, real, ptr, size)? {
            return Ok(null_mut());
        }
        // SAFETY: `ptr` is a fresh block of `size` bytes nobody else has seen
        unsafe {
            match fill {
                Fill::Policy => engine.sanitizer.sanitize(ptr, size),
                Fill::Zero => ptr.write_bytes(0, size),
            }
        }
        Ok(ptr)
    }

    /// The single-allocation cap. Reported, never fatal.
    fn refuse_single(&self, engine: &Engine, call: Call, size: usize) -> bool {
        if !engine.limits.check_single(size) {
            return false;
        }
        let verdict = engine.limits.single_verdict(size);
        self.sink.report(format_args!("{call} refused: {verdict}"));
        self.trace_call(engine, call, null_mut());
        true
    }

    /// Record `ptr` and hold the totals against the limits. On a violation
    /// the block is forgotten and given back, leaving the registry exactly as
    /// it was. `Ok(false)` means the caller gets null.
    fn admit(
        &self,
        engine: &mut Engine,
        real: &RealAlloc,
        ptr: *mut u8,
        size: usize,
    ) -> Result<bool, Fatal> {
        if engine.registry.record(ptr, size).is_err() {
            self.report_registry_full(size);
            // SAFETY: fresh from the real allocator, not handed out yet
            unsafe { real.release(ptr) };
            return Ok(false);
        }
        self.trace_total(engine);

        let verdict = engine
            .limits
            .check_aggregate(engine.registry.len(), engine.registry.bytes());
        let disposition = engine.limits.disposition(verdict);
        if disposition == Disposition::Allow {
            engine.registry.commit_peaks();
            return Ok(true);
        }

        engine.registry.forget(ptr);
        // SAFETY: as above
        unsafe { real.release(ptr) };
        self.trace_total(engine);
        match disposition {
            Disposition::Terminate(fatal) => Err(fatal),
            _ => {
                self.trace_denied(engine, verdict);
                Ok(false)
            }
        }
    }

    fn report_registry_full(&self, size: usize) {
        self.sink.report(format_args!(
            "cannot grow the allocation registry, refusing {size} bytes"
        ));
    }

    fn trace_denied(&self, engine: &Engine, verdict: Verdict) {
        if engine.trace {
            self.sink
                .trace(format_args!("limit reached, returning NULL: {verdict}"));
        }
    }

    fn trace_call(&self, engine: &Engine, call: Call, result: *mut u8) {
        if engine.trace {
            self.sink.trace(format_args!("{call} -> {result:p}"));
        }
    }

    fn trace_total(&self, engine: &Engine) {
        if engine.trace {
            self.sink
                .trace(format_args!("{} bytes tracked", engine.registry.bytes()));
        }
    }
}

/// For use as `#[global_allocator]`. `malloc()` only promises [`MIN_ALIGN`],
/// so over-aligned layouts go to [`System`] untracked.
unsafe impl<S, K> GlobalAlloc for Trap<S, K>
where
    S: SymbolSource,
    K: DiagnosticSink,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return System.alloc(layout);
        }
        Self::alloc(self, layout.size()).unwrap_or_else(|fatal| self.terminate(fatal))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return System.alloc_zeroed(layout);
        }
        Self::alloc_zeroed(self, 1, layout.size()).unwrap_or_else(|fatal| self.terminate(fatal))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > MIN_ALIGN {
            return System.dealloc(ptr, layout);
        }
        Self::release(self, ptr).unwrap_or_else(|fatal| self.terminate(fatal))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return System.realloc(ptr, layout, new_size);
        }
        Self::resize(self, ptr, new_size).unwrap_or_else(|fatal| self.terminate(fatal))
    }
}
