//! An allocator that sits in front of the C allocator, keeps a record of
//! every live block, and holds the totals against configured limits.
//!
//! Loaded with `LD_PRELOAD` (build with `--features preload`) it replaces
//! `malloc()`, `calloc()`, `realloc()` and `free()` for a whole process. As a
//! library, [`Trap`] can be a `#[global_allocator]` or be called directly.

pub mod alloc;
pub mod config;
pub mod diag;
pub mod error;
#[cfg(feature = "preload")]
pub mod externc;
mod lazy_lock;
mod os;
mod util;

pub use alloc::{
    policy::{Disposition, Limits, Verdict},
    real::{DlsymNext, LinkedSymbols, RealAlloc, SymbolSource},
    registry::Stats,
    sanitize::SanitizeMode,
    trap::Trap,
};
pub use config::Config;
pub use diag::{DiagnosticSink, LogSink, StderrSink};
pub use error::{ConfigError, DlError, Fatal};
pub use lazy_lock::LazyLockState;
