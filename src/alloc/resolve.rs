use crate::{
    error::Fatal,
    lazy_lock::{InitError, LazyLock, LazyLockState},
};

use super::real::{resolve, RealAlloc, SymbolSource};

/// Binds the real allocator on first use, exactly once.
pub struct Resolver {
    real: LazyLock<RealAlloc>,
}

impl Resolver {
    pub const fn new() -> Self {
        Self {
            real: LazyLock::new(),
        }
    }

    pub fn state(&self) -> LazyLockState {
        self.real.state()
    }

    /// The real allocator, if `ensure_resolved()` has completed
    pub fn resolved(&self) -> Option<&RealAlloc> {
        self.real.get()
    }

    /// Resolve if nobody has yet. Being called again while the lookup is
    /// still running means the lookup itself allocated, which we cannot
    /// serve: there is no allocator to serve it with.
    pub fn ensure_resolved<S>(&self, symbols: &S) -> Result<&RealAlloc, Fatal>
    where
        S: SymbolSource + ?Sized,
    {
        self.real
            .get_or_try_init(|| resolve(symbols))
            .map_err(|e| match e {
                InitError::Reentered => Fatal::Reentrancy,
                InitError::Failed(fatal) => fatal,
            })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
