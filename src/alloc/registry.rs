use ahash::RandomState;
use hashbrown::{HashMap, TryReserveError};
use serde::Serialize;

use super::{passthrough::Passthrough, real::RealAlloc};

/// Fixed seeds: keys are addresses, not attacker controlled, and seeding from
/// the OS would mean a syscall (or worse) inside `malloc()`
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Running totals over the live allocations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub tracked_count: usize,
    pub tracked_bytes: usize,
    /// Most allocations ever live at once
    pub peak_count: usize,
    /// Most bytes ever live at once
    pub peak_bytes: usize,
}

/// Every live allocation we handed out, by address, with its requested size.
///
/// The map's own storage comes from [`Passthrough`], so recording an
/// allocation never records another one.
pub struct Registry {
    live: HashMap<usize, usize, RandomState, Passthrough>,
    bytes: usize,
    peak_count: usize,
    peak_bytes: usize,
}

impl Registry {
    pub fn new(real: RealAlloc) -> Self {
        let [k0, k1, k2, k3] = SEEDS;
        Self {
            live: HashMap::with_hasher_in(
                RandomState::with_seeds(k0, k1, k2, k3),
                Passthrough::new(real),
            ),
            bytes: 0,
            peak_count: 0,
            peak_bytes: 0,
        }
    }

    /// Make sure the next `record()` cannot fail.
    pub fn reserve(&mut self) -> Result<(), TryReserveError> {
        self.live.try_reserve(1)
    }

    /// Start tracking `address`. Fails only if the map cannot grow, in which
    /// case nothing changes. The peaks stay put until `commit_peaks()`, so a
    /// record that is undone again leaves no trace.
    pub fn record(&mut self, address: *const u8, size: usize) -> Result<(), TryReserveError> {
        self.reserve()?;
        // The real allocator never hands out a live address twice, but keep
        // the totals honest if someone freed behind our back
        if let Some(stale) = self.live.insert(address as usize, size) {
            self.bytes -= stale;
        }
        self.bytes += size;
        Ok(())
    }

    /// Raise the high-water marks to the current totals
    pub fn commit_peaks(&mut self) {
        self.peak_count = self.peak_count.max(self.live.len());
        self.peak_bytes = self.peak_bytes.max(self.bytes);
    }

    /// Stop tracking `address`, returning the size it was recorded with.
    /// Untracked addresses are a no-op.
    pub fn forget(&mut self, address: *const u8) -> Option<usize> {
        let size = self.live.remove(&(address as usize))?;
        self.bytes -= size;
        Some(size)
    }

    pub fn lookup(&self, address: *const u8) -> Option<usize> {
        self.live.get(&(address as usize)).copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tracked_count: self.len(),
            tracked_bytes: self.bytes,
            peak_count: self.peak_count,
            peak_bytes: self.peak_bytes,
        }
    }
}
