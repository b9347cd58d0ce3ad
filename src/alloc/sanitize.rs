use std::{fmt, slice, str::FromStr};

use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

/// What to overwrite fresh memory with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SanitizeMode {
    /// Leave whatever the real allocator gave us
    #[default]
    Off,
    Zero,
    /// Pseudo-random bytes, to shake out reads of uninitialized memory
    Random,
}

impl FromStr for SanitizeMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "off" | "no" | "none" | "false" => Ok(Self::Off),
            "zero" | "1" => Ok(Self::Zero),
            "random" | "rand" => Ok(Self::Random),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SanitizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Zero => "zero",
            Self::Random => "random",
        })
    }
}

pub struct Sanitizer {
    mode: SanitizeMode,
    rng: StdRng,
}

impl Sanitizer {
    pub fn new(mode: SanitizeMode, seed: u64) -> Self {
        Self {
            mode,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Overwrite `len` bytes at `ptr` according to the mode.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must be writable and not aliased by any reference.
    pub unsafe fn sanitize(&mut self, ptr: *mut u8, len: usize) {
        if len == 0 || ptr.is_null() {
            return;
        }
        match self.mode {
            SanitizeMode::Off => {}
            SanitizeMode::Zero => ptr.write_bytes(0, len),
            SanitizeMode::Random => self.rng.fill_bytes(slice::from_raw_parts_mut(ptr, len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse() {
        assert_eq!("zero".parse(), Ok(SanitizeMode::Zero));
        assert_eq!(" Random ".parse(), Ok(SanitizeMode::Random));
        assert_eq!("off".parse(), Ok(SanitizeMode::Off));
        assert_eq!("bogus".parse::<SanitizeMode>(), Err(()));
    }

    #[test]
    fn zero_fills_only_the_range() {
        let mut buf = [0xaau8; 16];
        let mut s = Sanitizer::new(SanitizeMode::Zero, 0);
        unsafe { s.sanitize(buf.as_mut_ptr().add(4), 8) };
        assert_eq!(&buf[..4], &[0xaa; 4]);
        assert_eq!(&buf[4..12], &[0; 8]);
        assert_eq!(&buf[12..], &[0xaa; 4]);
    }

    #[test]
    fn off_leaves_memory_alone() {
        let mut buf = [0x55u8; 8];
        let mut s = Sanitizer::new(SanitizeMode::Off, 0);
        unsafe { s.sanitize(buf.as_mut_ptr(), buf.len()) };
        assert_eq!(buf, [0x55; 8]);
    }

    #[test]
    fn random_is_reproducible_per_seed() {
        let (mut a, mut b) = ([0u8; 64], [0u8; 64]);
        unsafe {
            Sanitizer::new(SanitizeMode::Random, 7).sanitize(a.as_mut_ptr(), 64);
            Sanitizer::new(SanitizeMode::Random, 7).sanitize(b.as_mut_ptr(), 64);
        }
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 64]);
    }
}
