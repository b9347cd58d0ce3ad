use std::{ffi::CStr, fmt, io, path::PathBuf};

use thiserror::Error;

/// Conditions after which the process cannot carry on. The engine hands these
/// back instead of exiting, the ABI shims are what actually terminate.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Fatal {
    #[error("error in `dlsym(RTLD_NEXT, \"{symbol}\")`: {reason}")]
    Resolution {
        symbol: &'static str,
        reason: DlError,
    },
    /// Either the symbol lookup allocated, or two threads raced the very first
    /// allocation
    #[error("malloc-family function called while heaptrap was initializing")]
    Reentrancy,
    #[error("malloc allocation limit reached: {count} > {limit} pointers")]
    CountLimit { count: usize, limit: usize },
    #[error("malloc allocation limit reached: {bytes} > {limit} bytes")]
    BytesLimit { bytes: usize, limit: usize },
}

/// Longest `dlerror()` message we keep, the rest is cut off
const DLERROR_CAPACITY: usize = 120;

/// A copy of a `dlerror()` message, held inline so reporting a failed lookup
/// does not need the allocator we failed to find.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DlError {
    buf: [u8; DLERROR_CAPACITY],
    len: usize,
}

impl DlError {
    pub fn from_c_str(message: &CStr) -> Self {
        let bytes = message.to_bytes();
        let len = bytes.len().min(DLERROR_CAPACITY);
        let mut buf = [0; DLERROR_CAPACITY];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self { buf, len }
    }

    /// Take the pending `dlerror()` message, if the loader has one
    pub fn last() -> Self {
        // SAFETY: `dlerror` returns null or a NUL-terminated string that stays
        // valid until the next `dl*` call on this thread, and we copy it out
        // right away
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            Self::from_c_str(c"symbol not found")
        } else {
            Self::from_c_str(unsafe { CStr::from_ptr(message) })
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Display for DlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.as_bytes().utf8_chunks() {
            f.write_str(chunk.valid())?;
            if !chunk.invalid().is_empty() {
                f.write_str("\u{fffd}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DlError({:?})", self.to_string())
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read heaptrap config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse heaptrap config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be in (0.0, 1.0), got {value}")]
    RatioOutOfRange { key: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlerror_is_truncated_not_lost() {
        let long = std::ffi::CString::new("x".repeat(500)).unwrap();
        let err = DlError::from_c_str(&long);
        assert_eq!(err.as_bytes().len(), DLERROR_CAPACITY);
        assert_eq!(DlError::from_c_str(c"boom").to_string(), "boom");
    }

    #[test]
    fn fatal_messages_name_the_limit() {
        let fatal = Fatal::CountLimit { count: 3, limit: 2 };
        assert_eq!(fatal.to_string(), "malloc allocation limit reached: 3 > 2 pointers");
        let fatal = Fatal::Resolution {
            symbol: "malloc",
            reason: DlError::from_c_str(c"undefined symbol: malloc"),
        };
        assert!(fatal.to_string().contains("\"malloc\""));
        assert!(fatal.to_string().ends_with("undefined symbol: malloc"));
    }
}
