use std::fmt;

use crate::{config::Config, error::Fatal};

/// What the limits have to say about the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// A single request was bigger than the per-allocation cap
    SingleSizeExceeded { requested: usize, limit: usize },
    CountExceeded { count: usize, limit: usize },
    BytesExceeded { bytes: usize, limit: usize },
}

impl Verdict {
    pub fn is_ok(self) -> bool {
        self == Verdict::Ok
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Verdict::Ok => f.write_str("within limits"),
            Verdict::SingleSizeExceeded { requested, limit } => {
                write!(f, "{requested} > {limit} bytes in a single allocation")
            }
            Verdict::CountExceeded { count, limit } => write!(f, "{count} > {limit} pointers"),
            Verdict::BytesExceeded { bytes, limit } => write!(f, "{bytes} > {limit} bytes"),
        }
    }
}

/// What to do about a [`Verdict`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Allow,
    /// Undo the allocation and hand the caller null
    Deny,
    /// Undo the allocation and end the process
    Terminate(Fatal),
}

/// The configured limits. A limit of `0` is no limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    max_count: usize,
    count_fatal: bool,
    max_bytes: usize,
    bytes_fatal: bool,
    max_single: Option<usize>,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        let ratio = config.max_single_ratio;
        let max_single = if config.max_single != 0 {
            Some(config.max_single)
        } else if config.max_bytes != 0 && ratio > 0.0 && ratio < 1.0 {
            Some((config.max_bytes as f64 * ratio) as usize)
        } else {
            None
        };
        Self {
            max_count: config.max_count,
            count_fatal: config.max_count_fatal,
            max_bytes: config.max_bytes,
            bytes_fatal: config.max_bytes_fatal,
            max_single,
        }
    }

    /// The per-allocation cap, explicit or derived from the byte limit
    pub fn single_limit(&self) -> Option<usize> {
        self.max_single
    }

    /// Checked before the real allocator is asked for anything
    pub fn single_verdict(&self, requested: usize) -> Verdict {
        match self.max_single {
            Some(limit) if requested > limit => Verdict::SingleSizeExceeded { requested, limit },
            _ => Verdict::Ok,
        }
    }

    /// `true` if a request of `requested` bytes must be refused outright
    pub fn check_single(&self, requested: usize) -> bool {
        !self.single_verdict(requested).is_ok()
    }

    /// Checked after an allocation has been recorded. The count limit is
    /// reported before the byte limit.
    pub fn check_aggregate(&self, count: usize, bytes: usize) -> Verdict {
        if self.max_count != 0 && count > self.max_count {
            Verdict::CountExceeded {
                count,
                limit: self.max_count,
            }
        } else if self.max_bytes != 0 && bytes > self.max_bytes {
            Verdict::BytesExceeded {
                bytes,
                limit: self.max_bytes,
            }
        } else {
            Verdict::Ok
        }
    }

    pub fn disposition(&self, verdict: Verdict) -> Disposition {
        match verdict {
            Verdict::Ok => Disposition::Allow,
            Verdict::SingleSizeExceeded { .. } => Disposition::Deny,
            Verdict::CountExceeded { count, limit } if self.count_fatal => {
                Disposition::Terminate(Fatal::CountLimit { count, limit })
            }
            Verdict::BytesExceeded { bytes, limit } if self.bytes_fatal => {
                Disposition::Terminate(Fatal::BytesLimit { bytes, limit })
            }
            Verdict::CountExceeded { .. } | Verdict::BytesExceeded { .. } => Disposition::Deny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(edit: impl FnOnce(&mut Config)) -> Limits {
        let mut config = Config::unlimited();
        edit(&mut config);
        Limits::from_config(&config)
    }

    #[test]
    fn unlimited_allows_everything() {
        let l = limits(|_| {});
        assert!(!l.check_single(usize::MAX));
        assert_eq!(l.check_aggregate(usize::MAX, usize::MAX), Verdict::Ok);
    }

    #[test]
    fn single_cap_is_strict() {
        let l = limits(|c| c.max_single = 100);
        assert!(!l.check_single(100));
        assert!(l.check_single(101));
        assert_eq!(
            l.single_verdict(101),
            Verdict::SingleSizeExceeded {
                requested: 101,
                limit: 100
            }
        );
    }

    #[test]
    fn single_cap_derives_from_ratio() {
        let l = limits(|c| {
            c.max_bytes = 1000;
            c.max_single_ratio = 0.25;
        });
        assert_eq!(l.single_limit(), Some(250));

        // no byte limit, nothing to derive from
        let l = limits(|c| c.max_single_ratio = 0.25);
        assert_eq!(l.single_limit(), None);

        // a ratio of 1.0 or more would never bite before the byte limit
        let l = limits(|c| {
            c.max_bytes = 1000;
            c.max_single_ratio = 1.0;
        });
        assert_eq!(l.single_limit(), None);

        // an explicit cap wins
        let l = limits(|c| {
            c.max_bytes = 1000;
            c.max_single_ratio = 0.25;
            c.max_single = 10;
        });
        assert_eq!(l.single_limit(), Some(10));
    }

    #[test]
    fn count_is_reported_before_bytes() {
        let l = limits(|c| {
            c.max_count = 2;
            c.max_bytes = 10;
        });
        assert_eq!(l.check_aggregate(2, 10), Verdict::Ok);
        assert_eq!(
            l.check_aggregate(3, 11),
            Verdict::CountExceeded { count: 3, limit: 2 }
        );
        assert_eq!(
            l.check_aggregate(2, 11),
            Verdict::BytesExceeded {
                bytes: 11,
                limit: 10
            }
        );
    }

    #[test]
    fn fatality_is_per_limit() {
        let l = limits(|c| {
            c.max_count = 2;
            c.max_count_fatal = true;
            c.max_bytes = 10;
            c.max_bytes_fatal = false;
        });
        assert_eq!(
            l.disposition(l.check_aggregate(3, 0)),
            Disposition::Terminate(Fatal::CountLimit { count: 3, limit: 2 })
        );
        assert_eq!(l.disposition(l.check_aggregate(1, 11)), Disposition::Deny);
        assert_eq!(l.disposition(l.single_verdict(0)), Disposition::Allow);
    }

    #[test]
    fn verdicts_display_their_numbers() {
        let verdict = Verdict::CountExceeded { count: 3, limit: 2 };
        assert_eq!(verdict.to_string(), "3 > 2 pointers");
    }
}
