//! Process-level configuration.
//!
//! Read once, the first time the allocator is used, from a JSON file named by
//! `HEAPTRAP_CONFIG` (if set) and then from individual `HEAPTRAP_*` variables,
//! which win. Anything malformed is reported and left at its previous value.

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{alloc::sanitize::SanitizeMode, diag::DiagnosticSink, error::ConfigError};

pub const CONFIG_VAR: &str = "HEAPTRAP_CONFIG";
pub const TRACE_VAR: &str = "HEAPTRAP_TRACE";
pub const RESET_VAR: &str = "HEAPTRAP_RESET";
pub const MAX_COUNT_VAR: &str = "HEAPTRAP_MAX_COUNT";
pub const MAX_COUNT_FATAL_VAR: &str = "HEAPTRAP_MAX_COUNT_FATAL";
pub const MAX_BYTES_VAR: &str = "HEAPTRAP_MAX_BYTES";
pub const MAX_BYTES_FATAL_VAR: &str = "HEAPTRAP_MAX_BYTES_FATAL";
pub const MAX_SINGLE_VAR: &str = "HEAPTRAP_MAX_SINGLE";
pub const MAX_SINGLE_RATIO_VAR: &str = "HEAPTRAP_MAX_SINGLE_RATIO";
pub const DISCOUNT_RESIZE_VAR: &str = "HEAPTRAP_DISCOUNT_RESIZE";
pub const SEED_VAR: &str = "HEAPTRAP_SEED";

/// How a config is produced on first use. Gets the sink to complain into.
pub type ConfigLoader = fn(&dyn DiagnosticSink) -> Config;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Write a line for every call and every change of the running total
    pub trace: bool,
    /// What to overwrite new memory with
    pub reset: SanitizeMode,
    /// Most live allocations, `0` for unlimited
    pub max_count: usize,
    pub max_count_fatal: bool,
    /// Most live bytes, `0` for unlimited
    pub max_bytes: usize,
    pub max_bytes_fatal: bool,
    /// Largest single request, `0` to derive it from `max_single_ratio`
    pub max_single: usize,
    /// Fraction of `max_bytes` a single request may take, when `max_single`
    /// is unset. Ignored unless in `(0.0, 1.0)`.
    pub max_single_ratio: f64,
    /// Do not track what `realloc()` returns
    pub discount_resize: bool,
    /// Seed for `SanitizeMode::Random`
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: false,
            reset: SanitizeMode::Off,
            max_count: 400_000,
            max_count_fatal: true,
            max_bytes: 100_000_000,
            max_bytes_fatal: true,
            max_single: 0,
            max_single_ratio: 0.0,
            discount_resize: false,
            seed: 0,
        }
    }
}

impl Config {
    /// No limits at all, nothing sanitized, nothing traced
    pub fn unlimited() -> Self {
        Self {
            max_count: 0,
            max_bytes: 0,
            ..Self::default()
        }
    }

    /// Whether `realloc()` results are tracked
    pub fn tracks_resize(&self) -> bool {
        !self.discount_resize
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The process environment, see the module docs. This is the default
    /// [`ConfigLoader`].
    pub fn from_env(sink: &dyn DiagnosticSink) -> Self {
        let mut config = match env::var_os(CONFIG_VAR) {
            Some(path) => Self::from_file(Path::new(&path)).unwrap_or_else(|e| {
                sink.report(format_args!("{e}"));
                Self::default()
            }),
            None => Self::default(),
        };
        config.apply_vars(|key| env::var(key).ok(), |e| sink.report(format_args!("{e}")));
        config
    }

    /// Apply every `HEAPTRAP_*` variable `lookup` knows about on top of
    /// `self`.
    pub fn apply_vars<L, E>(&mut self, lookup: L, mut on_error: E)
    where
        L: Fn(&str) -> Option<String>,
        E: FnMut(ConfigError),
    {
        let mut set = |key: &'static str, apply: &mut dyn FnMut(&str) -> bool| {
            if let Some(value) = lookup(key) {
                if !apply(&value) {
                    on_error(ConfigError::InvalidValue { key, value });
                }
            }
        };

        set(TRACE_VAR, &mut |v| parse_bool(v).map(|b| self.trace = b).is_some());
        set(RESET_VAR, &mut |v| v.parse().map(|m| self.reset = m).is_ok());
        set(MAX_COUNT_VAR, &mut |v| v.trim().parse().map(|n| self.max_count = n).is_ok());
        set(MAX_COUNT_FATAL_VAR, &mut |v| {
            parse_bool(v).map(|b| self.max_count_fatal = b).is_some()
        });
        set(MAX_BYTES_VAR, &mut |v| v.trim().parse().map(|n| self.max_bytes = n).is_ok());
        set(MAX_BYTES_FATAL_VAR, &mut |v| {
            parse_bool(v).map(|b| self.max_bytes_fatal = b).is_some()
        });
        set(MAX_SINGLE_VAR, &mut |v| v.trim().parse().map(|n| self.max_single = n).is_ok());
        set(DISCOUNT_RESIZE_VAR, &mut |v| {
            parse_bool(v).map(|b| self.discount_resize = b).is_some()
        });
        set(SEED_VAR, &mut |v| v.trim().parse().map(|n| self.seed = n).is_ok());

        if let Some(value) = lookup(MAX_SINGLE_RATIO_VAR) {
            match value.trim().parse::<f64>() {
                Ok(ratio) if ratio > 0.0 && ratio < 1.0 => self.max_single_ratio = ratio,
                Ok(ratio) => on_error(ConfigError::RatioOutOfRange {
                    key: MAX_SINGLE_RATIO_VAR,
                    value: ratio,
                }),
                Err(_) => on_error(ConfigError::InvalidValue {
                    key: MAX_SINGLE_RATIO_VAR,
                    value,
                }),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn apply(vars: &[(&str, &str)]) -> (Config, Vec<String>) {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        let mut errors = Vec::new();
        config.apply_vars(|k| vars.get(k).cloned(), |e| errors.push(e.to_string()));
        (config, errors)
    }

    #[test]
    fn vars_override_defaults() {
        let (config, errors) = apply(&[
            (TRACE_VAR, "1"),
            (RESET_VAR, "random"),
            (MAX_COUNT_VAR, "2"),
            (MAX_COUNT_FATAL_VAR, "no"),
            (MAX_BYTES_VAR, " 4096 "),
            (MAX_SINGLE_RATIO_VAR, "0.5"),
            (DISCOUNT_RESIZE_VAR, "true"),
            (SEED_VAR, "42"),
        ]);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(config.trace);
        assert_eq!(config.reset, SanitizeMode::Random);
        assert_eq!(config.max_count, 2);
        assert!(!config.max_count_fatal);
        assert_eq!(config.max_bytes, 4096);
        assert!(config.max_bytes_fatal);
        assert_eq!(config.max_single_ratio, 0.5);
        assert!(!config.tracks_resize());
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn bad_values_are_reported_and_ignored() {
        let (config, errors) = apply(&[
            (MAX_COUNT_VAR, "lots"),
            (TRACE_VAR, "maybe"),
            (MAX_SINGLE_RATIO_VAR, "1.5"),
        ]);
        assert_eq!(config, Config::default());
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains(MAX_COUNT_VAR)));
        assert!(errors.iter().any(|e| e.contains("(0.0, 1.0)")));
    }

    #[test]
    fn json_file_fills_in_defaults() {
        let path = env::temp_dir().join(format!("heaptrap-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "max_count": 3, "reset": "zero" }"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.max_count, 3);
        assert_eq!(config.reset, SanitizeMode::Zero);
        assert_eq!(config.max_bytes, Config::default().max_bytes);
    }

    #[test]
    fn unknown_json_keys_are_rejected() {
        let path = env::temp_dir().join(format!("heaptrap-bad-{}.json", std::process::id()));
        fs::write(&path, r#"{ "max_cuont": 3 }"#).unwrap();
        let err = Config::from_file(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
