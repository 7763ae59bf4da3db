//! Call linking tunables.
//!
//! Defaults can be overridden through the environment:
//!
//! - `OTTER_CALL_POLY_CAPACITY=<n>`: maximum cases in a polymorphic call stub
//! - `OTTER_CALL_VARARGS_CEILING=<n>`: ceiling of the varargs argument profile
//! - `OTTER_DISABLE_CALL_IC=1`: never cache callees; every call site goes virtual
//! - `OTTER_GC_MARK_BUDGET=<n>`: cells marked per safepoint
//! - `OTTER_GC_THRESHOLD=<n>`: allocations between collections

use serde::{Deserialize, Serialize};

use otter_vm_gc::GcConfig;

use crate::error::ConfigError;

/// Default number of cases a polymorphic call stub may hold.
pub const DEFAULT_POLYMORPHIC_CAPACITY: u32 = 4;

/// Largest accepted polymorphic stub capacity.
pub const MAX_POLYMORPHIC_CAPACITY: u32 = 32;

/// Default (and largest) varargs argument-count ceiling, including `this`.
pub const DEFAULT_VARARGS_CEILING: u32 = 255;

/// Call linking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallLinkConfig {
    /// Maximum number of cases in a polymorphic call stub
    pub polymorphic_capacity: u32,
    /// Saturation point of the varargs argument-count profile
    pub max_varargs_argument_count: u32,
    /// When false every site goes straight to virtual dispatch
    pub enable_call_caching: bool,
    /// Gray cells scanned per safepoint while marking
    pub mark_budget: usize,
    /// Allocations between collections
    pub gc_allocation_threshold: usize,
}

impl Default for CallLinkConfig {
    fn default() -> Self {
        Self {
            polymorphic_capacity: DEFAULT_POLYMORPHIC_CAPACITY,
            max_varargs_argument_count: DEFAULT_VARARGS_CEILING,
            enable_call_caching: true,
            mark_budget: 64,
            gc_allocation_threshold: 4096,
        }
    }
}

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

fn parse_env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl CallLinkConfig {
    /// Defaults with environment overrides applied, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = parse_env_u64("OTTER_CALL_POLY_CAPACITY")? {
            config.polymorphic_capacity = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(n) = parse_env_u64("OTTER_CALL_VARARGS_CEILING")? {
            config.max_varargs_argument_count = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if std::env::var("OTTER_DISABLE_CALL_IC")
            .ok()
            .is_some_and(|v| parse_env_truthy(&v))
        {
            config.enable_call_caching = false;
        }
        if let Some(n) = parse_env_u64("OTTER_GC_MARK_BUDGET")? {
            config.mark_budget = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(n) = parse_env_u64("OTTER_GC_THRESHOLD")? {
            config.gc_allocation_threshold = usize::try_from(n).unwrap_or(usize::MAX);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every tunable against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "polymorphic_capacity",
            self.polymorphic_capacity as u64,
            1,
            MAX_POLYMORPHIC_CAPACITY as u64,
        )?;
        check_range(
            "max_varargs_argument_count",
            self.max_varargs_argument_count as u64,
            1,
            DEFAULT_VARARGS_CEILING as u64,
        )?;
        check_range("mark_budget", self.mark_budget as u64, 1, u64::MAX)?;
        check_range(
            "gc_allocation_threshold",
            self.gc_allocation_threshold as u64,
            1,
            u64::MAX,
        )?;
        Ok(())
    }

    /// The collector half of the configuration.
    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            allocation_threshold: self.gc_allocation_threshold,
            mark_budget: self.mark_budget,
        }
    }
}

fn check_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}
