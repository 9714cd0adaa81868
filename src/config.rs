use std::env;
use std::num::ParseIntError;

use thiserror::Error;

use crate::pool::POOL_PAGES;

/// Finalizer hook, invoked during sweep for blocks carrying the FINALIZE
/// attribute. The second argument reports whether the object was detached
/// from the heap before the call, the third whether its memory will be
/// reset afterwards; both are always false for sweep-time invocations.
pub type FinalizeFn = unsafe fn(p: *mut u8, detached: bool, reset_mem: bool);

/// Errors that can be encountered while reading the collector configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not unicode")]
    Env(&'static str),
    #[error("environment variable {0} is not a number: {1}")]
    Parse(&'static str, ParseIntError),
    #[error("environment variable {0} must be positive")]
    Zero(&'static str),
}

/// Tuning knobs for the collector, resolved once at heap construction.
#[derive(Clone)]
pub struct GcConfig {
    /// Page quantum of a freshly mapped pool. New pools are at least this
    /// many 4K pages.
    pub pool_pages: usize,
    /// Start with automatic collections disabled (explicit `full_collect`
    /// still works).
    pub start_disabled: bool,
    /// Finalizer callback for FINALIZE-attributed blocks.
    pub finalizer: Option<FinalizeFn>,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            pool_pages: POOL_PAGES,
            start_disabled: false,
            finalizer: None,
        }
    }
}

impl GcConfig {
    /// Read configuration from the environment: `GC_POOL_PAGES` overrides
    /// the pool quantum, `GC_DISABLE=1` starts the collector disabled.
    /// Absent variables fall back to the defaults.
    pub fn from_env() -> Result<GcConfig, ConfigError> {
        let mut config = GcConfig::default();
        if let Some(pages) = read_var("GC_POOL_PAGES")? {
            let pages: usize = pages
                .parse()
                .map_err(|e| ConfigError::Parse("GC_POOL_PAGES", e))?;
            if pages == 0 {
                return Err(ConfigError::Zero("GC_POOL_PAGES"));
            }
            config.pool_pages = pages;
        }
        if let Some(flag) = read_var("GC_DISABLE")? {
            config.start_disabled = flag != "0";
        }
        Ok(config)
    }
}

fn read_var(name: &'static str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::Env(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GcConfig::default();
        assert_eq!(config.pool_pages, POOL_PAGES);
        assert!(!config.start_disabled);
        assert!(config.finalizer.is_none());
    }
}
