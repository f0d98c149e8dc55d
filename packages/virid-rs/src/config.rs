//! Version store configuration.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ViridError;

/// Window sizes and traversal depths for the version store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmberConfig {
    /// Snapshots kept per entity before the oldest is evicted.
    pub max_stack_size: usize,
    /// Macro snapshots kept before the oldest tick is evicted.
    pub max_tick_length: usize,
    /// Nesting depth the default serializer filters private keys to. Deeper
    /// containers are copied whole.
    pub snapshot_depth: usize,
    /// Nesting depth compared by the default diff before assuming a change.
    pub diff_depth: usize,
}

impl Default for AmberConfig {
    fn default() -> Self {
        Self {
            max_stack_size: 20,
            max_tick_length: 20,
            snapshot_depth: 5,
            diff_depth: 5,
        }
    }
}

impl AmberConfig {
    /// Load from `VIRID_AMBER_*` environment variables, defaulting what is unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_stack_size: env_or("VIRID_AMBER_MAX_STACK_SIZE", defaults.max_stack_size)?,
            max_tick_length: env_or("VIRID_AMBER_MAX_TICK_LENGTH", defaults.max_tick_length)?,
            snapshot_depth: env_or("VIRID_AMBER_SNAPSHOT_DEPTH", defaults.snapshot_depth)?,
            diff_depth: env_or("VIRID_AMBER_DIFF_DEPTH", defaults.diff_depth)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    pub fn with_max_tick_length(mut self, length: usize) -> Self {
        self.max_tick_length = length;
        self
    }

    pub fn with_snapshot_depth(mut self, depth: usize) -> Self {
        self.snapshot_depth = depth;
        self
    }

    pub fn with_diff_depth(mut self, depth: usize) -> Self {
        self.diff_depth = depth;
        self
    }

    /// Both windows must hold at least the present.
    pub fn validate(&self) -> Result<(), ViridError> {
        if self.max_stack_size == 0 {
            return Err(ViridError::InvalidConfig(
                "max_stack_size must be at least 1".to_string(),
            ));
        }
        if self.max_tick_length == 0 {
            return Err(ViridError::InvalidConfig(
                "max_tick_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AmberConfig::default();

        assert_eq!(config.max_stack_size, 20);
        assert_eq!(config.max_tick_length, 20);
        assert_eq!(config.snapshot_depth, 5);
        assert_eq!(config.diff_depth, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_windows_are_rejected() {
        let stack = AmberConfig::default().with_max_stack_size(0);
        let ticks = AmberConfig::default().with_max_tick_length(0);

        assert!(matches!(stack.validate(), Err(ViridError::InvalidConfig(_))));
        assert!(matches!(ticks.validate(), Err(ViridError::InvalidConfig(_))));
    }

    #[test]
    fn deserializes_partial_config_over_defaults() {
        let config: AmberConfig =
            serde_json::from_value(serde_json::json!({ "max_stack_size": 100 })).unwrap();

        assert_eq!(config.max_stack_size, 100);
        assert_eq!(config.max_tick_length, 20);
    }

    #[test]
    fn env_or_reports_the_offending_key() {
        // unique key, no other test touches it
        env::set_var("VIRID_AMBER_TEST_GARBAGE", "lots");

        let err = env_or::<usize>("VIRID_AMBER_TEST_GARBAGE", 1).unwrap_err();

        assert!(err.to_string().contains("VIRID_AMBER_TEST_GARBAGE"));
        assert_eq!(env_or::<usize>("VIRID_AMBER_TEST_UNSET", 7).unwrap(), 7);
    }
}
