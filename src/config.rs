//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;
pub const DEFAULT_FUEL_PER_GAS: u64 = 100;
pub const DEFAULT_MAX_GAS_PER_INVOCATION: u64 = 1_000_000;
/// 16 MiB of guest linear memory.
pub const DEFAULT_GUEST_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Limits applied to every guest invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Wasm fuel units per unit of machine gas.
    pub fuel_per_gas: u64,
    pub max_gas_per_invocation: u64,
    pub memory_limit_bytes: usize,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            fuel_per_gas: DEFAULT_FUEL_PER_GAS,
            max_gas_per_invocation: DEFAULT_MAX_GAS_PER_INVOCATION,
            memory_limit_bytes: DEFAULT_GUEST_MEMORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Gas given to freshly created machines.
    pub gas_limit: u64,
    /// Ceiling on steps per `Interpreter::run` call.
    pub max_steps: u64,
    /// Record an execution trace while running.
    pub trace: bool,
    pub guest: GuestConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_GAS_LIMIT,
            max_steps: DEFAULT_MAX_STEPS,
            trace: false,
            guest: GuestConfig::default(),
        }
    }
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.guest.fuel_per_gas == 0 {
            return Err(ConfigError::Zero("guest.fuel_per_gas"));
        }
        if self.guest.memory_limit_bytes == 0 {
            return Err(ConfigError::Zero("guest.memory_limit_bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = VmConfig::from_json(r#"{"gas_limit": 500, "guest": {"fuel_per_gas": 7}}"#).unwrap();
        assert_eq!(config.gas_limit, 500);
        assert_eq!(config.max_steps, DEFAULT_MAX_STEPS);
        assert!(!config.trace);
        assert_eq!(config.guest.fuel_per_gas, 7);
        assert_eq!(config.guest.max_gas_per_invocation, DEFAULT_MAX_GAS_PER_INVOCATION);
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(VmConfig::from_json("{}").unwrap(), VmConfig::default());
    }

    #[test]
    fn rejects_zero_fuel_rate_and_bad_json() {
        assert!(matches!(
            VmConfig::from_json(r#"{"guest": {"fuel_per_gas": 0}}"#),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            VmConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("avmstep-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"max_steps": 12, "trace": true}"#).unwrap();
        let config = VmConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.max_steps, 12);
        assert!(config.trace);
        assert!(matches!(VmConfig::from_file(&path), Err(ConfigError::Io(_))));
    }

    #[test]
    fn serializes_back_to_the_same_config() {
        let config = VmConfig {
            trace: true,
            ..VmConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(VmConfig::from_json(&text).unwrap(), config);
    }
}
