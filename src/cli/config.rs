// CLI Configuration - Simulator parameters from file and flags
// Principle: Clear mapping between user input and internal configuration

use crate::cli::ConfigArgs;
use crate::contracts::RegistryConfig;
use crate::types::Balance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Epoch windows, in blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSchedule {
    /// Length of every epoch after the first
    pub length: u64,

    /// Length of epoch 1
    pub first_length: u64,
}

impl Default for EpochSchedule {
    fn default() -> Self {
        Self {
            length: 10,
            first_length: 10,
        }
    }
}

/// Defaults applied when a validator opens its delegation ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationParams {
    pub cooldown_epochs: u64,
    pub min_stake: Balance,
}

impl Default for DelegationParams {
    fn default() -> Self {
        Self {
            cooldown_epochs: 2,
            min_stake: 10,
        }
    }
}

/// Account funded at start, addressed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub name: String,
    pub balance: Balance,
}

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Height of the chain when epochs are initialized
    pub start_height: u64,

    pub epochs: EpochSchedule,

    pub registry: RegistryConfig,

    pub delegation: DelegationParams,

    /// Account that initializes the components and settles epochs
    pub admin: String,

    pub accounts: Vec<GenesisAccount>,
}

impl Default for SimConfig {
    fn default() -> Self {
        let accounts = ["admin", "validator", "alice", "bob"]
            .into_iter()
            .map(|name| GenesisAccount {
                name: name.to_string(),
                balance: 1_000_000,
            })
            .collect();

        Self {
            start_height: 0,
            epochs: EpochSchedule::default(),
            registry: RegistryConfig::default(),
            delegation: DelegationParams::default(),
            admin: "admin".to_string(),
            accounts,
        }
    }
}

impl SimConfig {
    /// Loads a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: SimConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Builds the configuration from a file (if any) and command-line overrides
    pub fn from_args(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(length) = args.epoch_length {
            config.epochs.length = length;
        }
        if let Some(first_length) = args.first_epoch_length {
            config.epochs.first_length = first_length;
        }
        if let Some(cooldown) = args.cooldown_epochs {
            config.registry.cooldown_epochs = cooldown;
            config.delegation.cooldown_epochs = cooldown;
        }
        if let Some(delay) = args.activation_delay_epochs {
            config.registry.activation_delay_epochs = delay;
        }
        if let Some(bps) = args.commission_bps {
            config.registry.commission_bps = bps;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs.length == 0 || self.epochs.first_length == 0 {
            return Err(ConfigError::Invalid(
                "epoch lengths must be positive".to_string(),
            ));
        }
        self.registry
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.delegation.cooldown_epochs > self.registry.cooldown_epochs {
            return Err(ConfigError::Invalid(format!(
                "delegation cooldown {} exceeds registry cooldown {}",
                self.delegation.cooldown_epochs, self.registry.cooldown_epochs
            )));
        }
        if self.delegation.min_stake < self.registry.min_delegation {
            return Err(ConfigError::Invalid(format!(
                "delegation min stake {} below registry minimum delegation {}",
                self.delegation.min_stake, self.registry.min_delegation
            )));
        }

        let mut names = BTreeSet::new();
        for account in &self.accounts {
            if account.name.is_empty() {
                return Err(ConfigError::Invalid("empty account name".to_string()));
            }
            if !names.insert(account.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account {}",
                    account.name
                )));
            }
        }
        if self.admin.is_empty() {
            return Err(ConfigError::Invalid("empty admin name".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
