//! Configuration management for the orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{OrchestratorError, OrchestratorResult};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    /// Cadence of the coarse phase-expiry sweep
    pub phase_sweep_interval_secs: u64,
    /// Cadence of the exclusive-withdrawal boundary check
    pub exclusive_check_interval_secs: u64,
    /// Escrow monitoring poll interval
    pub escrow_poll_interval_secs: u64,
    /// Escrow monitoring attempt budget
    pub escrow_poll_max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: "crosslock-0".to_string(),
            phase_sweep_interval_secs: 30,
            exclusive_check_interval_secs: 60,
            escrow_poll_interval_secs: 10,
            escrow_poll_max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Per-chain parameters consumed by the timelock and verifier components.
///
/// Chains are keyed by string identifier because the destination side of a
/// swap may be a non-EVM chain without a numeric chain id.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    /// Average block time in seconds
    pub block_time_secs: u64,
    /// Confirmations required before state is treated as final
    pub finality_blocks: u64,
    pub gas_limits: GasLimits,
    pub enabled: bool,
}

/// Gas limits served to resolvers for each escrow operation
#[derive(Debug, Clone, Deserialize)]
pub struct GasLimits {
    pub deploy_escrow: u64,
    pub withdraw: u64,
    pub cancel: u64,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CROSSLOCK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (id, chain) in &self.chains {
            if chain.enabled {
                if chain.block_time_secs == 0 {
                    anyhow::bail!("Chain {} has zero block time", id);
                }
                if chain.finality_blocks == 0 {
                    anyhow::bail!("Chain {} has zero finality blocks", id);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainSpec)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Look up a chain's parameters; unknown chain ids fail loudly
    pub fn chain(&self, chain: &str) -> OrchestratorResult<&ChainSpec> {
        self.chains
            .get(chain)
            .filter(|c| c.enabled)
            .ok_or_else(|| OrchestratorError::ChainNotFound {
                chain: chain.to_string(),
            })
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
