//! Configuration management for the HTLC bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::Chain;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub timelock: TimelockConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub oracle: OracleConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub sweep_interval_ms: u64,
    pub health_check_interval_secs: u64,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_secs: u64,
}

/// Backoff policy for chain RPC calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
            timeout_ms: 30_000,
        }
    }
}

/// Timelock windows applied to every new swap, relative to creation time
#[derive(Debug, Clone, Deserialize)]
pub struct TimelockConfig {
    pub source_secs: u64,
    pub dest_secs: u64,
    /// Minimum gap between the two deadlines
    pub safety_margin_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL, or `memory://` for a volatile in-process store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    Fixed,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub kind: OracleKind,
    /// USD price per whole native unit, keyed by asset symbol (eth, trx, near)
    #[serde(default)]
    pub usd_prices: HashMap<String, String>,
    pub url: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: Chain,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    /// Environment variable holding this adapter's signing key
    pub signer_key_env: String,
    /// NEAR account that owns the signing key
    pub signer_account: Option<String>,
    /// Overrides the chain's default finality depth
    pub confirmation_blocks: Option<u64>,
    /// EIP-155 chain id for EVM networks
    pub evm_chain_id: Option<u64>,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: u64,
    /// TRON energy fee ceiling per call, in sun
    #[serde(default = "default_fee_limit")]
    pub fee_limit_sun: u64,
    /// Environment variable holding a TRON Pro API key
    pub api_key_env: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_block_range")]
    pub max_block_range: u64,
    /// First block to scan when no checkpoint exists
    pub start_block: Option<u64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

fn default_dedupe_window() -> u64 {
    3_600
}

fn default_oracle_timeout() -> u64 {
    5_000
}

fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_max_gas_price() -> u64 {
    200
}

fn default_fee_limit() -> u64 {
    100_000_000
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_block_range() -> u64 {
    500
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
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

        let mut seen = HashMap::new();
        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.contract_address.is_empty() {
                anyhow::bail!("Chain {} has no HTLC contract address", name);
            }
            if chain.chain == Chain::Near && chain.signer_account.is_none() {
                anyhow::bail!("Chain {} needs signer_account for NEAR", name);
            }
            if chain.chain == Chain::Ethereum && chain.evm_chain_id.is_none() {
                anyhow::bail!("Chain {} needs evm_chain_id", name);
            }
            if chain.max_block_range == 0 {
                anyhow::bail!("Chain {} max_block_range must be positive", name);
            }
            if let Some(other) = seen.insert(chain.chain, name) {
                anyhow::bail!(
                    "Chains {} and {} are both configured as {}",
                    other,
                    name,
                    chain.chain
                );
            }
        }

        let t = &self.timelock;
        if t.dest_secs == 0 {
            anyhow::bail!("timelock.dest_secs must be positive");
        }
        if t.source_secs <= t.dest_secs.saturating_add(t.safety_margin_secs) {
            anyhow::bail!(
                "timelock.source_secs ({}) must exceed dest_secs ({}) plus safety_margin_secs ({})",
                t.source_secs,
                t.dest_secs,
                t.safety_margin_secs
            );
        }

        if self.retry.timeout_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry settings are inconsistent");
        }

        match self.oracle.kind {
            OracleKind::Fixed => {
                for chain in self.enabled_chains().iter().map(|(_, c)| c.chain) {
                    if !self.oracle.usd_prices.contains_key(chain.native_asset()) {
                        anyhow::bail!(
                            "oracle.usd_prices has no price for {}",
                            chain.native_asset()
                        );
                    }
                }
            }
            OracleKind::Http => {
                if self.oracle.url.as_deref().unwrap_or_default().is_empty() {
                    anyhow::bail!("oracle.url is required for the http oracle");
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain
    pub fn get_chain(&self, chain: Chain) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.enabled && c.chain == chain)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
