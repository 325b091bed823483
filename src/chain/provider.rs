//! EVM provider with multi-RPC support and automatic failover

use super::{classify_rejection, Chain};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Config(format!(
                "No valid RPC providers for {}",
                config.name
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.name, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from {}: {}", self.config.name, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(self.rpc_error(last_error, "all providers failed to get block number"))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from {}: {}", self.config.name, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(self.rpc_error(last_error, "all providers failed to get logs"))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.map_provider_error(e))
    }

    /// Read-only call, also used to surface revert reasons before submitting
    pub async fn call(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        self.http()
            .call(tx, None)
            .await
            .map_err(|e| self.map_provider_error(e))
    }

    /// Estimate gas for a transaction; a revert surfaces as a rejection
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.map_provider_error(e))
    }

    pub async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| self.map_provider_error(e))
    }

    /// Pending-inclusive transaction count for an address
    pub async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.map_provider_error(e))
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| self.map_provider_error(e))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.map_provider_error(e))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.map_provider_error(e))?
            .ok_or_else(|| self.rpc_error(None, "no latest block"))?;

        let base_fee = block.base_fee_per_gas.ok_or_else(|| {
            RelayerError::Config(format!(
                "{} has no base fee; use gas_price_strategy = \"legacy\"",
                self.config.name
            ))
        })?;

        Ok(eip1559_fees(base_fee, self.config.max_gas_price_gwei))
    }

    /// EIP-155 chain id
    pub fn evm_chain_id(&self) -> u64 {
        self.config.evm_chain_id.unwrap_or(1)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Map a provider failure onto the error taxonomy: reverts and funding
    /// problems are permanent, everything else is transient
    pub fn map_provider_error(&self, err: ProviderError) -> RelayerError {
        let message = match &err {
            ProviderError::JsonRpcClientError(inner) => match inner.as_error_response() {
                Some(resp) => resp.message.clone(),
                None => inner.to_string(),
            },
            other => other.to_string(),
        };
        classify_provider_message(&message)
    }

    fn rpc_error(&self, err: Option<ProviderError>, context: &str) -> RelayerError {
        match err {
            Some(e) => self.map_provider_error(e),
            None => RelayerError::TransientRpc {
                chain: Chain::Ethereum,
                message: context.to_string(),
            },
        }
    }
}

fn classify_provider_message(message: &str) -> RelayerError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
        return RelayerError::RateLimited {
            chain: Chain::Ethereum,
        };
    }
    if lower.contains("revert")
        || lower.contains("insufficient funds")
        || lower.contains("nonce too low")
        || lower.contains("underpriced")
        || lower.contains("already known")
    {
        return classify_rejection(Chain::Ethereum, None, message);
    }
    RelayerError::TransientRpc {
        chain: Chain::Ethereum,
        message: message.to_string(),
    }
}

/// Max fee = 2 * base fee + 2 gwei tip, capped at the configured ceiling
fn eip1559_fees(base_fee: U256, max_gas_price_gwei: u64) -> (U256, U256) {
    let priority_fee = U256::from(2_000_000_000u64);
    let max_fee = base_fee * 2 + priority_fee;
    let cap = U256::from(max_gas_price_gwei) * U256::from(1_000_000_000u64);
    let max_fee = std::cmp::min(max_fee, cap);
    (max_fee, std::cmp::min(priority_fee, max_fee))
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
