//! Transaction sender with retry logic and receipt tracking

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::retry::backoff_delay;
use crate::chain::{Chain, ChainProvider, GasPrice};
use crate::config::RetryConfig;
use crate::error::{RelayerError, RelayerResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for a submitted transaction to be mined
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);

/// A state-changing call to the HTLC contract
#[derive(Debug, Clone)]
pub struct ContractCall {
    /// Operation name for logs and metrics
    pub label: &'static str,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// Signs and submits HTLC calls on one EVM chain
pub struct TransactionSender {
    /// Provider with failover
    provider: Arc<ChainProvider>,
    /// Nonce manager
    nonce_manager: NonceManager,
    /// Gas estimator
    gas_estimator: GasEstimator,
    /// Wallet for signing
    wallet: LocalWallet,
    /// Retry policy for submission
    retry: RetryConfig,
    /// Receipt polling interval
    poll_interval: Duration,
}

impl TransactionSender {
    /// Create a sender signing with the key held in `signer_key_env`
    pub fn new(
        provider: Arc<ChainProvider>,
        signer_key_env: &str,
        retry: RetryConfig,
    ) -> RelayerResult<Self> {
        let wallet = load_wallet(signer_key_env)?.with_chain_id(provider.evm_chain_id());
        let wallet_address = wallet.address();

        info!(
            "Transaction sender for {} initialized with wallet: {:?}",
            provider.config().name,
            wallet_address
        );

        let poll_interval = Duration::from_millis(provider.config().poll_interval_ms.max(250));

        Ok(Self {
            provider,
            nonce_manager: NonceManager::new(wallet_address),
            gas_estimator: GasEstimator::new(),
            wallet,
            retry,
            poll_interval,
        })
    }

    /// Get wallet address
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Execute a call read-only from the signer's address
    pub async fn simulate(&self, call: &ContractCall) -> RelayerResult<Bytes> {
        self.provider.call(&self.draft(call)).await
    }

    /// Submit a call and wait until it is mined successfully
    pub async fn submit(&self, call: &ContractCall) -> RelayerResult<TransactionReceipt> {
        let (tx_hash, nonce) = self.send_with_retry(call).await?;
        crate::metrics::record_tx_submitted(Chain::Ethereum, call.label);
        self.wait_for_receipt(call, tx_hash, nonce).await
    }

    /// Unsigned request used for simulation and gas estimation
    fn draft(&self, call: &ContractCall) -> TypedTransaction {
        TransactionRequest::new()
            .from(self.wallet.address())
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .into()
    }

    /// Build the signed-ready transaction
    fn build_tx(
        &self,
        call: &ContractCall,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let chain_id = self.provider.evm_chain_id();
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(self.wallet.address())
                .to(call.to)
                .data(call.data.clone())
                .value(call.value)
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(call.to)
                .data(call.data.clone())
                .value(call.value)
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Send transaction with retry logic
    async fn send_with_retry(&self, call: &ContractCall) -> RelayerResult<(H256, u64)> {
        let attempts = self.retry.max_retries.saturating_add(1);
        let label = crate::chain::retry_label(Chain::Ethereum, call.label);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.send_once(call).await {
                Ok(sent) => {
                    info!(
                        "Transaction sent: {:?} ({}, attempt {}/{})",
                        sent.0,
                        call.label,
                        attempt + 1,
                        attempts
                    );
                    return Ok(sent);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", label, attempt + 1, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                crate::metrics::record_rpc_retry(&label);
                sleep(backoff_delay(&self.retry, attempt)).await;
            }
        }

        Err(last_error.unwrap_or(RelayerError::Timeout {
            operation: format!("{} (retries exhausted)", label),
        }))
    }

    async fn send_once(&self, call: &ContractCall) -> RelayerResult<(H256, u64)> {
        let gas_limit = self
            .gas_estimator
            .estimate_gas(&self.provider, &self.draft(call))
            .await?;
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
        let nonce = self.nonce_manager.next_nonce(&self.provider).await?;

        let tx = self.build_tx(call, nonce, gas_limit, &gas_price);

        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to sign transaction: {}", e);
                self.nonce_manager.release(nonce).await;
                return Err(RelayerError::Wallet(e.to_string()));
            }
        };
        let local_hash = tx.hash(&signature);
        let raw = tx.rlp_signed(&signature);

        let send_timeout = Duration::from_millis(self.retry.timeout_ms);
        match timeout(send_timeout, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(tx_hash)) => {
                self.nonce_manager
                    .mark_pending(nonce, &format!("{:?}", tx_hash))
                    .await;
                Ok((tx_hash, nonce))
            }
            Ok(Err(e)) => {
                let message = e.to_string().to_ascii_lowercase();
                if message.contains("already known") {
                    debug!("Transaction {:?} already in mempool", local_hash);
                    self.nonce_manager
                        .mark_pending(nonce, &format!("{:?}", local_hash))
                        .await;
                    return Ok((local_hash, nonce));
                }

                self.nonce_manager.release(nonce).await;
                if message.contains("nonce") {
                    warn!("Nonce conflict, syncing before retry");
                    if let Err(sync_err) = self.nonce_manager.sync(&self.provider).await {
                        warn!("Nonce sync failed: {}", sync_err);
                    }
                }
                Err(e)
            }
            Err(_) => {
                // The node may have accepted it; the receipt wait decides
                warn!("Transaction send timeout, tracking {:?}", local_hash);
                self.nonce_manager
                    .mark_pending(nonce, &format!("{:?}", local_hash))
                    .await;
                Ok((local_hash, nonce))
            }
        }
    }

    async fn wait_for_receipt(
        &self,
        call: &ContractCall,
        tx_hash: H256,
        nonce: u64,
    ) -> RelayerResult<TransactionReceipt> {
        let deadline = Instant::now() + RECEIPT_TIMEOUT;

        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    self.nonce_manager.confirm(nonce).await;
                    if receipt.status == Some(U64::zero()) {
                        return Err(self.revert_reason(call, tx_hash).await);
                    }
                    debug!(
                        "Transaction {:?} mined in block {:?}",
                        tx_hash, receipt.block_number
                    );
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => debug!("Receipt poll failed: {}", e),
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                self.nonce_manager.release(nonce).await;
                if let Err(e) = self.nonce_manager.sync(&self.provider).await {
                    warn!("Nonce sync after receipt timeout failed: {}", e);
                }
                return Err(RelayerError::Timeout {
                    operation: format!("receipt of {:?}", tx_hash),
                });
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Replay a reverted call to recover the contract's reason
    async fn revert_reason(&self, call: &ContractCall, tx_hash: H256) -> RelayerError {
        match self.simulate(call).await {
            Err(e) if !e.is_retryable() => e,
            _ => RelayerError::ChainRejection {
                chain: Chain::Ethereum,
                reason: format!("transaction {:?} reverted", tx_hash),
            },
        }
    }

    pub async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        self.provider.get_balance(address).await
    }
}

/// Load a secp256k1 key from the named environment variable
pub fn load_wallet(signer_key_env: &str) -> RelayerResult<LocalWallet> {
    let key = std::env::var(signer_key_env).map_err(|_| {
        RelayerError::Wallet(format!("No wallet configured. Set {}", signer_key_env))
    })?;
    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key in {}: {}", signer_key_env, e)))
}
