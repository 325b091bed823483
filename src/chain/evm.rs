//! EVM adapter: HTLC calls over ethers JSON-RPC

use super::contract::{self, EscrowView, GET_CONTRACT, NEW_CONTRACT, REFUND, WITHDRAW};
use super::retry::with_backoff;
use super::units::{self, WEI_DECIMALS};
use super::{
    retry_label, Chain, ChainAdapter, ChainProvider, EscrowParams, EscrowRef, Settlement, TxRef,
};
use crate::config::{ChainConfig, RetryConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{topics, ChainEvent, HtlcLogParser};
use crate::secret::Secret;
use crate::tx::{ContractCall, TransactionSender};

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EvmAdapter {
    config: ChainConfig,
    provider: Arc<ChainProvider>,
    sender: TransactionSender,
    contract: Address,
    parser: HtlcLogParser,
    retry: RetryConfig,
}

impl EvmAdapter {
    pub async fn new(config: ChainConfig, retry: RetryConfig) -> RelayerResult<Self> {
        let contract: Address = config
            .contract_address
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid contract address: {}", e)))?;
        let provider = Arc::new(ChainProvider::new(config.clone())?);
        let sender = TransactionSender::new(provider.clone(), &config.signer_key_env, retry.clone())?;

        match provider.get_block_number().await {
            Ok(head) => info!("{} reachable at block {}", config.name, head),
            Err(e) => warn!("{} not reachable at startup: {}", config.name, e),
        }

        Ok(Self {
            config,
            provider,
            sender,
            contract,
            parser: HtlcLogParser::new(Chain::Ethereum, WEI_DECIMALS),
            retry,
        })
    }

    fn parse_address(&self, address: &str) -> RelayerResult<Address> {
        if !self.is_valid_address(address) {
            return Err(RelayerError::InvalidAddress {
                chain: Chain::Ethereum,
                address: address.to_string(),
            });
        }
        address.parse().map_err(|_| RelayerError::InvalidAddress {
            chain: Chain::Ethereum,
            address: address.to_string(),
        })
    }

    fn call(&self, label: &'static str, signature: &str, args: &[ethers::abi::Token], value: U256) -> ContractCall {
        ContractCall {
            label,
            to: self.contract,
            data: contract::calldata(signature, args).into(),
            value,
        }
    }

    /// Read an escrow through the `getContract` view
    async fn view(&self, contract_id: H256) -> RelayerResult<EscrowView> {
        let call = self.call("get_contract", GET_CONTRACT, &contract::id_args(contract_id), U256::zero());
        let output = with_backoff(
            &retry_label(Chain::Ethereum, "get_contract"),
            &self.retry,
            || self.sender.simulate(&call),
        )
        .await?;
        contract::decode_escrow_view(&output)
    }

    async fn existing_escrow(&self, escrow: &EscrowRef) -> RelayerResult<(H256, EscrowView)> {
        let id = contract::parse_contract_id(escrow.as_str())?;
        let view = self.view(id).await?;
        if !view.exists() {
            return Err(RelayerError::ChainRejection {
                chain: Chain::Ethereum,
                reason: format!("escrow {} does not exist", escrow),
            });
        }
        Ok((id, view))
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    fn signer_address(&self) -> String {
        format!("{:?}", self.sender.wallet_address())
    }

    fn finality_depth(&self) -> u64 {
        self.config
            .confirmation_blocks
            .unwrap_or_else(|| Chain::Ethereum.default_finality_depth())
    }

    async fn create_escrow(&self, params: &EscrowParams) -> RelayerResult<EscrowRef> {
        let receiver = self
            .parse_address(&params.beneficiary)
            .map_err(|e| e.into_escrow_creation(Chain::Ethereum))?;
        let amount = units::to_base_units(&params.amount, WEI_DECIMALS)
            .map_err(|e| RelayerError::EscrowCreationFailed {
                chain: Chain::Ethereum,
                reason: e.to_string(),
            })?;
        let timelock = params.timelock.timestamp().max(0) as u64;

        // The contract id is a pure function of the lock, so a retried
        // creation finds the escrow from the earlier attempt
        let expected_id = contract::derive_contract_id(
            self.sender.wallet_address(),
            receiver,
            amount,
            &params.hashlock,
            timelock,
        );
        if self.view(expected_id).await?.exists() {
            info!("Escrow {:?} already exists, reusing", expected_id);
            return Ok(EscrowRef::new(format!("{:?}", expected_id)));
        }

        let call = self.call(
            "create_escrow",
            NEW_CONTRACT,
            &contract::new_contract_args(receiver, &params.hashlock, timelock),
            amount,
        );
        let receipt = self
            .sender
            .submit(&call)
            .await
            .map_err(|e| e.into_escrow_creation(Chain::Ethereum))?;

        let contract_id = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract)
            .find(|log| log.topics.first() == Some(&*topics::HTLC_NEW))
            .and_then(|log| log.topics.get(1).copied())
            .unwrap_or(expected_id);

        info!(
            "Created escrow {:?} for {} wei in tx {:?}",
            contract_id, amount, receipt.transaction_hash
        );
        Ok(EscrowRef::new(format!("{:?}", contract_id)))
    }

    async fn complete_escrow(&self, escrow: &EscrowRef, secret: &Secret) -> RelayerResult<TxRef> {
        let (id, view) = self.existing_escrow(escrow).await?;
        if view.withdrawn {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if view.refunded {
            return Ok(TxRef::AlreadySettled(Settlement::Refunded));
        }

        let call = self.call("complete_escrow", WITHDRAW, &contract::withdraw_args(id, secret), U256::zero());
        let receipt = self.sender.submit(&call).await?;
        Ok(TxRef::Submitted(format!("{:?}", receipt.transaction_hash)))
    }

    async fn revealed_secret(&self, escrow: &EscrowRef) -> RelayerResult<Option<Secret>> {
        let (_, view) = self.existing_escrow(escrow).await?;
        Ok(view.revealed())
    }

    async fn refund_escrow(&self, escrow: &EscrowRef) -> RelayerResult<TxRef> {
        let (id, view) = self.existing_escrow(escrow).await?;
        if view.withdrawn {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if view.refunded {
            return Ok(TxRef::AlreadySettled(Settlement::Refunded));
        }

        let call = self.call("refund_escrow", REFUND, &contract::id_args(id), U256::zero());
        let receipt = self.sender.submit(&call).await.map_err(|e| match e {
            RelayerError::TimelockNotExpired { chain, .. } => RelayerError::TimelockNotExpired {
                chain,
                escrow_ref: escrow.to_string(),
            },
            other => other,
        })?;
        Ok(TxRef::Submitted(format!("{:?}", receipt.transaction_hash)))
    }

    async fn latest_height(&self) -> RelayerResult<u64> {
        with_backoff(
            &retry_label(Chain::Ethereum, "latest_height"),
            &self.retry,
            || self.provider.get_block_number(),
        )
        .await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from)
            .to_block(to)
            .topic0(vec![
                *topics::HTLC_NEW,
                *topics::HTLC_WITHDRAW,
                *topics::HTLC_REFUND,
            ]);

        let logs = with_backoff(
            &retry_label(Chain::Ethereum, "get_logs"),
            &self.retry,
            || self.provider.get_logs(&filter),
        )
        .await?;

        let mut events = Vec::new();
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            let Some(block) = log.block_number else {
                continue;
            };
            let tx_ref = log
                .transaction_hash
                .map(|h| format!("{:?}", h))
                .unwrap_or_default();
            match self.parser.parse(&log.topics, &log.data, block.as_u64(), tx_ref) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Skipping undecodable HTLC log at block {}: {}", block, e),
            }
        }

        debug!("{} HTLC events in blocks {}..={}", events.len(), from, to);
        Ok(events)
    }

    async fn get_balance(&self, address: &str) -> RelayerResult<String> {
        let address = self.parse_address(address)?;
        let wei = with_backoff(
            &retry_label(Chain::Ethereum, "get_balance"),
            &self.retry,
            || self.sender.get_balance(address),
        )
        .await?;
        units::from_base_units(wei, WEI_DECIMALS)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        is_evm_address(address)
    }
}

/// `0x` followed by 40 hex digits
pub fn is_evm_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_evm_addresses() {
        assert!(is_evm_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_evm_address("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_evm_address("0x1234"));
        assert!(!is_evm_address("0xg39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_evm_address("TLsV52sRDL79HXGGm9yzwKibb6BeruhUzy"));
    }
}
