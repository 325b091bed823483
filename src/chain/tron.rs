//! TRON adapter: the Solidity HTLC driven through the TRON HTTP API
//!
//! Transactions are built by the node (`triggersmartcontract`), signed
//! locally over their `txID` with secp256k1, and broadcast. Events come from
//! `gettransactioninfobyblocknum`, whose logs use the EVM layout.

use super::contract::{self, EscrowView, GET_CONTRACT, NEW_CONTRACT, REFUND, WITHDRAW};
use super::http::HttpEndpoint;
use super::retry::with_backoff;
use super::units::{self, SUN_DECIMALS};
use super::{
    classify_rejection, retry_label, Chain, ChainAdapter, EscrowParams, EscrowRef, Settlement,
    TxRef,
};
use crate::config::{ChainConfig, RetryConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{topics, ChainEvent, HtlcLogParser};
use crate::secret::Secret;
use crate::tx::load_wallet;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Version byte of mainnet and testnet TRON addresses
const ADDRESS_PREFIX: u8 = 0x41;
/// Parallel block fetches during a scan
const SCAN_CONCURRENCY: usize = 8;
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);

/// Decode a base58check TRON address into its 20-byte EVM form
pub fn decode_address(address: &str) -> Option<Address> {
    let bytes = bs58::decode(address).with_check(None).into_vec().ok()?;
    if bytes.len() != 21 || bytes[0] != ADDRESS_PREFIX {
        return None;
    }
    Some(Address::from_slice(&bytes[1..]))
}

/// Encode a 20-byte address as base58check with the TRON prefix
pub fn encode_address(address: Address) -> String {
    let mut bytes = Vec::with_capacity(21);
    bytes.push(ADDRESS_PREFIX);
    bytes.extend_from_slice(address.as_bytes());
    bs58::encode(bytes).with_check().into_string()
}

/// `41` + 20 bytes, the hex form the HTTP API takes with `visible: false`
fn hex_address(address: Address) -> String {
    format!("{:02x}{}", ADDRESS_PREFIX, hex::encode(address.as_bytes()))
}

/// Node messages are hex-encoded UTF-8
fn decode_message(message: &str) -> String {
    hex::decode(message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| message.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiResult {
    result: bool,
    code: Option<String>,
    message: Option<String>,
}

impl ApiResult {
    fn reason(&self) -> String {
        let message = self.message.as_deref().map(decode_message).unwrap_or_default();
        match &self.code {
            Some(code) => format!("{} {}", code, message).trim().to_string(),
            None => message,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TriggerResponse {
    result: ApiResult,
    transaction: Option<Value>,
    constant_result: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BroadcastResponse {
    result: bool,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TxLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TxReceipt {
    result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TransactionInfo {
    id: String,
    #[serde(rename = "blockNumber")]
    block_number: u64,
    receipt: TxReceipt,
    #[serde(rename = "contractResult")]
    contract_result: Vec<String>,
    #[serde(rename = "resMessage")]
    res_message: Option<String>,
    log: Vec<TxLog>,
}

impl TransactionInfo {
    fn succeeded(&self) -> bool {
        matches!(self.receipt.result.as_deref(), None | Some("SUCCESS"))
    }

    fn failure_reason(&self) -> String {
        self.contract_result
            .first()
            .and_then(|r| hex::decode(r).ok())
            .and_then(|bytes| contract::decode_revert_reason(&bytes))
            .or_else(|| self.res_message.as_deref().map(decode_message))
            .unwrap_or_else(|| {
                format!("{} {}", self.receipt.result.as_deref().unwrap_or("FAILED"), self.id)
            })
    }
}

/// Thin client over the TRON full-node HTTP API
pub struct TronClient {
    http: HttpEndpoint,
}

impl TronClient {
    pub fn new(config: &ChainConfig, timeout: Duration) -> RelayerResult<Self> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .map(|key| ("tron-pro-api-key", key));
        Ok(Self {
            http: HttpEndpoint::new(Chain::Tron, &config.rpc_urls, timeout, api_key)?,
        })
    }

    pub async fn now_block(&self) -> RelayerResult<u64> {
        let block: Value = self.http.post("wallet/getnowblock", &json!({})).await?;
        block["block_header"]["raw_data"]["number"]
            .as_u64()
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Tron,
                message: "getnowblock without block number".into(),
            })
    }

    /// Balance in sun; unactivated accounts report zero
    pub async fn balance(&self, address: Address) -> RelayerResult<u128> {
        let account: Value = self
            .http
            .post(
                "wallet/getaccount",
                &json!({ "address": hex_address(address), "visible": false }),
            )
            .await?;
        Ok(account["balance"].as_u64().unwrap_or(0) as u128)
    }

    /// Read-only execution; returns the raw output or the classified revert
    pub async fn trigger_constant(
        &self,
        owner: Address,
        contract: Address,
        selector: &str,
        parameter: &[u8],
    ) -> RelayerResult<Vec<u8>> {
        let response: TriggerResponse = self
            .http
            .post(
                "wallet/triggerconstantcontract",
                &json!({
                    "owner_address": hex_address(owner),
                    "contract_address": hex_address(contract),
                    "function_selector": selector,
                    "parameter": hex::encode(parameter),
                    "visible": false,
                }),
            )
            .await?;

        let output = response
            .constant_result
            .first()
            .and_then(|r| hex::decode(r).ok())
            .unwrap_or_default();

        if !response.result.result {
            let reason = contract::decode_revert_reason(&output)
                .unwrap_or_else(|| response.result.reason());
            return Err(classify_rejection(Chain::Tron, None, &reason));
        }
        Ok(output)
    }

    /// Ask the node to build an unsigned contract call
    pub async fn trigger(
        &self,
        owner: Address,
        contract: Address,
        selector: &str,
        parameter: &[u8],
        call_value: u128,
        fee_limit: u64,
    ) -> RelayerResult<Value> {
        let response: TriggerResponse = self
            .http
            .post(
                "wallet/triggersmartcontract",
                &json!({
                    "owner_address": hex_address(owner),
                    "contract_address": hex_address(contract),
                    "function_selector": selector,
                    "parameter": hex::encode(parameter),
                    "call_value": call_value as u64,
                    "fee_limit": fee_limit,
                    "visible": false,
                }),
            )
            .await?;

        if !response.result.result {
            return Err(classify_rejection(Chain::Tron, None, &response.result.reason()));
        }
        response.transaction.ok_or_else(|| RelayerError::TransientRpc {
            chain: Chain::Tron,
            message: "triggersmartcontract returned no transaction".into(),
        })
    }

    /// Broadcast a signed transaction; duplicates count as accepted
    pub async fn broadcast(&self, signed: &Value) -> RelayerResult<()> {
        let response: BroadcastResponse = self.http.post("wallet/broadcasttransaction", signed).await?;
        if response.result {
            return Ok(());
        }
        let code = response.code.unwrap_or_default();
        let message = response.message.as_deref().map(decode_message).unwrap_or_default();
        match code.as_str() {
            "DUP_TRANSACTION_ERROR" => Ok(()),
            "SERVER_BUSY" | "NOT_ENOUGH_EFFECTIVE_CONNECTION" | "NO_CONNECTION" => {
                Err(RelayerError::TransientRpc {
                    chain: Chain::Tron,
                    message: format!("{} {}", code, message),
                })
            }
            _ => Err(classify_rejection(
                Chain::Tron,
                None,
                &format!("{} {}", code, message),
            )),
        }
    }

    /// `None` until the transaction is in a block
    async fn transaction_info(&self, tx_id: &str) -> RelayerResult<Option<TransactionInfo>> {
        let info: TransactionInfo = self
            .http
            .post("wallet/gettransactioninfobyid", &json!({ "value": tx_id }))
            .await?;
        Ok(if info.id.is_empty() { None } else { Some(info) })
    }

    async fn block_transactions(&self, number: u64) -> RelayerResult<Vec<TransactionInfo>> {
        let infos: Option<Vec<TransactionInfo>> = self
            .http
            .post("wallet/gettransactioninfobyblocknum", &json!({ "num": number }))
            .await?;
        Ok(infos.unwrap_or_default())
    }
}

pub struct TronAdapter {
    config: ChainConfig,
    client: TronClient,
    wallet: LocalWallet,
    contract: Address,
    parser: HtlcLogParser,
    retry: RetryConfig,
}

impl TronAdapter {
    pub fn new(config: ChainConfig, retry: RetryConfig) -> RelayerResult<Self> {
        let contract = decode_address(&config.contract_address).ok_or_else(|| {
            RelayerError::Config(format!("Invalid TRON contract address: {}", config.contract_address))
        })?;
        let wallet = load_wallet(&config.signer_key_env)?;
        let client = TronClient::new(&config, Duration::from_millis(retry.timeout_ms))?;

        info!(
            "TRON adapter for {} signing as {}",
            config.name,
            encode_address(wallet.address())
        );

        Ok(Self {
            config,
            client,
            wallet,
            contract,
            parser: HtlcLogParser::new(Chain::Tron, SUN_DECIMALS),
            retry,
        })
    }

    fn parse_address(&self, address: &str) -> RelayerResult<Address> {
        decode_address(address).ok_or_else(|| RelayerError::InvalidAddress {
            chain: Chain::Tron,
            address: address.to_string(),
        })
    }

    async fn view(&self, contract_id: H256) -> RelayerResult<EscrowView> {
        let parameter = contract::parameters(&contract::id_args(contract_id));
        let output = with_backoff(&retry_label(Chain::Tron, "get_contract"), &self.retry, || {
            self.client
                .trigger_constant(self.wallet.address(), self.contract, GET_CONTRACT, &parameter)
        })
        .await?;
        contract::decode_escrow_view(&output)
    }

    async fn existing_escrow(&self, escrow: &EscrowRef) -> RelayerResult<(H256, EscrowView)> {
        let id = contract::parse_contract_id(escrow.as_str())?;
        let view = self.view(id).await?;
        if !view.exists() {
            return Err(RelayerError::ChainRejection {
                chain: Chain::Tron,
                reason: format!("escrow {} does not exist", escrow),
            });
        }
        Ok((id, view))
    }

    /// Build, sign and broadcast a call, then wait for its execution result
    async fn execute(
        &self,
        label: &'static str,
        selector: &str,
        args: &[Token],
        call_value: u128,
    ) -> RelayerResult<TransactionInfo> {
        let parameter = contract::parameters(args);
        let retry_name = retry_label(Chain::Tron, label);

        let mut transaction = with_backoff(&retry_name, &self.retry, || {
            self.client.trigger(
                self.wallet.address(),
                self.contract,
                selector,
                &parameter,
                call_value,
                self.config.fee_limit_sun,
            )
        })
        .await?;

        let tx_id = transaction["txID"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Tron,
                message: "transaction without txID".into(),
            })?;
        let digest = hex::decode(&tx_id)
            .ok()
            .filter(|b| b.len() == 32)
            .map(|b| H256::from_slice(&b))
            .ok_or_else(|| RelayerError::EventParsing(format!("bad txID {}", tx_id)))?;

        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        transaction["signature"] = json!([hex::encode(signature.to_vec())]);

        with_backoff(&retry_name, &self.retry, || self.client.broadcast(&transaction)).await?;
        crate::metrics::record_tx_submitted(Chain::Tron, label);
        info!("TRON {} broadcast: {}", label, tx_id);

        self.wait_for_info(&tx_id).await
    }

    async fn wait_for_info(&self, tx_id: &str) -> RelayerResult<TransactionInfo> {
        let deadline = Instant::now() + CONFIRM_TIMEOUT;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(500));

        loop {
            match self.client.transaction_info(tx_id).await {
                Ok(Some(info)) if info.succeeded() => return Ok(info),
                Ok(Some(info)) => {
                    return Err(classify_rejection(Chain::Tron, None, &info.failure_reason()))
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => debug!("TRON info poll failed: {}", e),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("TRON transaction {}", tx_id),
                });
            }
            sleep(poll).await;
        }
    }
}

#[async_trait]
impl ChainAdapter for TronAdapter {
    fn chain(&self) -> Chain {
        Chain::Tron
    }

    fn signer_address(&self) -> String {
        encode_address(self.wallet.address())
    }

    fn finality_depth(&self) -> u64 {
        self.config
            .confirmation_blocks
            .unwrap_or_else(|| Chain::Tron.default_finality_depth())
    }

    async fn create_escrow(&self, params: &EscrowParams) -> RelayerResult<EscrowRef> {
        let receiver = self
            .parse_address(&params.beneficiary)
            .map_err(|e| e.into_escrow_creation(Chain::Tron))?;
        let sun = units::to_base_u128(&params.amount, SUN_DECIMALS).map_err(|e| {
            RelayerError::EscrowCreationFailed {
                chain: Chain::Tron,
                reason: e.to_string(),
            }
        })?;
        let timelock = params.timelock.timestamp().max(0) as u64;

        let expected_id = contract::derive_contract_id(
            self.wallet.address(),
            receiver,
            U256::from(sun),
            &params.hashlock,
            timelock,
        );
        if self.view(expected_id).await?.exists() {
            info!("TRON escrow {:?} already exists, reusing", expected_id);
            return Ok(EscrowRef::new(format!("{:?}", expected_id)));
        }

        let info = self
            .execute(
                "create_escrow",
                NEW_CONTRACT,
                &contract::new_contract_args(receiver, &params.hashlock, timelock),
                sun,
            )
            .await
            .map_err(|e| e.into_escrow_creation(Chain::Tron))?;

        let contract_id = info
            .contract_result
            .first()
            .and_then(|r| hex::decode(r).ok())
            .and_then(|bytes| contract::decode_contract_id(&bytes).ok())
            .unwrap_or(expected_id);

        info!("Created TRON escrow {:?} for {} sun", contract_id, sun);
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

        let info = self
            .execute("complete_escrow", WITHDRAW, &contract::withdraw_args(id, secret), 0)
            .await?;
        Ok(TxRef::Submitted(info.id))
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

        let with_ref = |e: RelayerError| match e {
            RelayerError::TimelockNotExpired { chain, .. } => RelayerError::TimelockNotExpired {
                chain,
                escrow_ref: escrow.to_string(),
            },
            other => other,
        };

        // Simulate first so an early refund costs no energy
        let parameter = contract::parameters(&contract::id_args(id));
        self.client
            .trigger_constant(self.wallet.address(), self.contract, REFUND, &parameter)
            .await
            .map_err(with_ref)?;

        let info = self
            .execute("refund_escrow", REFUND, &contract::id_args(id), 0)
            .await
            .map_err(with_ref)?;
        Ok(TxRef::Submitted(info.id))
    }

    async fn latest_height(&self) -> RelayerResult<u64> {
        with_backoff(&retry_label(Chain::Tron, "latest_height"), &self.retry, || {
            self.client.now_block()
        })
        .await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let label = retry_label(Chain::Tron, "block_transactions");
        let blocks: Vec<Vec<TransactionInfo>> = futures::stream::iter(from..=to)
            .map(|number| {
                let label = label.clone();
                async move {
                    with_backoff(&label, &self.retry, || self.client.block_transactions(number))
                        .await
                }
            })
            .buffered(SCAN_CONCURRENCY)
            .try_collect()
            .await?;

        let contract_hex = hex::encode(self.contract.as_bytes());
        let mut events = Vec::new();

        for info in blocks.into_iter().flatten() {
            if !info.succeeded() {
                continue;
            }
            for log in &info.log {
                if !log.address.eq_ignore_ascii_case(&contract_hex)
                    && !log.address.eq_ignore_ascii_case(&format!("41{}", contract_hex))
                {
                    continue;
                }
                let log_topics: Vec<H256> = log
                    .topics
                    .iter()
                    .filter_map(|t| hex::decode(t).ok())
                    .filter(|b| b.len() == 32)
                    .map(|b| H256::from_slice(&b))
                    .collect();
                if log_topics.first().map_or(true, |t| {
                    *t != *topics::HTLC_NEW
                        && *t != *topics::HTLC_WITHDRAW
                        && *t != *topics::HTLC_REFUND
                }) {
                    continue;
                }
                let data = hex::decode(&log.data).unwrap_or_default();
                match self
                    .parser
                    .parse(&log_topics, &data, info.block_number, info.id.clone())
                {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping undecodable TRON log in {}: {}", info.id, e),
                }
            }
        }

        debug!("{} TRON HTLC events in blocks {}..={}", events.len(), from, to);
        Ok(events)
    }

    async fn get_balance(&self, address: &str) -> RelayerResult<String> {
        let address = self.parse_address(address)?;
        let sun = with_backoff(&retry_label(Chain::Tron, "get_balance"), &self.retry, || {
            self.client.balance(address)
        })
        .await?;
        units::from_base_u128(sun, SUN_DECIMALS)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        decode_address(address).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // USDT contract on TRON mainnet
    const USDT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn base58_round_trip() {
        let address = decode_address(USDT).unwrap();
        assert_eq!(
            hex::encode(address.as_bytes()),
            "a614f803b6fd780986a42c78ec9c7f77e6ded13c"
        );
        assert_eq!(encode_address(address), USDT);
        assert_eq!(hex_address(address), "41a614f803b6fd780986a42c78ec9c7f77e6ded13c");
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(decode_address("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u").is_none());
        assert!(decode_address("0xa614f803b6fd780986a42c78ec9c7f77e6ded13c").is_none());
        assert!(decode_address("").is_none());
    }

    #[test]
    fn decodes_hex_messages() {
        assert_eq!(decode_message("4f4b"), "OK");
        assert_eq!(decode_message("not hex"), "not hex");
    }

    #[test]
    fn failed_info_exposes_revert_reason() {
        let mut payload = ethers::utils::id("Error(string)").to_vec();
        payload.extend(ethers::abi::encode(&[Token::String(
            "refundable: timelock not yet passed".into(),
        )]));
        let info: TransactionInfo = serde_json::from_value(json!({
            "id": "ab",
            "blockNumber": 10,
            "receipt": { "result": "REVERT" },
            "contractResult": [hex::encode(payload)],
        }))
        .unwrap();
        assert!(!info.succeeded());
        assert!(matches!(
            classify_rejection(Chain::Tron, None, &info.failure_reason()),
            RelayerError::TimelockNotExpired { .. }
        ));
    }
}
