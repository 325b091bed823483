//! NEAR adapter: the `htlc-near` contract over NEAR JSON-RPC
//!
//! Calls are signed locally: the transaction is borsh-serialized, its
//! SHA-256 digest is signed with ed25519 and the signed form is sent through
//! `broadcast_tx_commit`. NEAR has no EVM-style logs, so events are recovered
//! by scanning chunk transactions addressed to the contract and checking
//! their execution status.

use super::http::HttpEndpoint;
use super::retry::with_backoff;
use super::units::{self, YOCTO_DECIMALS};
use super::{
    classify_rejection, retry_label, Chain, ChainAdapter, EscrowParams, EscrowRef, Settlement,
    TxRef,
};
use crate::config::{ChainConfig, RetryConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventKind};
use crate::secret::{Hashlock, Secret};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use borsh::BorshSerialize;
use ed25519_dalek::{Signer, SigningKey};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Gas attached to every HTLC call (30 TGas)
const CALL_GAS: u64 = 30_000_000_000_000;
const SCAN_CONCURRENCY: usize = 4;
/// Borsh variant index of `Action::FunctionCall`
const FUNCTION_CALL_TAG: u8 = 2;
const ED25519_TAG: u8 = 0;

#[derive(BorshSerialize)]
struct PublicKey {
    key_type: u8,
    data: [u8; 32],
}

#[derive(BorshSerialize)]
struct FunctionCallAction {
    method_name: String,
    args: Vec<u8>,
    gas: u64,
    deposit: u128,
}

/// Only function calls are ever sent
enum Action {
    FunctionCall(FunctionCallAction),
}

impl BorshSerialize for Action {
    fn serialize<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Action::FunctionCall(call) => {
                FUNCTION_CALL_TAG.serialize(writer)?;
                call.serialize(writer)
            }
        }
    }
}

#[derive(BorshSerialize)]
struct Transaction {
    signer_id: String,
    public_key: PublicKey,
    nonce: u64,
    receiver_id: String,
    block_hash: [u8; 32],
    actions: Vec<Action>,
}

#[derive(BorshSerialize)]
struct Signature {
    key_type: u8,
    data: [u8; 64],
}

#[derive(BorshSerialize)]
struct SignedTransaction {
    transaction: Transaction,
    signature: Signature,
}

/// Parse an `ed25519:<base58>` key holding either the 32-byte seed or the
/// 64-byte seed + public key pair
pub fn parse_secret_key(value: &str) -> RelayerResult<SigningKey> {
    let encoded = value
        .trim()
        .strip_prefix("ed25519:")
        .ok_or_else(|| RelayerError::Wallet("NEAR key must start with ed25519:".into()))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| RelayerError::Wallet(format!("Invalid NEAR key encoding: {}", e)))?;

    match bytes.len() {
        32 => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| RelayerError::Wallet("Invalid NEAR key length".into()))?;
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let pair: [u8; 64] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| RelayerError::Wallet("Invalid NEAR key length".into()))?;
            SigningKey::from_keypair_bytes(&pair)
                .map_err(|e| RelayerError::Wallet(format!("Inconsistent NEAR keypair: {}", e)))
        }
        n => Err(RelayerError::Wallet(format!("NEAR key has {} bytes", n))),
    }
}

/// Named accounts (`alice.near`) or 64-hex implicit accounts
pub fn is_valid_account_id(account: &str) -> bool {
    if account.len() < 2 || account.len() > 64 {
        return false;
    }
    let mut prev_separator = true;
    for c in account.chars() {
        let separator = matches!(c, '-' | '_' | '.');
        if separator {
            if prev_separator {
                return false;
            }
        } else if !(c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return false;
        }
        prev_separator = separator;
    }
    !prev_separator
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cause: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcErrorBody {
    fn cause_name(&self) -> &str {
        self.cause
            .as_ref()
            .and_then(|c| c["name"].as_str())
            .unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!(
            "{} {} {}",
            self.cause_name(),
            self.message.as_deref().unwrap_or_default(),
            self.data
                .as_ref()
                .or(self.cause.as_ref())
                .map(|v| v.to_string())
                .unwrap_or_default()
        )
    }

    fn is_unknown(&self) -> bool {
        matches!(
            self.cause_name(),
            "UNKNOWN_BLOCK" | "UNKNOWN_CHUNK" | "UNKNOWN_TRANSACTION" | "UNAVAILABLE_SHARD"
        )
    }

    fn into_error(self) -> RelayerError {
        if self.name.as_deref() == Some("TIMEOUT_ERROR") || self.cause_name() == "TIMEOUT_ERROR" {
            return RelayerError::Timeout {
                operation: "NEAR RPC".into(),
            };
        }
        if self.name.as_deref() == Some("INTERNAL_ERROR") {
            return RelayerError::TransientRpc {
                chain: Chain::Near,
                message: self.describe(),
            };
        }
        classify_rejection(Chain::Near, None, &self.describe())
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// Outcome of an executed NEAR transaction
#[derive(Debug, Clone)]
pub struct Outcome {
    pub tx_hash: String,
    /// Decoded `SuccessValue`; `None` when execution failed
    pub success_value: Option<Vec<u8>>,
    pub failure: Option<String>,
}

impl Outcome {
    fn from_value(value: &Value) -> RelayerResult<Self> {
        let tx_hash = value["transaction"]["hash"]
            .as_str()
            .or_else(|| value["transaction_outcome"]["id"].as_str())
            .unwrap_or_default()
            .to_string();
        let status = &value["status"];

        if let Some(encoded) = status["SuccessValue"].as_str() {
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| RelayerError::EventParsing(format!("SuccessValue: {}", e)))?;
            return Ok(Self {
                tx_hash,
                success_value: Some(bytes),
                failure: None,
            });
        }
        if status.get("Failure").is_some() {
            return Ok(Self {
                tx_hash,
                success_value: None,
                failure: Some(status["Failure"].to_string()),
            });
        }
        Err(RelayerError::TransientRpc {
            chain: Chain::Near,
            message: format!("transaction {} not finished: {}", tx_hash, status),
        })
    }
}

/// Client for the NEAR JSON-RPC API
pub struct NearRpc {
    http: HttpEndpoint,
}

impl NearRpc {
    pub fn new(urls: &[String], timeout: Duration) -> RelayerResult<Self> {
        Ok(Self {
            http: HttpEndpoint::new(Chain::Near, urls, timeout, None)?,
        })
    }

    /// `Ok(None)` when the node reports the item as unknown
    async fn call_optional(&self, method: &str, params: Value) -> RelayerResult<Option<Value>> {
        let response: RpcResponse = self
            .http
            .post(
                "",
                &json!({ "jsonrpc": "2.0", "id": "htlc-bridge", "method": method, "params": params }),
            )
            .await?;

        match (response.result, response.error) {
            (_, Some(err)) if err.is_unknown() => Ok(None),
            (_, Some(err)) => Err(err.into_error()),
            (Some(result), None) => Ok(Some(result)),
            (None, None) => Err(RelayerError::TransientRpc {
                chain: Chain::Near,
                message: format!("{} returned neither result nor error", method),
            }),
        }
    }

    async fn call(&self, method: &str, params: Value) -> RelayerResult<Value> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Near,
                message: format!("{} returned an unknown item", method),
            })
    }

    pub async fn final_height(&self) -> RelayerResult<u64> {
        let block = self.call("block", json!({ "finality": "optimistic" })).await?;
        block["header"]["height"]
            .as_u64()
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Near,
                message: "block without height".into(),
            })
    }

    /// Current access key nonce and a recent final block hash
    async fn access_key(&self, account: &str, public_key: &str) -> RelayerResult<(u64, [u8; 32])> {
        let result = self
            .call(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account,
                    "public_key": public_key,
                }),
            )
            .await?;
        if let Some(error) = result["error"].as_str() {
            return Err(RelayerError::Wallet(format!("access key {}: {}", public_key, error)));
        }

        let nonce = result["nonce"].as_u64().unwrap_or(0);
        let hash = result["block_hash"]
            .as_str()
            .and_then(|h| bs58::decode(h).into_vec().ok())
            .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Near,
                message: "view_access_key without block hash".into(),
            })?;
        Ok((nonce, hash))
    }

    /// Balance in yoctoNEAR
    pub async fn balance(&self, account: &str) -> RelayerResult<u128> {
        let result = self
            .call(
                "query",
                json!({
                    "request_type": "view_account",
                    "finality": "final",
                    "account_id": account,
                }),
            )
            .await?;
        result["amount"]
            .as_str()
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| RelayerError::TransientRpc {
                chain: Chain::Near,
                message: format!("view_account {} without amount", account),
            })
    }

    /// Execute a view method and return its raw result bytes
    pub async fn view(&self, contract: &str, method: &str, args: &Value) -> RelayerResult<Vec<u8>> {
        let result = self
            .call(
                "query",
                json!({
                    "request_type": "call_function",
                    "finality": "final",
                    "account_id": contract,
                    "method_name": method,
                    "args_base64": BASE64.encode(args.to_string()),
                }),
            )
            .await?;
        if let Some(error) = result["error"].as_str() {
            return Err(classify_rejection(Chain::Near, None, error));
        }
        let bytes = result["result"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|b| b.as_u64().map(|b| b as u8)).collect())
            .unwrap_or_default();
        Ok(bytes)
    }

    async fn block(&self, height: u64) -> RelayerResult<Option<Value>> {
        self.call_optional("block", json!({ "block_id": height })).await
    }

    async fn chunk(&self, chunk_hash: &str) -> RelayerResult<Option<Value>> {
        self.call_optional("chunk", json!({ "chunk_id": chunk_hash })).await
    }

    async fn tx_status(&self, tx_hash: &str, signer: &str) -> RelayerResult<Option<Outcome>> {
        match self.call_optional("tx", json!([tx_hash, signer])).await? {
            Some(value) => Outcome::from_value(&value).map(Some),
            None => Ok(None),
        }
    }

    async fn broadcast_commit(&self, signed_base64: &str) -> RelayerResult<Outcome> {
        let value = self
            .call("broadcast_tx_commit", json!([signed_base64]))
            .await?;
        Outcome::from_value(&value)
    }
}

/// `get_contract` tuple: (sender, receiver, amount, hashlock hex, timelock ms,
/// withdrawn, refunded, eth address)
type HtlcView = (String, String, String, String, u64, bool, bool, String);

pub struct NearAdapter {
    config: ChainConfig,
    rpc: NearRpc,
    account_id: String,
    signing_key: SigningKey,
    public_key: String,
    /// Highest nonce this process has signed with
    last_nonce: Mutex<u64>,
    retry: RetryConfig,
}

impl NearAdapter {
    pub fn new(config: ChainConfig, retry: RetryConfig) -> RelayerResult<Self> {
        let account_id = config
            .signer_account
            .clone()
            .ok_or_else(|| RelayerError::Config("NEAR chain requires signer_account".into()))?;
        let key = std::env::var(&config.signer_key_env).map_err(|_| {
            RelayerError::Wallet(format!("No wallet configured. Set {}", config.signer_key_env))
        })?;
        let signing_key = parse_secret_key(&key)?;
        let public_key = format!(
            "ed25519:{}",
            bs58::encode(signing_key.verifying_key().to_bytes()).into_string()
        );
        let rpc = NearRpc::new(&config.rpc_urls, Duration::from_millis(retry.timeout_ms))?;

        info!("NEAR adapter for {} signing as {} ({})", config.name, account_id, public_key);

        Ok(Self {
            config,
            rpc,
            account_id,
            signing_key,
            public_key,
            last_nonce: Mutex::new(0),
            retry,
        })
    }

    fn contract(&self) -> &str {
        &self.config.contract_address
    }

    async fn get_contract(&self, contract_id: &str) -> RelayerResult<Option<HtlcView>> {
        let args = json!({ "contract_id": contract_id });
        let bytes = with_backoff(&retry_label(Chain::Near, "get_contract"), &self.retry, || {
            self.rpc.view(self.contract(), "get_contract", &args)
        })
        .await?;
        serde_json::from_slice::<Option<HtlcView>>(&bytes)
            .map_err(|e| RelayerError::EventParsing(format!("get_contract result: {}", e)))
    }

    async fn existing_escrow(&self, escrow: &EscrowRef) -> RelayerResult<HtlcView> {
        self.get_contract(escrow.as_str())
            .await?
            .ok_or_else(|| RelayerError::ChainRejection {
                chain: Chain::Near,
                reason: format!("escrow {} does not exist", escrow),
            })
    }

    /// Escrow left by an earlier attempt at the same lock. Contract ids embed
    /// the block timestamp, so a retry has to search by hashlock.
    async fn find_existing(&self, params: &EscrowParams, deposit: u128) -> RelayerResult<Option<EscrowRef>> {
        let args = json!({});
        let bytes = with_backoff(&retry_label(Chain::Near, "get_all_contracts"), &self.retry, || {
            self.rpc.view(self.contract(), "get_all_contracts", &args)
        })
        .await?;
        let all: Vec<(String, HtlcView)> = serde_json::from_slice(&bytes)
            .map_err(|e| RelayerError::EventParsing(format!("get_all_contracts result: {}", e)))?;
        Ok(matching_escrow(&all, &self.account_id, params, deposit))
    }

    /// Sign a single function call with a fresh nonce
    async fn sign_call(
        &self,
        method: &str,
        args: &Value,
        deposit: u128,
    ) -> RelayerResult<(String, String)> {
        let (chain_nonce, block_hash) = with_backoff(
            &retry_label(Chain::Near, "access_key"),
            &self.retry,
            || self.rpc.access_key(&self.account_id, &self.public_key),
        )
        .await?;

        let nonce = {
            let mut last = self.last_nonce.lock().await;
            let next = chain_nonce.max(*last) + 1;
            *last = next;
            next
        };

        let transaction = Transaction {
            signer_id: self.account_id.clone(),
            public_key: PublicKey {
                key_type: ED25519_TAG,
                data: self.signing_key.verifying_key().to_bytes(),
            },
            nonce,
            receiver_id: self.contract().to_string(),
            block_hash,
            actions: vec![Action::FunctionCall(FunctionCallAction {
                method_name: method.to_string(),
                args: args.to_string().into_bytes(),
                gas: CALL_GAS,
                deposit,
            })],
        };

        let encoded = borsh::to_vec(&transaction)
            .map_err(|e| RelayerError::Internal(format!("borsh transaction: {}", e)))?;
        let digest = Sha256::digest(&encoded);
        let signature = self.signing_key.sign(&digest);
        let tx_hash = bs58::encode(digest).into_string();

        let signed = SignedTransaction {
            transaction,
            signature: Signature {
                key_type: ED25519_TAG,
                data: signature.to_bytes(),
            },
        };
        let signed_bytes = borsh::to_vec(&signed)
            .map_err(|e| RelayerError::Internal(format!("borsh signed transaction: {}", e)))?;

        Ok((BASE64.encode(signed_bytes), tx_hash))
    }

    /// Sign, broadcast and wait for execution of one contract call
    async fn execute(
        &self,
        label: &'static str,
        method: &str,
        args: Value,
        deposit: u128,
    ) -> RelayerResult<Outcome> {
        let retry_name = retry_label(Chain::Near, label);
        let attempts = self.retry.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let (signed, tx_hash) = self.sign_call(method, &args, deposit).await?;

            // Resending identical bytes is idempotent on NEAR
            let result = with_backoff(&retry_name, &self.retry, || {
                self.rpc.broadcast_commit(&signed)
            })
            .await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if e.is_retryable() => {
                    // An earlier broadcast may have landed before the error
                    if let Ok(Some(outcome)) = self.rpc.tx_status(&tx_hash, &self.account_id).await {
                        outcome
                    } else {
                        warn!("{} attempt {} failed: {}", retry_name, attempt + 1, e);
                        last_error = Some(e);
                        continue;
                    }
                }
                Err(e) => return Err(e),
            };

            crate::metrics::record_tx_submitted(Chain::Near, label);
            if let Some(failure) = &outcome.failure {
                return Err(classify_rejection(Chain::Near, None, failure));
            }
            info!("NEAR {} executed: {}", method, outcome.tx_hash);
            return Ok(outcome);
        }

        Err(last_error.unwrap_or(RelayerError::Timeout {
            operation: retry_name,
        }))
    }

    /// Events carried by one chunk transaction
    async fn transaction_event(&self, tx: &Value, height: u64) -> RelayerResult<Option<ChainEvent>> {
        if tx["receiver_id"].as_str() != Some(self.contract()) {
            return Ok(None);
        }
        let Some(call) = tx["actions"]
            .as_array()
            .and_then(|actions| actions.iter().find_map(|a| a.get("FunctionCall")))
        else {
            return Ok(None);
        };
        let method = call["method_name"].as_str().unwrap_or_default();
        if !matches!(method, "create_htlc" | "withdraw" | "refund") {
            return Ok(None);
        }

        let tx_hash = tx["hash"].as_str().unwrap_or_default().to_string();
        let signer = tx["signer_id"].as_str().unwrap_or_default();
        let args: Value = call["args"]
            .as_str()
            .and_then(|a| BASE64.decode(a).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or(Value::Null);

        let outcome = with_backoff(&retry_label(Chain::Near, "tx_status"), &self.retry, || {
            self.rpc.tx_status(&tx_hash, signer)
        })
        .await?;
        let Some(success) = outcome.and_then(|o| o.success_value) else {
            return Ok(None);
        };

        let event = decode_call_event(method, &args, call, &success, height, tx_hash);
        if event.is_none() {
            debug!("Ignoring malformed {} call at height {}", method, height);
        }
        Ok(event)
    }

    async fn block_events(&self, height: u64) -> RelayerResult<Vec<ChainEvent>> {
        let Some(block) = self.rpc.block(height).await? else {
            // Skipped height
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let chunks = block["chunks"].as_array().cloned().unwrap_or_default();
        for chunk_header in chunks {
            if chunk_header["height_included"].as_u64() != Some(height) {
                continue;
            }
            let Some(hash) = chunk_header["chunk_hash"].as_str() else {
                continue;
            };
            let Some(chunk) = self.rpc.chunk(hash).await? else {
                continue;
            };
            for tx in chunk["transactions"].as_array().into_iter().flatten() {
                if let Some(event) = self.transaction_event(tx, height).await? {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }
}

/// Build the event for a successful HTLC call from its arguments and result
fn matching_escrow(
    all: &[(String, HtlcView)],
    sender: &str,
    params: &EscrowParams,
    deposit: u128,
) -> Option<EscrowRef> {
    let hashlock = hex::encode(params.hashlock.as_bytes());
    let deposit = deposit.to_string();
    all.iter()
        .find(|(_, view)| {
            view.0 == sender
                && view.1 == params.beneficiary
                && view.2 == deposit
                && view.3.eq_ignore_ascii_case(&hashlock)
                && !view.6
        })
        .map(|(id, _)| EscrowRef::new(id.clone()))
}

fn decode_call_event(
    method: &str,
    args: &Value,
    call: &Value,
    success_value: &[u8],
    height: u64,
    tx_ref: String,
) -> Option<ChainEvent> {
    let mut event = ChainEvent {
        chain: Chain::Near,
        escrow_ref: EscrowRef::new(""),
        kind: EventKind::EscrowCreated,
        block_height: height,
        tx_ref,
        amount: None,
        hashlock: None,
        secret: None,
    };

    match method {
        "create_htlc" => {
            let contract_id: String = serde_json::from_slice(success_value).ok()?;
            let hashlock = args["hashlock"]
                .as_str()
                .and_then(|h| BASE64.decode(h).ok())
                .and_then(|b| Hashlock::from_slice(&b).ok())?;
            let deposit: u128 = call["deposit"]
                .as_str()
                .map(str::to_string)
                .or_else(|| call["deposit"].as_u64().map(|d| d.to_string()))?
                .parse()
                .ok()?;
            event.escrow_ref = EscrowRef::new(contract_id);
            event.hashlock = Some(hashlock);
            event.amount = units::from_base_u128(deposit, YOCTO_DECIMALS).ok();
        }
        "withdraw" => {
            let secret = args["preimage"]
                .as_str()
                .and_then(|p| BASE64.decode(p).ok())
                .and_then(|b| Secret::from_slice(&b).ok())?;
            event.escrow_ref = EscrowRef::new(args["contract_id"].as_str()?);
            event.kind = EventKind::Completed;
            event.hashlock = Some(secret.hashlock());
            event.secret = Some(secret);
        }
        "refund" => {
            event.escrow_ref = EscrowRef::new(args["contract_id"].as_str()?);
            event.kind = EventKind::Refunded;
        }
        _ => return None,
    }
    Some(event)
}

#[async_trait]
impl ChainAdapter for NearAdapter {
    fn chain(&self) -> Chain {
        Chain::Near
    }

    fn signer_address(&self) -> String {
        self.account_id.clone()
    }

    fn finality_depth(&self) -> u64 {
        self.config
            .confirmation_blocks
            .unwrap_or_else(|| Chain::Near.default_finality_depth())
    }

    async fn create_escrow(&self, params: &EscrowParams) -> RelayerResult<EscrowRef> {
        if !self.is_valid_address(&params.beneficiary) {
            return Err(RelayerError::EscrowCreationFailed {
                chain: Chain::Near,
                reason: format!("invalid receiver {}", params.beneficiary),
            });
        }
        let deposit = units::to_base_u128(&params.amount, YOCTO_DECIMALS).map_err(|e| {
            RelayerError::EscrowCreationFailed {
                chain: Chain::Near,
                reason: e.to_string(),
            }
        })?;

        if let Some(existing) = self.find_existing(params, deposit).await? {
            info!("NEAR escrow {} already exists, reusing", existing);
            return Ok(existing);
        }

        let args = json!({
            "receiver": params.beneficiary,
            "hashlock": BASE64.encode(params.hashlock.as_bytes()),
            "timelock": params.timelock.timestamp_millis().max(0) as u64,
            "eth_address": "",
        });

        let outcome = self
            .execute("create_escrow", "create_htlc", args, deposit)
            .await
            .map_err(|e| e.into_escrow_creation(Chain::Near))?;

        let contract_id: String = outcome
            .success_value
            .as_deref()
            .and_then(|v| serde_json::from_slice(v).ok())
            .ok_or_else(|| RelayerError::EventParsing("create_htlc returned no contract id".into()))?;

        info!("Created NEAR escrow {} in {}", contract_id, outcome.tx_hash);
        Ok(EscrowRef::new(contract_id))
    }

    /// `htlc-near` only accepts `withdraw` from the escrow's receiver, so this
    /// succeeds where the coordinator's account is the receiver
    async fn complete_escrow(&self, escrow: &EscrowRef, secret: &Secret) -> RelayerResult<TxRef> {
        let view = self.existing_escrow(escrow).await?;
        if view.5 {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if view.6 {
            return Ok(TxRef::AlreadySettled(Settlement::Refunded));
        }

        let args = json!({
            "contract_id": escrow.as_str(),
            "preimage": BASE64.encode(secret.as_bytes()),
        });
        let outcome = self.execute("complete_escrow", "withdraw", args, 0).await?;
        Ok(TxRef::Submitted(outcome.tx_hash))
    }

    /// The contract keeps only the hashlock; the preimage reaches the
    /// coordinator through the watcher's `withdraw` decoding instead
    async fn revealed_secret(&self, escrow: &EscrowRef) -> RelayerResult<Option<Secret>> {
        self.existing_escrow(escrow).await?;
        Ok(None)
    }

    async fn refund_escrow(&self, escrow: &EscrowRef) -> RelayerResult<TxRef> {
        let view = self.existing_escrow(escrow).await?;
        if view.5 {
            return Ok(TxRef::AlreadySettled(Settlement::Completed));
        }
        if view.6 {
            return Ok(TxRef::AlreadySettled(Settlement::Refunded));
        }

        let args = json!({ "contract_id": escrow.as_str() });
        let outcome = self
            .execute("refund_escrow", "refund", args, 0)
            .await
            .map_err(|e| match e {
                RelayerError::TimelockNotExpired { chain, .. } => RelayerError::TimelockNotExpired {
                    chain,
                    escrow_ref: escrow.to_string(),
                },
                other => other,
            })?;
        Ok(TxRef::Submitted(outcome.tx_hash))
    }

    async fn latest_height(&self) -> RelayerResult<u64> {
        with_backoff(&retry_label(Chain::Near, "latest_height"), &self.retry, || {
            self.rpc.final_height()
        })
        .await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let label = retry_label(Chain::Near, "block_events");
        let per_block: Vec<Vec<ChainEvent>> = futures::stream::iter(from..=to)
            .map(|height| {
                let label = label.clone();
                async move {
                    with_backoff(&label, &self.retry, || self.block_events(height)).await
                }
            })
            .buffered(SCAN_CONCURRENCY)
            .try_collect()
            .await?;

        let events: Vec<ChainEvent> = per_block.into_iter().flatten().collect();
        debug!("{} NEAR HTLC events in blocks {}..={}", events.len(), from, to);
        Ok(events)
    }

    async fn get_balance(&self, address: &str) -> RelayerResult<String> {
        if !self.is_valid_address(address) {
            return Err(RelayerError::InvalidAddress {
                chain: Chain::Near,
                address: address.to_string(),
            });
        }
        let yocto = with_backoff(&retry_label(Chain::Near, "get_balance"), &self.retry, || {
            self.rpc.balance(address)
        })
        .await?;
        units::from_base_u128(yocto, YOCTO_DECIMALS)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        is_valid_account_id(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(sender: &str, hashlock: &Hashlock, refunded: bool) -> HtlcView {
        (
            sender.into(),
            "bob.near".into(),
            "5".into(),
            hex::encode(hashlock.as_bytes()),
            0,
            false,
            refunded,
            String::new(),
        )
    }

    #[test]
    fn earlier_attempt_is_found_by_hashlock() {
        let secret = Secret::from_bytes([9u8; 32]);
        let params = EscrowParams {
            hashlock: secret.hashlock(),
            beneficiary: "bob.near".into(),
            amount: "0.000000000000000000000005".into(),
            timelock: chrono::Utc::now(),
        };
        let other = Secret::from_bytes([1u8; 32]).hashlock();
        let all = vec![
            ("a".to_string(), view("relayer.near", &other, false)),
            ("b".to_string(), view("relayer.near", &params.hashlock, true)),
            ("c".to_string(), view("someone.near", &params.hashlock, false)),
            ("d".to_string(), view("relayer.near", &params.hashlock, false)),
        ];
        assert_eq!(
            matching_escrow(&all, "relayer.near", &params, 5),
            Some(EscrowRef::new("d"))
        );
        assert_eq!(matching_escrow(&all, "relayer.near", &params, 6), None);
    }

    #[test]
    fn validates_account_ids() {
        assert!(is_valid_account_id("alice.near"));
        assert!(is_valid_account_id("htlc-bridge.testnet"));
        assert!(is_valid_account_id(&"a1".repeat(32)));
        assert!(!is_valid_account_id("Alice.near"));
        assert!(!is_valid_account_id("a..near"));
        assert!(!is_valid_account_id(".near"));
        assert!(!is_valid_account_id("near."));
        assert!(!is_valid_account_id("a"));
        assert!(!is_valid_account_id("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
    }

    #[test]
    fn parses_seed_and_keypair_forms() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let seed = format!("ed25519:{}", bs58::encode(key.to_bytes()).into_string());
        let pair = format!("ed25519:{}", bs58::encode(key.to_keypair_bytes()).into_string());
        assert_eq!(parse_secret_key(&seed).unwrap().to_bytes(), key.to_bytes());
        assert_eq!(parse_secret_key(&pair).unwrap().to_bytes(), key.to_bytes());
        assert!(parse_secret_key("secp256k1:abc").is_err());
    }

    #[test]
    fn function_call_action_layout() {
        let action = Action::FunctionCall(FunctionCallAction {
            method_name: "refund".into(),
            args: b"{}".to_vec(),
            gas: 1,
            deposit: 0,
        });
        let bytes = borsh::to_vec(&action).unwrap();
        assert_eq!(bytes[0], FUNCTION_CALL_TAG);
        // tag + (len + "refund") + (len + "{}") + gas + deposit
        assert_eq!(bytes.len(), 1 + (4 + 6) + (4 + 2) + 8 + 16);
        assert_eq!(&bytes[1..5], &6u32.to_le_bytes());
    }

    #[test]
    fn decodes_withdraw_call() {
        let secret = Secret::from_bytes([5u8; 32]);
        let args = json!({
            "contract_id": "bridge.near-alice.near-1-2",
            "preimage": BASE64.encode(secret.as_bytes()),
        });
        let event = decode_call_event("withdraw", &args, &json!({}), b"", 77, "tx".into()).unwrap();
        assert_eq!(event.kind, EventKind::Completed);
        assert_eq!(event.escrow_ref.as_str(), "bridge.near-alice.near-1-2");
        assert_eq!(event.hashlock, Some(secret.hashlock()));
        assert_eq!(event.secret, Some(secret));
    }

    #[test]
    fn decodes_create_call() {
        let lock = Hashlock::from_bytes([1u8; 32]);
        let args = json!({
            "receiver": "alice.near",
            "hashlock": BASE64.encode(lock.as_bytes()),
            "timelock": 1_700_000_000_000u64,
        });
        let call = json!({ "deposit": "1500000000000000000000000" });
        let event = decode_call_event(
            "create_htlc",
            &args,
            &call,
            br#""bridge.near-alice.near-1500000000000000000000000-1""#,
            9,
            "tx".into(),
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::EscrowCreated);
        assert_eq!(event.amount.as_deref(), Some("1.5"));
        assert_eq!(event.hashlock, Some(lock));
        assert_eq!(
            event.escrow_ref.as_str(),
            "bridge.near-alice.near-1500000000000000000000000-1"
        );
    }

    #[test]
    fn malformed_withdraw_is_ignored() {
        let args = json!({ "contract_id": "x", "preimage": BASE64.encode(b"short") });
        assert!(decode_call_event("withdraw", &args, &json!({}), b"", 1, "tx".into()).is_none());
    }

    #[test]
    fn rpc_errors_are_classified() {
        let body: RpcErrorBody = serde_json::from_value(json!({
            "name": "HANDLER_ERROR",
            "cause": { "name": "UNKNOWN_BLOCK", "info": {} },
            "message": "Server error"
        }))
        .unwrap();
        assert!(body.is_unknown());

        let body: RpcErrorBody = serde_json::from_value(json!({
            "name": "HANDLER_ERROR",
            "cause": { "name": "INVALID_TRANSACTION", "info": {} },
            "data": { "TxExecutionError": { "InvalidTxError": { "InvalidNonce": { "tx_nonce": 5, "ak_nonce": 7 } } } }
        }))
        .unwrap();
        assert!(body.into_error().is_retryable());
    }
}
