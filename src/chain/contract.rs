//! Solidity HTLC call encoding shared by the EVM and TRON adapters

use crate::error::{RelayerError, RelayerResult};
use crate::secret::{Hashlock, Secret};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::id;
use sha2::{Digest, Sha256};

pub const NEW_CONTRACT: &str = "newContract(address,bytes32,uint256)";
pub const WITHDRAW: &str = "withdraw(bytes32,bytes32)";
pub const REFUND: &str = "refund(bytes32)";
pub const GET_CONTRACT: &str = "getContract(bytes32)";

/// Escrow as returned by `getContract`
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowView {
    pub sender: Address,
    pub receiver: Address,
    pub amount: U256,
    pub hashlock: H256,
    pub timelock: U256,
    pub withdrawn: bool,
    pub refunded: bool,
    pub preimage: H256,
}

impl EscrowView {
    /// The contract returns an all-zero tuple for unknown ids
    pub fn exists(&self) -> bool {
        self.sender != Address::zero()
    }

    /// Preimage recorded by a completed escrow
    pub fn revealed(&self) -> Option<Secret> {
        (self.withdrawn && !self.preimage.is_zero()).then(|| Secret::from_bytes(self.preimage.0))
    }
}

/// Full calldata: 4-byte selector followed by the encoded arguments
pub fn calldata(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data
}

/// Encoded arguments only, as the TRON `parameter` field expects
pub fn parameters(args: &[Token]) -> Vec<u8> {
    abi::encode(args)
}

pub fn new_contract_args(receiver: Address, hashlock: &Hashlock, timelock_secs: u64) -> Vec<Token> {
    vec![
        Token::Address(receiver),
        Token::FixedBytes(hashlock.as_bytes().to_vec()),
        Token::Uint(U256::from(timelock_secs)),
    ]
}

pub fn withdraw_args(contract_id: H256, secret: &Secret) -> Vec<Token> {
    vec![
        Token::FixedBytes(contract_id.as_bytes().to_vec()),
        Token::FixedBytes(secret.as_bytes().to_vec()),
    ]
}

pub fn id_args(contract_id: H256) -> Vec<Token> {
    vec![Token::FixedBytes(contract_id.as_bytes().to_vec())]
}

/// Contract id the HTLC derives for a new escrow:
/// `sha256(abi.encodePacked(sender, receiver, amount, hashlock, timelock))`
pub fn derive_contract_id(
    sender: Address,
    receiver: Address,
    amount: U256,
    hashlock: &Hashlock,
    timelock_secs: u64,
) -> H256 {
    let mut packed = Vec::with_capacity(20 + 20 + 32 * 3);
    packed.extend_from_slice(sender.as_bytes());
    packed.extend_from_slice(receiver.as_bytes());
    let mut word = [0u8; 32];
    amount.to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    packed.extend_from_slice(hashlock.as_bytes());
    U256::from(timelock_secs).to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    H256::from_slice(&Sha256::digest(&packed))
}

/// Decode the `newContract` return value
pub fn decode_contract_id(output: &[u8]) -> RelayerResult<H256> {
    let tokens = abi::decode(&[ParamType::FixedBytes(32)], output)
        .map_err(|e| RelayerError::EventParsing(format!("newContract output: {}", e)))?;
    match tokens.first() {
        Some(Token::FixedBytes(b)) if b.len() == 32 => Ok(H256::from_slice(b)),
        other => Err(RelayerError::EventParsing(format!(
            "unexpected newContract output {:?}",
            other
        ))),
    }
}

/// Decode the `getContract` view tuple
pub fn decode_escrow_view(output: &[u8]) -> RelayerResult<EscrowView> {
    let tokens = abi::decode(
        &[
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Bool,
            ParamType::Bool,
            ParamType::FixedBytes(32),
        ],
        output,
    )
    .map_err(|e| RelayerError::EventParsing(format!("getContract output: {}", e)))?;

    let bad = |what: &str| RelayerError::EventParsing(format!("getContract: bad {}", what));

    let mut it = tokens.into_iter();
    let sender = it.next().and_then(Token::into_address).ok_or_else(|| bad("sender"))?;
    let receiver = it.next().and_then(Token::into_address).ok_or_else(|| bad("receiver"))?;
    let amount = it.next().and_then(Token::into_uint).ok_or_else(|| bad("amount"))?;
    let hashlock = it
        .next()
        .and_then(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| bad("hashlock"))?;
    let timelock = it.next().and_then(Token::into_uint).ok_or_else(|| bad("timelock"))?;
    let withdrawn = it.next().and_then(Token::into_bool).ok_or_else(|| bad("withdrawn"))?;
    let refunded = it.next().and_then(Token::into_bool).ok_or_else(|| bad("refunded"))?;
    let preimage = it
        .next()
        .and_then(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| bad("preimage"))?;

    Ok(EscrowView {
        sender,
        receiver,
        amount,
        hashlock,
        timelock,
        withdrawn,
        refunded,
        preimage,
    })
}

/// Extract the message of a Solidity `Error(string)` revert payload
pub fn decode_revert_reason(output: &[u8]) -> Option<String> {
    let body = output.strip_prefix(&id("Error(string)")[..])?;
    match abi::decode(&[ParamType::String], body).ok()?.into_iter().next()? {
        Token::String(reason) => Some(reason),
        _ => None,
    }
}

/// Parse an escrow reference produced by the log parser (`0x` + 64 hex)
pub fn parse_contract_id(value: &str) -> RelayerResult<H256> {
    value
        .parse::<H256>()
        .map_err(|e| RelayerError::InvalidRequest(format!("bad contract id {}: {}", value, e)))
}
