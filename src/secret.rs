//! Secret and hashlock engine
//!
//! Secrets are 32 random bytes from the OS CSPRNG. The hashlock is SHA-256
//! over the raw secret bytes, matching what the HTLC contracts on all three
//! chains recompute on withdrawal.

use crate::error::{RelayerError, RelayerResult};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// HTLC preimage. Never printed through `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

/// SHA-256 commitment to a [`Secret`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hashlock([u8; 32]);

impl Secret {
    /// Generate a fresh secret from the operating system's entropy source
    pub fn generate() -> RelayerResult<Self> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| RelayerError::EntropyUnavailable(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> RelayerResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            RelayerError::EventParsing(format!("secret must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn hashlock(&self) -> Hashlock {
        hashlock(self)
    }
}

impl Hashlock {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> RelayerResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            RelayerError::EventParsing(format!("hashlock must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Derive the hashlock for a secret
pub fn hashlock(secret: &Secret) -> Hashlock {
    let digest = Sha256::digest(secret.0);
    Hashlock(digest.into())
}

/// Check a secret against a hashlock in constant time
pub fn verify(secret: &Secret, lock: &Hashlock) -> bool {
    hashlock(secret).0.ct_eq(&lock.0).into()
}

fn parse_hex32(s: &str) -> RelayerResult<[u8; 32]> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed)
        .map_err(|e| RelayerError::EventParsing(format!("invalid hex: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayerError::EventParsing(format!("expected 32 bytes, got {}", bytes.len())))
}

impl FromStr for Secret {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

impl FromStr for Hashlock {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self.to_hex())
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Hashlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_own_hashlock() {
        for _ in 0..32 {
            let secret = Secret::generate().unwrap();
            assert!(verify(&secret, &hashlock(&secret)));
        }
    }

    #[test]
    fn verify_rejects_other_secret() {
        let s1 = Secret::generate().unwrap();
        let s2 = Secret::generate().unwrap();
        assert_ne!(s1, s2);
        assert!(!verify(&s1, &hashlock(&s2)));
    }

    #[test]
    fn hashlock_is_sha256_of_raw_bytes() {
        let secret = Secret::from_bytes([0u8; 32]);
        assert_eq!(
            hashlock(&secret).to_hex(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn debug_never_prints_secret() {
        let secret = Secret::from_bytes([7u8; 32]);
        let printed = format!("{:?}", secret);
        assert!(!printed.contains(&secret.to_hex()));
    }

    #[test]
    fn hashlock_serde_accepts_prefixed_hex() {
        let lock = Secret::from_bytes([1u8; 32]).hashlock();
        let json = serde_json::to_string(&lock).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: Hashlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lock);
    }
}
