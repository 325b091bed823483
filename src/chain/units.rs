//! Decimal amount conversion between whole units and chain base units
//!
//! Amounts cross the adapter boundary as decimal strings in whole native
//! units ("1.5" ETH). Each adapter converts with its own precision:
//! wei (18), sun (6), yoctoNEAR (24).

use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};
use std::cmp::Ordering;

pub const WEI_DECIMALS: u32 = 18;
pub const SUN_DECIMALS: u32 = 6;
pub const YOCTO_DECIMALS: u32 = 24;

/// Precision used when comparing amounts of unknown origin
const COMPARE_DECIMALS: u32 = YOCTO_DECIMALS;

/// Parse a decimal amount into base units. Fractional digits beyond the
/// chain precision are truncated.
pub fn to_base_units(amount: &str, decimals: u32) -> RelayerResult<U256> {
    let normalized = normalize(amount, decimals)?;
    match parse_units(normalized.as_str(), decimals)
        .map_err(|e| RelayerError::InvalidRequest(format!("invalid amount {}: {}", amount, e)))?
    {
        ParseUnits::U256(value) => Ok(value),
        ParseUnits::I256(_) => Err(RelayerError::InvalidRequest(format!(
            "amount must not be negative: {}",
            amount
        ))),
    }
}

/// Format base units as a trimmed decimal string ("1.5", "0.000001", "3")
pub fn from_base_units(value: U256, decimals: u32) -> RelayerResult<String> {
    let formatted = format_units(value, decimals)
        .map_err(|e| RelayerError::Internal(format!("format units: {}", e)))?;
    Ok(trim_decimal(&formatted))
}

/// Convert base units held in a `u128` (TRON sun, NEAR yocto)
pub fn from_base_u128(value: u128, decimals: u32) -> RelayerResult<String> {
    from_base_units(U256::from(value), decimals)
}

/// Base units as `u128`; NEAR deposits and TRON call values fit comfortably
pub fn to_base_u128(amount: &str, decimals: u32) -> RelayerResult<u128> {
    let value = to_base_units(amount, decimals)?;
    if value > U256::from(u128::MAX) {
        return Err(RelayerError::InvalidRequest(format!(
            "amount {} overflows base units",
            amount
        )));
    }
    Ok(value.as_u128())
}

/// Parse an amount a chain must hold exactly: strictly positive, with no
/// significant digits below one base unit
pub fn to_exact_base_units(amount: &str, decimals: u32) -> RelayerResult<U256> {
    let excess = amount
        .trim()
        .split_once('.')
        .map(|(_, frac)| frac.chars().skip(decimals as usize).any(|c| c != '0'))
        .unwrap_or(false);
    if excess {
        return Err(RelayerError::InvalidRequest(format!(
            "amount {} has more than {} decimal places",
            amount, decimals
        )));
    }
    let value = to_base_units(amount, decimals)?;
    if value.is_zero() {
        return Err(RelayerError::InvalidRequest(format!(
            "amount must be positive, got {:?}",
            amount
        )));
    }
    Ok(value)
}

/// Compare two decimal amounts
pub fn compare(a: &str, b: &str) -> RelayerResult<Ordering> {
    let a = to_base_units(a, COMPARE_DECIMALS)?;
    let b = to_base_units(b, COMPARE_DECIMALS)?;
    Ok(a.cmp(&b))
}

fn normalize(amount: &str, decimals: u32) -> RelayerResult<String> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(RelayerError::InvalidRequest("amount is empty".into()));
    }
    if amount.starts_with('-') {
        return Err(RelayerError::InvalidRequest(format!(
            "amount must not be negative: {}",
            amount
        )));
    }
    match amount.split_once('.') {
        Some((whole, frac)) => {
            let whole = if whole.is_empty() { "0" } else { whole };
            let frac: String = frac.chars().take(decimals as usize).collect();
            if frac.is_empty() {
                Ok(whole.to_string())
            } else {
                Ok(format!("{}.{}", whole, frac))
            }
        }
        None => Ok(amount.to_string()),
    }
}

fn trim_decimal(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_per_chain_precision() {
        assert_eq!(
            to_base_units("1.0", WEI_DECIMALS).unwrap(),
            U256::exp10(18)
        );
        assert_eq!(to_base_u128("2.5", SUN_DECIMALS).unwrap(), 2_500_000);
        assert_eq!(
            to_base_u128("1", YOCTO_DECIMALS).unwrap(),
            1_000_000_000_000_000_000_000_000
        );
    }

    #[test]
    fn truncates_excess_fraction() {
        assert_eq!(to_base_u128("0.1234567", SUN_DECIMALS).unwrap(), 123_456);
    }

    #[test]
    fn formats_trimmed() {
        assert_eq!(from_base_u128(1_500_000, SUN_DECIMALS).unwrap(), "1.5");
        assert_eq!(from_base_u128(3_000_000, SUN_DECIMALS).unwrap(), "3");
        assert_eq!(from_base_u128(0, SUN_DECIMALS).unwrap(), "0");
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert!(to_base_units("-1", WEI_DECIMALS).is_err());
        assert!(to_base_units("abc", WEI_DECIMALS).is_err());
        assert!(to_base_units("", WEI_DECIMALS).is_err());
    }

    #[test]
    fn exact_amounts_fit_chain_precision() {
        assert_eq!(to_exact_base_units("0.000001", SUN_DECIMALS).unwrap(), U256::one());
        assert_eq!(
            to_exact_base_units("1.5000000", SUN_DECIMALS).unwrap(),
            U256::from(1_500_000u64)
        );
        assert!(to_exact_base_units("0.0", WEI_DECIMALS).is_err());
        assert!(to_exact_base_units("0.0000000000000000001", WEI_DECIMALS).is_err());
        assert!(to_exact_base_units("1.0000001", SUN_DECIMALS).is_err());
        assert!(to_exact_base_units("0.0000000000000000001", YOCTO_DECIMALS).is_ok());
    }

    #[test]
    fn compares_across_precision() {
        assert_eq!(compare("1.50", "1.5").unwrap(), Ordering::Equal);
        assert_eq!(compare("2", "10").unwrap(), Ordering::Less);
    }
}
