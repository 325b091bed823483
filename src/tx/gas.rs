//! Gas estimation with safety buffers

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for HTLC calls
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimate the gas limit of a call. A revert surfaces here, before
    /// anything is signed.
    pub async fn estimate_gas(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.buffer_limit(estimate))
    }

    /// Get buffered gas price for the chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price);
        debug!("Gas price for {}: {:?}", provider.config().name, buffered);
        Ok(buffered)
    }

    fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_limit_and_price() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.buffer_limit(U256::from(100_000u64)), U256::from(120_000u64));
        assert_eq!(
            estimator.buffer_price(GasPrice::Legacy(U256::from(100u64))),
            GasPrice::Legacy(U256::from(110u64))
        );
        assert_eq!(
            estimator.buffer_price(GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(200u64),
                max_priority_fee_per_gas: U256::from(10u64),
            }),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(220u64),
                max_priority_fee_per_gas: U256::from(11u64),
            }
        );
    }
}
