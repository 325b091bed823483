//! Price quotes for the destination leg of a swap
//!
//! Quotes convert through USD: `amount_out = amount_in * usd(from) / usd(to)`,
//! truncated to the destination chain's precision.

use crate::chain::{units, Chain};
use crate::config::{OracleConfig, OracleKind};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Fixed-point precision for prices
const PRICE_DECIMALS: u32 = 18;

/// Prices fetched over HTTP are reused for this long
const PRICE_TTL: Duration = Duration::from_secs(30);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Amount of `to`'s native asset worth `amount_in` of `from`'s
    async fn quote(&self, amount_in: &str, from: Chain, to: Chain) -> RelayerResult<String>;
}

/// Build the oracle selected in config
pub fn from_config(config: &OracleConfig) -> RelayerResult<Arc<dyn PriceOracle>> {
    match config.kind {
        OracleKind::Fixed => Ok(Arc::new(FixedRateOracle::new(config.usd_prices.clone()))),
        OracleKind::Http => Ok(Arc::new(HttpPriceOracle::new(config)?)),
    }
}

/// Convert `amount_in` between assets given their USD prices
pub fn convert(amount_in: &str, usd_from: &str, usd_to: &str, to: Chain) -> RelayerResult<String> {
    let unavailable = |what: &str| RelayerError::OracleUnavailable(what.to_string());

    let usd_from = units::to_base_units(usd_from, PRICE_DECIMALS)
        .map_err(|_| unavailable("unparseable source price"))?;
    let usd_to = units::to_base_units(usd_to, PRICE_DECIMALS)
        .map_err(|_| unavailable("unparseable destination price"))?;
    if usd_from.is_zero() || usd_to.is_zero() {
        return Err(unavailable("zero price"));
    }

    // Work at the finest precision, then truncate to the destination's
    let amount = units::to_base_units(amount_in, units::YOCTO_DECIMALS)?;
    let out = amount
        .checked_mul(usd_from)
        .map(|v| v / usd_to)
        .ok_or_else(|| RelayerError::InvalidRequest(format!("amount {} too large", amount_in)))?;
    let out = units::from_base_units(out, units::YOCTO_DECIMALS)?;
    let truncated = units::to_base_units(&out, to.decimals())?;

    if truncated.is_zero() {
        return Err(RelayerError::InvalidRequest(format!(
            "{} is worth less than one base unit on {}",
            amount_in, to
        )));
    }
    units::from_base_units(truncated, to.decimals())
}

/// Quotes from a static USD price table keyed by asset symbol
pub struct FixedRateOracle {
    usd_prices: HashMap<String, String>,
}

impl FixedRateOracle {
    pub fn new(usd_prices: HashMap<String, String>) -> Self {
        Self { usd_prices }
    }

    fn price(&self, chain: Chain) -> RelayerResult<&str> {
        self.usd_prices
            .get(chain.native_asset())
            .map(String::as_str)
            .ok_or_else(|| {
                RelayerError::OracleUnavailable(format!("no price for {}", chain.native_asset()))
            })
    }
}

#[async_trait]
impl PriceOracle for FixedRateOracle {
    async fn quote(&self, amount_in: &str, from: Chain, to: Chain) -> RelayerResult<String> {
        convert(amount_in, self.price(from)?, self.price(to)?, to)
    }
}

/// CoinGecko-style `simple/price` client
pub struct HttpPriceOracle {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    cache: RwLock<Option<(Instant, HashMap<Chain, f64>)>>,
}

#[derive(Debug, Deserialize)]
struct UsdPrice {
    usd: Option<f64>,
}

fn coin_id(chain: Chain) -> &'static str {
    match chain {
        Chain::Ethereum => "ethereum",
        Chain::Tron => "tron",
        Chain::Near => "near",
    }
}

impl HttpPriceOracle {
    pub fn new(config: &OracleConfig) -> RelayerResult<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| RelayerError::Config("oracle.url is required".into()))?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RelayerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            cache: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> RelayerResult<HashMap<Chain, f64>> {
        let ids: Vec<&str> = Chain::ALL.iter().map(|c| coin_id(*c)).collect();
        let mut request = self
            .client
            .get(format!("{}/simple/price", self.url))
            .query(&[("ids", ids.join(",")), ("vs_currencies", "usd".to_string())]);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-pro-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayerError::OracleUnavailable(format!("price request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(RelayerError::OracleUnavailable(format!(
                "price feed returned {}",
                response.status()
            )));
        }

        let body: HashMap<String, UsdPrice> = response
            .json()
            .await
            .map_err(|e| RelayerError::OracleUnavailable(format!("bad price payload: {}", e)))?;

        Ok(parse_prices(&body))
    }

    async fn prices(&self) -> RelayerResult<HashMap<Chain, f64>> {
        if let Some((at, prices)) = self.cache.read().await.as_ref() {
            if at.elapsed() < PRICE_TTL {
                return Ok(prices.clone());
            }
        }

        match self.fetch().await {
            Ok(prices) => {
                debug!("Refreshed {} prices", prices.len());
                *self.cache.write().await = Some((Instant::now(), prices.clone()));
                Ok(prices)
            }
            Err(e) => {
                warn!("Price refresh failed: {}", e);
                Err(e)
            }
        }
    }
}

fn parse_prices(body: &HashMap<String, UsdPrice>) -> HashMap<Chain, f64> {
    Chain::ALL
        .iter()
        .filter_map(|chain| {
            body.get(coin_id(*chain))
                .and_then(|p| p.usd)
                .filter(|usd| usd.is_finite() && *usd > 0.0)
                .map(|usd| (*chain, usd))
        })
        .collect()
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn quote(&self, amount_in: &str, from: Chain, to: Chain) -> RelayerResult<String> {
        let prices = self.prices().await?;
        let price = |chain: Chain| {
            prices.get(&chain).map(|p| p.to_string()).ok_or_else(|| {
                RelayerError::OracleUnavailable(format!("no price for {}", chain.native_asset()))
            })
        };
        convert(amount_in, &price(from)?, &price(to)?, to)
    }
}
