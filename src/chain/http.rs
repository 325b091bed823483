//! JSON-over-HTTP endpoint with failover, used by the TRON and NEAR adapters

use super::Chain;
use crate::error::{RelayerError, RelayerResult};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

pub struct HttpEndpoint {
    chain: Chain,
    client: reqwest::Client,
    urls: Vec<String>,
    current: AtomicUsize,
}

impl HttpEndpoint {
    pub fn new(
        chain: Chain,
        urls: &[String],
        timeout: Duration,
        header: Option<(&'static str, String)>,
    ) -> RelayerResult<Self> {
        if urls.is_empty() {
            return Err(RelayerError::Config(format!("No RPC urls for {}", chain)));
        }

        let mut headers = HeaderMap::new();
        if let Some((name, value)) = header {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| RelayerError::Config(format!("Invalid {} header: {}", name, e)))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RelayerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            chain,
            client,
            urls: urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
        })
    }

    fn base_url(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.urls[idx % self.urls.len()]
    }

    fn failover(&self) {
        if self.urls.len() > 1 {
            let next = (self.current.load(Ordering::Relaxed) + 1) % self.urls.len();
            self.current.store(next, Ordering::Relaxed);
            warn!("{} failover to endpoint {}", self.chain, next);
        }
    }

    /// POST a JSON body to `path` (empty for JSON-RPC roots)
    pub async fn post<B, R>(&self, path: &str, body: &B) -> RelayerResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = if path.is_empty() {
            self.base_url().to_string()
        } else {
            format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
        };

        let response = match self.client.post(&url).json(body).send().await {
            Ok(response) => response,
            Err(e) => {
                self.failover();
                return Err(if e.is_timeout() {
                    RelayerError::Timeout {
                        operation: format!("{} {}", self.chain, path),
                    }
                } else {
                    RelayerError::TransientRpc {
                        chain: self.chain,
                        message: format!("HTTP request failed: {}", e),
                    }
                });
            }
        };

        let status = response.status();
        if let Some(err) = self.status_error(status) {
            return Err(err);
        }

        response.json::<R>().await.map_err(|e| RelayerError::TransientRpc {
            chain: self.chain,
            message: format!("Invalid JSON from {}: {}", url, e),
        })
    }

    fn status_error(&self, status: StatusCode) -> Option<RelayerError> {
        if status.is_success() {
            return None;
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.failover();
            return Some(RelayerError::RateLimited { chain: self.chain });
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            self.failover();
            return Some(RelayerError::TransientRpc {
                chain: self.chain,
                message: format!("Server returned {}", status),
            });
        }
        Some(RelayerError::ChainRejection {
            chain: self.chain,
            reason: format!("Server returned {}", status),
        })
    }
}
