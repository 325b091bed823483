//! HTTP API for bridge requests, swap status, and monitoring

use crate::chain::{Chain, ChainManager};
use crate::config::ApiConfig;
use crate::coordination::{BridgeRequest, Swap, SwapCoordinator, SwapId, SwapTicket, Transition};
use crate::error::{RelayerError, RelayerResult};
use crate::state::SwapStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
    pub store: Arc<dyn SwapStore>,
    pub chains: Arc<ChainManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/swaps", post(create_swap))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/refund", post(request_refund))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Relayer error rendered as an HTTP response
struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        Self(err)
    }
}

fn status_for(err: &RelayerError) -> (StatusCode, &'static str) {
    match err {
        RelayerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        RelayerError::InvalidAddress { .. } => (StatusCode::BAD_REQUEST, "invalid_address"),
        RelayerError::ChainNotFound(_) => (StatusCode::BAD_REQUEST, "chain_not_configured"),
        RelayerError::SwapNotFound(_) => (StatusCode::NOT_FOUND, "swap_not_found"),
        RelayerError::InvalidStateTransition { .. } => (StatusCode::CONFLICT, "invalid_state"),
        RelayerError::InsufficientBalance { .. } => {
            (StatusCode::PAYMENT_REQUIRED, "insufficient_balance")
        }
        RelayerError::OracleUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "oracle_unavailable")
        }
        RelayerError::TransientRpc { .. }
        | RelayerError::RateLimited { .. }
        | RelayerError::Timeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, "chain_unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: code,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Accept a bridge request
async fn create_swap(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> Result<Json<SwapTicket>, ApiError> {
    let ticket = state.coordinator.create_swap(request).await?;
    Ok(Json(ticket))
}

/// Swap record with its transition log
async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapStatusResponse>, ApiError> {
    let id: SwapId = id.parse()?;
    let (swap, transitions) = state.coordinator.status(&id).await?;
    Ok(Json(SwapStatusResponse { swap, transitions }))
}

async fn request_refund(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Swap>, ApiError> {
    let id: SwapId = id.parse()?;
    let swap = state.coordinator.request_refund(&id).await?;
    Ok(Json(swap))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain must answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Configured chains and the coordinator's signer on each
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let chains = state
        .chains
        .connected_chains()
        .into_iter()
        .filter_map(|chain| state.chains.get_adapter(chain).ok())
        .map(|adapter| ChainInfo {
            chain: adapter.chain(),
            native_asset: adapter.chain().native_asset(),
            signer: adapter.signer_address(),
            finality_depth: adapter.finality_depth(),
        })
        .collect();
    Json(ChainsResponse { chains })
}

/// Swap counts per state
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats))
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
struct SwapStatusResponse {
    #[serde(flatten)]
    swap: Swap,
    transitions: Vec<Transition>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: Chain,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainInfo {
    chain: Chain,
    native_asset: &'static str,
    signer: String,
    finality_depth: u64,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::SimulatedChain;
    use crate::chain::{ChainAdapter, WatchConfig};
    use crate::config::TimelockConfig;
    use crate::coordination::CoordinatorConfig;
    use crate::oracle::FixedRateOracle;
    use crate::state::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<SimulatedChain>) {
        let eth = Arc::new(SimulatedChain::new(Chain::Ethereum, 12));
        let tron = Arc::new(SimulatedChain::new(Chain::Tron, 19));
        let chains = Arc::new(ChainManager::from_adapters(vec![
            (eth as Arc<dyn ChainAdapter>, WatchConfig::default()),
            (tron.clone() as Arc<dyn ChainAdapter>, WatchConfig::default()),
        ]));
        let store: Arc<dyn SwapStore> = Arc::new(MemoryStore::new());
        let oracle = Arc::new(FixedRateOracle::new(HashMap::from([
            ("eth".to_string(), "3000".to_string()),
            ("trx".to_string(), "0.15".to_string()),
        ])));
        let coordinator = Arc::new(SwapCoordinator::new(
            chains.clone(),
            store.clone(),
            oracle,
            CoordinatorConfig {
                timelocks: TimelockConfig {
                    source_secs: 7200,
                    dest_secs: 3600,
                    safety_margin_secs: 600,
                },
                sweep_interval: Duration::from_secs(5),
                dedupe_window: Duration::from_secs(60),
            },
        ));
        let state = AppState {
            coordinator,
            store,
            chains,
        };
        (router(state), tron)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn bridge(amount: &str) -> Value {
        json!({
            "source_chain": "ethereum",
            "dest_chain": "tron",
            "amount": amount,
            "initiator_address": "0xabc",
            "beneficiary_address": "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE",
        })
    }

    #[tokio::test]
    async fn bridge_request_returns_ticket_and_status() {
        let (app, _) = app();
        let (status, ticket) = call(&app, "POST", "/swaps", Some(bridge("0.1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ticket["dest_amount"], "2000");
        let id = ticket["swap_id"].as_str().unwrap().to_string();

        let (status, swap) = call(&app, "GET", &format!("/swaps/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(swap["state"], "created");
        assert_eq!(swap["transitions"].as_array().unwrap().len(), 1);
        assert!(swap.get("secret").is_none());
    }

    #[tokio::test]
    async fn rejections_map_to_status_codes() {
        let (app, tron) = app();

        let (status, body) = call(&app, "POST", "/swaps", Some(bridge("-1"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        tron.set_balance("1");
        let (status, body) = call(&app, "POST", "/swaps", Some(bridge("0.1"))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"], "insufficient_balance");

        let mut to_near = bridge("0.1");
        to_near["dest_chain"] = json!("near");
        let (status, _) = call(&app, "POST", "/swaps", Some(to_near)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_swaps_are_not_found() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", "/swaps/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/swaps/{}/refund", SwapId::generate());
        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "swap_not_found");
    }

    #[tokio::test]
    async fn operational_endpoints() {
        let (app, _) = app();
        call(&app, "POST", "/swaps", Some(bridge("0.1"))).await;

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        let (_, body) = call(&app, "GET", "/chains", None).await;
        let chains = body["chains"].as_array().unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0]["chain"], "ethereum");
        assert_eq!(chains[1]["signer"], "tron-coordinator");

        let (_, body) = call(&app, "GET", "/stats", None).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["by_state"]["created"], 1);
    }
}
