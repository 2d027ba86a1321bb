//! REST API server for Coinpit
//!
//! Wallet, transfer and game endpoints over a shared [`Node`]. Ledger work
//! runs on the blocking pool; the node's own lock serializes mining.

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{self, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::games::GameKind;
use crate::node::{GameResult, Node};

pub const DEFAULT_BLOCK_LIMIT: usize = 20;
pub const MAX_BLOCK_LIMIT: usize = 100;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Tracked clients beyond which idle entries are swept.
const RATE_LIMIT_SWEEP_THRESHOLD: usize = 1024;

/// Sliding-window request limiter keyed by client.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, RATE_LIMIT_WINDOW)
    }

    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    /// Record a request from `client` at `now` if it fits in the window.
    pub fn allow_at(&self, client: &str, now: Instant) -> bool {
        let mut requests = self.requests.lock();

        if requests.len() > RATE_LIMIT_SWEEP_THRESHOLD {
            let window = self.window;
            requests.retain(|_, times| {
                times
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
        }

        let times = requests.entry(client.to_string()).or_default();
        while times
            .front()
            .is_some_and(|first| now.saturating_duration_since(*first) >= self.window)
        {
            times.pop_front();
        }

        if times.len() >= self.limit {
            return false;
        }
        times.push_back(now);
        true
    }
}

pub struct ApiState {
    pub node: Arc<Node>,
    pub limiter: RateLimiter,
}

type SharedState = Arc<ApiState>;

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
    RateLimitExceeded,
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Chain(e) => {
                if !e.is_recoverable() {
                    tracing::error!(error = %e, "request failed");
                }
                let status = match &e {
                    ChainError::Validation(_) | ChainError::InsufficientFunds { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    ChainError::NotFound(_) => StatusCode::NOT_FOUND,
                    ChainError::AlreadyExists(_) | ChainError::StaleTip { .. } => StatusCode::CONFLICT,
                    ChainError::SignatureVerification(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
            ),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub amount: u64,
}

#[derive(Deserialize)]
pub struct GameRequest {
    pub from: String,
    pub amount: u64,
}

#[derive(Deserialize)]
pub struct NumberRangeRequest {
    pub from: String,
    pub amount: u64,
    pub guess: u8,
}

#[derive(Deserialize)]
struct BalanceQuery {
    address: Option<String>,
}

#[derive(Deserialize)]
struct BlockchainQuery {
    limit: Option<String>,
}

#[derive(Serialize)]
struct HelloResponse {
    text: String,
    time: String,
    number: u32,
}

#[derive(Serialize)]
pub struct WalletResponse {
    pub address: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub status: String,
    pub message: String,
    pub block: String,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResponse {
    pub status: String,
    pub result: String,
    pub game: GameKind,
    pub amount_change: i64,
    pub bet_amount: u64,
    pub payout: u64,
    pub change: u64,
    pub message: String,
    pub block: String,
    pub tx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_number: Option<u8>,
}

impl From<GameResult> for GameResponse {
    fn from(result: GameResult) -> Self {
        let amount_change = result
            .amount_change()
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        let (outcome, message) = if result.won {
            (
                "WIN",
                format!(
                    "{} WIN! You received {} coins (net gain: {})",
                    result.game, result.payout, amount_change
                ),
            )
        } else {
            ("LOSS", format!("{} LOSS! You lost {} coins", result.game, result.bet))
        };

        GameResponse {
            status: "success".to_string(),
            result: outcome.to_string(),
            game: result.game,
            amount_change,
            bet_amount: result.bet,
            payout: result.payout,
            change: result.change,
            message,
            block: hex::encode(result.block_hash),
            tx: result.transaction.id_hex(),
            server_number: result.server_number,
        }
    }
}

#[derive(Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub inputs: usize,
    pub outputs: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub nonce: u64,
    pub difficulty: u32,
    pub transactions: Vec<TransactionInfo>,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo {
            height: block.height,
            hash: block.hash_hex(),
            prev_hash: block.prev_hash_hex(),
            timestamp: block.timestamp,
            nonce: block.nonce,
            difficulty: block.difficulty,
            transactions: block
                .transactions
                .iter()
                .map(|tx| TransactionInfo {
                    id: tx.id_hex(),
                    inputs: tx.inputs.len(),
                    outputs: tx.outputs.len(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainResponse {
    pub blocks: Vec<BlockInfo>,
    pub total_blocks: usize,
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Run ledger work off the async runtime.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ChainError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::InternalError(format!("Worker task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| (1..=MAX_BLOCK_LIMIT).contains(limit))
        .unwrap_or(DEFAULT_BLOCK_LIMIT)
}

// ============================================================================
// Middleware
// ============================================================================

async fn rate_limit_middleware(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS || req.uri().path() == "/balance" {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_key(req.headers(), peer);

    if !state.limiter.allow(&client) {
        tracing::warn!(%client, "rate limit exceeded");
        return ApiError::RateLimitExceeded.into_response();
    }
    next.run(req).await
}

/// Request logging middleware. Logs method, path, status and duration.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints (for testing)
pub fn build_api_router(node: Arc<Node>) -> Router {
    let limit = node.config().api.rate_limit_per_minute;
    let state = Arc::new(ApiState {
        node,
        limiter: RateLimiter::per_minute(limit),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE, http::header::AUTHORIZATION]);

    Router::new()
        .route("/hello", get(hello))
        .route("/createwallet", post(create_wallet))
        .route("/send", post(send))
        .route("/balance", get(get_balance))
        .route("/coinflip", post(coinflip))
        .route("/diceroll", post(dice_roll))
        .route("/numberrange", post(number_range))
        .route("/blockchain", get(get_blockchain))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state)
        .layer(cors)
}

/// Serve the API on `0.0.0.0:<api.port>` until the process exits.
pub async fn run_api_server(node: Arc<Node>) -> Result<(), Box<dyn std::error::Error>> {
    let port = node.config().api.port;
    let app = build_api_router(node);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn hello() -> Json<HelloResponse> {
    Json(HelloResponse {
        text: "Hello World".to_string(),
        time: chrono::Utc::now().to_rfc3339(),
        number: rand::random(),
    })
}

async fn create_wallet(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let node = state.node.clone();
    let address = run_blocking(move || node.create_wallet()).await?;
    let grant = state.node.config().wallet.initial_grant;

    Ok((
        StatusCode::CREATED,
        Json(WalletResponse {
            address,
            message: format!("Wallet created with {} initial balance", grant),
        }),
    ))
}

async fn send(
    State(state): State<SharedState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    if req.amount == 0 {
        return Err(ApiError::InvalidInput("Amount must be greater than 0".to_string()));
    }

    let node = state.node.clone();
    let block = run_blocking(move || node.send(&req.from, &req.to, req.amount)).await?;

    Ok(Json(SendResponse {
        status: "success".to_string(),
        message: "Transaction mined successfully".to_string(),
        block: block.hash_hex(),
    }))
}

async fn get_balance(
    State(state): State<SharedState>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let address = query
        .address
        .filter(|address| !address.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("Address parameter is required".to_string()))?;

    let node = state.node.clone();
    let lookup = address.clone();
    let balance = run_blocking(move || node.balance(&lookup)).await?;

    Ok(Json(BalanceResponse { address, balance }))
}

fn require_bet(amount: u64) -> Result<(), ApiError> {
    if amount == 0 {
        return Err(ApiError::InvalidInput("Amount must be greater than 0".to_string()));
    }
    Ok(())
}

async fn coinflip(
    State(state): State<SharedState>,
    Json(req): Json<GameRequest>,
) -> Result<Json<GameResponse>, ApiError> {
    require_bet(req.amount)?;
    let node = state.node.clone();
    let result = run_blocking(move || node.coinflip(&req.from, req.amount)).await?;
    Ok(Json(result.into()))
}

async fn dice_roll(
    State(state): State<SharedState>,
    Json(req): Json<GameRequest>,
) -> Result<Json<GameResponse>, ApiError> {
    require_bet(req.amount)?;
    let node = state.node.clone();
    let result = run_blocking(move || node.dice_roll(&req.from, req.amount)).await?;
    Ok(Json(result.into()))
}

async fn number_range(
    State(state): State<SharedState>,
    Json(req): Json<NumberRangeRequest>,
) -> Result<Json<GameResponse>, ApiError> {
    require_bet(req.amount)?;
    crate::games::validate_guess(req.guess)?;
    let node = state.node.clone();
    let result = run_blocking(move || node.number_range(&req.from, req.amount, req.guess)).await?;
    Ok(Json(result.into()))
}

async fn get_blockchain(
    State(state): State<SharedState>,
    Query(query): Query<BlockchainQuery>,
) -> Result<Json<BlockchainResponse>, ApiError> {
    let limit = parse_limit(query.limit.as_deref());
    let node = state.node.clone();
    let blocks = run_blocking(move || node.blocks(limit)).await?;

    let blocks: Vec<BlockInfo> = blocks.iter().map(BlockInfo::from).collect();
    Ok(Json(BlockchainResponse {
        total_blocks: blocks.len(),
        blocks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("1.2.3.4", start));
        }
        assert!(!limiter.allow_at("1.2.3.4", start + Duration::from_secs(30)));
        assert!(limiter.allow_at("5.6.7.8", start + Duration::from_secs(30)));
        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_client_key_precedence() {
        let peer: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(peer)), "10.1.1.1");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-real-ip", "10.2.2.2".parse().unwrap());
        assert_eq!(client_key(&headers, Some(peer)), "10.2.2.2");

        headers.insert("x-forwarded-for", "10.3.3.3, 10.4.4.4".parse().unwrap());
        assert_eq!(client_key(&headers, Some(peer)), "10.3.3.3");
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), DEFAULT_BLOCK_LIMIT);
        assert_eq!(parse_limit(Some("5")), 5);
        assert_eq!(parse_limit(Some("0")), DEFAULT_BLOCK_LIMIT);
        assert_eq!(parse_limit(Some("101")), DEFAULT_BLOCK_LIMIT);
        assert_eq!(parse_limit(Some("abc")), DEFAULT_BLOCK_LIMIT);
    }
}
