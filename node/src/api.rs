//! # HTTP API
//!
//! The recipient/sender surface of the node, served with axum.
//!
//! ## Endpoints
//!
//! | Method | Path                                   | Description                                  |
//! |--------|----------------------------------------|----------------------------------------------|
//! | GET    | `/health`                              | Liveness probe                               |
//! | GET    | `/status`                              | Version, network, index stats, cursor        |
//! | POST   | `/api/generate-identifier`             | New identifier + the publish call to sign    |
//! | GET    | `/api/pending-transfers/:address`      | Pending transfers addressed to `address`     |
//! | POST   | `/api/claim-notification`              | Recipient reports a ledger claim             |
//! | GET    | `/api/transaction-status/:identifier`  | Index view of one transfer                   |
//! | POST   | `/api/verify-recipient`                | Is this identifier addressed to me?          |
//! | GET    | `/api/stats`                           | Index and ledger totals                      |
//! | GET    | `/api/user-stats/:address`             | Per-address counts                           |
//! | POST   | `/devnet/fund`                         | Mint devnet balance to an account            |
//! | POST   | `/devnet/submit`                       | Execute a ledger call as `caller`            |
//!
//! Amounts are base-unit integers rendered as decimal strings, except inside
//! a [`LedgerCall`], which carries them as JSON numbers.
//!
//! Errors are `{"error": ..., "retryable": ...}`: 400 for bad input, 404 for
//! unknown identifiers, 403 when the claimer is not the recipient, 409 for
//! state conflicts and 503 (retryable) when the ledger is unavailable.

use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cloak_contracts::{EscrowError, InProcessLedger};
use cloak_protocol::config::IDENTIFIER_HASH_FUNCTION;
use cloak_protocol::ledger::{ClientError, LedgerCall, LedgerClient, LedgerEvent};
use cloak_protocol::settlement::{ErrorClass, SettlementCoordinator, SettlementError};
use cloak_protocol::storage::{AddressStats, IndexError, IndexRecord, IndexStats, Transition};
use cloak_protocol::transfer::{Address, Amount, Token, TransferId, TransferStatus};

use crate::metrics::SharedMetrics;

/// The coordinator as wired in the node: backed by the devnet ledger.
pub type NodeCoordinator = SettlementCoordinator<InProcessLedger>;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Network name (e.g. "devnet").
    pub network: String,
    pub coordinator: Arc<NodeCoordinator>,
    pub metrics: SharedMetrics,
}

impl AppState {
    fn ledger(&self) -> &InProcessLedger {
        self.coordinator.client()
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/generate-identifier", post(generate_identifier_handler))
        .route("/api/pending-transfers/:address", get(pending_transfers_handler))
        .route("/api/claim-notification", post(claim_notification_handler))
        .route("/api/transaction-status/:identifier", get(transaction_status_handler))
        .route("/api/verify-recipient", post(verify_recipient_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/user-stats/:address", get(user_stats_handler))
        .route("/devnet/fund", post(devnet_fund_handler))
        .route("/devnet/submit", post(devnet_submit_handler))
        .layer(middleware::from_fn_with_state(state.clone(), track_latency))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_latency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let timer = state.metrics.api_request_latency_seconds.start_timer();
    let response = next.run(req).await;
    timer.observe_duration();
    response
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

/// A failed request, ready to render.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retryable: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retryable: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        let status = match (&err, err.class()) {
            (SettlementError::NotFound(_), _) => StatusCode::NOT_FOUND,
            (SettlementError::WrongClaimer { .. } | SettlementError::WrongCanceller { .. }, _) => {
                StatusCode::FORBIDDEN
            }
            (_, ErrorClass::Validation) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::Conflict) => StatusCode::CONFLICT,
            (_, ErrorClass::Availability) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorClass::Consistency) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, %status, "request failed");
        }
        Self {
            status,
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        SettlementError::from(err).into()
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        let (status, retryable) = if err.is_transient() {
            (StatusCode::SERVICE_UNAVAILABLE, true)
        } else {
            (StatusCode::CONFLICT, false)
        };
        Self {
            status,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

/// Unwraps a JSON body, turning axum's rejection into a 400.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid address: {raw}")))
}

fn parse_identifier(raw: &str) -> Result<TransferId, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid identifier: {raw}")))
}

fn parse_amount(raw: &str) -> Result<Amount, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid amount: {raw}")))
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Response for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    /// Hash function behind transfer identifiers.
    pub identifier_hash: String,
    pub index: IndexStats,
    pub reconcile_cursor: u64,
    /// Current devnet ledger time, in seconds.
    pub ledger_time: u64,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateIdentifierRequest {
    pub sender: String,
    pub recipient: String,
    pub amount: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateIdentifierResponse {
    pub identifier: TransferId,
    /// Returned once, to the sender. Never shown to anyone else.
    pub salt: String,
    pub created_at: DateTime<Utc>,
    pub sender: Address,
    pub amount: String,
    pub token: Token,
    pub status: TransferStatus,
    /// The call the sender's wallet must sign and submit.
    pub publish: LedgerCall,
}

/// One entry of a pending-transfers listing. The recipient is implied.
#[derive(Debug, Serialize)]
pub struct PendingTransfer {
    pub identifier: TransferId,
    pub sender: Address,
    pub token: Token,
    pub amount: String,
    pub created_at: DateTime<Utc>,
    pub published: bool,
}

impl From<IndexRecord> for PendingTransfer {
    fn from(record: IndexRecord) -> Self {
        let published = record.is_published();
        Self {
            identifier: record.identifier,
            sender: record.sender,
            token: record.token,
            amount: record.amount.to_string(),
            created_at: record.created_at,
            published,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingTransfersResponse {
    pub address: Address,
    pub count: usize,
    pub transfers: Vec<PendingTransfer>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimNotificationRequest {
    pub identifier: String,
    pub claimer: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimNotificationResponse {
    pub success: bool,
    pub identifier: TransferId,
    pub claimer: Address,
    /// `true` when the index already had the claim recorded.
    pub already_recorded: bool,
}

#[derive(Debug, Serialize)]
pub struct TransactionStatusResponse {
    pub identifier: TransferId,
    pub status: TransferStatus,
    pub sender: Address,
    pub amount: String,
    pub token: Token,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escrowed_amount: Option<String>,
    pub claimer_mismatch: bool,
}

impl From<IndexRecord> for TransactionStatusResponse {
    fn from(record: IndexRecord) -> Self {
        Self {
            identifier: record.identifier,
            status: record.status,
            sender: record.sender,
            amount: record.amount.to_string(),
            token: record.token,
            created_at: record.created_at,
            resolved_at: record.resolved_at,
            escrowed_amount: record.escrowed_amount.map(|a| a.to_string()),
            claimer_mismatch: record.claimer_mismatch,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRecipientRequest {
    pub identifier: String,
    pub recipient: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyRecipientResponse {
    pub valid: bool,
    pub identifier: TransferId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransferStatus>,
}

#[derive(Debug, Serialize)]
pub struct LedgerSummary {
    pub published: u64,
    pub claimed: u64,
    pub cancelled: u64,
    pub fee_bps: u32,
    pub total_escrowed: BTreeMap<Token, String>,
    pub total_fees: BTreeMap<Token, String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub index: IndexStats,
    pub ledger: LedgerSummary,
}

#[derive(Debug, Serialize)]
pub struct UserStatsResponse {
    pub address: Address,
    #[serde(flatten)]
    pub stats: AddressStats,
}

#[derive(Debug, Deserialize)]
pub struct FundRequest {
    pub account: String,
    pub token: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
pub struct FundResponse {
    pub account: Address,
    pub token: Token,
    pub balance: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub caller: String,
    pub call: LedgerCall,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let index = state.coordinator.index();
    Ok(Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        identifier_hash: IDENTIFIER_HASH_FUNCTION.to_string(),
        index: index.get_stats()?,
        reconcile_cursor: index.reconcile_cursor()?,
        ledger_time: state.ledger().now(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// `POST /api/generate-identifier`
///
/// Records the transfer as pending and hands back the publish call. The
/// node never submits it; the sender's wallet does.
async fn generate_identifier_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateIdentifierRequest>, JsonRejection>,
) -> Result<Json<GenerateIdentifierResponse>, ApiError> {
    let req = json_body(payload)?;
    let amount = parse_amount(&req.amount)?;
    let prepared = state
        .coordinator
        .prepare_transfer(&req.sender, &req.recipient, amount, &req.token)?;
    state.metrics.identifiers_generated_total.inc();
    state.metrics.pending_transfers.inc();

    Ok(Json(GenerateIdentifierResponse {
        identifier: prepared.identifier,
        salt: prepared.salt.to_hex(),
        created_at: prepared.created_at,
        sender: prepared.sender,
        amount: prepared.amount.to_string(),
        token: prepared.token,
        status: TransferStatus::Pending,
        publish: prepared.publish,
    }))
}

/// `GET /api/pending-transfers/:address`
async fn pending_transfers_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<PendingTransfersResponse>, ApiError> {
    let address = parse_address(&address)?;
    let transfers: Vec<PendingTransfer> = state
        .coordinator
        .list_pending_for(&address)?
        .into_iter()
        .map(PendingTransfer::from)
        .collect();

    Ok(Json(PendingTransfersResponse {
        address,
        count: transfers.len(),
        transfers,
    }))
}

/// `POST /api/claim-notification`
///
/// Accepted only once the ledger shows the escrow settled, and only from
/// the indexed recipient.
async fn claim_notification_handler(
    State(state): State<AppState>,
    payload: Result<Json<ClaimNotificationRequest>, JsonRejection>,
) -> Result<Json<ClaimNotificationResponse>, ApiError> {
    let req = json_body(payload)?;
    let identifier = parse_identifier(&req.identifier)?;
    let claimer = parse_address(&req.claimer)?;

    let transition = state
        .coordinator
        .acknowledge_claim(&identifier, &claimer)
        .await?;
    state.metrics.claim_notifications_total.inc();
    if transition == Transition::Applied {
        state.metrics.pending_transfers.dec();
    }

    Ok(Json(ClaimNotificationResponse {
        success: true,
        identifier,
        claimer,
        already_recorded: transition == Transition::Unchanged,
    }))
}

/// `GET /api/transaction-status/:identifier`
async fn transaction_status_handler(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Json<TransactionStatusResponse>, ApiError> {
    let identifier = parse_identifier(&identifier)?;
    let record = state.coordinator.transfer_status(&identifier)?;
    Ok(Json(record.into()))
}

/// `POST /api/verify-recipient`
///
/// Answers `valid: false` for unknown identifiers rather than 404, so the
/// response does not reveal whether an identifier exists.
async fn verify_recipient_handler(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRecipientRequest>, JsonRejection>,
) -> Result<Json<VerifyRecipientResponse>, ApiError> {
    let req = json_body(payload)?;
    let identifier = parse_identifier(&req.identifier)?;
    let recipient = parse_address(&req.recipient)?;

    let index = state.coordinator.index();
    let record = if index.verify_recipient(&identifier, &recipient)? {
        index.get(&identifier)?
    } else {
        None
    };

    Ok(Json(VerifyRecipientResponse {
        valid: record.is_some(),
        identifier,
        amount: record.as_ref().map(|r| r.amount.to_string()),
        token: record.as_ref().map(|r| r.token.clone()),
        status: record.map(|r| r.status),
    }))
}

/// `GET /api/stats`
async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let index = state.coordinator.index().get_stats()?;
    let ledger = state.ledger().read(|l| {
        let stats = l.stats();
        LedgerSummary {
            published: stats.published,
            claimed: stats.claimed,
            cancelled: stats.cancelled,
            fee_bps: l.fee_config().fee_bps,
            total_escrowed: amounts_as_strings(&stats.total_escrowed),
            total_fees: amounts_as_strings(&stats.total_fees),
        }
    });
    Ok(Json(StatsResponse { index, ledger }))
}

fn amounts_as_strings(totals: &BTreeMap<Token, Amount>) -> BTreeMap<Token, String> {
    totals
        .iter()
        .map(|(token, amount)| (token.clone(), amount.to_string()))
        .collect()
}

/// `GET /api/user-stats/:address`
async fn user_stats_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<UserStatsResponse>, ApiError> {
    let address = parse_address(&address)?;
    let stats = state.coordinator.index().address_stats(&address)?;
    Ok(Json(UserStatsResponse { address, stats }))
}

/// `POST /devnet/fund`: credits an account on the in-process ledger.
async fn devnet_fund_handler(
    State(state): State<AppState>,
    payload: Result<Json<FundRequest>, JsonRejection>,
) -> Result<Json<FundResponse>, ApiError> {
    let req = json_body(payload)?;
    let account = parse_address(&req.account)?;
    let amount = parse_amount(&req.amount)?;
    let token = resolve_token(&state, &req.token)?;

    state.ledger().fund(&account, &token, amount)?;
    let balance = state.ledger().read(|l| l.balance_of(&account, &token));
    tracing::info!(account = %account, token = %token, amount = %amount, "devnet account funded");

    Ok(Json(FundResponse {
        account,
        token,
        balance: balance.to_string(),
    }))
}

/// `POST /devnet/submit`: executes a ledger call as `caller`, standing in
/// for a wallet.
async fn devnet_submit_handler(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<LedgerEvent>, ApiError> {
    let req = json_body(payload)?;
    let caller = parse_address(&req.caller)?;
    let mut call = req.call;
    if let LedgerCall::Publish { token, .. } = &mut call {
        *token = resolve_token(&state, token.symbol())?;
    }
    let event = state.ledger().submit(&caller, call).await?;
    Ok(Json(event))
}

/// Maps a symbol from a request onto a supported token.
fn resolve_token(state: &AppState, symbol: &str) -> Result<Token, ApiError> {
    state
        .coordinator
        .generator()
        .registry()
        .resolve(symbol)
        .ok_or_else(|| ApiError::bad_request(format!("unsupported token: {symbol}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
