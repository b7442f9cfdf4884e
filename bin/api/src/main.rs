//! Quasar API Server: account reads, claiming, withdrawals, and manual pipeline triggers.
//!
//! Routes that change state require `Authorization: Bearer $API_TOKEN`. The
//! sign-in flow that verifies account ownership sits in front of this server
//! and is the only holder of that token.

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use quasar_core::{Address, Amount, Handle, Settings, Token, telemetry};
use quasar_pipeline::{ClaimError, Services, WalletError, build_services};
use quasar_pipeline::executor::TransferError;
use quasar_storage::{self as storage, models::Account, models::Profile};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

/// Shared application state.
struct AppState {
    services: Services,
    api_token: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!("Starting Quasar API Server");

    let pool = storage::connect(&settings.database_url).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database ready");

    let services = build_services(&settings, pool)?;
    if settings.api_token.is_none() {
        tracing::warn!("API_TOKEN is not set; state-changing routes will refuse every request");
    }
    let state = Arc::new(AppState {
        services,
        api_token: settings.api_token.clone(),
    });

    let protected = Router::new()
        .route("/api/v1/accounts/activate", post(activate_account))
        .route(
            "/api/v1/accounts/:handle/claims/claim-all",
            post(claim_all),
        )
        .route("/api/v1/accounts/:handle/claims/:id/claim", post(claim_one))
        .route("/api/v1/accounts/:handle/withdraw", post(withdraw))
        .route("/api/v1/poll", post(trigger_poll))
        .route("/api/v1/replies/retry", post(trigger_retry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    let app = Router::new()
        .merge(protected)
        .route("/api/v1/accounts/:handle", get(get_account))
        .route("/api/v1/accounts/:handle/balance", get(get_balance))
        .route("/api/v1/accounts/:handle/history", get(get_history))
        .route("/api/v1/accounts/:handle/claims", get(get_claims))
        .route("/api/v1/replies/queue", get(get_queue))
        .route("/health", get(health))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PollParams {
    since_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    to_address: String,
    /// Decimal amount, e.g. `"0.25"`.
    amount: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    handle: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    avatar_url: String,
    #[serde(default)]
    bio: String,
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

/// Public view of an account; custody material never leaves the store.
#[derive(Serialize)]
struct AccountView {
    handle: String,
    address: String,
    activated: bool,
    display_name: String,
    avatar_url: String,
    bio: String,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        let handle = account.handle().to_string();
        let address = format!("{:#x}", account.address());
        match account {
            Account::Activated { profile, .. } => Self {
                handle,
                address,
                activated: true,
                display_name: profile.display_name,
                avatar_url: profile.avatar_url,
                bio: profile.bio,
            },
            Account::Provisioned { .. } => Self {
                handle,
                address,
                activated: false,
                display_name: String::new(),
                avatar_url: String::new(),
                bio: String::new(),
            },
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn json_ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn json_err(status: StatusCode, msg: &str) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: msg.to_string(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "Request failed");
    json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

fn claim_err(e: ClaimError) -> ApiError {
    match e {
        ClaimError::NotFound(_) | ClaimError::ClaimNotFound(_) => {
            json_err(StatusCode::NOT_FOUND, &e.to_string())
        }
        ClaimError::NotActivated(_) => json_err(StatusCode::FORBIDDEN, &e.to_string()),
        ClaimError::Store(_) | ClaimError::Custody(_) => internal(e),
    }
}

fn wallet_err(e: WalletError) -> ApiError {
    match e {
        WalletError::NotFound(_) | WalletError::NoWallet(_) => {
            json_err(StatusCode::NOT_FOUND, &e.to_string())
        }
        WalletError::NotActivated(_) => json_err(StatusCode::FORBIDDEN, &e.to_string()),
        WalletError::InvalidAmount
        | WalletError::Transfer(
            TransferError::InsufficientBalance { .. } | TransferError::InsufficientFee { .. },
        ) => json_err(StatusCode::BAD_REQUEST, &e.to_string()),
        WalletError::Transfer(_) | WalletError::Chain(_) | WalletError::Store(_) => internal(e),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn require_api_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Err(json_err(
            StatusCode::SERVICE_UNAVAILABLE,
            "API token is not configured",
        ));
    };
    if bearer_token(request.headers()) != Some(expected) {
        return Err(json_err(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    Ok(next.run(request).await)
}

fn parse_handle(raw: &str) -> Result<Handle, ApiError> {
    Handle::parse(raw).ok_or_else(|| json_err(StatusCode::BAD_REQUEST, "Invalid handle"))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// GET /api/v1/accounts/:handle: account and custodial address.
async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let row = state
        .services
        .store
        .find_account(&handle)
        .await
        .map_err(internal)?
        .ok_or_else(|| json_err(StatusCode::NOT_FOUND, "Account not found"))?;
    let account = Account::try_from(row).map_err(internal)?;
    Ok(json_ok(AccountView::from(account)))
}

/// GET /api/v1/accounts/:handle/history: settled movements, newest first.
async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let history = state
        .services
        .store
        .history(&handle)
        .await
        .map_err(internal)?;
    Ok(json_ok(history))
}

/// GET /api/v1/accounts/:handle/claims: value waiting to be claimed.
async fn get_claims(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let claims = state
        .services
        .store
        .pending_claims(&handle)
        .await
        .map_err(internal)?;
    Ok(json_ok(claims))
}

/// POST /api/v1/accounts/:handle/claims/:id/claim
async fn claim_one(
    State(state): State<Arc<AppState>>,
    Path((handle, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let entry = state
        .services
        .claims
        .claim(&handle, id)
        .await
        .map_err(claim_err)?;
    Ok(json_ok(entry))
}

/// POST /api/v1/accounts/:handle/claims/claim-all
async fn claim_all(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let entries = state
        .services
        .claims
        .claim_all(&handle)
        .await
        .map_err(claim_err)?;
    Ok(json_ok(entries))
}

/// GET /api/v1/accounts/:handle/balance: on-chain holdings of the custodial wallet.
async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let balance = state
        .services
        .wallets
        .balance(&handle)
        .await
        .map_err(wallet_err)?;
    Ok(json_ok(balance))
}

/// POST /api/v1/accounts/:handle/withdraw: send funds to an external address.
async fn withdraw(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
    Json(request): Json<WithdrawRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&handle)?;
    let to: Address = request
        .to_address
        .trim()
        .parse()
        .map_err(|_| json_err(StatusCode::BAD_REQUEST, "Invalid recipient address"))?;
    let amount = Amount::parse_decimal(request.amount.trim())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("Invalid amount: {e}")))?;
    let token = match request.token.as_deref() {
        Some(raw) => raw
            .parse::<Token>()
            .map_err(|_| json_err(StatusCode::BAD_REQUEST, "Unsupported token"))?,
        None => Token::Bnb,
    };

    let withdrawal = state
        .services
        .wallets
        .withdraw(&handle, to, amount, token)
        .await
        .map_err(wallet_err)?;
    Ok(json_ok(withdrawal))
}

/// POST /api/v1/accounts/activate: the owner signed in.
async fn activate_account(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = parse_handle(&request.handle)?;
    let profile = Profile {
        display_name: request.display_name,
        avatar_url: request.avatar_url,
        bio: request.bio,
    };
    let account = state
        .services
        .claims
        .activate(&handle, profile)
        .await
        .map_err(claim_err)?;
    Ok(json_ok(AccountView::from(account)))
}

/// POST /api/v1/poll: run one cycle now. With `since_id` the stored cursor is left alone.
async fn trigger_poll(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = &state.services.pipeline;
    let report = match params.since_id.as_deref() {
        Some(since) => pipeline.run_poll_cycle(Some(since)).await,
        None => pipeline.run_scheduled_poll().await,
    }
    .map_err(internal)?;
    Ok(json_ok(report))
}

/// POST /api/v1/replies/retry: sweep the reply queue now.
async fn trigger_retry(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .services
        .pipeline
        .run_retry_sweep()
        .await
        .map_err(internal)?;
    Ok(json_ok(report))
}

/// GET /api/v1/replies/queue: reply queue counters.
async fn get_queue(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .services
        .store
        .queue_stats(chrono::Utc::now())
        .await
        .map_err(internal)?;
    Ok(json_ok(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn unit_bearer_token_reads_the_authorization_header() {
        assert_eq!(bearer_token(&with_auth("Bearer s3cret")), Some("s3cret"));
        assert_eq!(bearer_token(&with_auth("Bearer   s3cret ")), Some("s3cret"));
    }

    #[test]
    fn unit_bearer_token_rejects_other_schemes_and_blanks() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
        assert_eq!(bearer_token(&with_auth("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&with_auth("Bearer ")), None);
        assert_eq!(bearer_token(&with_auth("s3cret")), None);
    }
}
