use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::account::{self, Account, AccountStore, CreationRequest};
use crate::cache::BalanceCache;
use crate::config::Config;
use crate::customer;
use crate::money::Money;

#[derive(Clone)]
pub struct App {
    pub store: AccountStore,
    pub cache: BalanceCache,
}

pub fn router(app: App, cfg: &Config) -> Router {
    Router::new()
        .route("/accounts", get(find_all_accounts))
        .route("/accounts", post(create_account_for_customer))
        .route("/accounts/:id", get(get_account_by_id))
        .route("/accounts/:id", delete(delete_account_by_id))
        .route("/accounts/:id/freeze", put(freeze))
        .route("/accounts/:id/balance", get(get_balance))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(cfg.write_timeout))
        .layer(RequestBodyTimeoutLayer::new(cfg.read_timeout))
        .with_state(app)
}

/// JSON error envelope with its status code. Anything 5xx except 503/501 is
/// reported as a generic 500 so internals never leak to clients.
#[derive(Debug, PartialEq)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(id: i64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("account id {id} is not found"),
        )
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    fn normalized(self) -> Self {
        let masked = self.status.is_server_error()
            && self.status != StatusCode::SERVICE_UNAVAILABLE
            && self.status != StatusCode::NOT_IMPLEMENTED;
        if masked {
            ApiError::internal()
        } else {
            self
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError { status, message } = self.normalized();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<account::Error> for ApiError {
    fn from(err: account::Error) -> Self {
        match err {
            account::Error::NotFound(id) => ApiError::not_found(id),
            other => {
                error!("error while serving request: {other}");
                ApiError::internal()
            }
        }
    }
}

fn parse_account_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("unable to parse account id"))
}

async fn find_all_accounts(State(app): State<App>) -> Result<Json<Vec<Account>>, ApiError> {
    Ok(Json(app.store.select_all().await?))
}

async fn get_account_by_id(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let id = parse_account_id(&id)?;
    Ok(Json(app.store.select_by_id(id).await?))
}

async fn create_account_for_customer(
    State(app): State<App>,
    payload: Result<Json<CreationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let Json(req) = payload
        .map_err(|_| ApiError::bad_request("invalid request payload, unable to parse"))?;
    let currency = req
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let customer = customer::create(app.store.pool(), &req)
        .await
        .map_err(|err| match err {
            customer::Error::EmailTaken(_) => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            customer::Error::Db(db) => {
                error!("unable to insert customer: {db}");
                ApiError::internal()
            }
        })?;

    let account = app
        .store
        .create(customer.id, req.initial_balance, currency)
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn delete_account_by_id(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_account_id(&id)?;
    app.store.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn freeze(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let id = parse_account_id(&id)?;
    Ok(Json(app.store.freeze(id).await?))
}

/// Balance reads prefer the cache; a miss falls back to the store and is not
/// repopulated. Responds with a display string, not minor units.
async fn get_balance(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_account_id(&id)?;

    if let Some(balance) = app.cache.get(id).await {
        return Ok(Json(json!({ "balance": balance.to_string() })));
    }

    let account = app.store.select_by_id(id).await?;
    let balance = Money::new(account.balance_minor, account.currency);
    Ok(Json(json!({ "balance": balance.to_string() })))
}

async fn health(State(app): State<App>) -> Result<Json<Value>, ApiError> {
    app.store.health_check().await.map_err(|err| {
        error!("health check failed: {err}");
        ApiError::internal()
    })?;
    Ok(Json(json!({ "status": "ok" })))
}
