//! REST handlers and router for `/accounts`.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::domain::Account;
use crate::error::ApiError;
use crate::storage::AccountStorage;

/// Response body for a single account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDto {
    pub id: Uuid,
    pub users: Vec<String>,
    pub balance: i64,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<Account> for AccountDto {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            users: account.users,
            balance: account.balance,
            created_at: account.created_at,
            deleted_at: account.deleted_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteAccountRequest {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountQuery {
    id: Option<String>,
}

/// Build the router for the accounts API.
///
/// - `POST /accounts` -- create an account, body `{"user": "..."}`
/// - `GET /accounts?id=<uuid>` -- fetch an account
/// - `DELETE /accounts?id=<uuid>` -- delete an account, body `{"reason": "..."}`
pub fn build_router(storage: AccountStorage) -> Router {
    Router::new()
        .route(
            "/accounts",
            post(create_account).get(get_account).delete(delete_account),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(storage)
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("invalid request body".into()))
}

fn parse_id(query: &AccountQuery) -> Result<Uuid, ApiError> {
    let raw = query
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing id".into()))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("invalid id".into()))
}

async fn create_account(
    State(storage): State<AccountStorage>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateAccountRequest = parse_body(&body)?;
    let user = request.user.unwrap_or_default();

    let account = storage.create_account(&user).await?;
    Ok((StatusCode::CREATED, Json(AccountDto::from(account))).into_response())
}

async fn get_account(
    State(storage): State<AccountStorage>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<AccountDto>, ApiError> {
    let id = parse_id(&query)?;
    let account = storage.get_account(id).await?;
    Ok(Json(AccountDto::from(account)))
}

async fn delete_account(
    State(storage): State<AccountStorage>,
    Query(query): Query<AccountQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&query)?;
    let request: DeleteAccountRequest = parse_body(&body)?;
    let reason = request
        .reason
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing reason".into()))?;

    storage.delete_account(id, &reason).await?;
    Ok(StatusCode::NO_CONTENT)
}
