//! REST surface over [`SettlementEngine`].
//!
//! The caller identity arrives from the upstream authentication layer in the
//! `x-actor-id` header. Webhook routes are the exception: rails authenticate
//! with their own signature headers over the raw body.

use crate::application::engine::SettlementEngine;
use crate::application::gateway::PaymentRequest;
use crate::application::redemption::RedemptionRequest;
use crate::domain::budget::{Amount, BudgetCategory};
use crate::domain::rail::{RailArtifact, RailKind, WebhookHeaders};
use crate::domain::redemption::Redemption;
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::domain::voucher::{RuleCheck, Voucher};
use crate::error::PaymentError;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: SettlementEngine,
    /// Storage backend name reported by `/health`.
    pub storage: &'static str,
}

impl AppState {
    pub fn new(engine: SettlementEngine, storage: &'static str) -> Self {
        Self { engine, storage }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments", post(create_payment))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/refresh", post(refresh_payment))
        .route("/webhooks/:rail", post(receive_webhook))
        .route("/redemptions", post(create_redemption))
        .route("/redemptions/:id", get(get_redemption))
        .route("/redemptions/:id/settle", post(settle_redemption))
        .route("/redemptions/:id/refresh", post(refresh_redemption))
        .route("/tokens", post(mint_token))
        .route("/tokens/:id", get(get_token))
        .route("/tokens/:id/validate", post(validate_token))
        .route("/categories/:id", get(get_category))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

/// HTTP status for each engine error.
pub fn status_for(err: &PaymentError) -> StatusCode {
    match err {
        PaymentError::ValidationError(_) | PaymentError::InvalidAmount(_) => {
            StatusCode::BAD_REQUEST
        }
        PaymentError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        PaymentError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        PaymentError::Forbidden(_)
        | PaymentError::ProviderNotRegistered(_)
        | PaymentError::StepUpRequired { .. } => StatusCode::FORBIDDEN,
        PaymentError::NotFound { .. } => StatusCode::NOT_FOUND,
        PaymentError::Conflict(_) => StatusCode::CONFLICT,
        PaymentError::RailUnavailable { .. } => StatusCode::BAD_GATEWAY,
        PaymentError::LedgerViolation(_)
        | PaymentError::CsvError(_)
        | PaymentError::IoError(_)
        | PaymentError::SerializationError(_)
        | PaymentError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Payment(err) => {
                let status = status_for(&err);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "Request failed");
                }
                let body = match &err {
                    PaymentError::StepUpRequired { methods } => json!({
                        "error": err.to_string(),
                        "requiredMethods": methods,
                    }),
                    _ => json!({ "error": err.to_string() }),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

/// The authenticated principal named by `x-actor-id`.
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::unauthenticated(format!("missing {ACTOR_HEADER} header")))?;
        Ok(Actor(actor.to_string()))
    }
}

/// Malformed or mistyped bodies are 400s, not axum's default 422.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "planpay",
        storage: state.storage,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCreated {
    transaction_id: String,
    status: TransactionStatus,
    rail_artifact: RailArtifact,
}

async fn create_payment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentCreated>), ApiError> {
    let request = json_body(payload)?;
    let initiated = state.engine.initiate_payment(&actor, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(PaymentCreated {
            transaction_id: initiated.transaction.id,
            status: initiated.transaction.status,
            rail_artifact: initiated.rail_artifact,
        }),
    ))
}

async fn get_payment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(tx_id): Path<String>,
) -> Result<Json<PaymentTransaction>, ApiError> {
    Ok(Json(state.engine.transaction_for(&actor, &tx_id).await?))
}

async fn refresh_payment(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(tx_id): Path<String>,
) -> Result<Json<PaymentTransaction>, ApiError> {
    Ok(Json(state.engine.refresh_payment(&actor, &tx_id).await?))
}

fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str(), value.to_string()))
        })
        .collect()
}

/// Answers 200 for everything except a failed signature check, so rails do
/// not enter retry storms. Events that failed to apply are recovered through
/// the refresh path.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let rail: RailKind = rail
        .parse()
        .map_err(|_| ApiError::not_found(format!("no webhook route for rail '{rail}'")))?;
    let headers = webhook_headers(&headers);

    match state.engine.ingest_webhook(rail, &body, &headers).await {
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome)).into_response()),
        Err(err @ PaymentError::InvalidSignature(_)) => Err(err.into()),
        Err(err) => {
            error!(%rail, error = %err, "Webhook accepted but not applied");
            Ok((StatusCode::OK, Json(json!({ "received": true }))).into_response())
        }
    }
}

async fn create_redemption(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<RedemptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Redemption>), ApiError> {
    let request = json_body(payload)?;
    let redemption = state.engine.request_redemption(&actor, request).await?;
    Ok((StatusCode::CREATED, Json(redemption)))
}

async fn get_redemption(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(redemption_id): Path<String>,
) -> Result<Json<Redemption>, ApiError> {
    Ok(Json(
        state.engine.redemption_for(&actor, &redemption_id).await?,
    ))
}

async fn settle_redemption(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(redemption_id): Path<String>,
) -> Result<Json<Redemption>, ApiError> {
    Ok(Json(
        state
            .engine
            .settle_redemption(&actor, &redemption_id)
            .await?,
    ))
}

async fn refresh_redemption(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(redemption_id): Path<String>,
) -> Result<Json<Redemption>, ApiError> {
    Ok(Json(
        state
            .engine
            .refresh_redemption(&actor, &redemption_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintRequest {
    category_id: String,
    amount: Decimal,
    #[serde(default)]
    provider_id: Option<String>,
}

async fn mint_token(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<MintRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Voucher>), ApiError> {
    let request = json_body(payload)?;
    let amount = Amount::new(request.amount)?;
    let voucher = state
        .engine
        .mint_voucher(&actor, &request.category_id, amount, request.provider_id)
        .await?;
    Ok((StatusCode::CREATED, Json(voucher)))
}

async fn get_token(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path(voucher_id): Path<String>,
) -> Result<Json<Voucher>, ApiError> {
    Ok(Json(state.engine.voucher(&voucher_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest {
    service_code: String,
    provider_id: String,
}

async fn validate_token(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path(voucher_id): Path<String>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<RuleCheck>, ApiError> {
    let request = json_body(payload)?;
    let check = state
        .engine
        .validate_voucher(&voucher_id, &request.service_code, &request.provider_id)
        .await?;
    Ok(Json(check))
}

async fn get_category(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(category_id): Path<String>,
) -> Result<Json<BudgetCategory>, ApiError> {
    Ok(Json(state.engine.category_for(&actor, &category_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::budget::Balance;
    use crate::domain::provider::ProviderRegistration;
    use crate::infrastructure::in_memory::{
        InMemoryCredentialStore, InMemoryProviderDirectory, in_memory_stores,
    };
    use crate::infrastructure::rails::SandboxRails;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, SandboxRails) {
        let config = EngineConfig::default();
        let providers = InMemoryProviderDirectory::new();
        providers
            .register(ProviderRegistration {
                provider_id: "prov-1".into(),
                registration_number: "4050012345".into(),
                active: true,
                expires_at: Utc::now() + Duration::days(365),
            })
            .await;
        let stores = in_memory_stores(
            Arc::new(providers),
            Arc::new(InMemoryCredentialStore::new()),
        );
        let rails = SandboxRails::new(&config);
        let engine = SettlementEngine::new(stores, rails.registry(), &config);
        engine
            .provision_category(BudgetCategory::new(
                "cat-t",
                "plan-1",
                "p-1",
                "transport",
                Balance(dec!(2000)),
            ))
            .await
            .unwrap();
        (router(AppState::new(engine, "memory")), rails)
    }

    fn post(uri: &str, actor: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(actor) = actor {
            builder = builder.header(ACTOR_HEADER, actor);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn payment(amount: &str) -> Value {
        json!({
            "participantId": "p-1",
            "providerId": "prov-1",
            "categoryId": "cat-t",
            "serviceCode": "transport",
            "amount": amount,
            "railKind": "CARD"
        })
    }

    async fn json_of(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_actor_is_unauthorized() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post("/payments", None, payment("10")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_payment_returns_artifact() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post("/payments", Some("p-1"), payment("120.50")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = json_of(response).await;
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["railArtifact"]["type"], "client_secret");
        assert!(body["transactionId"].as_str().unwrap().starts_with("tx"));
    }

    #[tokio::test]
    async fn test_step_up_lists_required_methods() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post("/payments", Some("p-1"), payment("1000")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = json_of(response).await;
        assert_eq!(body["requiredMethods"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_payment_required() {
        let (app, _) = app().await;
        let response = app
            .clone()
            .oneshot(post(
                "/tokens",
                Some("p-1"),
                json!({ "categoryId": "cat-t", "amount": "1500" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(post("/payments", Some("p-1"), payment("999")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post("/payments", Some("p-1"), json!({ "amount": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_signature_failure_is_unauthorized() {
        let (app, _) = app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/card")
            .header("x-card-signature", "t=1,v1=deadbeef")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signed_webhook_completes_payment() {
        let (app, rails) = app().await;
        let response = app
            .clone()
            .oneshot(post("/payments", Some("p-1"), payment("80")))
            .await
            .unwrap();
        let created = json_of(response).await;
        let tx_id = created["transactionId"].as_str().unwrap().to_string();
        let intent = created["railArtifact"]["paymentIntentId"]
            .as_str()
            .unwrap()
            .to_string();

        let raw = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": intent } }
        }))
        .unwrap();
        let headers = rails.card.webhook_headers(&raw).unwrap();
        let mut builder = Request::builder().method("POST").uri("/webhooks/card");
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::from(raw)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/payments/{tx_id}"))
                    .header(ACTOR_HEADER, "p-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_of(response).await["status"], "COMPLETED");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/categories/cat-t")
                    .header(ACTOR_HEADER, "p-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let category = json_of(response).await;
        assert_eq!(category["spentAmount"], "80");
    }

    #[tokio::test]
    async fn test_unknown_payment_is_not_found() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/payments/tx_missing")
                    .header(ACTOR_HEADER, "p-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
