use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::auth::require_operator;
use crate::engine::{ConflictKind, Engine, EngineError, PromoteRequest};
use crate::model::*;
use crate::observability;
use crate::realtime;

// ── State ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// One permit per connected real-time session.
    pub sessions: Arc<Semaphore>,
    pub operator_token: Option<Arc<str>>,
    /// Cancelled at shutdown; live sessions close on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, max_sessions: usize, operator_token: Option<String>) -> Self {
        Self {
            engine,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            operator_token: operator_token.map(Arc::from),
            shutdown: CancellationToken::new(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Unauthorized,
    TooManySessions,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Engine(EngineError::Conflict(ConflictKind::HeldByOtherSession)) => {
                (StatusCode::CONFLICT, "slot_held")
            }
            ApiError::Engine(EngineError::Conflict(ConflictKind::AlreadyBooked)) => {
                (StatusCode::CONFLICT, "slot_booked")
            }
            ApiError::Engine(EngineError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Engine(EngineError::Validation(_)) | ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            ApiError::Engine(EngineError::LimitExceeded(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "limit_exceeded")
            }
            ApiError::Engine(EngineError::StoreUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::TooManySessions => (StatusCode::SERVICE_UNAVAILABLE, "too_many_sessions"),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{e}"),
            ApiError::BadRequest(msg) => write!(f, "{msg}"),
            ApiError::Unauthorized => write!(f, "operator token required"),
            ApiError::TooManySessions => write!(f, "too many connected sessions"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if let ApiError::Engine(e) = &self {
            metrics::counter!(observability::ERRORS_TOTAL, "kind" => observability::error_label(e))
                .increment(1);
            if matches!(e, EngineError::StoreUnavailable(_)) {
                tracing::error!("request failed: {e}");
            }
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Request parsing ──────────────────────────────────────────────

fn parse_id(field: &str, raw: &str) -> Result<Ulid, EngineError> {
    raw.parse()
        .map_err(|_| EngineError::invalid(format!("{field}: not a valid id: {raw:?}")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(format!("date: expected YYYY-MM-DD, got {raw:?}")))
}

fn parse_time(raw: &str) -> Result<TimeOfDay, EngineError> {
    raw.parse().map_err(|e: ParseTimeError| EngineError::invalid(e.to_string()))
}

fn parse_slot(service_id: &str, date: &str, time: &str) -> Result<SlotKey, EngineError> {
    Ok(SlotKey::new(
        parse_id("service_id", service_id)?,
        parse_date(date)?,
        parse_time(time)?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: String,
    pub service_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AcquireBody {
    pub date: String,
    pub time: String,
    pub service_id: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub lease_id: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    #[serde(default)]
    pub lease_id: Option<String>,
    pub session_id: String,
    pub client_name: String,
    #[serde(default)]
    pub client_contact: String,
    pub service_id: String,
    pub date: String,
    pub time: String,
}

#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub lease_id: Ulid,
    pub slot: SlotKey,
    pub session_id: Ulid,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

// ── Routes ───────────────────────────────────────────────────────

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(public_routes())
        .merge(operator_routes(state.clone()))
        .route("/ws", get(realtime::ws_handler))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/availability", get(availability))
        .route("/api/leases", post(acquire_lease).get(list_leases))
        .route("/api/leases/release", post(release_lease))
        .route("/api/bookings", post(confirm_booking))
        .route("/api/services", get(list_services))
        .route("/api/schedules", get(list_schedules))
}

fn operator_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/admin/bookings", get(list_bookings))
        .route(
            "/api/admin/bookings/{id}",
            get(get_booking).patch(update_booking).delete(delete_booking),
        )
        .route_layer(middleware::from_fn_with_state(state, require_operator))
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();
    metrics::counter!(observability::HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn healthz() -> &'static str {
    "ok"
}

async fn availability(
    State(state): State<AppState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SlotView>>> {
    let Query(q) = query?;
    let date = parse_date(&q.date)?;
    let service_id = parse_id("service_id", &q.service_id)?;
    Ok(Json(state.engine.resolve(date, service_id).await?))
}

async fn acquire_lease(
    State(state): State<AppState>,
    body: Result<Json<AcquireBody>, JsonRejection>,
) -> ApiResult<Json<LeaseResponse>> {
    let Json(body) = body?;
    let slot = parse_slot(&body.service_id, &body.date, &body.time)?;
    let session_id = parse_id("session_id", &body.session_id)?;

    let lease = state.engine.acquire(slot, session_id).await?;
    let info = lease.info(state.engine.locks.ttl());
    Ok(Json(LeaseResponse {
        lease_id: lease.id,
        slot: lease.slot,
        session_id: lease.session_id,
        acquired_at: info.acquired_at,
        expires_at: info.expires_at,
    }))
}

async fn release_lease(
    State(state): State<AppState>,
    body: Result<Json<ReleaseBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = body?;
    let lease_id = parse_id("lease_id", &body.lease_id)?;
    let session_id = parse_id("session_id", &body.session_id)?;
    state.engine.release(lease_id, session_id).await;
    Ok(Json(serde_json::json!({})))
}

async fn list_leases(State(state): State<AppState>) -> Json<Vec<SlotHolds>> {
    Json(state.engine.lock_snapshot())
}

async fn confirm_booking(
    State(state): State<AppState>,
    body: Result<Json<ConfirmBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let Json(body) = body?;
    let lease_id = match body.lease_id.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(parse_id("lease_id", raw)?),
    };
    let req = PromoteRequest {
        lease_id,
        session_id: parse_id("session_id", &body.session_id)?,
        slot: parse_slot(&body.service_id, &body.date, &body.time)?,
        client: ClientDetails {
            name: body.client_name,
            contact: body.client_contact,
        },
    };
    let booking = state.engine.promote(req).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<Service>> {
    Json(state.engine.catalog.services().to_vec())
}

async fn list_schedules(State(state): State<AppState>) -> Json<Vec<DaySchedule>> {
    Json(state.engine.catalog.schedules())
}

async fn list_bookings(State(state): State<AppState>) -> ApiResult<Json<Vec<Booking>>> {
    Ok(Json(state.engine.list_bookings().await?))
}

async fn get_booking(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Booking>> {
    let id = parse_id("id", &id)?;
    Ok(Json(state.engine.get_booking(id).await?))
}

async fn update_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    patch: Result<Json<BookingPatch>, JsonRejection>,
) -> ApiResult<Json<Booking>> {
    let id = parse_id("id", &id)?;
    let Json(patch) = patch?;
    Ok(Json(state.engine.update_booking(id, patch).await?))
}

async fn delete_booking(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Booking>> {
    let id = parse_id("id", &id)?;
    Ok(Json(state.engine.delete_booking(id).await?))
}
