use axum::{
    Router,
    routing::{get, post, delete},
    extract::{Path, Query, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use crate::error::{Error, ErrorCode, OracleError};
use crate::observability::metrics::gather_text;
use crate::price_infra::cache::CacheStats;
use crate::price_infra::circuit_breaker::BreakerSnapshot;
use crate::price_infra::service::FeedInfo;
use crate::price_infra::{AggregateRequest, OracleService};
use crate::types::aggregation::AggregateResponse;
use crate::types::ids::FeedId;

pub struct ApiState {
    pub service: Arc<OracleService>,
}

impl ApiState {
    pub fn new(service: Arc<OracleService>) -> Self {
        ApiState { service }
    }

    fn error(&self, error: Error) -> ApiError {
        ApiError {
            status: status_for(&error),
            body: OracleError::from_error(&error, self.service.now()),
        }
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/v1/prices/:feed_id", get(get_price))
        .route("/v1/feeds", get(list_feeds))
        .route("/v1/feeds/:feed_id/breakers", get(get_breakers))
        .route("/v1/feeds/:feed_id/breakers/reset", post(reset_breakers))
        .route("/v1/cache", delete(clear_cache))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/:feed_id", delete(invalidate_cache))
        .with_state(state)
}

/// `OracleError` JSON with a status derived from its code.
pub struct ApiError {
    status: StatusCode,
    body: OracleError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error.code() {
        ErrorCode::DataValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::ConfigurationError => StatusCode::NOT_FOUND,
        ErrorCode::AggregationError | ErrorCode::CircuitBreakerError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::AuthenticationError => StatusCode::BAD_GATEWAY,
        ErrorCode::NetworkError => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::StaleDataError
        | ErrorCode::PriceDeviationError
        | ErrorCode::LowConfidenceError => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics() -> Result<String, StatusCode> {
    gather_text().map_err(|e| {
        tracing::error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Default, Deserialize)]
struct PriceQuery {
    max_staleness_secs: Option<u64>,
    min_confidence: Option<u64>,
    allow_cached: Option<bool>,
    timeout_ms: Option<u64>,
}

impl PriceQuery {
    fn into_request(self, feed_id: FeedId) -> Result<AggregateRequest, Error> {
        let min_confidence = self
            .min_confidence
            .map(|c| {
                u8::try_from(c)
                    .map_err(|_| Error::InvalidRequest(format!("min_confidence {} outside 0-100", c)))
            })
            .transpose()?;

        Ok(AggregateRequest {
            feed_id,
            max_staleness_secs: self.max_staleness_secs,
            min_confidence,
            allow_cached: self.allow_cached.unwrap_or(true),
            timeout_ms: self.timeout_ms,
        })
    }
}

fn parse_feed(state: &ApiState, raw: &str) -> Result<FeedId, ApiError> {
    FeedId::parse(raw).map_err(|e| state.error(e))
}

async fn get_price(
    State(state): State<Arc<ApiState>>,
    Path(feed_id): Path<String>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<AggregateResponse>, ApiError> {
    let feed_id = parse_feed(&state, &feed_id)?;
    let request = query.into_request(feed_id).map_err(|e| state.error(e))?;

    let response = state
        .service
        .aggregate(request)
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(response))
}

async fn list_feeds(State(state): State<Arc<ApiState>>) -> Json<Vec<FeedInfo>> {
    Json(state.service.feeds())
}

async fn get_breakers(
    State(state): State<Arc<ApiState>>,
    Path(feed_id): Path<String>,
) -> Result<Json<Vec<BreakerSnapshot>>, ApiError> {
    let feed_id = parse_feed(&state, &feed_id)?;
    let snapshots = state
        .service
        .breaker_snapshots(&feed_id)
        .map_err(|e| state.error(e))?;
    Ok(Json(snapshots))
}

#[derive(Serialize)]
struct ResetResponse {
    feed_id: FeedId,
    reset: usize,
}

async fn reset_breakers(
    State(state): State<Arc<ApiState>>,
    Path(feed_id): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let feed_id = parse_feed(&state, &feed_id)?;
    let reset = state
        .service
        .reset_breakers(&feed_id)
        .map_err(|e| state.error(e))?;
    Ok(Json(ResetResponse { feed_id, reset }))
}

#[derive(Serialize)]
struct InvalidateResponse {
    feed_id: FeedId,
    invalidated: bool,
}

async fn invalidate_cache(
    State(state): State<Arc<ApiState>>,
    Path(feed_id): Path<String>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let feed_id = parse_feed(&state, &feed_id)?;
    let invalidated = state.service.invalidate_cache(&feed_id);
    Ok(Json(InvalidateResponse { feed_id, invalidated }))
}

async fn cache_stats(State(state): State<Arc<ApiState>>) -> Json<CacheStats> {
    Json(state.service.cache_stats())
}

#[derive(Serialize)]
struct ClearResponse {
    cleared: usize,
}

async fn clear_cache(State(state): State<Arc<ApiState>>) -> Json<ClearResponse> {
    Json(ClearResponse { cleared: state.service.clear_cache() })
}
