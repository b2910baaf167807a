//! Thin JSON admin surface: channel and pricing CRUD plus cache refresh.
//! Mutations write through storage and invalidate the relay's caches.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;

use modelgate_core::{AppState, ChannelSelector, HealthChecker, PricingService};
use modelgate_storage::{ChannelUpsert, PricingUpsert, QuotaType, Storage};

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
    pub selector: Arc<ChannelSelector>,
    pub pricing: Arc<PricingService>,
    pub health: Arc<HealthChecker>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/batch", post(batch_set_enabled))
        .route("/channels/{id}", put(update_channel).delete(delete_channel))
        .route("/channels/{id}/test", post(test_channel))
        .route("/pricing", get(list_pricing).post(upsert_pricing))
        .route("/pricing/refresh", post(refresh_pricing))
        .route("/pricing/{id}", axum::routing::delete(delete_pricing))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected_hash = state.app.config.load().admin_key_hash.clone();
    let authorized = presented_admin_key(req.headers(), req.uri())
        .is_some_and(|key| blake3::hash(key.as_bytes()).to_hex().to_string() == expected_hash);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

/// Admin key as presented by the caller: `x-admin-key`, then a bearer
/// token, then an `admin_key` query parameter.
fn presented_admin_key(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    let from_header = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
    let from_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.trim().split_once(' '))
        .and_then(|(scheme, token)| scheme.eq_ignore_ascii_case("bearer").then_some(token));

    if let Some(key) = [from_header, from_bearer]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|key| !key.is_empty())
    {
        return Some(key.to_string());
    }

    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(uri.query()?).ok()?;
    pairs
        .into_iter()
        .find(|(name, value)| name == "admin_key" && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    name: String,
    adapter: String,
    #[serde(default)]
    base_url: Option<String>,
    api_keys: Vec<String>,
    models: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    test_model: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_weight")]
    weight: i32,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_weight() -> i32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ChannelPayload {
    fn validate(&self) -> Result<ChannelUpsert, &'static str> {
        if self.api_keys.is_empty() {
            return Err("channel requires at least one api key");
        }
        if self.models.is_empty() {
            return Err("channel requires at least one supported model");
        }
        Ok(ChannelUpsert {
            name: self.name.clone(),
            adapter: self.adapter.clone(),
            base_url: self.base_url.clone(),
            api_keys: self.api_keys.clone(),
            models: self.models.clone(),
            groups: self.groups.clone(),
            test_model: self.test_model.clone(),
            priority: self.priority,
            weight: self.weight,
            enabled: self.enabled,
        })
    }
}

async fn list_channels(State(state): State<AdminState>) -> Response {
    match state.storage.load_channels().await {
        Ok(rows) => {
            let body: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    let stats = state.selector.stats(row.id);
                    serde_json::json!({
                        "id": row.id,
                        "name": row.name,
                        "adapter": row.adapter,
                        "base_url": row.base_url,
                        "models": row.models,
                        "groups": row.groups,
                        "priority": row.priority,
                        "weight": row.weight,
                        "enabled": row.enabled,
                        "stats": stats.map(|s| serde_json::json!({
                            "total": s.total,
                            "successes": s.successes,
                            "failures": s.failures,
                            "consecutive_failures": s.consecutive_failures,
                            "ema_latency_ms": s.ema_latency_ms,
                        })),
                    })
                })
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn create_channel(
    State(state): State<AdminState>,
    Json(payload): Json<ChannelPayload>,
) -> Response {
    let upsert = match payload.validate() {
        Ok(upsert) => upsert,
        Err(message) => return bad_request(message),
    };
    match state.storage.insert_channel(&upsert).await {
        Ok(id) => {
            state.selector.invalidate().await;
            (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn update_channel(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<ChannelPayload>,
) -> Response {
    let upsert = match payload.validate() {
        Ok(upsert) => upsert,
        Err(message) => return bad_request(message),
    };
    match state.storage.update_channel(id, &upsert).await {
        Ok(()) => {
            state.selector.invalidate().await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn delete_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.storage.delete_channel(id).await {
        Ok(()) => {
            state.selector.invalidate().await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct BatchEnablePayload {
    ids: Vec<i64>,
    enabled: bool,
}

async fn batch_set_enabled(
    State(state): State<AdminState>,
    Json(payload): Json<BatchEnablePayload>,
) -> Response {
    for id in &payload.ids {
        state.selector.set_enabled(*id, payload.enabled).await;
    }
    state.selector.invalidate().await;
    StatusCode::NO_CONTENT.into_response()
}

async fn test_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    let channel = state
        .selector
        .channels()
        .into_iter()
        .find(|channel| channel.id == id);
    let Some(channel) = channel else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let result = state.health.probe(&channel).await;
    state
        .selector
        .record(
            result.channel_id,
            result.ok,
            std::time::Duration::from_millis(result.latency_ms.max(0) as u64),
        )
        .await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "channel_id": result.channel_id,
            "ok": result.ok,
            "latency_ms": result.latency_ms,
            "error": result.error,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct PricingPayload {
    model_name: String,
    #[serde(default = "default_group")]
    group_name: String,
    #[serde(default = "default_quota_type")]
    quota_type: String,
    input_rate: f64,
    #[serde(default = "default_multiplier")]
    completion_multiplier: f64,
    #[serde(default = "default_multiplier")]
    group_multiplier: f64,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_quota_type() -> String {
    "token".to_string()
}

fn default_multiplier() -> f64 {
    1.0
}

async fn list_pricing(State(state): State<AdminState>) -> Response {
    match state.storage.load_pricing().await {
        Ok(rows) => {
            let body: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "id": row.id,
                        "model_name": row.model_name,
                        "group_name": row.group_name,
                        "quota_type": row.quota_type.as_str(),
                        "input_rate": row.input_rate,
                        "completion_multiplier": row.completion_multiplier,
                        "group_multiplier": row.group_multiplier,
                        "enabled": row.enabled,
                    })
                })
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn upsert_pricing(
    State(state): State<AdminState>,
    Json(payload): Json<PricingPayload>,
) -> Response {
    let upsert = PricingUpsert {
        model_name: payload.model_name,
        group_name: payload.group_name,
        quota_type: QuotaType::parse(&payload.quota_type),
        input_rate: payload.input_rate,
        completion_multiplier: payload.completion_multiplier,
        group_multiplier: payload.group_multiplier,
        enabled: payload.enabled,
    };
    match state.storage.upsert_pricing(&upsert).await {
        Ok(id) => {
            refresh_pricing_cache(&state).await;
            (StatusCode::OK, Json(serde_json::json!({ "id": id }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn delete_pricing(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.storage.delete_pricing(id).await {
        Ok(()) => {
            refresh_pricing_cache(&state).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn refresh_pricing(State(state): State<AdminState>) -> Response {
    refresh_pricing_cache(&state).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn refresh_pricing_cache(state: &AdminState) {
    if let Err(err) = state.pricing.force_refresh().await {
        tracing::warn!(error = %err, "pricing cache refresh failed");
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn storage_error(err: modelgate_storage::StorageError) -> Response {
    tracing::warn!(error = %err, "admin storage operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "storage unavailable" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_key_sources() {
        let uri: axum::http::Uri = "/channels".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert!(presented_admin_key(&headers, &uri).is_none());

        headers.insert("x-admin-key", "secret".parse().unwrap());
        assert_eq!(
            presented_admin_key(&headers, &uri).as_deref(),
            Some("secret")
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer tok-1".parse().unwrap());
        assert_eq!(
            presented_admin_key(&headers, &uri).as_deref(),
            Some("tok-1")
        );

        let headers = HeaderMap::new();
        let uri: axum::http::Uri = "/channels?admin_key=qsecret".parse().unwrap();
        assert_eq!(
            presented_admin_key(&headers, &uri).as_deref(),
            Some("qsecret")
        );

        let uri: axum::http::Uri = "/channels?admin_key=%20".parse().unwrap();
        assert!(presented_admin_key(&headers, &uri).is_none());
    }

    #[test]
    fn channel_payload_invariants() {
        let payload = ChannelPayload {
            name: "c".to_string(),
            adapter: "openai".to_string(),
            base_url: None,
            api_keys: vec![],
            models: vec!["gpt-4".to_string()],
            groups: vec![],
            test_model: None,
            priority: 0,
            weight: 1,
            enabled: true,
        };
        assert!(payload.validate().is_err());
    }
}
