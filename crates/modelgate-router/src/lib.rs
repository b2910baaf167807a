//! OpenAI-compatible downstream surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use modelgate_core::{AppState, AuthedUser, RelayError, RelayOrchestrator, RelayResponse};
use modelgate_protocol::chat::ChatCompletionRequest;

#[derive(Clone)]
pub struct RouterState {
    pub app: Arc<AppState>,
    pub relay: Arc<RelayOrchestrator>,
}

pub fn proxy_router(app: Arc<AppState>, relay: Arc<RelayOrchestrator>) -> Router {
    let state = RouterState { app, relay };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&RelayError::InvalidRequest(format!(
                "malformed request body: {err}"
            )));
        }
    };

    match state.relay.handle_chat(&user, request).await {
        Ok(RelayResponse::Completion(response)) => json_ok(&*response),
        Ok(RelayResponse::Stream(frames)) => sse_response(frames),
        Err(err) => {
            if err.status() >= 500 {
                tracing::warn!(user_id = user.id, error = %err, "relay request failed");
            }
            error_response(&err)
        }
    }
}

async fn list_models(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    json_ok(&state.relay.models())
}

fn authenticate(state: &RouterState, headers: &HeaderMap) -> Result<AuthedUser, Response> {
    let Some(key) = extract_bearer(headers) else {
        return Err(error_response(&RelayError::Unauthorized));
    };
    state
        .app
        .authenticate(key)
        .ok_or_else(|| error_response(&RelayError::Unauthorized))
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&err.envelope()).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// SSE headers are set once, before the first frame is flushed.
fn sse_response(frames: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("sk-abc"));

        headers.insert(header::AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());
    }
}
