use bytes::Bytes;

use crate::errors::AdapterError;
use crate::headers::Headers;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes (non-2xx).
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    /// Collapse a transport failure into the typed adapter error. HTTP
    /// failures go through the owning adapter instead, which can read the
    /// provider's error body.
    pub fn into_transport_error(self) -> AdapterError {
        match self {
            UpstreamFailure::Transport { kind, message } => match kind {
                TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => {
                    AdapterError::timeout(message)
                }
                _ => AdapterError::new(crate::AdapterErrorCode::Transport, message, true),
            },
            UpstreamFailure::Http { status, body, .. } => {
                AdapterError::from_status(status, String::from_utf8_lossy(&body).into_owned())
            }
        }
    }
}
