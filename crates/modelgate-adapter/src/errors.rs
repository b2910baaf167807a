use std::error::Error;
use std::fmt;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorCode {
    Timeout,
    TooManyRequests,
    UpstreamServerError,
    UpstreamClientError,
    UpstreamAuthError,
    InvalidConfig,
    Unsupported,
    Decode,
    Transport,
}

impl AdapterErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorCode::Timeout => "timeout",
            AdapterErrorCode::TooManyRequests => "too_many_requests",
            AdapterErrorCode::UpstreamServerError => "upstream_server_error",
            AdapterErrorCode::UpstreamClientError => "upstream_client_error",
            AdapterErrorCode::UpstreamAuthError => "upstream_auth_error",
            AdapterErrorCode::InvalidConfig => "invalid_config",
            AdapterErrorCode::Unsupported => "unsupported",
            AdapterErrorCode::Decode => "decode",
            AdapterErrorCode::Transport => "transport",
        }
    }
}

/// Typed upstream failure. `retryable` drives the selector's failover loop:
/// true means another channel may succeed, false means the request itself is
/// at fault and must surface to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub code: AdapterErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl AdapterError {
    pub fn new(code: AdapterErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorCode::Timeout, message, true)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorCode::InvalidConfig, message, false)
    }

    pub fn unsupported(what: &'static str) -> Self {
        Self::new(AdapterErrorCode::Unsupported, what, false)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorCode::Decode, message, false)
    }

    /// Map an HTTP error status per the relay's retry policy: 408/429/5xx
    /// are retryable, 401/403 marks the channel key bad, other 4xx are
    /// semantic errors of this request.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => Self::new(AdapterErrorCode::Timeout, message, true),
            429 => Self::new(AdapterErrorCode::TooManyRequests, message, true),
            401 | 403 => Self::new(AdapterErrorCode::UpstreamAuthError, message, false),
            400..=499 => Self::new(AdapterErrorCode::UpstreamClientError, message, false),
            _ => Self::new(AdapterErrorCode::UpstreamServerError, message, true),
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl Error for AdapterError {}
