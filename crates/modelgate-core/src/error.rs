use modelgate_adapter::AdapterError;
use modelgate_protocol::error::ErrorEnvelope;
use modelgate_storage::StorageError;

pub type RelayResult<T> = Result<T, RelayError>;

/// The full downstream-visible error taxonomy. Each variant knows its HTTP
/// status and stable error code; the router only serializes.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("insufficient quota: need {needed}, balance {balance}")]
    InsufficientQuota { needed: i64, balance: i64 },
    #[error("model unknown: {0}")]
    ModelUnknown(String),
    #[error("no pricing for model {model} in group {group}")]
    PricingNotFound { model: String, group: String },
    #[error("no eligible channel for model {model} in group {group}")]
    NoEligibleChannel { model: String, group: String },
    #[error("all channels failed after {attempts} attempts")]
    UpstreamExhausted { attempts: u32 },
    #[error("upstream error: {0}")]
    Upstream(#[from] AdapterError),
    #[error("stream idle timeout")]
    StreamIdleTimeout,
    #[error("stream total timeout")]
    StreamTotalTimeout,
    #[error("client canceled")]
    ClientCanceled,
    #[error("pre-consume record not found for request {0}")]
    PreConsumeNotFound(String),
    #[error("storage unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidRequest(_) => 400,
            RelayError::Unauthorized => 401,
            RelayError::InsufficientQuota { .. } => 402,
            RelayError::ModelUnknown(_) | RelayError::PricingNotFound { .. } => 404,
            RelayError::Upstream(err) if err.code == modelgate_adapter::AdapterErrorCode::TooManyRequests => 429,
            RelayError::Upstream(_) => 502,
            RelayError::NoEligibleChannel { .. } | RelayError::UpstreamExhausted { .. } => 503,
            RelayError::StreamIdleTimeout | RelayError::StreamTotalTimeout => 504,
            RelayError::ClientCanceled => 499,
            RelayError::PreConsumeNotFound(_)
            | RelayError::Storage(_)
            | RelayError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Unauthorized => "unauthorized",
            RelayError::InsufficientQuota { .. } => "insufficient_quota",
            RelayError::ModelUnknown(_) => "model_unknown",
            RelayError::PricingNotFound { .. } => "pricing_not_found",
            RelayError::NoEligibleChannel { .. } => "no_eligible_channel",
            RelayError::UpstreamExhausted { .. } => "upstream_exhausted",
            RelayError::Upstream(_) => "upstream_error",
            RelayError::StreamIdleTimeout => "stream_idle_timeout",
            RelayError::StreamTotalTimeout => "stream_total_timeout",
            RelayError::ClientCanceled => "client_canceled",
            RelayError::PreConsumeNotFound(_) => "pre_consume_not_found",
            RelayError::Storage(_) => "storage_unavailable",
            RelayError::Internal(_) => "internal_error",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.status() {
            400..=499 => "invalid_request_error",
            _ => "api_error",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.to_string(), self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_adapter::AdapterErrorCode;

    #[test]
    fn status_mapping() {
        assert_eq!(RelayError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(
            RelayError::InsufficientQuota {
                needed: 10,
                balance: 1
            }
            .status(),
            402
        );
        assert_eq!(
            RelayError::PricingNotFound {
                model: "m".into(),
                group: "g".into()
            }
            .status(),
            404
        );
        assert_eq!(
            RelayError::NoEligibleChannel {
                model: "m".into(),
                group: "g".into()
            }
            .status(),
            503
        );
        assert_eq!(RelayError::UpstreamExhausted { attempts: 3 }.status(), 503);
        assert_eq!(RelayError::StreamIdleTimeout.status(), 504);
        assert_eq!(
            RelayError::Upstream(AdapterError::new(
                AdapterErrorCode::TooManyRequests,
                "slow",
                true
            ))
            .status(),
            429
        );
        assert_eq!(
            RelayError::Upstream(AdapterError::from_status(500, "boom")).status(),
            502
        );
    }

    #[test]
    fn envelope_carries_code() {
        let envelope = RelayError::Unauthorized.envelope();
        assert_eq!(envelope.error.code, "unauthorized");
        assert_eq!(envelope.error.kind, "invalid_request_error");
    }
}
