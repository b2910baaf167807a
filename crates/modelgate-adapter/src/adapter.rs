use async_trait::async_trait;
use bytes::Bytes;

use modelgate_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};

use crate::binding::ChannelBinding;
use crate::errors::{AdapterError, AdapterResult};
use crate::http::{ByteStream, UpstreamHttpRequest};

pub type StreamItem = Result<modelgate_protocol::chat::ChatCompletionChunk, AdapterError>;
pub type ChunkSender = tokio::sync::mpsc::Sender<StreamItem>;
pub type ChunkReceiver = tokio::sync::mpsc::Receiver<StreamItem>;

/// Bounded buffer between the upstream stream parser and the pump; provider
/// back-pressure becomes client back-pressure through this channel.
pub const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// A lightweight upstream probe built by the adapter, executed by the
/// health checker.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub request: UpstreamHttpRequest,
}

/// Uniform capability set of one upstream provider family, bound to a
/// single channel's URL/key/timeouts.
///
/// Adapters never perform IO themselves: `convert` and `health_probe` build
/// typed HTTP requests, `parse_*` decode what the upstream client read.
/// This keeps every adapter deterministic and unit testable.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn binding(&self) -> &ChannelBinding;

    /// Translate the canonical request into this provider's wire request.
    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest>;

    /// Decode a non-stream success body into the canonical response.
    fn parse_response(
        &self,
        request: &ChatCompletionRequest,
        body: &Bytes,
    ) -> AdapterResult<ChatCompletionResponse>;

    /// Spawn this provider's stream decoder over the raw upstream bytes.
    /// The returned receiver yields canonical chunks in arrival order and
    /// closes when the upstream finishes (or errors).
    fn parse_stream(&self, model: String, body: ByteStream) -> ChunkReceiver;

    /// Read a typed error out of an HTTP >= 400 response. The default
    /// understands the common `{"error": {"message": ...}}` envelope.
    fn extract_error(&self, status: u16, body: &Bytes) -> AdapterError {
        AdapterError::from_status(status, extract_error_message(body))
    }

    /// Build the health-check probe for this channel.
    fn health_probe(&self) -> AdapterResult<HealthProbe>;
}

pub(crate) fn extract_error_message(body: &Bytes) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for path in [&["error", "message"][..], &["error_msg"][..], &["message"][..]] {
            let mut cursor = &value;
            let mut found = true;
            for key in path {
                match cursor.get(key) {
                    Some(next) => cursor = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found && let Some(text) = cursor.as_str() {
                return text.to_string();
            }
        }
    }
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_paths() {
        let openai = Bytes::from_static(br#"{"error":{"message":"bad key","type":"auth"}}"#);
        assert_eq!(extract_error_message(&openai), "bad key");

        let baidu = Bytes::from_static(br#"{"error_msg":"token expired","error_code":110}"#);
        assert_eq!(extract_error_message(&baidu), "token expired");

        let plain = Bytes::from_static(b"upstream exploded");
        assert_eq!(extract_error_message(&plain), "upstream exploded");
    }
}
