//! OpenAI chat-completions adapter.
//!
//! The canonical schema *is* this provider's wire format, so conversion is
//! serialization. DeepSeek, Moonshot and MiniMax expose the same protocol
//! and reuse this adapter under their own registry names.

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_adapter::adapter::CHUNK_CHANNEL_CAPACITY;
use modelgate_adapter::{
    AdapterError, AdapterResult, ByteStream, ChannelBinding, ChunkReceiver, HealthProbe,
    HttpMethod, ProviderAdapter, UpstreamHttpRequest, headers,
};
use modelgate_protocol::chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use modelgate_protocol::sse::SseDecoder;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const MOONSHOT_BASE_URL: &str = "https://api.moonshot.cn";
pub const MINIMAX_BASE_URL: &str = "https://api.minimax.chat";

#[derive(Debug)]
pub struct OpenAiAdapter {
    name: &'static str,
    default_base: &'static str,
    binding: ChannelBinding,
}

impl OpenAiAdapter {
    pub fn new(name: &'static str, default_base: &'static str, binding: ChannelBinding) -> Self {
        Self {
            name,
            default_base,
            binding,
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.binding.base_url_or(self.default_base);
        let mut path = path.trim_start_matches('/');
        // Tolerate base URLs that already end in /v1.
        if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
            path = path.trim_start_matches("v1/").trim_start_matches("v1");
        }
        format!("{base}/{path}")
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        let is_stream = request.is_stream();
        let body =
            serde_json::to_vec(request).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = Vec::new();
        headers::set_bearer(&mut headers, &self.binding.api_key);
        headers::set_json_body(&mut headers);
        if is_stream {
            headers::set_accept_sse(&mut headers);
        } else {
            headers::set_accept_json(&mut headers);
        }
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.url("/v1/chat/completions"),
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        })
    }

    fn parse_response(
        &self,
        _request: &ChatCompletionRequest,
        body: &Bytes,
    ) -> AdapterResult<ChatCompletionResponse> {
        serde_json::from_slice(body).map_err(|err| AdapterError::decode(err.to_string()))
    }

    fn parse_stream(&self, _model: String, mut body: ByteStream) -> ChunkReceiver {
        let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            'outer: while let Some(bytes) = body.recv().await {
                for frame in decoder.push_bytes(&bytes) {
                    if frame.is_done() {
                        break 'outer;
                    }
                    // Lines that fail JSON decode are skipped, per protocol.
                    let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&frame.data)
                    else {
                        continue;
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        break 'outer;
                    }
                }
            }
        });
        rx
    }

    fn health_probe(&self) -> AdapterResult<HealthProbe> {
        let mut headers = Vec::new();
        headers::set_bearer(&mut headers, &self.binding.api_key);
        headers::set_accept_json(&mut headers);
        Ok(HealthProbe {
            request: UpstreamHttpRequest {
                method: HttpMethod::Get,
                url: self.url("/v1/models"),
                headers,
                body: None,
                is_stream: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_adapter::header_get;
    use modelgate_protocol::chat::{ChatMessage, ChatRole};

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![ChatMessage::new(ChatRole::User, "Hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: Some(stream),
            stop: None,
            user: None,
            tools: None,
        }
    }

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new("openai", OPENAI_BASE_URL, ChannelBinding::new(1, "sk-x"))
    }

    #[tokio::test]
    async fn convert_is_passthrough() {
        let upstream = adapter().convert(&request(false)).await.unwrap();
        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            header_get(&upstream.headers, "authorization"),
            Some("Bearer sk-x")
        );
        let body: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["content"], "Hi");
        assert!(!upstream.is_stream);
    }

    #[tokio::test]
    async fn base_url_with_v1_suffix_is_not_doubled() {
        let binding = ChannelBinding::new(1, "sk-x").with_base_url("https://relay.example/v1");
        let adapter = OpenAiAdapter::new("openai", OPENAI_BASE_URL, binding);
        let upstream = adapter.convert(&request(false)).await.unwrap();
        assert_eq!(upstream.url, "https://relay.example/v1/chat/completions");
    }

    #[tokio::test]
    async fn stream_parser_stops_at_done() {
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel(4);
        let mut chunks = adapter().parse_stream("gpt-3.5-turbo".to_string(), byte_rx);

        let frame = |content: &str| {
            format!(
                "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-3.5-turbo\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}},\"finish_reason\":null}}]}}\n\n"
            )
        };
        byte_tx.send(Bytes::from(frame("a"))).await.unwrap();
        byte_tx.send(Bytes::from("data: not-json\n\n")).await.unwrap();
        byte_tx.send(Bytes::from(frame("b"))).await.unwrap();
        byte_tx
            .send(Bytes::from("data: [DONE]\n\n"))
            .await
            .unwrap();
        drop(byte_tx);

        let first = chunks.recv().await.unwrap().unwrap();
        assert_eq!(first.delta_content(), Some("a"));
        let second = chunks.recv().await.unwrap().unwrap();
        assert_eq!(second.delta_content(), Some("b"));
        assert!(chunks.recv().await.is_none());
    }
}
