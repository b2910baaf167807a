//! Anthropic Messages adapter.

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_adapter::adapter::CHUNK_CHANNEL_CAPACITY;
use modelgate_adapter::{
    AdapterError, AdapterResult, ByteStream, ChannelBinding, ChunkReceiver, HealthProbe,
    HttpMethod, ProviderAdapter, UpstreamHttpRequest, headers,
};
use modelgate_protocol::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage, ChatObjectType,
    ChatRole, FinishReason, Usage,
};
use modelgate_protocol::claude::{
    Message, MessageRole, MessagesRequest, MessagesResponse, StreamContentDelta,
    StreamMessageDelta, StreamMessageStart, StreamTextDelta,
};
use modelgate_protocol::sse::SseDecoder;

use crate::util::{finish_chunk, now_unix, split_system, text_chunk};

pub const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API requires max_tokens; used when downstream omits it.
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug)]
pub struct ClaudeAdapter {
    binding: ChannelBinding,
}

impl ClaudeAdapter {
    pub fn new(binding: ChannelBinding) -> Self {
        Self { binding }
    }

    fn url(&self, path: &str) -> String {
        let base = self.binding.base_url_or(CLAUDE_BASE_URL);
        format!("{base}/{}", path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> modelgate_adapter::Headers {
        let mut headers = Vec::new();
        headers::set_api_key(&mut headers, "x-api-key", &self.binding.api_key);
        headers::set_api_key(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        headers
    }
}

fn map_stop_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("end_turn") | Some("stop_sequence") => Some(FinishReason::Stop),
        Some("max_tokens") => Some(FinishReason::Length),
        Some("tool_use") => Some(FinishReason::ToolCalls),
        Some(_) => Some(FinishReason::Stop),
        None => None,
    }
}

fn to_messages_request(request: &ChatCompletionRequest) -> MessagesRequest {
    let (system, rest) = split_system(&request.messages);
    let messages = rest
        .into_iter()
        .map(|message| Message {
            role: match message.role {
                ChatRole::Assistant => MessageRole::Assistant,
                // Later system turns and tool results become user turns.
                _ => MessageRole::User,
            },
            content: message.content.clone(),
        })
        .collect();
    MessagesRequest {
        model: request.model.clone(),
        system,
        messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop.clone().map(|stop| stop.into_vec()),
        stream: request.stream,
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        let is_stream = request.is_stream();
        let wire = to_messages_request(request);
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = self.auth_headers();
        headers::set_json_body(&mut headers);
        if is_stream {
            headers::set_accept_sse(&mut headers);
        }
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.url("/v1/messages"),
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
        let wire: MessagesResponse =
            serde_json::from_slice(body).map_err(|err| AdapterError::decode(err.to_string()))?;
        let usage = Usage::new(wire.usage.input_tokens, wire.usage.output_tokens);
        Ok(ChatCompletionResponse {
            id: wire.id.clone(),
            object: ChatObjectType::ChatCompletion,
            created: now_unix(),
            model: wire.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(ChatRole::Assistant, wire.joined_text()),
                finish_reason: map_stop_reason(wire.stop_reason.as_deref()),
            }],
            usage: Some(usage),
        })
    }

    fn parse_stream(&self, model: String, mut body: ByteStream) -> ChunkReceiver {
        let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let created = now_unix();
            let mut id = String::new();
            let mut input_tokens: u64 = 0;

            'outer: while let Some(bytes) = body.recv().await {
                for frame in decoder.push_bytes(&bytes) {
                    match frame.event.as_deref() {
                        Some("message_start") => {
                            if let Ok(start) =
                                serde_json::from_str::<StreamMessageStart>(&frame.data)
                            {
                                id = start.message.id;
                                input_tokens = start.message.usage.input_tokens;
                            }
                        }
                        Some("content_block_delta") => {
                            let Ok(delta) =
                                serde_json::from_str::<StreamContentDelta>(&frame.data)
                            else {
                                continue;
                            };
                            let StreamTextDelta::TextDelta { text } = delta.delta;
                            if tx
                                .send(Ok(text_chunk(&id, &model, created, text)))
                                .await
                                .is_err()
                            {
                                break 'outer;
                            }
                        }
                        Some("message_delta") => {
                            let Ok(delta) =
                                serde_json::from_str::<StreamMessageDelta>(&frame.data)
                            else {
                                continue;
                            };
                            let reason = map_stop_reason(delta.delta.stop_reason.as_deref())
                                .unwrap_or(FinishReason::Stop);
                            let usage = delta
                                .usage
                                .map(|u| Usage::new(input_tokens, u.output_tokens));
                            if tx
                                .send(Ok(finish_chunk(&id, &model, created, reason, usage)))
                                .await
                                .is_err()
                            {
                                break 'outer;
                            }
                        }
                        Some("message_stop") => break 'outer,
                        Some("error") => {
                            let err = AdapterError::new(
                                modelgate_adapter::AdapterErrorCode::UpstreamServerError,
                                frame.data.clone(),
                                true,
                            );
                            let _ = tx.send(Err(err)).await;
                            break 'outer;
                        }
                        // ping / content_block_start / content_block_stop
                        _ => {}
                    }
                }
            }
        });
        rx
    }

    fn health_probe(&self) -> AdapterResult<HealthProbe> {
        let mut headers = self.auth_headers();
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
    use modelgate_protocol::chat::StopSequences;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-3-haiku".to_string(),
            messages: vec![
                ChatMessage::new(ChatRole::System, "Be terse."),
                ChatMessage::new(ChatRole::User, "Hi"),
            ],
            temperature: Some(0.2),
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: Some(StopSequences::One("END".to_string())),
            user: None,
            tools: None,
        }
    }

    #[tokio::test]
    async fn convert_hoists_system_and_defaults_max_tokens() {
        let adapter = ClaudeAdapter::new(ChannelBinding::new(1, "sk-ant"));
        let upstream = adapter.convert(&request()).await.unwrap();
        assert_eq!(upstream.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(header_get(&upstream.headers, "x-api-key"), Some("sk-ant"));

        let body: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["stop_sequences"][0], "END");
    }

    #[test]
    fn parse_sums_usage_into_canonical() {
        let adapter = ClaudeAdapter::new(ChannelBinding::new(1, "sk-ant"));
        let body = Bytes::from_static(
            br#"{"id":"msg_1","model":"claude-3-haiku","content":[{"type":"text","text":"Hello"}],
                "stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":4}}"#,
        );
        let resp = adapter.parse_response(&request(), &body).unwrap();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 4);
        assert_eq!(usage.total_tokens, 13);
        assert_eq!(resp.choices[0].message.content, "Hello");
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn stream_events_become_canonical_chunks() {
        let adapter = ClaudeAdapter::new(ChannelBinding::new(1, "sk-ant"));
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel(8);
        let mut chunks = adapter.parse_stream("claude-3-haiku".to_string(), byte_rx);

        let events = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-haiku\",\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\n",
            "data: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        byte_tx.send(Bytes::from(events)).await.unwrap();
        drop(byte_tx);

        let first = chunks.recv().await.unwrap().unwrap();
        assert_eq!(first.delta_content(), Some("Hel"));
        let second = chunks.recv().await.unwrap().unwrap();
        assert_eq!(second.delta_content(), Some("lo"));
        let last = chunks.recv().await.unwrap().unwrap();
        assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
        let usage = last.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert!(chunks.recv().await.is_none());
    }
}
