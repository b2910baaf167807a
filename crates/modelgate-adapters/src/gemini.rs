//! Google Gemini adapter.
//!
//! The model name rides in the URL; parameters move under
//! `generationConfig`; streaming uses `streamGenerateContent?alt=sse`.

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
use modelgate_protocol::gemini::{
    Content, ContentRole, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
};
use modelgate_protocol::sse::SseDecoder;

use crate::util::{finish_chunk, now_unix, split_system, synth_response_id, text_chunk};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug)]
pub struct GeminiAdapter {
    binding: ChannelBinding,
}

impl GeminiAdapter {
    pub fn new(binding: ChannelBinding) -> Self {
        Self { binding }
    }

    fn url(&self, path: &str) -> String {
        let base = self.binding.base_url_or(GEMINI_BASE_URL);
        format!("{base}/{}", path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> modelgate_adapter::Headers {
        let mut headers = Vec::new();
        headers::set_api_key(&mut headers, "x-goog-api-key", &self.binding.api_key);
        headers
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("STOP") => Some(FinishReason::Stop),
        Some("MAX_TOKENS") => Some(FinishReason::Length),
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") => {
            Some(FinishReason::ContentFilter)
        }
        Some(_) => Some(FinishReason::Stop),
        None => None,
    }
}

fn to_generate_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let (system, rest) = split_system(&request.messages);
    let contents = rest
        .into_iter()
        .map(|message| Content {
            role: Some(match message.role {
                ChatRole::Assistant => ContentRole::Model,
                _ => ContentRole::User,
            }),
            parts: vec![Part {
                text: message.content.clone(),
            }],
        })
        .collect();

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop.clone().map(|stop| stop.into_vec()),
    };
    let has_config = generation_config != GenerationConfig::default();

    GenerateContentRequest {
        contents,
        system_instruction: system.map(|text| Content {
            role: None,
            parts: vec![Part { text }],
        }),
        generation_config: has_config.then_some(generation_config),
    }
}

fn usage_from_metadata(
    metadata: Option<modelgate_protocol::gemini::UsageMetadata>,
) -> Option<Usage> {
    metadata.map(|m| Usage {
        prompt_tokens: m.prompt_token_count,
        completion_tokens: m.candidates_token_count,
        total_tokens: m.total_token_count,
    })
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        let is_stream = request.is_stream();
        let wire = to_generate_request(request);
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let path = if is_stream {
            format!(
                "/v1beta/models/{}:streamGenerateContent?alt=sse",
                request.model
            )
        } else {
            format!("/v1beta/models/{}:generateContent", request.model)
        };
        let mut headers = self.auth_headers();
        headers::set_json_body(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.url(&path),
            headers,
            body: Some(Bytes::from(body)),
            is_stream,
        })
    }

    fn parse_response(
        &self,
        request: &ChatCompletionRequest,
        body: &Bytes,
    ) -> AdapterResult<ChatCompletionResponse> {
        let wire: GenerateContentResponse =
            serde_json::from_slice(body).map_err(|err| AdapterError::decode(err.to_string()))?;
        Ok(ChatCompletionResponse {
            id: synth_response_id(),
            object: ChatObjectType::ChatCompletion,
            created: now_unix(),
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(ChatRole::Assistant, wire.first_text()),
                finish_reason: map_finish_reason(wire.finish_reason()),
            }],
            usage: usage_from_metadata(wire.usage_metadata),
        })
    }

    fn parse_stream(&self, model: String, mut body: ByteStream) -> ChunkReceiver {
        let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let created = now_unix();
            let id = synth_response_id();
            let mut usage: Option<Usage> = None;
            let mut finish: Option<FinishReason> = None;

            'outer: while let Some(bytes) = body.recv().await {
                for frame in decoder.push_bytes(&bytes) {
                    let Ok(event) =
                        serde_json::from_str::<GenerateContentResponse>(&frame.data)
                    else {
                        continue;
                    };
                    // Usage metadata accumulates; the last frame carries the
                    // final totals.
                    if let Some(u) = usage_from_metadata(event.usage_metadata) {
                        usage = Some(u);
                    }
                    if let Some(reason) = map_finish_reason(event.finish_reason()) {
                        finish = Some(reason);
                    }
                    let text = event.first_text();
                    if !text.is_empty()
                        && tx
                            .send(Ok(text_chunk(&id, &model, created, text)))
                            .await
                            .is_err()
                    {
                        break 'outer;
                    }
                }
            }
            if let Some(reason) = finish {
                let _ = tx
                    .send(Ok(finish_chunk(&id, &model, created, reason, usage)))
                    .await;
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
                url: self.url("/v1beta/models"),
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

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-1.5-flash".to_string(),
            messages: vec![
                ChatMessage::new(ChatRole::System, "Be brief."),
                ChatMessage::new(ChatRole::User, "Hi"),
                ChatMessage::new(ChatRole::Assistant, "Hello!"),
                ChatMessage::new(ChatRole::User, "Again"),
            ],
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(256),
            stream: Some(stream),
            stop: None,
            user: None,
            tools: None,
        }
    }

    #[tokio::test]
    async fn convert_maps_roles_and_config() {
        let adapter = GeminiAdapter::new(ChannelBinding::new(1, "g-key"));
        let upstream = adapter.convert(&request(false)).await.unwrap();
        assert_eq!(
            upstream.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(header_get(&upstream.headers, "x-goog-api-key"), Some("g-key"));

        let body: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["generationConfig"]["topP"], 0.9);
    }

    #[tokio::test]
    async fn stream_url_requests_sse() {
        let adapter = GeminiAdapter::new(ChannelBinding::new(1, "g-key"));
        let upstream = adapter.convert(&request(true)).await.unwrap();
        assert!(upstream.url.ends_with(":streamGenerateContent?alt=sse"));
        assert!(upstream.is_stream);
    }

    #[tokio::test]
    async fn stream_frames_emit_deltas_then_finish() {
        let adapter = GeminiAdapter::new(ChannelBinding::new(1, "g-key"));
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel(8);
        let mut chunks = adapter.parse_stream("gemini-1.5-flash".to_string(), byte_rx);

        let frames = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2,\"totalTokenCount\":6}}\n\n",
        );
        byte_tx.send(Bytes::from(frames)).await.unwrap();
        drop(byte_tx);

        let first = chunks.recv().await.unwrap().unwrap();
        assert_eq!(first.delta_content(), Some("Hel"));
        let second = chunks.recv().await.unwrap().unwrap();
        assert_eq!(second.delta_content(), Some("lo"));
        let last = chunks.recv().await.unwrap().unwrap();
        assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(last.usage.unwrap().total_tokens, 6);
        assert!(chunks.recv().await.is_none());
    }
}
