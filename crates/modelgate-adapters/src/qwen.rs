//! Alibaba Qwen (DashScope) adapter.

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_adapter::adapter::CHUNK_CHANNEL_CAPACITY;
use modelgate_adapter::{
    AdapterError, AdapterErrorCode, AdapterResult, ByteStream, ChannelBinding, ChunkReceiver,
    HealthProbe, HttpMethod, ProviderAdapter, UpstreamHttpRequest, headers,
};
use modelgate_protocol::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage, ChatObjectType,
    ChatRole, FinishReason, Usage,
};
use modelgate_protocol::qwen::{
    GenerationInput, GenerationParameters, GenerationRequest, GenerationResponse, QwenMessage,
    QwenUsage,
};
use modelgate_protocol::sse::SseDecoder;

use crate::util::{finish_chunk, now_unix, text_chunk};

pub const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com";
const GENERATION_PATH: &str = "/api/v1/services/aigc/text-generation/generation";

#[derive(Debug)]
pub struct QwenAdapter {
    binding: ChannelBinding,
}

impl QwenAdapter {
    pub fn new(binding: ChannelBinding) -> Self {
        Self { binding }
    }

    fn url(&self) -> String {
        let base = self.binding.base_url_or(QWEN_BASE_URL);
        format!("{base}{GENERATION_PATH}")
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        Some("tool_calls") => Some(FinishReason::ToolCalls),
        Some(_) => Some(FinishReason::Stop),
        None => None,
    }
}

fn to_generation_request(request: &ChatCompletionRequest) -> GenerationRequest {
    let messages = request
        .messages
        .iter()
        .map(|message| QwenMessage {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        })
        .collect();
    GenerationRequest {
        model: request.model.clone(),
        input: GenerationInput { messages },
        parameters: Some(GenerationParameters {
            result_format: Some("message".to_string()),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stop: request.stop.clone().map(|stop| stop.into_vec()),
            incremental_output: request.is_stream().then_some(true),
        }),
    }
}

fn usage_of(usage: Option<QwenUsage>) -> Option<Usage> {
    usage.map(|u| Usage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: if u.total_tokens > 0 {
            u.total_tokens
        } else {
            u.input_tokens + u.output_tokens
        },
    })
}

fn embedded_error(code: &str, message: &str) -> AdapterError {
    match code {
        "InvalidApiKey" | "InvalidAccessKeyId" => {
            AdapterError::new(AdapterErrorCode::UpstreamAuthError, message, false)
        }
        "Throttling" | "Throttling.RateQuota" | "Throttling.AllocationQuota" => {
            AdapterError::new(AdapterErrorCode::TooManyRequests, message, true)
        }
        _ => AdapterError::new(AdapterErrorCode::UpstreamServerError, message, true),
    }
}

#[async_trait]
impl ProviderAdapter for QwenAdapter {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        let is_stream = request.is_stream();
        let wire = to_generation_request(request);
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = Vec::new();
        headers::set_bearer(&mut headers, &self.binding.api_key);
        headers::set_json_body(&mut headers);
        if is_stream {
            headers::set_api_key(&mut headers, "x-dashscope-sse", "enable");
        }
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.url(),
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
        let wire: GenerationResponse =
            serde_json::from_slice(body).map_err(|err| AdapterError::decode(err.to_string()))?;
        if let Some((code, message)) = wire.error() {
            return Err(embedded_error(code, message));
        }
        Ok(ChatCompletionResponse {
            id: wire.request_id.clone(),
            object: ChatObjectType::ChatCompletion,
            created: now_unix(),
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(ChatRole::Assistant, wire.first_text()),
                finish_reason: map_finish_reason(wire.finish_reason()),
            }],
            usage: usage_of(wire.usage),
        })
    }

    fn parse_stream(&self, model: String, mut body: ByteStream) -> ChunkReceiver {
        let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let created = now_unix();
            'outer: while let Some(bytes) = body.recv().await {
                for frame in decoder.push_bytes(&bytes) {
                    let Ok(event) = serde_json::from_str::<GenerationResponse>(&frame.data)
                    else {
                        continue;
                    };
                    if let Some((code, message)) = event.error() {
                        let _ = tx.send(Err(embedded_error(code, message))).await;
                        break 'outer;
                    }
                    let text = event.first_text();
                    if !text.is_empty()
                        && tx
                            .send(Ok(text_chunk(&event.request_id, &model, created, text)))
                            .await
                            .is_err()
                    {
                        break 'outer;
                    }
                    if let Some(reason) = map_finish_reason(event.finish_reason()) {
                        let _ = tx
                            .send(Ok(finish_chunk(
                                &event.request_id,
                                &model,
                                created,
                                reason,
                                usage_of(event.usage),
                            )))
                            .await;
                        break 'outer;
                    }
                }
            }
        });
        rx
    }

    fn health_probe(&self) -> AdapterResult<HealthProbe> {
        let model = self
            .binding
            .test_model
            .clone()
            .unwrap_or_else(|| "qwen-turbo".to_string());
        let wire = GenerationRequest {
            model,
            input: GenerationInput {
                messages: vec![QwenMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
            },
            parameters: Some(GenerationParameters {
                result_format: Some("message".to_string()),
                max_tokens: Some(1),
                ..GenerationParameters::default()
            }),
        };
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = Vec::new();
        headers::set_bearer(&mut headers, &self.binding.api_key);
        headers::set_json_body(&mut headers);
        Ok(HealthProbe {
            request: UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.url(),
                headers,
                body: Some(Bytes::from(body)),
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
            model: "qwen-turbo".to_string(),
            messages: vec![ChatMessage::new(ChatRole::User, "讲个笑话")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: Some(stream),
            stop: None,
            user: None,
            tools: None,
        }
    }

    #[tokio::test]
    async fn convert_wraps_input_and_parameters() {
        let adapter = QwenAdapter::new(ChannelBinding::new(1, "sk-q"));
        let upstream = adapter.convert(&request(true)).await.unwrap();
        assert!(upstream.url.ends_with(GENERATION_PATH));
        assert_eq!(
            header_get(&upstream.headers, "x-dashscope-sse"),
            Some("enable")
        );
        let body: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        assert_eq!(body["input"]["messages"][0]["role"], "user");
        assert_eq!(body["parameters"]["result_format"], "message");
        assert_eq!(body["parameters"]["incremental_output"], true);
    }

    #[test]
    fn parse_maps_output_choices() {
        let adapter = QwenAdapter::new(ChannelBinding::new(1, "sk-q"));
        let body = Bytes::from_static(
            r#"{"request_id":"r1",
                "output":{"choices":[{"message":{"role":"assistant","content":"哈哈"},"finish_reason":"stop"}]},
                "usage":{"input_tokens":6,"output_tokens":2,"total_tokens":8}}"#
                .as_bytes(),
        );
        let resp = adapter.parse_response(&request(false), &body).unwrap();
        assert_eq!(resp.choices[0].message.content, "哈哈");
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
    }

    #[tokio::test]
    async fn throttling_code_is_retryable() {
        let adapter = QwenAdapter::new(ChannelBinding::new(1, "sk-q"));
        let body =
            Bytes::from_static(br#"{"request_id":"r2","code":"Throttling","message":"slow down"}"#);
        let err = adapter.parse_response(&request(false), &body).unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::TooManyRequests);
        assert!(err.retryable);
    }
}
