//! Baidu ERNIE adapter.
//!
//! The endpoint path carries the model name and authentication rides in an
//! `access_token` query parameter. Failures frequently come back as HTTP
//! 200 bodies with `error_code`/`error_msg`, so parsing must re-check.

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_adapter::adapter::CHUNK_CHANNEL_CAPACITY;
use modelgate_adapter::{
    AdapterError, AdapterErrorCode, AdapterResult, ByteStream, ChannelBinding, ChunkReceiver,
    HealthProbe, HttpMethod, ProviderAdapter, UpstreamHttpRequest, headers,
};
use modelgate_protocol::baidu::{ErnieChatRequest, ErnieChatResponse, ErnieMessage, ErnieUsage};
use modelgate_protocol::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage, ChatObjectType,
    ChatRole, FinishReason, Usage,
};
use modelgate_protocol::sse::SseDecoder;

use crate::util::{finish_chunk, now_unix, split_system, text_chunk};

pub const BAIDU_BASE_URL: &str = "https://aip.baidubce.com";

// ERNIE access-token error codes that mean the channel key is bad.
const ERR_ACCESS_TOKEN_INVALID: i64 = 110;
const ERR_ACCESS_TOKEN_EXPIRED: i64 = 111;
const ERR_QPS_LIMIT: i64 = 18;

#[derive(Debug)]
pub struct BaiduAdapter {
    binding: ChannelBinding,
}

impl BaiduAdapter {
    pub fn new(binding: ChannelBinding) -> Self {
        Self { binding }
    }

    fn chat_url(&self, model: &str) -> String {
        let base = self.binding.base_url_or(BAIDU_BASE_URL);
        let path = model.to_ascii_lowercase();
        format!(
            "{base}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{path}?access_token={}",
            self.binding.api_key
        )
    }
}

pub(crate) fn embedded_error(code: i64, msg: &str) -> AdapterError {
    match code {
        ERR_ACCESS_TOKEN_INVALID | ERR_ACCESS_TOKEN_EXPIRED => {
            AdapterError::new(AdapterErrorCode::UpstreamAuthError, msg, false)
        }
        ERR_QPS_LIMIT => AdapterError::new(AdapterErrorCode::TooManyRequests, msg, true),
        _ => AdapterError::new(AdapterErrorCode::UpstreamServerError, msg, true),
    }
}

fn to_ernie_request(request: &ChatCompletionRequest) -> ErnieChatRequest {
    let (system, rest) = split_system(&request.messages);
    let messages = rest
        .into_iter()
        .map(|message| ErnieMessage {
            role: match message.role {
                ChatRole::Assistant => "assistant".to_string(),
                _ => "user".to_string(),
            },
            content: message.content.clone(),
        })
        .collect();
    ErnieChatRequest {
        messages,
        system,
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stream: request.stream,
        user_id: request.user.clone(),
    }
}

fn usage_of(usage: Option<ErnieUsage>) -> Option<Usage> {
    usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    })
}

#[async_trait]
impl ProviderAdapter for BaiduAdapter {
    fn name(&self) -> &'static str {
        "baidu"
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn convert(&self, request: &ChatCompletionRequest) -> AdapterResult<UpstreamHttpRequest> {
        let is_stream = request.is_stream();
        let wire = to_ernie_request(request);
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = Vec::new();
        headers::set_json_body(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.chat_url(&request.model),
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
        let wire: ErnieChatResponse =
            serde_json::from_slice(body).map_err(|err| AdapterError::decode(err.to_string()))?;
        if let Some((code, msg)) = wire.error() {
            return Err(embedded_error(code, msg));
        }
        let created = if wire.created > 0 {
            wire.created
        } else {
            now_unix()
        };
        Ok(ChatCompletionResponse {
            id: wire.id.clone(),
            object: ChatObjectType::ChatCompletion,
            created,
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(ChatRole::Assistant, wire.result.clone()),
                finish_reason: Some(FinishReason::Stop),
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
                    let Ok(event) = serde_json::from_str::<ErnieChatResponse>(&frame.data)
                    else {
                        continue;
                    };
                    if let Some((code, msg)) = event.error() {
                        let _ = tx.send(Err(embedded_error(code, msg))).await;
                        break 'outer;
                    }
                    if !event.result.is_empty()
                        && tx
                            .send(Ok(text_chunk(&event.id, &model, created, event.result.clone())))
                            .await
                            .is_err()
                    {
                        break 'outer;
                    }
                    if event.is_end == Some(true) {
                        let _ = tx
                            .send(Ok(finish_chunk(
                                &event.id,
                                &model,
                                created,
                                FinishReason::Stop,
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
        // No listing endpoint; probe with a one-token completion against
        // the channel's declared test model.
        let model = self
            .binding
            .test_model
            .clone()
            .unwrap_or_else(|| "ernie-3.5-8k".to_string());
        let wire = ErnieChatRequest {
            messages: vec![ErnieMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            system: None,
            temperature: None,
            top_p: None,
            max_output_tokens: Some(1),
            stream: None,
            user_id: None,
        };
        let body =
            serde_json::to_vec(&wire).map_err(|err| AdapterError::decode(err.to_string()))?;
        let mut headers = Vec::new();
        headers::set_json_body(&mut headers);
        Ok(HealthProbe {
            request: UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.chat_url(&model),
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

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "ERNIE-4.0-8K".to_string(),
            messages: vec![ChatMessage::new(ChatRole::User, "你好")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: None,
            user: None,
            tools: None,
        }
    }

    #[tokio::test]
    async fn convert_puts_token_in_query_and_model_in_path() {
        let adapter = BaiduAdapter::new(ChannelBinding::new(1, "tok-123"));
        let upstream = adapter.convert(&request()).await.unwrap();
        assert_eq!(
            upstream.url,
            "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/ernie-4.0-8k?access_token=tok-123"
        );
    }

    #[test]
    fn embedded_error_maps_to_auth() {
        let adapter = BaiduAdapter::new(ChannelBinding::new(1, "tok"));
        let body = Bytes::from_static(br#"{"id":"","error_code":110,"error_msg":"bad token"}"#);
        let err = adapter.parse_response(&request(), &body).unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::UpstreamAuthError);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn stream_ends_on_is_end_with_usage() {
        let adapter = BaiduAdapter::new(ChannelBinding::new(1, "tok"));
        let (byte_tx, byte_rx) = tokio::sync::mpsc::channel(8);
        let mut chunks = adapter.parse_stream("ernie-4.0-8k".to_string(), byte_rx);

        let frames = concat!(
            "data: {\"id\":\"as-1\",\"result\":\"你\",\"is_end\":false}\n\n",
            "data: {\"id\":\"as-1\",\"result\":\"好\",\"is_end\":true,",
            "\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
        );
        byte_tx.send(Bytes::from(frames)).await.unwrap();
        drop(byte_tx);

        assert_eq!(
            chunks.recv().await.unwrap().unwrap().delta_content(),
            Some("你")
        );
        assert_eq!(
            chunks.recv().await.unwrap().unwrap().delta_content(),
            Some("好")
        );
        let last = chunks.recv().await.unwrap().unwrap();
        assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(last.usage.unwrap().total_tokens, 4);
        assert!(chunks.recv().await.is_none());
    }
}
