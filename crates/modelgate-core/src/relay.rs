//! Relay orchestration: the one place that wires pricing, quota, selection,
//! adapters and the pump together and guarantees that every request settles
//! with exactly one of post-consume or refund.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use modelgate_adapter::{
    AdapterError, AdapterErrorCode, AdapterRegistry, ChannelBinding, ChunkReceiver, UpstreamBody,
    UpstreamClient, UpstreamFailure,
};
use modelgate_common::GatewayConfig;
use modelgate_protocol::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelEntry, ModelList,
    Usage,
};
use modelgate_storage::ChannelRow;
use modelgate_tokenizer::{streaming_counter, tokenizer_for};

use crate::error::{RelayError, RelayResult};
use crate::pricing::PricingService;
use crate::pump::{self, PumpConfig};
use crate::quota::{QuotaService, UsageRecord};
use crate::selector::{ChannelSelector, SelectedChannel};

/// Safety margin on the input estimate plus a floor so tiny prompts still
/// reserve something.
const ESTIMATE_MARGIN: f64 = 1.5;
const ESTIMATE_FLOOR: i64 = 8;

const CLIENT_FRAME_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: i64,
    pub name: String,
    pub group: String,
}

pub enum RelayResponse {
    Completion(Box<ChatCompletionResponse>),
    /// SSE frames, already encoded; the router streams them verbatim.
    Stream(mpsc::Receiver<Bytes>),
}

struct CompletionAttempt {
    channel: Arc<ChannelRow>,
    response: ChatCompletionResponse,
    latency: Duration,
}

struct StreamAttempt {
    channel: Arc<ChannelRow>,
    chunks: ChunkReceiver,
    buffered_first: Option<ChatCompletionChunk>,
    started: Instant,
}

enum AttemptOutput {
    Completion(Box<CompletionAttempt>),
    Stream(StreamAttempt),
}

pub struct RelayOrchestrator {
    config: Arc<ArcSwap<GatewayConfig>>,
    registry: Arc<AdapterRegistry>,
    client: Arc<dyn UpstreamClient>,
    selector: Arc<ChannelSelector>,
    pricing: Arc<PricingService>,
    quota: Arc<QuotaService>,
}

impl RelayOrchestrator {
    pub fn new(
        config: Arc<ArcSwap<GatewayConfig>>,
        registry: Arc<AdapterRegistry>,
        client: Arc<dyn UpstreamClient>,
        selector: Arc<ChannelSelector>,
        pricing: Arc<PricingService>,
        quota: Arc<QuotaService>,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            selector,
            pricing,
            quota,
        }
    }

    pub fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }

    /// `GET /v1/models`: union of model names across enabled channels.
    pub fn models(&self) -> ModelList {
        let mut names: Vec<(String, String)> = Vec::new();
        for channel in self.selector.channels() {
            if !channel.enabled {
                continue;
            }
            for model in &channel.models {
                names.push((model.clone(), channel.adapter.clone()));
            }
        }
        names.sort();
        names.dedup_by(|a, b| a.0 == b.0);
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        ModelList::new(
            names
                .into_iter()
                .map(|(id, owned_by)| ModelEntry {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by,
                })
                .collect(),
        )
    }

    pub async fn handle_chat(
        &self,
        user: &AuthedUser,
        request: ChatCompletionRequest,
    ) -> RelayResult<RelayResponse> {
        validate(&request)?;
        if !self.selector.model_known(&request.model).await {
            return Err(RelayError::ModelUnknown(request.model.clone()));
        }

        let config = self.config.load_full();
        let request_id = uuid::Uuid::new_v4().to_string();
        let model = request.model.clone();
        let group = user.group.clone();

        // Fail fast on unknown pricing before touching quota or upstreams.
        let pricing = self.pricing.price(&model, &group).await?;

        let input_estimate = tokenizer_for(&model).count_messages(&request.messages);
        let estimated = estimate_quota(&pricing, input_estimate);
        self.quota
            .pre_consume(&request_id, user.id, estimated)
            .await?;

        let is_stream = request.is_stream();
        let outcome = self
            .selector
            .select_with_retry(
                &model,
                &group,
                config.selector_strategy,
                config.selector_max_attempts,
                |selected, _attempt| self.attempt(&request, selected, config.as_ref()),
            )
            .await;

        let (output, _attempts) = match outcome {
            Ok(value) => value,
            Err(err) => {
                // The upstream never produced billable output: release the
                // reservation before surfacing the error.
                if let Err(refund_err) = self.quota.refund(&request_id).await {
                    tracing::error!(request_id = %request_id, error = %refund_err, "refund after failure failed");
                }
                return Err(err);
            }
        };

        match output {
            AttemptOutput::Completion(attempt) => {
                debug_assert!(!is_stream);
                let response = self
                    .finalize_completion(&request_id, user, &group, input_estimate, *attempt)
                    .await?;
                Ok(RelayResponse::Completion(Box::new(response)))
            }
            AttemptOutput::Stream(attempt) => {
                let client_rx = self.spawn_stream(
                    request_id,
                    user.clone(),
                    model,
                    group,
                    input_estimate,
                    attempt,
                    config.as_ref(),
                );
                Ok(RelayResponse::Stream(client_rx))
            }
        }
    }

    /// One upstream attempt: bind adapter, convert, send, and either parse
    /// the response or open the chunk stream (buffering the first chunk so
    /// failover is still possible while the stream is cold).
    async fn attempt(
        &self,
        request: &ChatCompletionRequest,
        selected: SelectedChannel,
        config: &GatewayConfig,
    ) -> Result<AttemptOutput, AdapterError> {
        let channel = selected.channel.clone();
        let binding = ChannelBinding {
            channel_id: channel.id,
            base_url: channel.base_url.clone(),
            api_key: selected.api_key,
            test_model: channel.test_model.clone(),
            request_timeout: Duration::from_secs(60),
        };
        let adapter = self
            .registry
            .create(&channel.adapter, binding)
            .map_err(|err| AdapterError::invalid_config(err.to_string()))?;

        let upstream_req = adapter.convert(request).await?;
        let started = Instant::now();
        let response = self
            .client
            .send(upstream_req)
            .await
            .map_err(|failure| match failure {
                UpstreamFailure::Http { status, body, .. } => adapter.extract_error(status, &body),
                transport => transport.into_transport_error(),
            })?;

        if response.status >= 400 {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            return Err(adapter.extract_error(response.status, &body));
        }

        if !request.is_stream() {
            let UpstreamBody::Bytes(body) = response.body else {
                return Err(AdapterError::decode("unexpected stream body"));
            };
            let parsed = adapter.parse_response(request, &body)?;
            return Ok(AttemptOutput::Completion(Box::new(CompletionAttempt {
                channel,
                response: parsed,
                latency: started.elapsed(),
            })));
        }

        let byte_rx = match response.body {
            UpstreamBody::Stream(rx) => rx,
            // Some compatible endpoints reply non-chunked; feed the buffered
            // body through the same parser.
            UpstreamBody::Bytes(bytes) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };
        let mut chunks = adapter.parse_stream(request.model.clone(), byte_rx);

        match tokio::time::timeout(config.stream_first_chunk_wait(), chunks.recv()).await {
            Ok(Some(Ok(first))) => Ok(AttemptOutput::Stream(StreamAttempt {
                channel,
                chunks,
                buffered_first: Some(first),
                started,
            })),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Err(AdapterError::new(
                AdapterErrorCode::UpstreamServerError,
                "upstream closed before first chunk",
                true,
            )),
            // Slow first token: start forwarding anyway; failover is no
            // longer possible past this point.
            Err(_) => Ok(AttemptOutput::Stream(StreamAttempt {
                channel,
                chunks,
                buffered_first: None,
                started,
            })),
        }
    }

    async fn finalize_completion(
        &self,
        request_id: &str,
        user: &AuthedUser,
        group: &str,
        input_estimate: u64,
        attempt: CompletionAttempt,
    ) -> RelayResult<ChatCompletionResponse> {
        let CompletionAttempt {
            channel,
            mut response,
            latency,
        } = attempt;

        // Provider-reported usage wins; fall back to local counts.
        let usage = response.usage.unwrap_or_else(|| {
            let counter = tokenizer_for(&response.model);
            let completion_text: String = response
                .choices
                .iter()
                .map(|choice| choice.message.content.as_str())
                .collect();
            Usage::new(input_estimate, counter.count(&completion_text))
        });
        response.usage = Some(usage);

        let record = UsageRecord {
            request_id: request_id.to_string(),
            user_id: user.id,
            channel_id: channel.id,
            model: response.model.clone(),
            group: group.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: latency.as_millis() as i64,
            success: true,
            error_code: None,
        };
        if let Err(err) = self.quota.post_consume(&record).await {
            tracing::error!(request_id = %request_id, error = %err, "post-consume failed after success");
        }
        self.selector.record(channel.id, true, latency).await;
        Ok(response)
    }

    /// Spawn the pump detached so accounting runs even when the downstream
    /// connection is torn away mid-stream.
    #[allow(clippy::too_many_arguments)]
    fn spawn_stream(
        &self,
        request_id: String,
        user: AuthedUser,
        model: String,
        group: String,
        input_estimate: u64,
        attempt: StreamAttempt,
        config: &GatewayConfig,
    ) -> mpsc::Receiver<Bytes> {
        let StreamAttempt {
            channel,
            chunks,
            buffered_first,
            started,
        } = attempt;

        let (client_tx, client_rx) = mpsc::channel::<Bytes>(CLIENT_FRAME_BUFFER);
        let pump_config = PumpConfig {
            total_timeout: config.stream_total_timeout(),
            idle_timeout: config.stream_idle_timeout(),
        };
        let quota = self.quota.clone();
        let selector = self.selector.clone();

        let chunks = stitch_first(buffered_first, chunks);
        tokio::spawn(async move {
            let counter = streaming_counter(&model);
            let outcome = pump::run(chunks, client_tx, counter, pump_config).await;
            let latency = started.elapsed();
            let channel_ok = outcome.exit.channel_ok();

            if outcome.chunks_received == 0 {
                // Hard failure at request time: bill nothing, no usage row.
                if let Err(err) = quota.refund(&request_id).await {
                    tracing::error!(request_id = %request_id, error = %err, "stream refund failed");
                }
                selector.record(channel.id, channel_ok, latency).await;
                return;
            }

            let prompt_tokens = outcome
                .upstream_usage
                .map(|usage| usage.prompt_tokens)
                .filter(|tokens| *tokens > 0)
                .unwrap_or(input_estimate);
            let completion_tokens = outcome
                .upstream_usage
                .map(|usage| usage.completion_tokens)
                .filter(|tokens| *tokens > 0)
                .unwrap_or(outcome.completion_tokens);

            let record = UsageRecord {
                request_id: request_id.clone(),
                user_id: user.id,
                channel_id: channel.id,
                model,
                group,
                prompt_tokens,
                completion_tokens,
                latency_ms: latency.as_millis() as i64,
                success: outcome.exit.error_code().is_none()
                    || matches!(outcome.exit, pump::PumpExit::ClientCanceled),
                error_code: outcome.exit.error_code().map(|code| code.to_string()),
            };
            if let Err(err) = quota.post_consume(&record).await {
                tracing::error!(request_id = %request_id, error = %err, "stream post-consume failed");
            }
            selector.record(channel.id, channel_ok, latency).await;
        });

        client_rx
    }
}

fn validate(request: &ChatCompletionRequest) -> RelayResult<()> {
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn estimate_quota(pricing: &crate::pricing::Pricing, input_estimate: u64) -> i64 {
    match pricing.quota_type {
        modelgate_storage::QuotaType::PerCall => pricing.calculate(0, 0).max(ESTIMATE_FLOOR),
        modelgate_storage::QuotaType::Token => {
            let rate = pricing.input_rate * pricing.group_multiplier;
            (ESTIMATE_MARGIN * input_estimate as f64 * rate).ceil() as i64 + ESTIMATE_FLOOR
        }
    }
}

/// Re-prefix the buffered first chunk onto the live stream.
fn stitch_first(first: Option<ChatCompletionChunk>, mut rest: ChunkReceiver) -> ChunkReceiver {
    let Some(first) = first else {
        return rest;
    };
    let (tx, rx) = mpsc::channel(CLIENT_FRAME_BUFFER);
    tokio::spawn(async move {
        if tx.send(Ok(first)).await.is_err() {
            return;
        }
        while let Some(item) = rest.recv().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_storage::QuotaType;

    #[test]
    fn estimate_has_margin_and_floor() {
        let pricing = crate::pricing::Pricing {
            quota_type: QuotaType::Token,
            input_rate: 1.0,
            completion_multiplier: 2.0,
            group_multiplier: 1.0,
        };
        // ceil(1.5 * 10 * 1) + 8 = 23
        assert_eq!(estimate_quota(&pricing, 10), 23);
        // Zero-input prompts still reserve the floor.
        assert_eq!(estimate_quota(&pricing, 0), ESTIMATE_FLOOR);
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let bad_model = ChatCompletionRequest {
            model: " ".to_string(),
            messages: vec![modelgate_protocol::chat::ChatMessage::new(
                modelgate_protocol::chat::ChatRole::User,
                "hi",
            )],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: None,
            user: None,
            tools: None,
        };
        assert!(matches!(
            validate(&bad_model),
            Err(RelayError::InvalidRequest(_))
        ));

        let no_messages = ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: None,
            user: None,
            tools: None,
        };
        assert!(matches!(
            validate(&no_messages),
            Err(RelayError::InvalidRequest(_))
        ));
    }
}
