//! SSE stream pump.
//!
//! Copies canonical chunks from the adapter's stream parser to the client
//! as `data:` frames, enforcing the idle and total deadlines, counting
//! completion tokens as they pass, and reporting exactly how the stream
//! ended so the caller's one finalizer can settle quota and stats.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use modelgate_adapter::{AdapterError, ChunkReceiver};
use modelgate_protocol::chat::Usage;
use modelgate_protocol::sse::{data_frame, done_frame};
use modelgate_tokenizer::StreamingCounter;

use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub total_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum PumpExit {
    /// Upstream closed normally.
    UpstreamDone,
    UpstreamError(AdapterError),
    IdleTimeout,
    TotalTimeout,
    /// Downstream write failed; the client went away.
    ClientCanceled,
}

impl PumpExit {
    /// The taxonomy error this exit corresponds to; `None` for a normal
    /// upstream close. Drives both the SSE error frame and the usage-log
    /// error code.
    pub fn relay_error(&self) -> Option<RelayError> {
        match self {
            PumpExit::UpstreamDone => None,
            PumpExit::UpstreamError(err) => Some(RelayError::Upstream(err.clone())),
            PumpExit::IdleTimeout => Some(RelayError::StreamIdleTimeout),
            PumpExit::TotalTimeout => Some(RelayError::StreamTotalTimeout),
            PumpExit::ClientCanceled => Some(RelayError::ClientCanceled),
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.relay_error().map(|err| err.code())
    }

    /// Partial delivery still counts as a successful call for channel
    /// stats; only upstream-side failures mark the channel bad.
    pub fn channel_ok(&self) -> bool {
        !matches!(self, PumpExit::UpstreamError(_) | PumpExit::IdleTimeout)
    }
}

#[derive(Debug)]
pub struct PumpOutcome {
    pub exit: PumpExit,
    /// Chunks read from upstream. Zero means the call failed before any
    /// billable output: refund instead of post-consume.
    pub chunks_received: u64,
    pub chunks_forwarded: u64,
    pub completion_tokens: u64,
    /// Usage as reported by the provider mid-stream, when present.
    pub upstream_usage: Option<Usage>,
}

/// Drain `chunks` into `client`. Every exit path flows through the single
/// return value; the caller is responsible for running accounting on it.
pub async fn run(
    mut chunks: ChunkReceiver,
    client: mpsc::Sender<Bytes>,
    mut counter: StreamingCounter,
    config: PumpConfig,
) -> PumpOutcome {
    let total_deadline = Instant::now() + config.total_timeout;
    let mut idle_deadline = Instant::now() + config.idle_timeout;
    let mut chunks_received: u64 = 0;
    let mut chunks_forwarded: u64 = 0;
    let mut upstream_usage: Option<Usage> = None;

    let exit = loop {
        tokio::select! {
            item = chunks.recv() => {
                match item {
                    Some(Ok(chunk)) => {
                        chunks_received += 1;
                        if let Some(text) = chunk.delta_content() {
                            counter.add_chunk(text);
                        }
                        if let Some(usage) = chunk.usage {
                            upstream_usage = Some(usage);
                        }
                        let payload = match serde_json::to_string(&chunk) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::warn!(error = %err, "chunk serialization failed, skipping");
                                continue;
                            }
                        };
                        if client.send(data_frame(&payload)).await.is_err() {
                            break PumpExit::ClientCanceled;
                        }
                        chunks_forwarded += 1;
                        idle_deadline = Instant::now() + config.idle_timeout;
                    }
                    Some(Err(err)) => {
                        let exit = PumpExit::UpstreamError(err);
                        let _ = send_error_frame(&client, &exit).await;
                        break exit;
                    }
                    None => {
                        if client.send(done_frame()).await.is_err() {
                            break PumpExit::ClientCanceled;
                        }
                        break PumpExit::UpstreamDone;
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                let _ = send_error_frame(&client, &PumpExit::IdleTimeout).await;
                break PumpExit::IdleTimeout;
            }
            _ = tokio::time::sleep_until(total_deadline) => {
                let _ = send_error_frame(&client, &PumpExit::TotalTimeout).await;
                break PumpExit::TotalTimeout;
            }
        }
    };

    PumpOutcome {
        exit,
        chunks_received,
        chunks_forwarded,
        completion_tokens: counter.finalize(),
        upstream_usage,
    }
}

/// Error event then `[DONE]`, per the SSE contract for failed streams.
async fn send_error_frame(client: &mpsc::Sender<Bytes>, exit: &PumpExit) -> Result<(), ()> {
    let Some(err) = exit.relay_error() else {
        return Ok(());
    };
    let payload = serde_json::to_string(&err.envelope()).map_err(|_| ())?;
    client.send(data_frame(&payload)).await.map_err(|_| ())?;
    client.send(done_frame()).await.map_err(|_| ())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_protocol::chat::{
        ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkObjectType, FinishReason,
    };
    use modelgate_tokenizer::streaming_counter;

    fn chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "c1".to_string(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: 1,
            model: "gpt-3.5-turbo".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(text.to_string()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn finish_with_usage(prompt: u64, completion: u64) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "c1".to_string(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: 1,
            model: "gpt-3.5-turbo".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Some(Usage::new(prompt, completion)),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(bytes) = rx.recv().await {
            frames.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn forwards_in_order_and_terminates_with_done() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (client_tx, client_rx) = mpsc::channel(8);

        chunk_tx.send(Ok(chunk("a"))).await.unwrap();
        chunk_tx.send(Ok(chunk("b"))).await.unwrap();
        chunk_tx.send(Ok(chunk("c"))).await.unwrap();
        drop(chunk_tx);

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig::default(),
        )
        .await;

        assert!(matches!(outcome.exit, PumpExit::UpstreamDone));
        assert_eq!(outcome.chunks_forwarded, 3);

        let frames = drain(client_rx).await;
        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("\"a\""));
        assert!(frames[1].contains("\"b\""));
        assert!(frames[2].contains("\"c\""));
        assert_eq!(frames[3], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn counts_tokens_and_captures_upstream_usage() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (client_tx, client_rx) = mpsc::channel(8);

        chunk_tx.send(Ok(chunk("hello "))).await.unwrap();
        chunk_tx.send(Ok(chunk("world"))).await.unwrap();
        chunk_tx.send(Ok(finish_with_usage(5, 12))).await.unwrap();
        drop(chunk_tx);

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig::default(),
        )
        .await;

        assert!(outcome.completion_tokens > 0);
        let usage = outcome.upstream_usage.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 12);
        drop(drain(client_rx).await);
    }

    #[tokio::test]
    async fn client_disconnect_is_observed() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (client_tx, client_rx) = mpsc::channel(8);
        drop(client_rx);

        chunk_tx.send(Ok(chunk("hello"))).await.unwrap();

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig::default(),
        )
        .await;

        assert!(matches!(outcome.exit, PumpExit::ClientCanceled));
        assert_eq!(outcome.chunks_forwarded, 0);
        assert_eq!(outcome.chunks_received, 1);
        // Tokens already read from upstream still count for billing.
        assert!(outcome.completion_tokens > 0);
    }

    #[tokio::test]
    async fn upstream_error_sends_error_frame_then_done() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (client_tx, client_rx) = mpsc::channel(8);

        chunk_tx.send(Ok(chunk("partial"))).await.unwrap();
        chunk_tx
            .send(Err(AdapterError::from_status(500, "mid-stream failure")))
            .await
            .unwrap();
        drop(chunk_tx);

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig::default(),
        )
        .await;

        assert!(matches!(outcome.exit, PumpExit::UpstreamError(_)));
        let frames = drain(client_rx).await;
        assert!(frames[1].contains("upstream_error"));
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_fires() {
        let (_chunk_tx, chunk_rx) = mpsc::channel::<modelgate_adapter::StreamItem>(8);
        let (client_tx, client_rx) = mpsc::channel(8);

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig {
                total_timeout: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(30),
            },
        )
        .await;

        assert!(matches!(outcome.exit, PumpExit::IdleTimeout));
        let frames = drain(client_rx).await;
        assert!(frames[0].contains("stream_idle_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn total_deadline_fires_despite_activity() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (client_tx, client_rx) = mpsc::channel(64);

        // Feeder keeps the idle timer fresh forever.
        tokio::spawn(async move {
            loop {
                if chunk_tx.send(Ok(chunk("tick"))).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let outcome = run(
            chunk_rx,
            client_tx,
            streaming_counter("gpt-3.5-turbo"),
            PumpConfig {
                total_timeout: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(30),
            },
        )
        .await;

        assert!(matches!(outcome.exit, PumpExit::TotalTimeout));
        assert!(outcome.chunks_forwarded > 0);
        drop(drain(client_rx).await);
    }
}
