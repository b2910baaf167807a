//! Batched, at-least-once usage-log writer.
//!
//! UsageLog rows are the billing facts; they must never be dropped, but
//! they also must not block the request path. Rows go into a bounded queue
//! and a background task flushes them in batches, retrying on DB errors.
//! Replays are harmless: the table dedupes on request_id.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::storage::{Storage, UsageLogInsert};

#[derive(Debug, Clone)]
pub struct UsageLogQueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for UsageLogQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
            retry_delay: Duration::from_millis(200),
        }
    }
}

pub struct UsageLogQueue {
    tx: mpsc::Sender<UsageLogInsert>,
    _handle: JoinHandle<()>,
}

impl UsageLogQueue {
    pub fn spawn(storage: Arc<dyn Storage>, config: UsageLogQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let handle = tokio::spawn(writer(storage, rx, config));
        Self {
            tx,
            _handle: handle,
        }
    }

    /// Enqueue one row; waits when the queue is saturated so billing facts
    /// are never dropped on the floor.
    pub async fn push(&self, row: UsageLogInsert) {
        let _ = self.tx.send(row).await;
    }
}

async fn writer(
    storage: Arc<dyn Storage>,
    mut rx: mpsc::Receiver<UsageLogInsert>,
    config: UsageLogQueueConfig,
) {
    let mut batch: Vec<UsageLogInsert> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(row) => {
                        batch.push(row);
                        if batch.len() >= config.batch_size {
                            flush(&storage, &mut batch, config.retry_delay).await;
                        }
                    }
                    None => {
                        flush(&storage, &mut batch, config.retry_delay).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&storage, &mut batch, config.retry_delay).await;
            }
        }
    }
}

async fn flush(storage: &Arc<dyn Storage>, batch: &mut Vec<UsageLogInsert>, retry_delay: Duration) {
    if batch.is_empty() {
        return;
    }
    loop {
        match storage.append_usage_logs(batch).await {
            Ok(()) => {
                batch.clear();
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, rows = batch.len(), "usage log flush failed, retrying");
                tokio_time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStorage;
    use time::OffsetDateTime;

    fn row(request_id: &str) -> UsageLogInsert {
        UsageLogInsert {
            request_id: request_id.to_string(),
            user_id: 1,
            channel_id: 1,
            model: "m".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            quota: 1,
            latency_ms: 1,
            success: true,
            error_code: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn rows_reach_storage() {
        let storage = Arc::new(MemStorage::new());
        let queue = UsageLogQueue::spawn(
            storage.clone(),
            UsageLogQueueConfig {
                flush_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        queue.push(row("a")).await;
        queue.push(row("b")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if storage.usage_logs().len() == 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "rows not flushed in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
