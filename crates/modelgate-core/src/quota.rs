//! Quota: pre-consume / post-consume / refund.
//!
//! Correctness rests on two storage primitives: the conditional
//! balance deduction and the take-exactly-once pre-consume removal.
//! Everything else here is policy layered on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use modelgate_storage::{
    PreConsumedRecord, Storage, UsageLogInsert, UsageLogQueue,
};
use time::OffsetDateTime;

use crate::error::{RelayError, RelayResult};
use crate::pricing::PricingService;

/// Re-reads after a failed conditional deduction, for the rare race where a
/// concurrent refund tops the balance back up.
const DEDUCT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Balance multiple above which pre-consume skips the deduction.
    pub trust_multiple: u64,
    pub pre_consume_ttl: Duration,
    pub balance_cache_ttl: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            trust_multiple: 10,
            pre_consume_ttl: Duration::from_secs(15 * 60),
            balance_cache_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreConsumeOutcome {
    pub trusted: bool,
    /// Amount actually held back from the balance (0 when trusted).
    pub reserved: i64,
}

/// Everything post-consume needs to settle and log one completed call.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub group: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
}

pub struct QuotaService {
    storage: Arc<dyn Storage>,
    pricing: Arc<PricingService>,
    usage_queue: Arc<UsageLogQueue>,
    config: QuotaConfig,
    balance_cache: Mutex<HashMap<i64, (i64, Instant)>>,
}

impl QuotaService {
    pub fn new(
        storage: Arc<dyn Storage>,
        pricing: Arc<PricingService>,
        usage_queue: Arc<UsageLogQueue>,
        config: QuotaConfig,
    ) -> Self {
        Self {
            storage,
            pricing,
            usage_queue,
            config,
            balance_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cache-first balance read.
    pub async fn balance(&self, user_id: i64) -> RelayResult<i64> {
        {
            let cache = self.balance_cache.lock().await;
            if let Some((balance, at)) = cache.get(&user_id)
                && at.elapsed() < self.config.balance_cache_ttl
            {
                return Ok(*balance);
            }
        }
        let user = self
            .storage
            .load_user(user_id)
            .await?
            .ok_or(RelayError::Unauthorized)?;
        let mut cache = self.balance_cache.lock().await;
        cache.insert(user_id, (user.balance, Instant::now()));
        Ok(user.balance)
    }

    async fn invalidate_balance(&self, user_id: i64) {
        self.balance_cache.lock().await.remove(&user_id);
    }

    pub async fn pre_consume(
        &self,
        request_id: &str,
        user_id: i64,
        estimated: i64,
    ) -> RelayResult<PreConsumeOutcome> {
        let balance = self.balance(user_id).await?;
        if balance < estimated {
            return Err(RelayError::InsufficientQuota {
                needed: estimated,
                balance,
            });
        }

        let trusted = estimated > 0
            && (balance as u128) >= (estimated as u128) * (self.config.trust_multiple as u128);
        let reserved = if trusted {
            // Well-funded user: skip the write, reserve nothing.
            0
        } else {
            let mut deducted = false;
            for _ in 0..DEDUCT_RETRIES {
                if self.storage.deduct_balance(user_id, estimated).await? {
                    deducted = true;
                    break;
                }
                self.invalidate_balance(user_id).await;
                let fresh = self.balance(user_id).await?;
                if fresh < estimated {
                    return Err(RelayError::InsufficientQuota {
                        needed: estimated,
                        balance: fresh,
                    });
                }
            }
            if !deducted {
                return Err(RelayError::Internal(
                    "balance deduction kept conflicting".to_string(),
                ));
            }
            estimated
        };

        self.storage
            .insert_pre_consumed(&PreConsumedRecord {
                request_id: request_id.to_string(),
                user_id,
                amount: reserved,
                trusted,
                created_at: OffsetDateTime::now_utc(),
            })
            .await?;
        self.invalidate_balance(user_id).await;
        Ok(PreConsumeOutcome { trusted, reserved })
    }

    /// Reconcile actual usage against the reservation and append the usage
    /// log. Returns the actual quota charged.
    pub async fn post_consume(&self, usage: &UsageRecord) -> RelayResult<i64> {
        let Some(record) = self.storage.take_pre_consumed(&usage.request_id).await? else {
            return Err(RelayError::PreConsumeNotFound(usage.request_id.clone()));
        };

        let actual = self
            .pricing
            .calculate(
                &usage.model,
                &usage.group,
                usage.prompt_tokens,
                usage.completion_tokens,
            )
            .await?;

        if record.trusted {
            // Nothing was held back; charge the whole thing now.
            self.deduct_up_to(record.user_id, actual).await?;
        } else {
            let delta = actual - record.amount;
            if delta > 0 {
                // The user already consumed the tokens; the deduction must
                // land even if it empties the balance.
                self.deduct_up_to(record.user_id, delta).await?;
            } else if delta < 0 {
                self.storage.credit_balance(record.user_id, -delta).await?;
            }
        }

        self.usage_queue
            .push(UsageLogInsert {
                request_id: usage.request_id.clone(),
                user_id: usage.user_id,
                channel_id: usage.channel_id,
                model: usage.model.clone(),
                prompt_tokens: usage.prompt_tokens as i64,
                completion_tokens: usage.completion_tokens as i64,
                quota: actual,
                latency_ms: usage.latency_ms,
                success: usage.success,
                error_code: usage.error_code.clone(),
                created_at: OffsetDateTime::now_utc(),
            })
            .await;

        self.invalidate_balance(record.user_id).await;
        Ok(actual)
    }

    /// Return the reservation when the call failed before any billable
    /// output. Idempotent: a second call (or a racing reaper) finds no
    /// record and does nothing.
    pub async fn refund(&self, request_id: &str) -> RelayResult<i64> {
        let Some(record) = self.storage.take_pre_consumed(request_id).await? else {
            return Ok(0);
        };
        if record.amount > 0 {
            self.storage
                .credit_balance(record.user_id, record.amount)
                .await?;
            self.invalidate_balance(record.user_id).await;
        }
        tracing::info!(
            request_id,
            user_id = record.user_id,
            amount = record.amount,
            "pre-consume refunded"
        );
        Ok(record.amount)
    }

    /// Background task treating expired reservations as refunds.
    pub fn spawn_reaper(self: &Arc<Self>, scan_interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = service.reap_expired().await {
                    tracing::warn!(error = %err, "pre-consume reaper pass failed");
                }
            }
        })
    }

    pub async fn reap_expired(&self) -> RelayResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - self.config.pre_consume_ttl;
        let expired = self.storage.expired_pre_consumed(cutoff).await?;
        let mut reaped = 0;
        for record in expired {
            // take() re-checks; a request that just settled is a no-op here.
            if self.refund(&record.request_id).await? > 0 || record.amount == 0 {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Deduct `amount`, clamping at zero: the conditional update is tried
    /// first, then whatever balance remains is taken.
    async fn deduct_up_to(&self, user_id: i64, amount: i64) -> RelayResult<()> {
        if amount <= 0 {
            return Ok(());
        }
        for _ in 0..DEDUCT_RETRIES {
            if self.storage.deduct_balance(user_id, amount).await? {
                return Ok(());
            }
            self.invalidate_balance(user_id).await;
            let remaining = self.balance(user_id).await.unwrap_or(0);
            if remaining <= 0 {
                return Ok(());
            }
            if self.storage.deduct_balance(user_id, remaining).await? {
                return Ok(());
            }
        }
        tracing::warn!(user_id, amount, "post-consume deduction kept conflicting");
        Ok(())
    }
}
