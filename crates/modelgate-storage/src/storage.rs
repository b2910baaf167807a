use async_trait::async_trait;
use time::OffsetDateTime;

use crate::snapshot::{ChannelRow, PricingRow, QuotaType, StorageSnapshot, UserRow};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ChannelUpsert {
    pub name: String,
    pub adapter: String,
    pub base_url: Option<String>,
    pub api_keys: Vec<String>,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub test_model: Option<String>,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PricingUpsert {
    pub model_name: String,
    pub group_name: String,
    pub quota_type: QuotaType,
    pub input_rate: f64,
    pub completion_multiplier: f64,
    pub group_multiplier: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreConsumedRecord {
    pub request_id: String,
    pub user_id: i64,
    pub amount: i64,
    pub trusted: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageLogInsert {
    pub request_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub latency_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Storage is used for:
/// - bootstrap (load_snapshot)
/// - admin mutations (channel / pricing writes)
/// - quota mutations (the conditional balance update is the one primitive
///   the correctness argument rests on)
/// - the batched usage-log writer
///
/// Runtime reads (selection, pricing lookups) must NOT hit the DB; they are
/// served from in-memory snapshots and caches.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync. Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    // Persisted gateway config (CLI/ENV layers merge on top at bootstrap)
    async fn load_gateway_config(&self) -> StorageResult<Option<serde_json::Value>>;
    async fn upsert_gateway_config(&self, config_json: &serde_json::Value) -> StorageResult<()>;

    // Channels
    async fn insert_channel(&self, input: &ChannelUpsert) -> StorageResult<i64>;
    async fn update_channel(&self, channel_id: i64, input: &ChannelUpsert) -> StorageResult<()>;
    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StorageResult<()>;
    async fn delete_channel(&self, channel_id: i64) -> StorageResult<()>;
    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>>;

    // Pricing
    async fn upsert_pricing(&self, input: &PricingUpsert) -> StorageResult<i64>;
    async fn delete_pricing(&self, pricing_id: i64) -> StorageResult<()>;
    async fn load_pricing(&self) -> StorageResult<Vec<PricingRow>>;

    // Users / balances
    async fn load_user(&self, user_id: i64) -> StorageResult<Option<UserRow>>;
    /// Compare-and-deduct: `balance -= amount` only while `balance >= amount`.
    /// Returns false when the condition failed. This is the only
    /// serializability guarantee quota relies on.
    async fn deduct_balance(&self, user_id: i64, amount: i64) -> StorageResult<bool>;
    async fn credit_balance(&self, user_id: i64, amount: i64) -> StorageResult<()>;

    // Pre-consume reservations
    async fn insert_pre_consumed(&self, record: &PreConsumedRecord) -> StorageResult<()>;
    /// Atomically remove and return the record; `None` when another actor
    /// (post-consume, refund, or the reaper) already took it.
    async fn take_pre_consumed(
        &self,
        request_id: &str,
    ) -> StorageResult<Option<PreConsumedRecord>>;
    async fn expired_pre_consumed(
        &self,
        older_than: OffsetDateTime,
    ) -> StorageResult<Vec<PreConsumedRecord>>;

    // Usage logs (append-only; replays deduped on request_id)
    async fn append_usage_logs(&self, rows: &[UsageLogInsert]) -> StorageResult<()>;
}
