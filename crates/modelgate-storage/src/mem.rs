//! In-memory storage.
//!
//! Backs the `mem:` DSN for local runs and gives the core crates a fast
//! deterministic backend for tests. The single mutex makes every mutation
//! serializable, which trivially satisfies the compare-and-deduct contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::snapshot::{ChannelRow, PricingRow, StorageSnapshot, UserRow};
use crate::storage::{
    ChannelUpsert, PreConsumedRecord, PricingUpsert, Storage, StorageResult, UsageLogInsert,
};

#[derive(Default)]
struct MemInner {
    gateway_config: Option<serde_json::Value>,
    channels: Vec<ChannelRow>,
    pricing: Vec<PricingRow>,
    users: HashMap<i64, UserRow>,
    pre_consumed: HashMap<String, PreConsumedRecord>,
    usage_logs: Vec<UsageLogInsert>,
    next_channel_id: i64,
    next_pricing_id: i64,
}

#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed_user(&self, user: UserRow) {
        self.lock().users.insert(user.id, user);
    }

    pub fn seed_channel(&self, channel: ChannelRow) {
        let mut inner = self.lock();
        inner.next_channel_id = inner.next_channel_id.max(channel.id);
        inner.channels.push(channel);
    }

    pub fn seed_pricing(&self, pricing: PricingRow) {
        let mut inner = self.lock();
        inner.next_pricing_id = inner.next_pricing_id.max(pricing.id);
        inner.pricing.push(pricing);
    }

    pub fn balance(&self, user_id: i64) -> Option<i64> {
        self.lock().users.get(&user_id).map(|user| user.balance)
    }

    pub fn usage_logs(&self) -> Vec<UsageLogInsert> {
        self.lock().usage_logs.clone()
    }

    pub fn pre_consumed_count(&self) -> usize {
        self.lock().pre_consumed.len()
    }
}

fn channel_from_upsert(id: i64, input: &ChannelUpsert, now: OffsetDateTime) -> ChannelRow {
    ChannelRow {
        id,
        name: input.name.clone(),
        adapter: input.adapter.clone(),
        base_url: input.base_url.clone(),
        api_keys: input.api_keys.clone(),
        models: input.models.clone(),
        groups: input.groups.clone(),
        test_model: input.test_model.clone(),
        priority: input.priority,
        weight: input.weight,
        enabled: input.enabled,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let inner = self.lock();
        Ok(StorageSnapshot {
            channels: inner.channels.clone(),
            pricing: inner.pricing.clone(),
            users: inner.users.values().cloned().collect(),
        })
    }

    async fn load_gateway_config(&self) -> StorageResult<Option<serde_json::Value>> {
        Ok(self.lock().gateway_config.clone())
    }

    async fn upsert_gateway_config(&self, config_json: &serde_json::Value) -> StorageResult<()> {
        self.lock().gateway_config = Some(config_json.clone());
        Ok(())
    }

    async fn insert_channel(&self, input: &ChannelUpsert) -> StorageResult<i64> {
        let mut inner = self.lock();
        inner.next_channel_id += 1;
        let id = inner.next_channel_id;
        let row = channel_from_upsert(id, input, OffsetDateTime::now_utc());
        inner.channels.push(row);
        Ok(id)
    }

    async fn update_channel(&self, channel_id: i64, input: &ChannelUpsert) -> StorageResult<()> {
        let mut inner = self.lock();
        if let Some(row) = inner.channels.iter_mut().find(|c| c.id == channel_id) {
            let created_at = row.created_at;
            *row = channel_from_upsert(channel_id, input, OffsetDateTime::now_utc());
            row.created_at = created_at;
        }
        Ok(())
    }

    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StorageResult<()> {
        let mut inner = self.lock();
        if let Some(row) = inner.channels.iter_mut().find(|c| c.id == channel_id) {
            row.enabled = enabled;
            row.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn delete_channel(&self, channel_id: i64) -> StorageResult<()> {
        self.lock().channels.retain(|c| c.id != channel_id);
        Ok(())
    }

    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>> {
        Ok(self.lock().channels.clone())
    }

    async fn upsert_pricing(&self, input: &PricingUpsert) -> StorageResult<i64> {
        let mut inner = self.lock();
        let now = OffsetDateTime::now_utc();
        if let Some(row) = inner
            .pricing
            .iter_mut()
            .find(|p| p.model_name == input.model_name && p.group_name == input.group_name)
        {
            row.quota_type = input.quota_type;
            row.input_rate = input.input_rate;
            row.completion_multiplier = input.completion_multiplier;
            row.group_multiplier = input.group_multiplier;
            row.enabled = input.enabled;
            row.updated_at = now;
            return Ok(row.id);
        }
        inner.next_pricing_id += 1;
        let id = inner.next_pricing_id;
        inner.pricing.push(PricingRow {
            id,
            model_name: input.model_name.clone(),
            group_name: input.group_name.clone(),
            quota_type: input.quota_type,
            input_rate: input.input_rate,
            completion_multiplier: input.completion_multiplier,
            group_multiplier: input.group_multiplier,
            enabled: input.enabled,
            updated_at: now,
        });
        Ok(id)
    }

    async fn delete_pricing(&self, pricing_id: i64) -> StorageResult<()> {
        self.lock().pricing.retain(|p| p.id != pricing_id);
        Ok(())
    }

    async fn load_pricing(&self) -> StorageResult<Vec<PricingRow>> {
        Ok(self.lock().pricing.clone())
    }

    async fn load_user(&self, user_id: i64) -> StorageResult<Option<UserRow>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn deduct_balance(&self, user_id: i64, amount: i64) -> StorageResult<bool> {
        let mut inner = self.lock();
        let Some(user) = inner.users.get_mut(&user_id) else {
            return Ok(false);
        };
        if user.balance < amount {
            return Ok(false);
        }
        user.balance -= amount;
        user.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn credit_balance(&self, user_id: i64, amount: i64) -> StorageResult<()> {
        let mut inner = self.lock();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.balance += amount;
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn insert_pre_consumed(&self, record: &PreConsumedRecord) -> StorageResult<()> {
        self.lock()
            .pre_consumed
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn take_pre_consumed(
        &self,
        request_id: &str,
    ) -> StorageResult<Option<PreConsumedRecord>> {
        Ok(self.lock().pre_consumed.remove(request_id))
    }

    async fn expired_pre_consumed(
        &self,
        older_than: OffsetDateTime,
    ) -> StorageResult<Vec<PreConsumedRecord>> {
        Ok(self
            .lock()
            .pre_consumed
            .values()
            .filter(|record| record.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn append_usage_logs(&self, rows: &[UsageLogInsert]) -> StorageResult<()> {
        let mut inner = self.lock();
        for row in rows {
            if inner
                .usage_logs
                .iter()
                .any(|existing| existing.request_id == row.request_id)
            {
                continue;
            }
            inner.usage_logs.push(row.clone());
        }
        Ok(())
    }
}
