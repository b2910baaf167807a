//! Model pricing with a TTL'd in-memory table.
//!
//! Lookups never hit storage on the hot path; the whole table is reloaded
//! at most once per TTL (or explicitly on admin refresh).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use modelgate_storage::{PricingRow, QuotaType, Storage};

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub quota_type: QuotaType,
    pub input_rate: f64,
    pub completion_multiplier: f64,
    pub group_multiplier: f64,
}

impl Pricing {
    /// `quota = ceil((input × rate + output × rate × completion_mult) × group_mult)`
    /// for token pricing; per-call pricing charges the rate once.
    pub fn calculate(&self, input_tokens: u64, output_tokens: u64) -> i64 {
        let raw = match self.quota_type {
            QuotaType::Token => {
                (input_tokens as f64 * self.input_rate
                    + output_tokens as f64 * self.input_rate * self.completion_multiplier)
                    * self.group_multiplier
            }
            QuotaType::PerCall => self.input_rate * self.group_multiplier,
        };
        raw.ceil().max(0.0) as i64
    }
}

struct PricingTable {
    rows: HashMap<(String, String), Pricing>,
    /// None = never loaded; forces a refresh on first lookup.
    loaded_at: Option<Instant>,
}

impl PricingTable {
    fn is_stale(&self, ttl: std::time::Duration) -> bool {
        self.loaded_at.is_none_or(|at| at.elapsed() >= ttl)
    }
}

pub struct PricingService {
    storage: Arc<dyn Storage>,
    ttl: std::time::Duration,
    table: ArcSwap<PricingTable>,
    refresh_lock: Mutex<()>,
}

impl PricingService {
    pub fn new(storage: Arc<dyn Storage>, ttl: std::time::Duration) -> Self {
        let empty = PricingTable {
            rows: HashMap::new(),
            loaded_at: None,
        };
        Self {
            storage,
            ttl,
            table: ArcSwap::new(Arc::new(empty)),
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn refresh(&self) -> RelayResult<()> {
        // One refresher at a time; latecomers reuse the fresh table.
        let _guard = self.refresh_lock.lock().await;
        if !self.table.load().is_stale(self.ttl) {
            return Ok(());
        }
        self.force_refresh().await
    }

    /// Unconditional reload, used by the admin refresh endpoint.
    pub async fn force_refresh(&self) -> RelayResult<()> {
        let rows = self.storage.load_pricing().await?;
        let mut table = HashMap::new();
        for row in rows {
            if !row.enabled {
                continue;
            }
            table.insert(
                (row.model_name.clone(), row.group_name.clone()),
                pricing_of(&row),
            );
        }
        let count = table.len();
        self.table.store(Arc::new(PricingTable {
            rows: table,
            loaded_at: Some(Instant::now()),
        }));
        tracing::debug!(rows = count, "pricing table refreshed");
        Ok(())
    }

    /// Lookup with `(model, group)` -> `(model, "default")` fallback.
    pub async fn price(&self, model: &str, group: &str) -> RelayResult<Pricing> {
        if self.table.load().is_stale(self.ttl) {
            self.refresh().await?;
        }
        let table = self.table.load();
        if let Some(pricing) = table.rows.get(&(model.to_string(), group.to_string())) {
            return Ok(*pricing);
        }
        if group != DEFAULT_GROUP
            && let Some(pricing) = table
                .rows
                .get(&(model.to_string(), DEFAULT_GROUP.to_string()))
        {
            return Ok(*pricing);
        }
        Err(RelayError::PricingNotFound {
            model: model.to_string(),
            group: group.to_string(),
        })
    }

    pub async fn calculate(
        &self,
        model: &str,
        group: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> RelayResult<i64> {
        let pricing = self.price(model, group).await?;
        Ok(pricing.calculate(input_tokens, output_tokens))
    }
}

fn pricing_of(row: &PricingRow) -> Pricing {
    Pricing {
        quota_type: row.quota_type,
        input_rate: row.input_rate,
        completion_multiplier: row.completion_multiplier,
        group_multiplier: row.group_multiplier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_storage::{MemStorage, PricingRow};
    use time::OffsetDateTime;

    fn row(model: &str, group: &str, rate: f64, completion: f64, group_mult: f64) -> PricingRow {
        PricingRow {
            id: 0,
            model_name: model.to_string(),
            group_name: group.to_string(),
            quota_type: QuotaType::Token,
            input_rate: rate,
            completion_multiplier: completion,
            group_multiplier: group_mult,
            enabled: true,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn service(rows: Vec<PricingRow>) -> PricingService {
        let storage = MemStorage::new();
        for row in rows {
            storage.seed_pricing(row);
        }
        PricingService::new(Arc::new(storage), std::time::Duration::from_secs(300))
    }

    #[test]
    fn formula_rounds_up() {
        let pricing = Pricing {
            quota_type: QuotaType::Token,
            input_rate: 1.0,
            completion_multiplier: 2.0,
            group_multiplier: 1.0,
        };
        // 5 + 10*2 = 25
        assert_eq!(pricing.calculate(5, 10), 25);

        let fractional = Pricing {
            quota_type: QuotaType::Token,
            input_rate: 0.3,
            completion_multiplier: 1.0,
            group_multiplier: 1.0,
        };
        // 0.3*3 = 0.9 -> 1
        assert_eq!(fractional.calculate(3, 0), 1);
    }

    #[test]
    fn per_call_ignores_tokens() {
        let pricing = Pricing {
            quota_type: QuotaType::PerCall,
            input_rate: 50.0,
            completion_multiplier: 2.0,
            group_multiplier: 0.8,
        };
        assert_eq!(pricing.calculate(0, 0), 40);
        assert_eq!(pricing.calculate(1000, 1000), 40);
    }

    #[tokio::test]
    async fn group_falls_back_to_default() {
        let service = service(vec![
            row("gpt-3.5-turbo", "default", 1.0, 2.0, 1.0),
            row("gpt-3.5-turbo", "vip", 1.0, 2.0, 0.8),
        ]);
        let vip = service.price("gpt-3.5-turbo", "vip").await.unwrap();
        assert_eq!(vip.group_multiplier, 0.8);
        let free = service.price("gpt-3.5-turbo", "free").await.unwrap();
        assert_eq!(free.group_multiplier, 1.0);

        let missing = service.price("gpt-9", "default").await;
        assert!(matches!(missing, Err(RelayError::PricingNotFound { .. })));
    }

    #[tokio::test]
    async fn disabled_rows_are_invisible() {
        let mut disabled = row("m", "default", 1.0, 1.0, 1.0);
        disabled.enabled = false;
        let service = service(vec![disabled]);
        assert!(service.price("m", "default").await.is_err());
    }
}
