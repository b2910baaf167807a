use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, ExprTrait, QueryFilter, Schema,
};
use time::OffsetDateTime;

use async_trait::async_trait;

use crate::entities;
use crate::snapshot::{ChannelRow, PricingRow, QuotaType, StorageSnapshot, UserRow};
use crate::storage::{
    ChannelUpsert, PreConsumedRecord, PricingUpsert, Storage, StorageResult, UsageLogInsert,
};

const GATEWAY_CONFIG_ID: i64 = 1;

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (integrity of admin deletes).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn json_strings(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn channel_row(model: entities::channels::Model) -> ChannelRow {
    ChannelRow {
        id: model.id,
        name: model.name,
        adapter: model.adapter,
        base_url: model.base_url,
        api_keys: json_strings(&model.api_keys),
        models: json_strings(&model.models),
        groups: json_strings(&model.groups),
        test_model: model.test_model,
        priority: model.priority,
        weight: model.weight,
        enabled: model.enabled,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn pricing_row(model: entities::model_pricing::Model) -> PricingRow {
    PricingRow {
        id: model.id,
        model_name: model.model_name,
        group_name: model.group_name,
        quota_type: QuotaType::parse(&model.quota_type),
        input_rate: model.input_rate,
        completion_multiplier: model.completion_multiplier,
        group_multiplier: model.group_multiplier,
        enabled: model.enabled,
        updated_at: model.updated_at,
    }
}

fn user_row(model: entities::users::Model) -> UserRow {
    UserRow {
        id: model.id,
        name: model.name,
        api_key: model.api_key,
        group_name: model.group_name,
        balance: model.balance,
        enabled: model.enabled,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn pre_consumed_record(model: entities::pre_consumed::Model) -> PreConsumedRecord {
    PreConsumedRecord {
        request_id: model.request_id,
        user_id: model.user_id,
        amount: model.amount,
        trusted: model.trusted,
        created_at: model.created_at,
    }
}

fn channel_active(
    input: &ChannelUpsert,
    now: OffsetDateTime,
) -> StorageResult<entities::channels::ActiveModel> {
    Ok(entities::channels::ActiveModel {
        id: ActiveValue::NotSet,
        name: ActiveValue::Set(input.name.clone()),
        adapter: ActiveValue::Set(input.adapter.clone()),
        base_url: ActiveValue::Set(input.base_url.clone()),
        api_keys: ActiveValue::Set(serde_json::to_value(&input.api_keys)?),
        models: ActiveValue::Set(serde_json::to_value(&input.models)?),
        groups: ActiveValue::Set(serde_json::to_value(&input.groups)?),
        test_model: ActiveValue::Set(input.test_model.clone()),
        priority: ActiveValue::Set(input.priority),
        weight: ActiveValue::Set(input.weight),
        enabled: ActiveValue::Set(input.enabled),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
    })
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GatewayConfig)
            .register(entities::Channels)
            .register(entities::ModelPricing)
            .register(entities::Users)
            .register(entities::PreConsumed)
            .register(entities::UsageLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_gateway_config(&self) -> StorageResult<Option<serde_json::Value>> {
        let row = entities::GatewayConfig::find_by_id(GATEWAY_CONFIG_ID)
            .one(&self.db)
            .await?;
        Ok(row.map(|model| model.config_json))
    }

    async fn upsert_gateway_config(&self, config_json: &serde_json::Value) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::GatewayConfig::find_by_id(GATEWAY_CONFIG_ID)
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::gateway_config::ActiveModel = model.into();
                active.config_json = ActiveValue::Set(config_json.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::gateway_config::ActiveModel {
                    id: ActiveValue::Set(GATEWAY_CONFIG_ID),
                    config_json: ActiveValue::Set(config_json.clone()),
                    updated_at: ActiveValue::Set(now),
                };
                entities::GatewayConfig::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let channels = self.load_channels().await?;
        let pricing = self.load_pricing().await?;
        let users = entities::Users::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(user_row)
            .collect();
        Ok(StorageSnapshot {
            channels,
            pricing,
            users,
        })
    }

    async fn insert_channel(&self, input: &ChannelUpsert) -> StorageResult<i64> {
        let active = channel_active(input, OffsetDateTime::now_utc())?;
        let inserted = entities::Channels::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn update_channel(&self, channel_id: i64, input: &ChannelUpsert) -> StorageResult<()> {
        let Some(existing) = entities::Channels::find_by_id(channel_id).one(&self.db).await?
        else {
            return Ok(());
        };
        let created_at = existing.created_at;
        let mut active = channel_active(input, OffsetDateTime::now_utc())?;
        active.id = ActiveValue::Unchanged(channel_id);
        active.created_at = ActiveValue::Set(created_at);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_channel_enabled(&self, channel_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::Enabled, Expr::value(enabled))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: i64) -> StorageResult<()> {
        entities::Channels::delete_by_id(channel_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>> {
        let rows = entities::Channels::find().all(&self.db).await?;
        Ok(rows.into_iter().map(channel_row).collect())
    }

    async fn upsert_pricing(&self, input: &PricingUpsert) -> StorageResult<i64> {
        use entities::model_pricing::{ActiveModel as PricingActive, Column};

        let now = OffsetDateTime::now_utc();
        let existing = entities::ModelPricing::find()
            .filter(Column::ModelName.eq(&input.model_name))
            .filter(Column::GroupName.eq(&input.group_name))
            .one(&self.db)
            .await?;

        let id = match existing {
            Some(model) => {
                let id = model.id;
                let mut active: PricingActive = model.into();
                active.quota_type = ActiveValue::Set(input.quota_type.as_str().to_string());
                active.input_rate = ActiveValue::Set(input.input_rate);
                active.completion_multiplier = ActiveValue::Set(input.completion_multiplier);
                active.group_multiplier = ActiveValue::Set(input.group_multiplier);
                active.enabled = ActiveValue::Set(input.enabled);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
                id
            }
            None => {
                let active = PricingActive {
                    id: ActiveValue::NotSet,
                    model_name: ActiveValue::Set(input.model_name.clone()),
                    group_name: ActiveValue::Set(input.group_name.clone()),
                    quota_type: ActiveValue::Set(input.quota_type.as_str().to_string()),
                    input_rate: ActiveValue::Set(input.input_rate),
                    completion_multiplier: ActiveValue::Set(input.completion_multiplier),
                    group_multiplier: ActiveValue::Set(input.group_multiplier),
                    enabled: ActiveValue::Set(input.enabled),
                    updated_at: ActiveValue::Set(now),
                };
                let inserted = entities::ModelPricing::insert(active).exec(&self.db).await?;
                inserted.last_insert_id
            }
        };
        Ok(id)
    }

    async fn delete_pricing(&self, pricing_id: i64) -> StorageResult<()> {
        entities::ModelPricing::delete_by_id(pricing_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_pricing(&self) -> StorageResult<Vec<PricingRow>> {
        let rows = entities::ModelPricing::find().all(&self.db).await?;
        Ok(rows.into_iter().map(pricing_row).collect())
    }

    async fn load_user(&self, user_id: i64) -> StorageResult<Option<UserRow>> {
        let row = entities::Users::find_by_id(user_id).one(&self.db).await?;
        Ok(row.map(user_row))
    }

    async fn deduct_balance(&self, user_id: i64, amount: i64) -> StorageResult<bool> {
        use entities::users::Column;
        let result = entities::Users::update_many()
            .col_expr(Column::Balance, Expr::col(Column::Balance).sub(amount))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(user_id))
            .filter(Column::Balance.gte(amount))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn credit_balance(&self, user_id: i64, amount: i64) -> StorageResult<()> {
        use entities::users::Column;
        entities::Users::update_many()
            .col_expr(Column::Balance, Expr::col(Column::Balance).add(amount))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_pre_consumed(&self, record: &PreConsumedRecord) -> StorageResult<()> {
        let active = entities::pre_consumed::ActiveModel {
            request_id: ActiveValue::Set(record.request_id.clone()),
            user_id: ActiveValue::Set(record.user_id),
            amount: ActiveValue::Set(record.amount),
            trusted: ActiveValue::Set(record.trusted),
            created_at: ActiveValue::Set(record.created_at),
        };
        entities::PreConsumed::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn take_pre_consumed(
        &self,
        request_id: &str,
    ) -> StorageResult<Option<PreConsumedRecord>> {
        use entities::pre_consumed::Column;
        let Some(model) = entities::PreConsumed::find_by_id(request_id.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        // The delete is the linearization point: whichever caller deletes
        // the row wins; everyone else observes None.
        let deleted = entities::PreConsumed::delete_many()
            .filter(Column::RequestId.eq(request_id))
            .exec(&self.db)
            .await?;
        if deleted.rows_affected == 0 {
            return Ok(None);
        }
        Ok(Some(pre_consumed_record(model)))
    }

    async fn expired_pre_consumed(
        &self,
        older_than: OffsetDateTime,
    ) -> StorageResult<Vec<PreConsumedRecord>> {
        use entities::pre_consumed::Column;
        let rows = entities::PreConsumed::find()
            .filter(Column::CreatedAt.lt(older_than))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(pre_consumed_record).collect())
    }

    async fn append_usage_logs(&self, rows: &[UsageLogInsert]) -> StorageResult<()> {
        use entities::usage_logs::{ActiveModel as UsageActive, Column};
        if rows.is_empty() {
            return Ok(());
        }
        let models: Vec<UsageActive> = rows
            .iter()
            .map(|row| UsageActive {
                id: ActiveValue::NotSet,
                request_id: ActiveValue::Set(row.request_id.clone()),
                user_id: ActiveValue::Set(row.user_id),
                channel_id: ActiveValue::Set(row.channel_id),
                model: ActiveValue::Set(row.model.clone()),
                prompt_tokens: ActiveValue::Set(row.prompt_tokens),
                completion_tokens: ActiveValue::Set(row.completion_tokens),
                quota: ActiveValue::Set(row.quota),
                latency_ms: ActiveValue::Set(row.latency_ms),
                success: ActiveValue::Set(row.success),
                error_code: ActiveValue::Set(row.error_code.clone()),
                created_at: ActiveValue::Set(row.created_at),
            })
            .collect();
        entities::UsageLogs::insert_many(models)
            .on_conflict(
                OnConflict::column(Column::RequestId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
