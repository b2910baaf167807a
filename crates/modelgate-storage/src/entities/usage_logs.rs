use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Delivery is at-least-once; the unique request id dedupes replays.
    #[sea_orm(unique_key = "usage_request_id")]
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

impl ActiveModelBehavior for ActiveModel {}
