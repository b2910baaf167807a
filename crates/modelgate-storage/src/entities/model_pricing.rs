use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_pricing")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub model_name: String,
    pub group_name: String,
    /// "token" or "per_call".
    pub quota_type: String,
    /// Quota units per 1K prompt tokens.
    pub input_rate: f64,
    pub completion_multiplier: f64,
    pub group_multiplier: f64,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
