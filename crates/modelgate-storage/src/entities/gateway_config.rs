use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Single-row table holding the last merged gateway config; the bootstrap
/// layers CLI/ENV on top and persists the result back.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "gateway_config")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub config_json: Json,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
