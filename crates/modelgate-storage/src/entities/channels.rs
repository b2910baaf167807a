use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "channel_name")]
    pub name: String,
    /// Provider family tag; resolves an adapter factory in the registry.
    pub adapter: String,
    pub base_url: Option<String>,
    /// JSON array of API keys; at least one.
    pub api_keys: Json,
    /// JSON array of supported model names; `prefix*` patterns allowed.
    pub models: Json,
    /// JSON array of permitted user groups.
    pub groups: Json,
    pub test_model: Option<String>,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
