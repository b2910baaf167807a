use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_name")]
    pub name: String,
    /// Downstream bearer key mapped to this user by the auth layer.
    #[sea_orm(unique_key = "user_api_key")]
    pub api_key: String,
    pub group_name: String,
    /// Integer quota units; never negative.
    pub balance: i64,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
