use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "pre_consumed")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub request_id: String,
    pub user_id: i64,
    pub amount: i64,
    /// Trusted reservations never touched the balance.
    pub trusted: bool,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
