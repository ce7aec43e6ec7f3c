//! `SeaORM` Entity for WebhookEvent
//!
//! Durable record of processed provider event IDs. The primary key is the
//! provider's event ID, which gives the uniqueness constraint that makes
//! concurrent check-and-record races safe. Rows older than the retention
//! window are purged by the background sweep in `crate::dedup`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "WebhookEvent")]
pub struct Model {
    /// Provider-assigned event ID (e.g., "evt_...")
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_name = "eventType", column_type = "Text")]
    pub event_type: String,

    #[sea_orm(column_name = "receivedAt")]
    pub received_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
