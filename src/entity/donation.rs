//! `SeaORM` Entity for Donation
//!
//! One row per donation attempt. Rows are created in `PENDING` when a
//! checkout session is initiated and are only ever mutated by the
//! transition engine in `crate::donations`; they are never deleted.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::sea_orm_active_enums::DonationStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "Donation")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    /// The campaign this donation was made towards
    #[sea_orm(column_name = "campaignId", column_type = "Text")]
    pub campaign_id: String,

    #[sea_orm(column_name = "donorName", column_type = "Text", nullable)]
    pub donor_name: Option<String>,

    #[sea_orm(column_name = "donorEmail", column_type = "Text", nullable)]
    pub donor_email: Option<String>,

    /// Amount in minor currency units (cents), immutable after creation
    pub amount: i64,

    /// Three-letter currency code (e.g., "EUR", "USD"), immutable
    #[sea_orm(column_type = "Text")]
    pub currency: String,

    pub status: DonationStatus,

    /// Hosted checkout session correlated to this donation
    #[sea_orm(column_name = "checkoutSessionId", column_type = "Text", nullable)]
    pub checkout_session_id: Option<String>,

    /// Payment intent behind the session, known once payment succeeds
    #[sea_orm(column_name = "paymentIntentId", column_type = "Text", nullable)]
    pub payment_intent_id: Option<String>,

    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTime,

    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::campaign::Entity",
        from = "Column::CampaignId",
        to = "super::campaign::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    Campaign,
}

impl Related<super::campaign::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaign.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
