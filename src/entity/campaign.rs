//! `SeaORM` Entity for Campaign
//!
//! Checkout creation only needs a key lookup plus the `active` flag;
//! campaign management itself lives elsewhere.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "Campaign")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// Inactive campaigns no longer accept donations
    pub active: bool,

    /// Fundraising goal in minor currency units
    #[sea_orm(column_name = "goalAmount", nullable)]
    pub goal_amount: Option<i64>,

    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTime,

    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::donation::Entity")]
    Donation,
}

impl Related<super::donation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Donation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
