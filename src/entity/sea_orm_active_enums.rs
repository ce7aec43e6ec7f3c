//! Active enums shared across entities.
//!
//! Note: keep the string values in sync with the database enum types.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a donation attempt.
///
/// `SUCCESS` is absorbing: once a donation is confirmed paid, no webhook
/// event may move it to any other state. `REFUNDED` is modeled for the
/// reporting schema but no transition into it is wired up yet.
#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "DonationStatus")]
pub enum DonationStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "SUCCESS")]
    Success,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
}
