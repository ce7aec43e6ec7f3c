//! Donation state transitions driven by payment webhook events.
//!
//! The state machine is deliberately small: `PENDING` is the only
//! creation state, `SUCCESS` is absorbing, and `FAILED` sticks unless a
//! later success signal supersedes it. All rules live in [`next_status`]
//! so that out-of-order and duplicate deliveries are handled in one
//! place instead of scattered conditionals.

use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, sea_query::Expr,
};

use crate::entity::{donation, sea_orm_active_enums::DonationStatus};
use crate::error::ApiError;

/// Payment outcome distilled from a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentSignal {
    Succeeded,
    Failed,
}

/// Whether a transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Noop,
}

/// Computes the next status for a donation, or `None` for a no-op.
///
/// `SUCCESS` absorbs every signal: duplicate confirmations must not
/// re-trigger side effects and a late failure event for an old attempt
/// must never downgrade a confirmed payment. A failure signal on an
/// already failed donation is idempotent; a success signal supersedes a
/// previous failure.
pub fn next_status(current: &DonationStatus, signal: PaymentSignal) -> Option<DonationStatus> {
    match (current, signal) {
        (DonationStatus::Success, _) => None,
        (_, PaymentSignal::Succeeded) => Some(DonationStatus::Success),
        (DonationStatus::Failed, PaymentSignal::Failed) => None,
        (_, PaymentSignal::Failed) => Some(DonationStatus::Failed),
    }
}

/// Marks a donation as successfully paid, recording the payment intent.
///
/// Idempotent: a donation already in `SUCCESS` is left untouched,
/// including its payment-intent ID. The update is guarded with a status
/// predicate so two concurrent confirmations cannot race each other into
/// a lost update.
pub async fn mark_success(
    db: &DatabaseConnection,
    donation_id: &str,
    payment_intent_id: Option<&str>,
) -> Result<TransitionOutcome, ApiError> {
    let current = find_donation(db, donation_id).await?;

    if next_status(&current.status, PaymentSignal::Succeeded).is_none() {
        tracing::info!(
            donation_id = %donation_id,
            "Donation already SUCCESS, duplicate confirmation ignored"
        );
        return Ok(TransitionOutcome::Noop);
    }

    let result = donation::Entity::update_many()
        .col_expr(donation::Column::Status, Expr::value(DonationStatus::Success))
        .col_expr(
            donation::Column::PaymentIntentId,
            Expr::value(payment_intent_id.map(str::to_owned)),
        )
        .col_expr(
            donation::Column::UpdatedAt,
            Expr::value(Utc::now().naive_utc()),
        )
        .filter(donation::Column::Id.eq(donation_id))
        .filter(donation::Column::Status.ne(DonationStatus::Success))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        // A concurrent delivery confirmed the donation between our read
        // and the guarded update.
        tracing::info!(donation_id = %donation_id, "Donation confirmed concurrently, no-op");
        return Ok(TransitionOutcome::Noop);
    }

    tracing::info!(
        donation_id = %donation_id,
        payment_intent_id = ?payment_intent_id,
        "Donation marked SUCCESS"
    );
    Ok(TransitionOutcome::Applied)
}

/// Marks a donation as failed.
///
/// A failure signal never downgrades a confirmed success; that case is
/// logged as a warning and acknowledged as a no-op. Repeated failure
/// signals are idempotent.
pub async fn mark_failed(
    db: &DatabaseConnection,
    donation_id: &str,
) -> Result<TransitionOutcome, ApiError> {
    let current = find_donation(db, donation_id).await?;

    if next_status(&current.status, PaymentSignal::Failed).is_none() {
        if current.status == DonationStatus::Success {
            tracing::warn!(
                donation_id = %donation_id,
                "Failure event for already-successful donation, ignoring"
            );
        } else {
            tracing::info!(
                donation_id = %donation_id,
                "Donation already FAILED, duplicate failure ignored"
            );
        }
        return Ok(TransitionOutcome::Noop);
    }

    let result = donation::Entity::update_many()
        .col_expr(donation::Column::Status, Expr::value(DonationStatus::Failed))
        .col_expr(
            donation::Column::UpdatedAt,
            Expr::value(Utc::now().naive_utc()),
        )
        .filter(donation::Column::Id.eq(donation_id))
        .filter(
            donation::Column::Status
                .is_not_in([DonationStatus::Success, DonationStatus::Failed]),
        )
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        tracing::info!(donation_id = %donation_id, "Donation reached a sticky state concurrently, no-op");
        return Ok(TransitionOutcome::Noop);
    }

    tracing::info!(donation_id = %donation_id, "Donation marked FAILED");
    Ok(TransitionOutcome::Applied)
}

async fn find_donation(
    db: &DatabaseConnection,
    donation_id: &str,
) -> Result<donation::Model, ApiError> {
    donation::Entity::find_by_id(donation_id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Donation {} not found", donation_id)))
}
