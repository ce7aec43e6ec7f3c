//! Durable webhook-event deduplication.
//!
//! Persists every processed provider event ID so replays are suppressed
//! across process restarts. The primary key on the event ID lets the
//! database arbitrate concurrent deliveries: whoever loses the insert
//! race treats the event as a replay, never as a request failure.

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    sea_query::OnConflict,
};
use std::time::Duration;

use crate::entity::webhook_event;
use crate::error::ApiError;
use crate::state::AppState;

/// Processed-event rows older than this are purged. Longer than the
/// in-memory guard's window so the durable tier stays authoritative.
const RETENTION_HOURS: i64 = 48;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Records `event_id` and reports whether it had been seen before.
///
/// A single `INSERT .. ON CONFLICT DO NOTHING` keeps check and record
/// atomic; zero affected rows means another delivery got there first.
pub async fn check_and_record(
    db: &DatabaseConnection,
    event_id: &str,
    event_type: &str,
) -> Result<bool, ApiError> {
    let row = webhook_event::ActiveModel {
        id: Set(event_id.to_string()),
        event_type: Set(event_type.to_string()),
        received_at: Set(Utc::now().naive_utc()),
    };

    let inserted = webhook_event::Entity::insert(row)
        .on_conflict(
            OnConflict::column(webhook_event::Column::Id)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(inserted == 0)
}

/// Deletes processed-event rows past the retention window. Best effort;
/// a failed purge only delays cleanup until the next sweep.
pub async fn purge_expired(db: &DatabaseConnection) -> Result<u64, ApiError> {
    let cutoff = Utc::now().naive_utc() - chrono::Duration::hours(RETENTION_HOURS);
    let result = webhook_event::Entity::delete_many()
        .filter(webhook_event::Column::ReceivedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Spawns the hourly retention sweep. Called once from the binary.
pub fn spawn_retention_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match purge_expired(&state.db).await {
                Ok(0) => {}
                Ok(purged) => {
                    tracing::info!(purged, "Purged expired webhook event records");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Webhook event retention sweep failed");
                }
            }
        }
    });
}
