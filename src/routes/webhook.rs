//! Webhook verification and dispatch.
//!
//! Deliveries are at-least-once and unordered. The pipeline is:
//! signature check, freshness check, in-memory replay guard, durable
//! dedup record, then dispatch by event type. Rejections (400) happen
//! only before the dedup record is written; once an event is past that
//! point the provider always gets a 200, even when a handler fails,
//! otherwise an application bug would turn into an endless retry storm.

use axum::{Router, body::Bytes, extract::State, http::HeaderMap, routing::post};
use stripe::{CheckoutSession, CheckoutSessionPaymentStatus, Event, EventObject, EventType, Webhook};

use crate::donations;
use crate::error::ApiError;
use crate::state::AppState;
use crate::{dedup, internal};

/// Maximum allowed distance between the provider's event creation time
/// and our clock. Anything outside is rejected as stale before any
/// state mutation.
const MAX_EVENT_AGE_SECS: i64 = 300;

pub fn routes() -> Router<AppState> {
    Router::new().route("/stripe", post(stripe_webhook))
}

#[tracing::instrument(name = "POST /webhook/stripe", skip(state, headers, payload))]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<&'static str, ApiError> {
    let webhook_secret = state
        .webhook_secret
        .as_deref()
        .ok_or_else(|| internal!("Webhook secret not configured"))?;

    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!("Webhook rejected: missing stripe-signature header");
        return Err(ApiError::bad_request("Missing stripe-signature header"));
    };

    let payload_str = std::str::from_utf8(&payload).map_err(|_| {
        tracing::warn!("Webhook rejected: payload is not valid UTF-8");
        ApiError::bad_request("Invalid payload")
    })?;

    let event = Webhook::construct_event(payload_str, signature, webhook_secret).map_err(|e| {
        tracing::warn!(error = %e, "Webhook rejected: signature verification failed");
        ApiError::bad_request("Invalid signature")
    })?;

    let now = chrono::Utc::now().timestamp();
    if (now - event.created).abs() > MAX_EVENT_AGE_SECS {
        tracing::warn!(
            event_id = %event.id,
            created = event.created,
            "Webhook rejected: event timestamp outside freshness window"
        );
        return Err(ApiError::bad_request("Stale event"));
    }

    let event_id = event.id.to_string();

    // First tier: volatile pre-filter that absorbs rapid redeliveries
    // without a database round trip.
    if state.replay_guard.check_and_record(&event_id) {
        tracing::info!(event_id = %event_id, "Duplicate event (memory), skipping");
        return Ok("ignored");
    }

    // Second tier: durable and authoritative across restarts. If the
    // record cannot be written the event was not processed, so the
    // memory-tier entry must go too; otherwise the provider's retry
    // would be answered "ignored" and the event lost for good.
    let replay = match dedup::check_and_record(&state.db, &event_id, &event.type_.to_string()).await
    {
        Ok(replay) => replay,
        Err(err) => {
            state.replay_guard.remove(&event_id);
            return Err(err);
        }
    };
    if replay {
        tracing::info!(event_id = %event_id, "Duplicate event (store), skipping");
        return Ok("ignored");
    }

    if let Err(err) = dispatch_event(&state, &event).await {
        tracing::error!(
            event_id = %event_id,
            event_type = %event.type_,
            error = %err,
            "Failed to process webhook event"
        );
    }

    Ok("ok")
}

async fn dispatch_event(state: &AppState, event: &Event) -> Result<(), ApiError> {
    match event.type_ {
        EventType::CheckoutSessionCompleted => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                handle_checkout_completed(state, session).await?;
            }
        }
        EventType::CheckoutSessionAsyncPaymentSucceeded => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                handle_async_payment_succeeded(state, session).await?;
            }
        }
        EventType::CheckoutSessionAsyncPaymentFailed => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                handle_payment_failed(state, session, "async_payment_failed").await?;
            }
        }
        EventType::CheckoutSessionExpired => {
            if let EventObject::CheckoutSession(session) = &event.data.object {
                handle_payment_failed(state, session, "expired").await?;
            }
        }
        _ => {
            tracing::debug!(event_type = %event.type_, "Unhandled event type");
        }
    }

    Ok(())
}

/// Pulls the donation correlation ID out of the session metadata.
fn donation_id(session: &CheckoutSession) -> Option<String> {
    session
        .metadata
        .as_ref()
        .and_then(|m| m.get("donation_id"))
        .filter(|id| !id.trim().is_empty())
        .cloned()
}

async fn handle_checkout_completed(
    state: &AppState,
    session: &CheckoutSession,
) -> Result<(), ApiError> {
    let session_id = session.id.to_string();

    tracing::info!(
        session_id = %session_id,
        payment_status = ?session.payment_status,
        "Processing checkout.session.completed"
    );

    let Some(donation_id) = donation_id(session) else {
        tracing::warn!(
            session_id = %session_id,
            "Checkout session has no donation_id metadata, acknowledging without action"
        );
        return Ok(());
    };

    match session.payment_status {
        CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired => {
            let payment_intent_id = session.payment_intent.as_ref().map(|pi| pi.id().to_string());
            mark_success_acked(state, &donation_id, payment_intent_id.as_deref()).await
        }
        _ => {
            // Async payment method: the outcome arrives via a later
            // async_payment_succeeded/failed event.
            tracing::info!(
                donation_id = %donation_id,
                "Checkout completed with payment pending, awaiting async outcome"
            );
            Ok(())
        }
    }
}

async fn handle_async_payment_succeeded(
    state: &AppState,
    session: &CheckoutSession,
) -> Result<(), ApiError> {
    let Some(donation_id) = donation_id(session) else {
        tracing::warn!(
            session_id = %session.id,
            "Checkout session has no donation_id metadata, acknowledging without action"
        );
        return Ok(());
    };

    match session.payment_status {
        CheckoutSessionPaymentStatus::Paid => {
            let payment_intent_id = session.payment_intent.as_ref().map(|pi| pi.id().to_string());
            mark_success_acked(state, &donation_id, payment_intent_id.as_deref()).await
        }
        status => {
            tracing::warn!(
                donation_id = %donation_id,
                payment_status = ?status,
                "async_payment_succeeded with unexpected payment status, taking no action"
            );
            Ok(())
        }
    }
}

async fn handle_payment_failed(
    state: &AppState,
    session: &CheckoutSession,
    reason: &str,
) -> Result<(), ApiError> {
    let Some(donation_id) = donation_id(session) else {
        tracing::warn!(
            session_id = %session.id,
            reason,
            "Checkout session has no donation_id metadata, acknowledging without action"
        );
        return Ok(());
    };

    tracing::info!(donation_id = %donation_id, reason, "Processing payment failure");
    mark_failed_acked(state, &donation_id).await
}

/// Applies a success transition; a missing donation is logged and
/// acknowledged so the provider does not retry an event whose
/// correlation data will never resolve.
async fn mark_success_acked(
    state: &AppState,
    donation_id: &str,
    payment_intent_id: Option<&str>,
) -> Result<(), ApiError> {
    match donations::mark_success(&state.db, donation_id, payment_intent_id).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => {
            tracing::warn!(
                donation_id = %donation_id,
                "Donation not found for webhook event, acknowledging without action"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn mark_failed_acked(state: &AppState, donation_id: &str) -> Result<(), ApiError> {
    match donations::mark_failed(&state.db, donation_id).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => {
            tracing::warn!(
                donation_id = %donation_id,
                "Donation not found for webhook event, acknowledging without action"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{donation, sea_orm_active_enums::DonationStatus};
    use crate::replay_guard::ReplayGuard;
    use chrono::Utc;
    use hmac::{Hmac, Mac};
    use sea_orm::{DatabaseBackend, DatabaseConnection, DbErr, MockDatabase, MockExecResult};
    use sha2::Sha256;
    use std::sync::Arc;

    const SECRET: &str = "whsec_test_secret";

    fn test_state(db: DatabaseConnection) -> AppState {
        Arc::new(crate::state::State {
            db,
            stripe_client: None,
            webhook_secret: Some(SECRET.to_string()),
            replay_guard: ReplayGuard::new(),
        })
    }

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let digest = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        format!("t={},v1={}", timestamp, digest)
    }

    fn session_event(
        event_id: &str,
        event_type: &str,
        created: i64,
        payment_status: &str,
        metadata: serde_json::Value,
    ) -> String {
        serde_json::json!({
            "id": event_id,
            "object": "event",
            "api_version": "2023-10-16",
            "created": created,
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "object": "checkout.session",
                    "amount_subtotal": 5000,
                    "amount_total": 5000,
                    "automatic_tax": {"enabled": false, "status": null},
                    "cancel_url": "https://example.org/cancel",
                    "client_reference_id": null,
                    "created": created,
                    "currency": "eur",
                    "custom_fields": [],
                    "custom_text": {"shipping_address": null, "submit": null},
                    "customer": null,
                    "customer_details": null,
                    "customer_email": null,
                    "expires_at": created + 86_400,
                    "livemode": false,
                    "metadata": metadata,
                    "mode": "payment",
                    "payment_intent": "pi_123",
                    "payment_method_types": ["card"],
                    "payment_status": payment_status,
                    "phone_number_collection": {"enabled": false},
                    "shipping_options": [],
                    "status": "complete",
                    "success_url": "https://example.org/success",
                    "total_details": {"amount_discount": 0, "amount_shipping": 0, "amount_tax": 0},
                    "url": null
                }
            },
            "livemode": false,
            "pending_webhooks": 1,
            "request": {"id": null, "idempotency_key": null},
            "type": event_type
        })
        .to_string()
    }

    fn donation_metadata() -> serde_json::Value {
        serde_json::json!({"donation_id": "don_1"})
    }

    fn donation_with_status(status: DonationStatus) -> donation::Model {
        let now = Utc::now().naive_utc();
        donation::Model {
            id: "don_1".to_string(),
            campaign_id: "cmp_1".to_string(),
            donor_name: None,
            donor_email: None,
            amount: 5_000,
            currency: "EUR".to_string(),
            status,
            checkout_session_id: Some("cs_test_1".to_string()),
            payment_intent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn exec_ok() -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        }
    }

    async fn deliver(state: &AppState, payload: &str) -> Result<&'static str, ApiError> {
        let headers = signed_headers(payload, Utc::now().timestamp());
        stripe_webhook(State(state.clone()), headers, Bytes::from(payload.to_string())).await
    }

    fn signed_headers(payload: &str, timestamp: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", sign(payload, timestamp).parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let state = test_state(db);
        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        let err = stripe_webhook(State(state), HeaderMap::new(), Bytes::from(payload))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected_without_touching_storage() {
        // The mock database has no scripted results, so any query or
        // insert would fail the test with a database error instead of
        // the expected 400.
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let state = test_state(db);

        let signed = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );
        let tampered = signed.replace("don_1", "don_2");

        let headers = signed_headers(&signed, Utc::now().timestamp());
        let err = stripe_webhook(State(state), headers, Bytes::from(tampered))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_event_timestamp_is_rejected_despite_valid_signature() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let state = test_state(db);

        let stale_created = Utc::now().timestamp() - 4_000;
        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            stale_created,
            "paid",
            donation_metadata(),
        );

        // Signature header timestamp is fresh; only the event's own
        // creation time is stale.
        let err = deliver(&state, &payload).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn paid_checkout_completed_marks_donation_success() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            // dedup insert
            .append_exec_results([exec_ok()])
            // donation lookup
            .append_query_results([vec![donation_with_status(DonationStatus::Pending)]])
            // guarded status update
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn unpaid_checkout_completed_leaves_donation_pending() {
        // Only the dedup insert touches the database; the donation row
        // is never read or written.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "unpaid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_ignored_by_memory_guard() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_query_results([vec![donation_with_status(DonationStatus::Pending)]])
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.async_payment_failed",
            Utc::now().timestamp(),
            "unpaid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
        // Second delivery of the same event ID never reaches the
        // database; the mock has no results left to serve.
        assert_eq!(deliver(&state, &payload).await.unwrap(), "ignored");
    }

    #[tokio::test]
    async fn duplicate_in_durable_store_is_ignored() {
        // Simulates a restart: the memory guard is empty but the
        // durable store already holds the event ID, so the insert
        // affects zero rows.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ignored");
    }

    #[tokio::test]
    async fn transient_dedup_failure_does_not_swallow_the_retry() {
        // The durable record fails on the first delivery; the memory
        // guard must not keep the ID, or the provider's retry would be
        // answered "ignored" and the event lost.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Custom("connection reset".to_string())])
            .append_exec_results([exec_ok()])
            .append_query_results([vec![donation_with_status(DonationStatus::Pending)]])
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        assert!(deliver(&state, &payload).await.is_err());
        // The retry goes through the full pipeline and succeeds.
        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn paid_async_payment_succeeded_marks_donation_success() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_query_results([vec![donation_with_status(DonationStatus::Pending)]])
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.async_payment_succeeded",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn unpaid_async_payment_succeeded_takes_no_action() {
        // Only the dedup insert is scripted; the anomalous event must
        // not read or write the donation row.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.async_payment_succeeded",
            Utc::now().timestamp(),
            "unpaid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn missing_donation_metadata_is_acknowledged() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            serde_json::json!({}),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn expired_session_for_successful_donation_is_a_noop() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_query_results([vec![donation_with_status(DonationStatus::Success)]])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.expired",
            Utc::now().timestamp(),
            "unpaid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn async_payment_failed_marks_donation_failed() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_query_results([vec![donation_with_status(DonationStatus::Pending)]])
            .append_exec_results([exec_ok()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.async_payment_failed",
            Utc::now().timestamp(),
            "unpaid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn unknown_donation_id_is_acknowledged_not_retried() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_query_results([Vec::<donation::Model>::new()])
            .into_connection();
        let state = test_state(db);

        let payload = session_event(
            "evt_1",
            "checkout.session.completed",
            Utc::now().timestamp(),
            "paid",
            donation_metadata(),
        );

        assert_eq!(deliver(&state, &payload).await.unwrap(), "ok");
    }
}
