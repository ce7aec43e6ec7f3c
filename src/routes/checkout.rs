//! Checkout-session creation.
//!
//! Creates the PENDING donation row first and only then calls the
//! payment provider. If the provider call fails the row stays behind;
//! it either receives a webhook later or ages out as an orphaned
//! PENDING donation, which reconciliation tolerates.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use axum::{Json, Router, extract::State, routing::post};
use chrono::Utc;
use regex::Regex;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entity::{campaign, donation, sea_orm_active_enums::DonationStatus};
use crate::error::ApiError;
use crate::state::AppState;
use crate::{bad_request, not_found};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

pub fn routes() -> Router<AppState> {
    Router::new().route("/checkout", post(create_checkout_session))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub campaign_id: String,
    /// Amount in minor currency units (cents)
    pub amount: i64,
    /// Three-letter currency code
    pub currency: String,
    pub donor_name: Option<String>,
    pub donor_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
    pub donation_id: String,
}

#[utoipa::path(
    post,
    path = "/donations/checkout",
    tag = "donations",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Invalid donation or inactive campaign"),
        (status = 404, description = "Campaign not found")
    )
)]
#[tracing::instrument(name = "POST /donations/checkout", skip(state, request))]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    validate_request(&request)?;

    let stripe_client = state
        .stripe_client
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Payment provider not configured"))?;

    let campaign = campaign::Entity::find_by_id(&request.campaign_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| not_found!("Campaign {} not found", request.campaign_id))?;

    if !campaign.active {
        return Err(bad_request!("Campaign {} is not active", campaign.id));
    }

    let currency = stripe::Currency::from_str(&request.currency.to_lowercase())
        .map_err(|_| bad_request!("Unknown currency: {}", request.currency))?;

    let donation_id = Uuid::new_v4().to_string();
    let now = Utc::now().naive_utc();

    let pending = donation::ActiveModel {
        id: Set(donation_id.clone()),
        campaign_id: Set(campaign.id.clone()),
        donor_name: Set(request.donor_name.clone()),
        donor_email: Set(request.donor_email.clone()),
        amount: Set(request.amount),
        currency: Set(request.currency.to_uppercase()),
        status: Set(DonationStatus::Pending),
        checkout_session_id: Set(None),
        payment_intent_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    let inserted = pending.insert(&state.db).await?;

    let mut params = stripe::CreateCheckoutSession::new();
    params.mode = Some(stripe::CheckoutSessionMode::Payment);
    params.success_url = Some(&request.success_url);
    params.cancel_url = Some(&request.cancel_url);
    params.customer_email = request.donor_email.as_deref();
    params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
        price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
            currency,
            unit_amount: Some(request.amount),
            product_data: Some(stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                name: format!("Donation: {}", campaign.title),
                ..Default::default()
            }),
            ..Default::default()
        }),
        quantity: Some(1),
        ..Default::default()
    }]);
    params.metadata = Some(HashMap::from([(
        "donation_id".to_string(),
        donation_id.clone(),
    )]));

    // A failure here leaves the PENDING row in place on purpose; see the
    // module doc.
    let session = stripe::CheckoutSession::create(stripe_client, params).await?;

    let session_id = session.id.to_string();
    let mut active: donation::ActiveModel = inserted.into();
    active.checkout_session_id = Set(Some(session_id.clone()));
    active.updated_at = Set(Utc::now().naive_utc());
    active.update(&state.db).await?;

    tracing::info!(
        donation_id = %donation_id,
        session_id = %session_id,
        campaign_id = %campaign.id,
        "Created checkout session"
    );

    Ok(Json(CheckoutResponse {
        checkout_url: session.url.unwrap_or_default(),
        session_id,
        donation_id,
    }))
}

fn validate_request(request: &CheckoutRequest) -> Result<(), ApiError> {
    if request.amount <= 0 {
        return Err(bad_request!("Donation amount must be positive"));
    }
    if request.currency.len() != 3 || !request.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(bad_request!("Currency must be a 3-letter code"));
    }
    if let Some(email) = request.donor_email.as_deref()
        && !EMAIL_RE.is_match(email)
    {
        return Err(bad_request!("Invalid donor email address"));
    }
    Ok(())
}
