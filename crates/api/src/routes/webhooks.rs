//! Stripe webhook ingress

use axum::{extract::State, http::HeaderMap, Json};
use membra_billing::{BillingError, ProcessOutcome, WebhookDisposition};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const STRIPE_SIGNATURE: &str = "stripe-signature";

/// POST /webhook
///
/// 400 for a bad signature. Processing errors return 500 so Stripe redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(STRIPE_SIGNATURE)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Billing(BillingError::WebhookSignatureInvalid))?;

    match state.billing.webhooks.handle_payload(&body, signature).await {
        Ok(disposition) => Ok(Json(json!({
            "received": true,
            "result": disposition_label(&disposition)
        }))),
        Err(e @ BillingError::WebhookSignatureInvalid) => Err(e.into()),
        Err(e) => Err(ApiError::WebhookProcessing(e.to_string())),
    }
}

fn disposition_label(disposition: &WebhookDisposition) -> &'static str {
    match disposition {
        WebhookDisposition::Processed(ProcessOutcome::Activated { .. }) => "activated",
        WebhookDisposition::Processed(ProcessOutcome::Failed { .. }) => "failed",
        WebhookDisposition::Processed(ProcessOutcome::AlreadySettled { .. }) => "already_settled",
        WebhookDisposition::Deferred => "deferred",
        WebhookDisposition::MissingReference => "missing_reference",
        WebhookDisposition::Ignored => "ignored",
        WebhookDisposition::Duplicate(_) => "duplicate",
    }
}
