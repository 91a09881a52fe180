//! Stripe webhook ingress
//!
//! Verifies signed checkout events, claims them in the webhook log so each
//! event id is handled once, and hands the outcome to the payment outcome
//! processor. A delivery that ends in `error` (or sits in `processing` past
//! the timeout) can be claimed again, so Stripe's own redelivery retries it.

use std::sync::Arc;

use serde::Serialize;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;

use crate::client::session_status_from;
use crate::error::{BillingError, BillingResult};
use crate::gateway::SessionStatus;
use crate::outcome::{OutcomePayload, OutcomeSource, PaymentOutcomeProcessor, ProcessOutcome};
use crate::store::{ClaimOutcome, WebhookEventStatus, WebhookLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutEventKind {
    Completed,
    AsyncPaymentSucceeded,
    AsyncPaymentFailed,
    Expired,
    Unhandled,
}

impl From<&EventType> for CheckoutEventKind {
    fn from(event_type: &EventType) -> Self {
        match event_type {
            EventType::CheckoutSessionCompleted => CheckoutEventKind::Completed,
            EventType::CheckoutSessionAsyncPaymentSucceeded => {
                CheckoutEventKind::AsyncPaymentSucceeded
            }
            EventType::CheckoutSessionAsyncPaymentFailed => CheckoutEventKind::AsyncPaymentFailed,
            EventType::CheckoutSessionExpired => CheckoutEventKind::Expired,
            _ => CheckoutEventKind::Unhandled,
        }
    }
}

/// A verified gateway event reduced to what reconciliation needs
#[derive(Debug, Clone)]
pub struct CheckoutEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: CheckoutEventKind,
    pub session: Option<SessionStatus>,
}

impl CheckoutEvent {
    pub fn from_stripe(event: &Event) -> Self {
        let session = match &event.data.object {
            EventObject::CheckoutSession(session) => Some(session_status_from(session)),
            _ => None,
        };

        Self {
            event_id: event.id.to_string(),
            event_type: event.type_.to_string(),
            kind: CheckoutEventKind::from(&event.type_),
            session,
        }
    }
}

/// What happened to an accepted delivery
#[derive(Debug, Clone)]
pub enum WebhookDisposition {
    Processed(ProcessOutcome),
    /// Checkout completed but the payment has not cleared yet
    Deferred,
    /// No usable order back-reference; left for the reconciler
    MissingReference,
    /// Event type this service does not act on
    Ignored,
    /// Already handled or in flight elsewhere
    Duplicate(WebhookEventStatus),
}

pub struct WebhookHandler {
    webhook_secret: String,
    log: Arc<dyn WebhookLog>,
    processor: Arc<PaymentOutcomeProcessor>,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        log: Arc<dyn WebhookLog>,
        processor: Arc<PaymentOutcomeProcessor>,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            log,
            processor,
        }
    }

    /// Verify the `Stripe-Signature` header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        Webhook::construct_event(payload, signature, &self.webhook_secret).map_err(|e| {
            tracing::warn!(
                payload_len = payload.len(),
                error = %e,
                "Webhook signature verification failed"
            );
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Verify, then handle, a raw delivery
    pub async fn handle_payload(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(CheckoutEvent::from_stripe(&event)).await
    }

    pub async fn handle_event(&self, event: CheckoutEvent) -> BillingResult<WebhookDisposition> {
        if event.kind == CheckoutEventKind::Unhandled {
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Received unhandled Stripe event type - ignoring"
            );
            return Ok(WebhookDisposition::Ignored);
        }

        let now = OffsetDateTime::now_utc();
        match self
            .log
            .claim_event(&event.event_id, &event.event_type, now)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Duplicate(status) => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    status = status.as_str(),
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookDisposition::Duplicate(status));
            }
        }

        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.dispatch(&event).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        self.record_result(&event, error.as_deref()).await;

        result
    }

    /// Persist the processing result, retrying once
    async fn record_result(&self, event: &CheckoutEvent, error: Option<&str>) {
        if let Err(first) = self.log.record_result(&event.event_id, error).await {
            tracing::warn!(
                event_id = %event.event_id,
                error = %first,
                "Failed to record webhook result, retrying"
            );
            if let Err(retry) = self.log.record_result(&event.event_id, error).await {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    first_error = %first,
                    retry_error = %retry,
                    "Webhook audit record left in 'processing' until the claim times out"
                );
            }
        }
    }

    async fn dispatch(&self, event: &CheckoutEvent) -> BillingResult<WebhookDisposition> {
        let Some(session) = event.session.as_ref() else {
            tracing::warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Checkout event without a checkout session object"
            );
            return Ok(WebhookDisposition::MissingReference);
        };

        let Some(order_id) = session.order_id() else {
            tracing::warn!(
                event_id = %event.event_id,
                session_id = %session.session_id,
                order_ref = ?session.order_ref,
                "Checkout session has no valid order back-reference, leaving for reconciler"
            );
            return Ok(WebhookDisposition::MissingReference);
        };

        let success = match event.kind {
            CheckoutEventKind::Completed if session.paid => true,
            CheckoutEventKind::Completed => {
                tracing::info!(
                    order_id = %order_id,
                    session_id = %session.session_id,
                    payment_status = %session.payment_status,
                    "Checkout completed with payment pending, waiting for async result"
                );
                return Ok(WebhookDisposition::Deferred);
            }
            CheckoutEventKind::AsyncPaymentSucceeded => true,
            CheckoutEventKind::AsyncPaymentFailed | CheckoutEventKind::Expired => false,
            CheckoutEventKind::Unhandled => return Ok(WebhookDisposition::Ignored),
        };

        let payload = OutcomePayload::from_session(session, success, OutcomeSource::Webhook);
        match self.processor.process(order_id, &payload).await {
            Ok(outcome) => Ok(WebhookDisposition::Processed(outcome)),
            Err(BillingError::OrderNotFound(_)) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    order_id = %order_id,
                    "Webhook references an unknown order"
                );
                Ok(WebhookDisposition::MissingReference)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.event_id,
                    order_id = %order_id,
                    error = %e,
                    "Failed to process checkout event"
                );
                Err(e)
            }
        }
    }
}
