//! Payment outcome processing
//!
//! [`PaymentOutcomeProcessor::process`] is the single entry point that turns a
//! payment outcome into order, membership and history state. Webhook ingress,
//! the polling reconciler and manual sync all call it, and it is safe to call
//! any number of times for the same order: once the order is terminal every
//! further call is a no-op returning the stored order.
//!
//! Side effects (badge, lead conversion, confirmation email) run after the
//! settlement has committed. Each is attempted on its own and a failure is
//! logged and swallowed; the settlement is never rolled back for them.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::collaborators::{
    AccountDirectory, BadgeOutcome, BadgeService, PurchaseNotifier, PurchaseSummary,
};
use crate::conversion::{ConversionReport, LeadConversion};
use crate::error::{BillingError, BillingResult};
use crate::gateway::SessionStatus;
use crate::metadata::{self, MetadataMap};
use crate::models::{AssociationMember, MemberStatus, PurchaseOrder};
use crate::store::{OrderStore, Settlement};

/// Where an outcome was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
    Webhook,
    Poll,
    Manual,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Webhook => "webhook",
            OutcomeSource::Poll => "poll",
            OutcomeSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutcomePayload {
    pub success: bool,
    /// Gateway session the outcome belongs to
    pub reference: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    /// Extra gateway fields merged into the order's session reference
    pub fields: MetadataMap,
    pub source: OutcomeSource,
}

impl OutcomePayload {
    pub fn succeeded(source: OutcomeSource) -> Self {
        Self {
            success: true,
            reference: None,
            amount_cents: None,
            currency: None,
            fields: MetadataMap::new(),
            source,
        }
    }

    pub fn failed(source: OutcomeSource) -> Self {
        Self {
            success: false,
            ..Self::succeeded(source)
        }
    }

    pub fn from_session(status: &SessionStatus, success: bool, source: OutcomeSource) -> Self {
        Self {
            success,
            reference: Some(status.session_id.clone()),
            amount_cents: status.amount_total,
            currency: status.currency.clone(),
            fields: status.echo_fields(),
            source,
        }
    }

    /// Fields to merge into the order's session reference
    fn session_fields(&self) -> MetadataMap {
        let mut fields = MetadataMap::new()
            .with_opt(metadata::SESSION_ID, self.reference.clone())
            .with_opt("amount_total", self.amount_cents.map(|a| a.to_string()))
            .with_opt("currency", self.currency.clone())
            .with("settled_via", self.source.as_str());
        fields.merge(&self.fields);
        fields
    }
}

/// Best-effort work done after a successful settlement
#[derive(Debug, Clone, Default)]
pub struct SideEffectReport {
    pub badge: Option<BadgeOutcome>,
    pub conversion: Option<ConversionReport>,
    pub email_sent: bool,
}

#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// This call moved the order to PAID and activated the membership
    Activated {
        order: PurchaseOrder,
        member: AssociationMember,
        previous_status: MemberStatus,
        created_member: bool,
        side_effects: SideEffectReport,
    },
    /// This call moved the order to FAILED
    Failed { order: PurchaseOrder },
    /// The order was already PAID or FAILED; nothing changed
    AlreadySettled { order: PurchaseOrder },
}

impl ProcessOutcome {
    pub fn order(&self) -> &PurchaseOrder {
        match self {
            ProcessOutcome::Activated { order, .. }
            | ProcessOutcome::Failed { order }
            | ProcessOutcome::AlreadySettled { order } => order,
        }
    }

    pub fn into_order(self) -> PurchaseOrder {
        match self {
            ProcessOutcome::Activated { order, .. }
            | ProcessOutcome::Failed { order }
            | ProcessOutcome::AlreadySettled { order } => order,
        }
    }
}

pub struct PaymentOutcomeProcessor {
    orders: Arc<dyn OrderStore>,
    conversion: LeadConversion,
    badges: Arc<dyn BadgeService>,
    directory: Arc<dyn AccountDirectory>,
    notifier: Arc<dyn PurchaseNotifier>,
}

impl PaymentOutcomeProcessor {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        conversion: LeadConversion,
        badges: Arc<dyn BadgeService>,
        directory: Arc<dyn AccountDirectory>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> Self {
        Self {
            orders,
            conversion,
            badges,
            directory,
            notifier,
        }
    }

    pub async fn process(
        &self,
        order_id: Uuid,
        payload: &OutcomePayload,
    ) -> BillingResult<ProcessOutcome> {
        let now = OffsetDateTime::now_utc();
        let fields = payload.session_fields();

        let settlement = if payload.success {
            self.orders.settle_paid(order_id, &fields, now).await?
        } else {
            self.orders.settle_failed(order_id, &fields, now).await?
        };

        if let Some(echoed) = payload.amount_cents {
            let order = settlement.order();
            if echoed != order.amount_cents {
                tracing::warn!(
                    order_id = %order.id,
                    expected_cents = order.amount_cents,
                    echoed_cents = echoed,
                    "Gateway amount differs from order amount"
                );
            }
        }

        match settlement {
            Settlement::Unchanged { order } => {
                tracing::info!(
                    order_id = %order.id,
                    status = %order.status,
                    source = payload.source.as_str(),
                    "Order already settled, ignoring outcome"
                );
                Ok(ProcessOutcome::AlreadySettled { order })
            }
            Settlement::Failed { order } => {
                tracing::info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    source = payload.source.as_str(),
                    "Order marked FAILED"
                );
                Ok(ProcessOutcome::Failed { order })
            }
            Settlement::Paid {
                order,
                member,
                previous_status,
                created_member,
                ..
            } => {
                tracing::info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    member_id = %member.id,
                    previous_status = %previous_status,
                    created_member = created_member,
                    source = payload.source.as_str(),
                    "Order PAID, membership activated"
                );

                let side_effects = self.run_side_effects(&order, now).await;

                Ok(ProcessOutcome::Activated {
                    order,
                    member,
                    previous_status,
                    created_member,
                    side_effects,
                })
            }
        }
    }

    async fn run_side_effects(
        &self,
        order: &PurchaseOrder,
        now: OffsetDateTime,
    ) -> SideEffectReport {
        let mut report = SideEffectReport::default();

        match self.award_badge(order).await {
            Ok(outcome) => report.badge = outcome,
            Err(e) => tracing::warn!(
                order_id = %order.id,
                error = %e,
                "Failed to award association badge"
            ),
        }

        match self.conversion.convert_for_order(order, now).await {
            Ok(conversion) => report.conversion = Some(conversion),
            Err(e) => tracing::warn!(
                order_id = %order.id,
                error = %e,
                "Failed to convert leads for paid order"
            ),
        }

        match self.send_confirmation(order).await {
            Ok(sent) => report.email_sent = sent,
            Err(e) => tracing::warn!(
                order_id = %order.id,
                error = %e,
                "Failed to send purchase confirmation"
            ),
        }

        report
    }

    async fn award_badge(&self, order: &PurchaseOrder) -> BillingResult<Option<BadgeOutcome>> {
        let Some(profile) = self.directory.find_default_profile(order.user_id).await? else {
            tracing::debug!(user_id = %order.user_id, "No default profile, skipping badge");
            return Ok(None);
        };

        let outcome = self
            .badges
            .ensure_badge(profile.id, order.association_id)
            .await?;
        Ok(Some(outcome))
    }

    async fn send_confirmation(&self, order: &PurchaseOrder) -> BillingResult<bool> {
        let Some(contact) = self.directory.find_contact(order.user_id).await? else {
            tracing::debug!(user_id = %order.user_id, "No contact email, skipping confirmation");
            return Ok(false);
        };

        let (membership_start, membership_end) = order
            .membership_start
            .zip(order.membership_end)
            .ok_or_else(|| {
                BillingError::Internal(format!("Paid order {} has no validity window", order.id))
            })?;

        let association_name = self
            .directory
            .find_association_name(order.association_id)
            .await?
            .unwrap_or_else(|| "your association".to_string());

        let summary = PurchaseSummary {
            order_number: order.order_number.clone(),
            association_name,
            recipient_name: contact.display_name.clone(),
            amount_display: order.display_amount(),
            membership_start,
            membership_end,
        };

        self.notifier
            .send_purchase_confirmation(&contact.email, &summary)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SessionState;

    #[test]
    fn test_session_fields_keep_gateway_echo() {
        let status = SessionStatus {
            session_id: "cs_live_1".into(),
            paid: true,
            state: SessionState::Complete,
            payment_status: "paid".into(),
            order_ref: None,
            amount_total: Some(10_000),
            currency: Some("hkd".into()),
            payment_intent_id: Some("pi_9".into()),
            subscription_id: None,
            customer_id: Some("cus_3".into()),
        };

        let fields =
            OutcomePayload::from_session(&status, true, OutcomeSource::Poll).session_fields();

        assert_eq!(fields.session_id(), Some("cs_live_1"));
        assert_eq!(fields.get(metadata::PAYMENT_INTENT_ID), Some("pi_9"));
        assert_eq!(fields.get(metadata::CUSTOMER_ID), Some("cus_3"));
        assert_eq!(fields.get("amount_total"), Some("10000"));
        assert_eq!(fields.get("settled_via"), Some("poll"));
        assert!(!fields.contains_key(metadata::SUBSCRIPTION_ID));
    }

    #[test]
    fn test_failed_payload_has_no_reference() {
        let payload = OutcomePayload::failed(OutcomeSource::Manual);
        assert!(!payload.success);
        assert!(payload.reference.is_none());
        assert_eq!(payload.session_fields().get("settled_via"), Some("manual"));
    }
}
