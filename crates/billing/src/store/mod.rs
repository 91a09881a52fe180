//! Persistence ports
//!
//! [`OrderStore`] owns the only write path for orders, members and history:
//! [`OrderStore::settle_paid`] and [`OrderStore::settle_failed`]. Both backends
//! lock the order, re-check its status and then apply the plan computed by
//! [`plan_paid_settlement`] / [`plan_failed_settlement`], so the state
//! transition rules live in one place.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::metadata::MetadataMap;
use crate::models::{
    membership_period_end, AssociationLead, AssociationMember, MemberStatus, MembershipHistory,
    NewPurchaseOrder, OrderStatus, PricingPlan, PurchaseIntentData, PurchaseOrder,
    DEFAULT_MEMBER_ROLE,
};

/// Webhook events stuck in `processing` longer than this may be claimed again
pub const WEBHOOK_PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

/// Keyset position when paging PENDING orders by `(created_at, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCursor {
    pub created_at: OffsetDateTime,
    pub id: Uuid,
}

impl PendingCursor {
    /// Position just past `order`
    pub fn after(order: &PurchaseOrder) -> Self {
        Self {
            created_at: order.created_at,
            id: order.id,
        }
    }
}

// =============================================================================
// Settlement
// =============================================================================

/// Result of applying a payment outcome to an order
#[derive(Debug, Clone)]
pub enum Settlement {
    /// PENDING -> PAID committed together with the member write and history row
    Paid {
        order: PurchaseOrder,
        member: AssociationMember,
        previous_status: MemberStatus,
        history: MembershipHistory,
        created_member: bool,
    },
    /// PENDING -> FAILED committed
    Failed { order: PurchaseOrder },
    /// Order was already terminal; nothing written
    Unchanged { order: PurchaseOrder },
}

impl Settlement {
    pub fn order(&self) -> &PurchaseOrder {
        match self {
            Settlement::Paid { order, .. }
            | Settlement::Failed { order }
            | Settlement::Unchanged { order } => order,
        }
    }

    pub fn into_order(self) -> PurchaseOrder {
        match self {
            Settlement::Paid { order, .. }
            | Settlement::Failed { order }
            | Settlement::Unchanged { order } => order,
        }
    }
}

/// Writes required to activate a membership from a paid order
#[derive(Debug, Clone)]
pub struct PaidSettlementPlan {
    pub order: PurchaseOrder,
    pub member: AssociationMember,
    pub previous_status: MemberStatus,
    pub created_member: bool,
    pub history: MembershipHistory,
}

impl From<PaidSettlementPlan> for Settlement {
    fn from(plan: PaidSettlementPlan) -> Self {
        Settlement::Paid {
            order: plan.order,
            member: plan.member,
            previous_status: plan.previous_status,
            history: plan.history,
            created_member: plan.created_member,
        }
    }
}

/// Compute the PAID transition for a PENDING order.
///
/// `existing` is the member row for the order's (association, user), soft
/// deleted or not. The caller must hold the order lock and have checked the
/// order is still PENDING.
pub fn plan_paid_settlement(
    order: &PurchaseOrder,
    tier: &str,
    existing: Option<&AssociationMember>,
    fields: &MetadataMap,
    now: OffsetDateTime,
) -> PaidSettlementPlan {
    let membership_start = now;
    let membership_end = membership_period_end(tier, membership_start);

    let mut settled = order.clone();
    let conflicts = settled.session_ref.merge(fields);
    if !conflicts.is_empty() {
        tracing::warn!(
            order_id = %order.id,
            keys = ?conflicts,
            "Ignoring payment fields that differ from the stored session reference"
        );
    }
    settled.status = OrderStatus::Paid;
    settled.paid_at = Some(now);
    settled.membership_start = Some(membership_start);
    settled.membership_end = Some(membership_end);
    settled.updated_at = now;

    let mut payment = MetadataMap::new()
        .with("last_order_id", order.id.to_string())
        .with("last_order_number", order.order_number.clone())
        .with("amount_cents", order.amount_cents.to_string())
        .with("currency", order.currency.clone())
        .with_opt("paid_at", now.format(&Rfc3339).ok());
    payment.merge(fields);

    let (member, previous_status, created_member) = match existing {
        Some(current) => {
            let mut member = current.clone();
            member.tier = tier.to_string();
            member.status = MemberStatus::Active;
            member.renewal_date = Some(membership_end);
            member.payment_metadata.overwrite_with(&payment);
            member.deleted_at = None;
            member.updated_at = now;
            (member, current.status, false)
        }
        None => {
            let member = AssociationMember {
                id: Uuid::new_v4(),
                association_id: order.association_id,
                user_id: order.user_id,
                role: DEFAULT_MEMBER_ROLE.to_string(),
                tier: tier.to_string(),
                status: MemberStatus::Active,
                renewal_date: Some(membership_end),
                payment_metadata: payment,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            };
            (member, MemberStatus::Pending, true)
        }
    };

    let history = MembershipHistory {
        id: Uuid::new_v4(),
        member_id: member.id,
        previous_status,
        new_status: MemberStatus::Active,
        changed_by: order.user_id,
        reason: format!(
            "Membership activated by payment of order {} ({})",
            order.order_number,
            order.display_amount()
        ),
        created_at: now,
    };

    PaidSettlementPlan {
        order: settled,
        member,
        previous_status,
        created_member,
        history,
    }
}

/// Compute the FAILED transition for a PENDING order
pub fn plan_failed_settlement(
    order: &PurchaseOrder,
    fields: &MetadataMap,
    now: OffsetDateTime,
) -> PurchaseOrder {
    let mut failed = order.clone();
    failed.session_ref.merge(fields);
    failed.status = OrderStatus::Failed;
    failed.updated_at = now;
    failed
}

// =============================================================================
// Webhook log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Processing,
    Success,
    Error,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Success => "success",
            WebhookEventStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => WebhookEventStatus::Success,
            "error" => WebhookEventStatus::Error,
            _ => WebhookEventStatus::Processing,
        }
    }
}

/// Row of the inbound webhook audit log
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub processing_result: WebhookEventStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WebhookEventRecord {
    /// A failed or abandoned delivery may be processed again
    pub fn can_reclaim(&self, now: OffsetDateTime) -> bool {
        match self.processing_result {
            WebhookEventStatus::Success => false,
            WebhookEventStatus::Error => true,
            WebhookEventStatus::Processing => self
                .processing_started_at
                .map_or(true, |started| started < now - WEBHOOK_PROCESSING_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller holds exclusive processing rights
    Claimed,
    /// Another delivery already handled or is handling this event
    Duplicate(WebhookEventStatus),
}

// =============================================================================
// Ports
// =============================================================================

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_plan(&self, plan_id: Uuid) -> BillingResult<Option<PricingPlan>>;

    async fn find_member(
        &self,
        association_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<Option<AssociationMember>>;

    async fn insert_order(
        &self,
        order: &NewPurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseOrder>;

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<PurchaseOrder>>;

    async fn find_order_by_session(&self, session_id: &str)
        -> BillingResult<Option<PurchaseOrder>>;

    /// Add keys to the session reference without overwriting stored ones
    async fn merge_session_ref(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
    ) -> BillingResult<PurchaseOrder>;

    /// PENDING orders created at or after `created_after`, ordered by
    /// `(created_at, id)` and starting strictly past `after` when given
    async fn list_pending_orders(
        &self,
        created_after: OffsetDateTime,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> BillingResult<Vec<PurchaseOrder>>;

    async fn settle_paid(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement>;

    async fn settle_failed(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement>;

    async fn list_member_history(&self, member_id: Uuid) -> BillingResult<Vec<MembershipHistory>>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Newest open intent for the exact (email, plan, association)
    async fn find_intent_by_email(
        &self,
        email: &str,
        pricing_plan_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>>;

    /// Newest open intent for the exact (user, plan)
    async fn find_intent_by_user(
        &self,
        user_id: Uuid,
        pricing_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>>;

    /// Stamp `user_id` on an intent captured anonymously. Returns false when
    /// the intent already carried a user.
    async fn adopt_intent(&self, intent_id: Uuid, user_id: Uuid) -> BillingResult<bool>;

    async fn link_intent_to_order(&self, intent_id: Uuid, order_id: Uuid) -> BillingResult<()>;

    /// PENDING intent already linked to `order_id`, if any
    async fn find_intent_for_order(&self, order_id: Uuid)
        -> BillingResult<Option<PurchaseIntentData>>;

    /// Newest open intent for (user, association)
    async fn find_open_intent_for_member(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>>;

    /// PENDING -> CONVERTED. Returns false if the intent was no longer PENDING.
    async fn mark_intent_converted(
        &self,
        intent_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn find_lead_by_order(&self, order_id: Uuid) -> BillingResult<Option<AssociationLead>>;

    /// Newest non-terminal lead for (user, association) with the given source
    async fn find_open_lead(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        source: &str,
    ) -> BillingResult<Option<AssociationLead>>;

    /// Non-terminal -> CONVERTED. Returns false if the lead was already terminal.
    async fn mark_lead_converted(
        &self,
        lead_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;
}

#[async_trait]
pub trait WebhookLog: Send + Sync {
    /// Atomically take processing rights for an event id
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome>;

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;

    /// Delete `success` rows created before `cutoff`
    async fn purge_processed(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}
