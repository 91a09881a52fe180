//! In-process store
//!
//! Keeps every table in one map set behind a single async mutex. A settlement
//! holds the lock for its whole read-check-write, which gives the same
//! serialisation the Postgres row lock gives. Used by tests and local runs
//! without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    plan_failed_settlement, plan_paid_settlement, ClaimOutcome, LeadStore, OrderStore,
    PendingCursor, Settlement, WebhookEventRecord, WebhookEventStatus, WebhookLog,
};
use crate::collaborators::{AccountDirectory, BadgeOutcome, BadgeService};
use crate::error::{BillingError, BillingResult};
use crate::metadata::MetadataMap;
use crate::models::{
    AssociationLead, AssociationMember, IntentStatus, LeadStatus, MembershipHistory,
    NewPurchaseOrder, OrderStatus, PricingPlan, Profile, PurchaseIntentData, PurchaseOrder,
    UserContact,
};

#[derive(Default)]
struct MemoryState {
    plans: HashMap<Uuid, PricingPlan>,
    orders: HashMap<Uuid, PurchaseOrder>,
    members: HashMap<(Uuid, Uuid), AssociationMember>,
    history: Vec<MembershipHistory>,
    intents: HashMap<Uuid, PurchaseIntentData>,
    leads: HashMap<Uuid, AssociationLead>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    default_profiles: HashMap<Uuid, Profile>,
    contacts: HashMap<Uuid, UserContact>,
    associations: HashMap<Uuid, String>,
    badges: HashSet<(Uuid, Uuid)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    pub async fn insert_plan(&self, plan: PricingPlan) {
        self.state.lock().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_member(&self, member: AssociationMember) {
        self.state
            .lock()
            .await
            .members
            .insert((member.association_id, member.user_id), member);
    }

    pub async fn insert_intent(&self, intent: PurchaseIntentData) {
        self.state.lock().await.intents.insert(intent.id, intent);
    }

    pub async fn insert_lead(&self, lead: AssociationLead) {
        self.state.lock().await.leads.insert(lead.id, lead);
    }

    pub async fn insert_default_profile(&self, profile: Profile) {
        self.state
            .lock()
            .await
            .default_profiles
            .insert(profile.user_id, profile);
    }

    pub async fn insert_contact(&self, contact: UserContact) {
        self.state
            .lock()
            .await
            .contacts
            .insert(contact.user_id, contact);
    }

    pub async fn insert_association(&self, association_id: Uuid, name: impl Into<String>) {
        self.state
            .lock()
            .await
            .associations
            .insert(association_id, name.into());
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub async fn member(&self, association_id: Uuid, user_id: Uuid) -> Option<AssociationMember> {
        self.state
            .lock()
            .await
            .members
            .get(&(association_id, user_id))
            .cloned()
    }

    pub async fn history_count(&self) -> usize {
        self.state.lock().await.history.len()
    }

    pub async fn intent(&self, intent_id: Uuid) -> Option<PurchaseIntentData> {
        self.state.lock().await.intents.get(&intent_id).cloned()
    }

    pub async fn lead(&self, lead_id: Uuid) -> Option<AssociationLead> {
        self.state.lock().await.leads.get(&lead_id).cloned()
    }

    pub async fn has_badge(&self, profile_id: Uuid, association_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .badges
            .contains(&(profile_id, association_id))
    }

    pub async fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.state.lock().await.webhook_events.get(event_id).cloned()
    }
}

fn newest<T, F>(items: impl Iterator<Item = T>, created_at: F) -> Option<T>
where
    F: Fn(&T) -> OffsetDateTime,
{
    items.max_by_key(|item| created_at(item))
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_plan(&self, plan_id: Uuid) -> BillingResult<Option<PricingPlan>> {
        Ok(self.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn find_member(
        &self,
        association_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<Option<AssociationMember>> {
        Ok(self.member(association_id, user_id).await)
    }

    async fn insert_order(
        &self,
        order: &NewPurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseOrder> {
        let mut state = self.state.lock().await;
        if state
            .orders
            .values()
            .any(|o| o.order_number == order.order_number)
        {
            return Err(BillingError::Database(format!(
                "duplicate order number {}",
                order.order_number
            )));
        }

        let stored = PurchaseOrder {
            id: order.id,
            order_number: order.order_number.clone(),
            association_id: order.association_id,
            user_id: order.user_id,
            pricing_plan_id: order.pricing_plan_id,
            amount_cents: order.amount_cents,
            currency: order.currency.clone(),
            status: OrderStatus::Pending,
            session_ref: MetadataMap::new(),
            membership_start: None,
            membership_end: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<PurchaseOrder>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_order_by_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<PurchaseOrder>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.session_id() == Some(session_id))
            .cloned())
    }

    async fn merge_session_ref(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
    ) -> BillingResult<PurchaseOrder> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;
        order.session_ref.merge(fields);
        Ok(order.clone())
    }

    async fn list_pending_orders(
        &self,
        created_after: OffsetDateTime,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> BillingResult<Vec<PurchaseOrder>> {
        let state = self.state.lock().await;
        let mut pending: Vec<PurchaseOrder> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at >= created_after)
            .filter(|o| after.is_none_or(|c| (o.created_at, o.id) > (c.created_at, c.id)))
            .cloned()
            .collect();
        pending.sort_by_key(|o| (o.created_at, o.id));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn settle_paid(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut state = self.state.lock().await;

        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(Settlement::Unchanged { order });
        }

        let tier = state
            .plans
            .get(&order.pricing_plan_id)
            .map(|p| p.membership_tier.clone())
            .ok_or(BillingError::PlanNotFound(order.pricing_plan_id))?;

        let key = (order.association_id, order.user_id);
        let plan = plan_paid_settlement(&order, &tier, state.members.get(&key), fields, now);

        state.orders.insert(order.id, plan.order.clone());
        state.members.insert(key, plan.member.clone());
        state.history.push(plan.history.clone());

        Ok(plan.into())
    }

    async fn settle_failed(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut state = self.state.lock().await;

        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(Settlement::Unchanged { order });
        }

        let failed = plan_failed_settlement(&order, fields, now);
        state.orders.insert(failed.id, failed.clone());
        Ok(Settlement::Failed { order: failed })
    }

    async fn list_member_history(&self, member_id: Uuid) -> BillingResult<Vec<MembershipHistory>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.member_id == member_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn find_intent_by_email(
        &self,
        email: &str,
        pricing_plan_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let state = self.state.lock().await;
        Ok(newest(
            state.intents.values().filter(|i| {
                i.email == email
                    && i.pricing_plan_id == Some(pricing_plan_id)
                    && i.association_id == Some(association_id)
                    && i.is_open(now)
            }),
            |i| i.created_at,
        )
        .cloned())
    }

    async fn find_intent_by_user(
        &self,
        user_id: Uuid,
        pricing_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let state = self.state.lock().await;
        Ok(newest(
            state.intents.values().filter(|i| {
                i.user_id == Some(user_id)
                    && i.pricing_plan_id == Some(pricing_plan_id)
                    && i.is_open(now)
            }),
            |i| i.created_at,
        )
        .cloned())
    }

    async fn adopt_intent(&self, intent_id: Uuid, user_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.intents.get_mut(&intent_id) {
            Some(intent) if intent.user_id.is_none() => {
                intent.user_id = Some(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn link_intent_to_order(&self, intent_id: Uuid, order_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(intent) = state.intents.get_mut(&intent_id) {
            if intent.status == IntentStatus::Pending {
                intent.purchase_order_id = Some(order_id);
            }
        }
        Ok(())
    }

    async fn find_intent_for_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .values()
            .find(|i| i.purchase_order_id == Some(order_id) && i.status == IntentStatus::Pending)
            .cloned())
    }

    async fn find_open_intent_for_member(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let state = self.state.lock().await;
        Ok(newest(
            state.intents.values().filter(|i| {
                i.user_id == Some(user_id)
                    && i.association_id == Some(association_id)
                    && i.is_open(now)
            }),
            |i| i.created_at,
        )
        .cloned())
    }

    async fn mark_intent_converted(
        &self,
        intent_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.intents.get_mut(&intent_id) {
            Some(intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Converted;
                intent.converted_at = Some(now);
                intent.purchase_order_id = Some(order_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_lead_by_order(&self, order_id: Uuid) -> BillingResult<Option<AssociationLead>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .find(|l| l.purchase_order_id == Some(order_id))
            .cloned())
    }

    async fn find_open_lead(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        source: &str,
    ) -> BillingResult<Option<AssociationLead>> {
        let state = self.state.lock().await;
        Ok(newest(
            state.leads.values().filter(|l| {
                l.user_id == Some(user_id)
                    && l.association_id == association_id
                    && l.source == source
                    && !l.status.is_terminal()
            }),
            |l| l.created_at,
        )
        .cloned())
    }

    async fn mark_lead_converted(
        &self,
        lead_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.leads.get_mut(&lead_id) {
            Some(lead) if !lead.status.is_terminal() => {
                lead.status = LeadStatus::Converted;
                lead.purchase_order_id = Some(order_id);
                lead.converted_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WebhookLog for MemoryStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let mut state = self.state.lock().await;
        match state.webhook_events.get_mut(event_id) {
            Some(record) if !record.can_reclaim(now) => {
                Ok(ClaimOutcome::Duplicate(record.processing_result))
            }
            Some(record) => {
                record.processing_result = WebhookEventStatus::Processing;
                record.processing_started_at = Some(now);
                Ok(ClaimOutcome::Claimed)
            }
            None => {
                state.webhook_events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        processing_result: WebhookEventStatus::Processing,
                        processing_started_at: Some(now),
                        error_message: None,
                        created_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(event_id) {
            record.processing_result = match error {
                Some(_) => WebhookEventStatus::Error,
                None => WebhookEventStatus::Success,
            };
            record.error_message = error.map(str::to_string);
        }
        Ok(())
    }

    async fn purge_processed(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.webhook_events.len();
        state.webhook_events.retain(|_, r| {
            !(r.processing_result == WebhookEventStatus::Success && r.created_at < cutoff)
        });
        Ok((before - state.webhook_events.len()) as u64)
    }
}

#[async_trait]
impl BadgeService for MemoryStore {
    async fn ensure_badge(
        &self,
        profile_id: Uuid,
        association_id: Uuid,
    ) -> BillingResult<BadgeOutcome> {
        let inserted = self
            .state
            .lock()
            .await
            .badges
            .insert((profile_id, association_id));
        Ok(if inserted {
            BadgeOutcome::Created
        } else {
            BadgeOutcome::AlreadyPresent
        })
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn find_default_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        Ok(self
            .state
            .lock()
            .await
            .default_profiles
            .get(&user_id)
            .cloned())
    }

    async fn find_contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>> {
        Ok(self.state.lock().await.contacts.get(&user_id).cloned())
    }

    async fn find_association_name(&self, association_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .associations
            .get(&association_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    #[tokio::test]
    async fn test_purge_keeps_recent_and_failed_events() {
        let store = MemoryStore::new();
        let old = datetime!(2025-01-01 00:00 UTC);
        let recent = datetime!(2025-03-01 00:00 UTC);

        store.claim_event("evt_old_ok", "t", old).await.unwrap();
        store.record_result("evt_old_ok", None).await.unwrap();
        store.claim_event("evt_old_err", "t", old).await.unwrap();
        store.record_result("evt_old_err", Some("boom")).await.unwrap();
        store.claim_event("evt_recent", "t", recent).await.unwrap();
        store.record_result("evt_recent", None).await.unwrap();

        let purged = store
            .purge_processed(recent - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store.webhook_event("evt_old_ok").await.is_none());
        assert!(store.webhook_event("evt_old_err").await.is_some());
        assert!(store.webhook_event("evt_recent").await.is_some());
    }

    fn new_order(order_number: &str) -> NewPurchaseOrder {
        NewPurchaseOrder {
            id: Uuid::new_v4(),
            order_number: order_number.into(),
            association_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            pricing_plan_id: Uuid::new_v4(),
            amount_cents: 10_000,
            currency: "HKD".into(),
        }
    }

    #[tokio::test]
    async fn test_pending_orders_page_by_created_at_then_id() {
        let store = MemoryStore::new();
        let at = datetime!(2025-03-01 12:00 UTC);
        for n in 0..3 {
            store
                .insert_order(&new_order(&format!("ORD-TIE-{}", n)), at)
                .await
                .unwrap();
        }
        store
            .insert_order(&new_order("ORD-LATER"), at + Duration::minutes(1))
            .await
            .unwrap();

        let since = at - Duration::hours(1);
        let first = store.list_pending_orders(since, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first.last().map(PendingCursor::after);
        let second = store.list_pending_orders(since, cursor, 2).await.unwrap();
        assert_eq!(second.len(), 2);
        let cursor = second.last().map(PendingCursor::after);
        let third = store.list_pending_orders(since, cursor, 2).await.unwrap();
        assert!(third.is_empty());

        let mut seen: Vec<Uuid> = first.iter().chain(&second).map(|o| o.id).collect();
        assert_eq!(second[1].order_number, "ORD-LATER");
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_badge_insert_is_idempotent() {
        let store = MemoryStore::new();
        let (profile, association) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(
            store.ensure_badge(profile, association).await.unwrap(),
            BadgeOutcome::Created
        );
        assert_eq!(
            store.ensure_badge(profile, association).await.unwrap(),
            BadgeOutcome::AlreadyPresent
        );
    }
}
