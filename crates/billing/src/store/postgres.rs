//! Postgres store
//!
//! Settlement runs in one transaction: the order row is locked with
//! `SELECT ... FOR UPDATE`, its status re-checked, then order, member and
//! history rows are written before commit. Concurrent webhook and poll
//! deliveries for the same order queue on the row lock and the loser sees a
//! terminal status.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    plan_failed_settlement, plan_paid_settlement, ClaimOutcome, LeadStore, OrderStore,
    PendingCursor, Settlement, WebhookEventStatus, WebhookLog, WEBHOOK_PROCESSING_TIMEOUT,
};
use crate::collaborators::{AccountDirectory, BadgeOutcome, BadgeService};
use crate::error::{BillingError, BillingResult};
use crate::metadata::MetadataMap;
use crate::models::{
    AssociationLead, AssociationMember, MembershipHistory, NewPurchaseOrder, PricingPlan,
    Profile, PurchaseIntentData, PurchaseOrder, UserContact,
};

const ORDER_COLUMNS: &str = "id, order_number, association_id, user_id, pricing_plan_id, \
     amount_cents, currency, status, session_ref, membership_start, membership_end, paid_at, \
     created_at, updated_at";

const MEMBER_COLUMNS: &str = "id, association_id, user_id, role, tier, status, renewal_date, \
     payment_metadata, deleted_at, created_at, updated_at";

const INTENT_COLUMNS: &str = "id, email, user_id, association_id, pricing_plan_id, status, \
     purchase_order_id, expires_at, converted_at, created_at";

const LEAD_COLUMNS: &str = "id, association_id, user_id, email, source, status, \
     purchase_order_id, converted_at, created_at";

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    association_id: Uuid,
    name: String,
    amount_cents: i64,
    currency: String,
    stripe_price_id: String,
    membership_tier: String,
    is_active: bool,
}

impl From<PlanRow> for PricingPlan {
    fn from(row: PlanRow) -> Self {
        PricingPlan {
            id: row.id,
            association_id: row.association_id,
            name: row.name,
            amount_cents: row.amount_cents,
            currency: row.currency,
            stripe_price_id: row.stripe_price_id,
            membership_tier: row.membership_tier,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    association_id: Uuid,
    user_id: Uuid,
    pricing_plan_id: Uuid,
    amount_cents: i64,
    currency: String,
    status: String,
    session_ref: Json<MetadataMap>,
    membership_start: Option<OffsetDateTime>,
    membership_end: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for PurchaseOrder {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(PurchaseOrder {
            id: row.id,
            order_number: row.order_number,
            association_id: row.association_id,
            user_id: row.user_id,
            pricing_plan_id: row.pricing_plan_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            session_ref: row.session_ref.0,
            membership_start: row.membership_start,
            membership_end: row.membership_end,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MemberRow {
    id: Uuid,
    association_id: Uuid,
    user_id: Uuid,
    role: String,
    tier: String,
    status: String,
    renewal_date: Option<OffsetDateTime>,
    payment_metadata: Json<MetadataMap>,
    deleted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<MemberRow> for AssociationMember {
    type Error = BillingError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        Ok(AssociationMember {
            id: row.id,
            association_id: row.association_id,
            user_id: row.user_id,
            role: row.role,
            tier: row.tier,
            status: row.status.parse()?,
            renewal_date: row.renewal_date,
            payment_metadata: row.payment_metadata.0,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    id: Uuid,
    member_id: Uuid,
    previous_status: String,
    new_status: String,
    changed_by: Uuid,
    reason: String,
    created_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for MembershipHistory {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(MembershipHistory {
            id: row.id,
            member_id: row.member_id,
            previous_status: row.previous_status.parse()?,
            new_status: row.new_status.parse()?,
            changed_by: row.changed_by,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IntentRow {
    id: Uuid,
    email: String,
    user_id: Option<Uuid>,
    association_id: Option<Uuid>,
    pricing_plan_id: Option<Uuid>,
    status: String,
    purchase_order_id: Option<Uuid>,
    expires_at: Option<OffsetDateTime>,
    converted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<IntentRow> for PurchaseIntentData {
    type Error = BillingError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(PurchaseIntentData {
            id: row.id,
            email: row.email,
            user_id: row.user_id,
            association_id: row.association_id,
            pricing_plan_id: row.pricing_plan_id,
            status: row.status.parse()?,
            purchase_order_id: row.purchase_order_id,
            expires_at: row.expires_at,
            converted_at: row.converted_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LeadRow {
    id: Uuid,
    association_id: Uuid,
    user_id: Option<Uuid>,
    email: String,
    source: String,
    status: String,
    purchase_order_id: Option<Uuid>,
    converted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<LeadRow> for AssociationLead {
    type Error = BillingError;

    fn try_from(row: LeadRow) -> Result<Self, Self::Error> {
        Ok(AssociationLead {
            id: row.id,
            association_id: row.association_id,
            user_id: row.user_id,
            email: row.email,
            source: row.source,
            status: row.status.parse()?,
            purchase_order_id: row.purchase_order_id,
            converted_at: row.converted_at,
            created_at: row.created_at,
        })
    }
}

fn convert_opt<R, T>(row: Option<R>) -> BillingResult<Option<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    row.map(T::try_from).transpose()
}

// =============================================================================
// Store
// =============================================================================

/// sqlx-backed implementation of every store and directory port
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the order row for the rest of the transaction
    async fn lock_order(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> BillingResult<PurchaseOrder> {
        let sql = format!(
            "SELECT {} FROM purchase_orders WHERE id = $1 FOR UPDATE",
            ORDER_COLUMNS
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?
            .try_into()
    }

    async fn write_order_settlement(
        tx: &mut Transaction<'_, Postgres>,
        order: &PurchaseOrder,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE purchase_orders
            SET status = $2,
                session_ref = $3,
                membership_start = $4,
                membership_end = $5,
                paid_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(Json(&order.session_ref))
        .bind(order.membership_start)
        .bind(order.membership_end)
        .bind(order.paid_at)
        .bind(order.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_plan(&self, plan_id: Uuid) -> BillingResult<Option<PricingPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, association_id, name, amount_cents, currency, stripe_price_id,
                   membership_tier, is_active
            FROM pricing_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PricingPlan::from))
    }

    async fn find_member(
        &self,
        association_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<Option<AssociationMember>> {
        let sql = format!(
            "SELECT {} FROM association_members WHERE association_id = $1 AND user_id = $2",
            MEMBER_COLUMNS
        );
        let row: Option<MemberRow> = sqlx::query_as(&sql)
            .bind(association_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn insert_order(
        &self,
        order: &NewPurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseOrder> {
        let sql = format!(
            r#"
            INSERT INTO purchase_orders
                (id, order_number, association_id, user_id, pricing_plan_id,
                 amount_cents, currency, status, session_ref, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', '{{}}'::jsonb, $8, $8)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let row: OrderRow = sqlx::query_as(&sql)
            .bind(order.id)
            .bind(&order.order_number)
            .bind(order.association_id)
            .bind(order.user_id)
            .bind(order.pricing_plan_id)
            .bind(order.amount_cents)
            .bind(&order.currency)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<PurchaseOrder>> {
        let sql = format!("SELECT {} FROM purchase_orders WHERE id = $1", ORDER_COLUMNS);
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn find_order_by_session(
        &self,
        session_id: &str,
    ) -> BillingResult<Option<PurchaseOrder>> {
        let sql = format!(
            "SELECT {} FROM purchase_orders WHERE session_ref ->> 'session_id' = $1 LIMIT 1",
            ORDER_COLUMNS
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn merge_session_ref(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
    ) -> BillingResult<PurchaseOrder> {
        // Right-hand side of || wins, so stored keys survive
        let sql = format!(
            r#"
            UPDATE purchase_orders
            SET session_ref = $2::jsonb || session_ref,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(Json(fields))
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?
            .try_into()
    }

    async fn list_pending_orders(
        &self,
        created_after: OffsetDateTime,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> BillingResult<Vec<PurchaseOrder>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM purchase_orders
            WHERE status = 'PENDING'
              AND created_at >= $1
              AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
            ORDER_COLUMNS
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(created_after)
            .bind(after.map(|c| c.created_at))
            .bind(after.map(|c| c.id))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PurchaseOrder::try_from).collect()
    }

    async fn settle_paid(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        let order = Self::lock_order(&mut tx, order_id).await?;
        if order.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Settlement::Unchanged { order });
        }

        let tier: Option<(String,)> =
            sqlx::query_as("SELECT membership_tier FROM pricing_plans WHERE id = $1")
                .bind(order.pricing_plan_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (tier,) = tier.ok_or(BillingError::PlanNotFound(order.pricing_plan_id))?;

        let sql = format!(
            "SELECT {} FROM association_members \
             WHERE association_id = $1 AND user_id = $2 FOR UPDATE",
            MEMBER_COLUMNS
        );
        let existing: Option<MemberRow> = sqlx::query_as(&sql)
            .bind(order.association_id)
            .bind(order.user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let existing: Option<AssociationMember> = convert_opt(existing)?;

        let plan = plan_paid_settlement(&order, &tier, existing.as_ref(), fields, now);

        Self::write_order_settlement(&mut tx, &plan.order).await?;

        if plan.created_member {
            sqlx::query(
                r#"
                INSERT INTO association_members
                    (id, association_id, user_id, role, tier, status, renewal_date,
                     payment_metadata, deleted_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $9)
                "#,
            )
            .bind(plan.member.id)
            .bind(plan.member.association_id)
            .bind(plan.member.user_id)
            .bind(&plan.member.role)
            .bind(&plan.member.tier)
            .bind(plan.member.status.as_str())
            .bind(plan.member.renewal_date)
            .bind(Json(&plan.member.payment_metadata))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE association_members
                SET tier = $2,
                    status = $3,
                    renewal_date = $4,
                    payment_metadata = $5,
                    deleted_at = NULL,
                    updated_at = $6
                WHERE id = $1
                "#,
            )
            .bind(plan.member.id)
            .bind(&plan.member.tier)
            .bind(plan.member.status.as_str())
            .bind(plan.member.renewal_date)
            .bind(Json(&plan.member.payment_metadata))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO membership_history
                (id, member_id, previous_status, new_status, changed_by, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(plan.history.id)
        .bind(plan.history.member_id)
        .bind(plan.history.previous_status.as_str())
        .bind(plan.history.new_status.as_str())
        .bind(plan.history.changed_by)
        .bind(&plan.history.reason)
        .bind(plan.history.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(plan.into())
    }

    async fn settle_failed(
        &self,
        order_id: Uuid,
        fields: &MetadataMap,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        let order = Self::lock_order(&mut tx, order_id).await?;
        if order.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Settlement::Unchanged { order });
        }

        let failed = plan_failed_settlement(&order, fields, now);
        Self::write_order_settlement(&mut tx, &failed).await?;
        tx.commit().await?;

        Ok(Settlement::Failed { order: failed })
    }

    async fn list_member_history(&self, member_id: Uuid) -> BillingResult<Vec<MembershipHistory>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, member_id, previous_status, new_status, changed_by, reason, created_at
            FROM membership_history
            WHERE member_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MembershipHistory::try_from).collect()
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn find_intent_by_email(
        &self,
        email: &str,
        pricing_plan_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM purchase_intent_data
            WHERE email = $1
              AND pricing_plan_id = $2
              AND association_id = $3
              AND status = 'PENDING'
              AND (expires_at IS NULL OR expires_at > $4)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        );
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(email)
            .bind(pricing_plan_id)
            .bind(association_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn find_intent_by_user(
        &self,
        user_id: Uuid,
        pricing_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM purchase_intent_data
            WHERE user_id = $1
              AND pricing_plan_id = $2
              AND status = 'PENDING'
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        );
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(pricing_plan_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn adopt_intent(&self, intent_id: Uuid, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE purchase_intent_data SET user_id = $2 WHERE id = $1 AND user_id IS NULL",
        )
        .bind(intent_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn link_intent_to_order(&self, intent_id: Uuid, order_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE purchase_intent_data
            SET purchase_order_id = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(intent_id)
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_intent_for_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM purchase_intent_data
            WHERE purchase_order_id = $1 AND status = 'PENDING'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        );
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn find_open_intent_for_member(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseIntentData>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM purchase_intent_data
            WHERE user_id = $1
              AND association_id = $2
              AND status = 'PENDING'
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        );
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(association_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn mark_intent_converted(
        &self,
        intent_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purchase_intent_data
            SET status = 'CONVERTED', converted_at = $3, purchase_order_id = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(intent_id)
        .bind(order_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_lead_by_order(&self, order_id: Uuid) -> BillingResult<Option<AssociationLead>> {
        let sql = format!(
            "SELECT {} FROM association_leads WHERE purchase_order_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
            LEAD_COLUMNS
        );
        let row: Option<LeadRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn find_open_lead(
        &self,
        user_id: Uuid,
        association_id: Uuid,
        source: &str,
    ) -> BillingResult<Option<AssociationLead>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM association_leads
            WHERE user_id = $1
              AND association_id = $2
              AND source = $3
              AND status NOT IN ('CONVERTED', 'LOST')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            LEAD_COLUMNS
        );
        let row: Option<LeadRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(association_id)
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;

        convert_opt(row)
    }

    async fn mark_lead_converted(
        &self,
        lead_id: Uuid,
        order_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE association_leads
            SET status = 'CONVERTED', purchase_order_id = $2, converted_at = $3, updated_at = $3
            WHERE id = $1 AND status NOT IN ('CONVERTED', 'LOST')
            "#,
        )
        .bind(lead_id)
        .bind(order_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WebhookLog for PgStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let timeout_minutes = WEBHOOK_PROCESSING_TIMEOUT.whole_minutes() as i32;

        // Insert wins the claim; on conflict only failed or stuck rows are taken over
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (event_id, event_type, processing_result, processing_started_at, created_at)
            VALUES ($1, $2, 'processing', $3, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $3,
                error_message = NULL
            WHERE payment_webhook_events.processing_result = 'error'
               OR (payment_webhook_events.processing_result = 'processing'
                   AND (payment_webhook_events.processing_started_at IS NULL
                        OR payment_webhook_events.processing_started_at
                           < $3 - make_interval(mins => $4)))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(timeout_minutes)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM payment_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let status = existing
            .map(|(s,)| WebhookEventStatus::parse(&s))
            .unwrap_or(WebhookEventStatus::Processing);
        Ok(ClaimOutcome::Duplicate(status))
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let result = match error {
            Some(_) => WebhookEventStatus::Error,
            None => WebhookEventStatus::Success,
        };

        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET processing_result = $2, error_message = $3
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_processed(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM payment_webhook_events
            WHERE processing_result = 'success' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BadgeService for PgStore {
    async fn ensure_badge(
        &self,
        profile_id: Uuid,
        association_id: Uuid,
    ) -> BillingResult<BadgeOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO profile_badges (id, profile_id, association_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (profile_id, association_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(profile_id)
        .bind(association_id)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            BadgeOutcome::Created
        } else {
            BadgeOutcome::AlreadyPresent
        })
    }
}

#[async_trait]
impl AccountDirectory for PgStore {
    async fn find_default_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let row: Option<(Uuid, Uuid)> =
            sqlx::query_as("SELECT id, user_id FROM profiles WHERE user_id = $1 AND is_default")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, user_id)| Profile { id, user_id }))
    }

    async fn find_contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>> {
        let row: Option<(Uuid, String, Option<String>)> =
            sqlx::query_as("SELECT id, email, display_name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(user_id, email, display_name)| UserContact {
            user_id,
            email,
            display_name,
        }))
    }

    async fn find_association_name(&self, association_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM associations WHERE id = $1")
            .bind(association_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(name,)| name))
    }
}
