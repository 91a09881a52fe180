//! Membership payment invariants
//!
//! Runnable consistency checks over orders, members, history and intents.
//! Each check is a read-only SQL query; violations carry enough context to
//! debug. Run on demand from the admin API and hourly from the worker.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Orders, members or intents affected
    pub record_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money taken without a membership
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// No violation above `Low`
    pub healthy: bool,
}

/// Fold violations from `checks_run` checks into a summary
pub fn summarize(
    checked_at: OffsetDateTime,
    checks_run: usize,
    violations: Vec<InvariantViolation>,
) -> InvariantCheckSummary {
    let checks_failed = violations
        .iter()
        .map(|v| v.invariant.as_str())
        .collect::<HashSet<_>>()
        .len();

    InvariantCheckSummary {
        checked_at,
        checks_run,
        checks_passed: checks_run.saturating_sub(checks_failed),
        checks_failed,
        healthy: violations
            .iter()
            .all(|v| v.severity == ViolationSeverity::Low),
        violations,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutMemberRow {
    order_id: Uuid,
    order_number: String,
    association_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutWindowRow {
    order_id: Uuid,
    order_number: String,
    paid_at: Option<OffsetDateTime>,
    membership_start: Option<OffsetDateTime>,
    membership_end: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnauditedMemberRow {
    member_id: Uuid,
    association_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct ConvertedIntentRow {
    intent_id: Uuid,
    purchase_order_id: Option<Uuid>,
    order_status: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct AbandonedOrderRow {
    order_id: Uuid,
    order_number: String,
    created_at: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
    /// PENDING orders older than this count as abandoned
    abandoned_after: time::Duration,
}

impl InvariantChecker {
    pub const CHECKS: [&'static str; 5] = [
        "paid_order_has_membership",
        "paid_order_has_validity_window",
        "active_member_has_history",
        "converted_intent_has_paid_order",
        "no_abandoned_pending_orders",
    ];

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            abandoned_after: time::Duration::hours(24),
        }
    }

    pub fn with_abandoned_after(mut self, abandoned_after: time::Duration) -> Self {
        self.abandoned_after = abandoned_after;
        self
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let summary = summarize(now, Self::CHECKS.len(), violations);
        if summary.healthy {
            tracing::info!(
                checks_run = summary.checks_run,
                violations = summary.violations.len(),
                "Invariant checks passed"
            );
        } else {
            tracing::warn!(
                checks_run = summary.checks_run,
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_order_has_membership" => self.check_paid_order_has_membership().await,
            "paid_order_has_validity_window" => self.check_paid_order_has_window().await,
            "active_member_has_history" => self.check_active_member_has_history().await,
            "converted_intent_has_paid_order" => self.check_converted_intent_order().await,
            "no_abandoned_pending_orders" => self.check_abandoned_orders().await,
            _ => Ok(vec![]),
        }
    }

    /// A PAID order must have produced a non-PENDING member row
    async fn check_paid_order_has_membership(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutMemberRow> = sqlx::query_as(
            r#"
            SELECT o.id AS order_id, o.order_number, o.association_id, o.user_id
            FROM purchase_orders o
            WHERE o.status = 'PAID'
              AND NOT EXISTS (
                  SELECT 1 FROM association_members m
                  WHERE m.association_id = o.association_id
                    AND m.user_id = o.user_id
                    AND m.status <> 'PENDING'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_order_has_membership".to_string(),
                record_ids: vec![row.order_id],
                description: format!(
                    "Order {} is PAID but the buyer has no membership",
                    row.order_number
                ),
                context: serde_json::json!({
                    "association_id": row.association_id,
                    "user_id": row.user_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_paid_order_has_window(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutWindowRow> = sqlx::query_as(
            r#"
            SELECT id AS order_id, order_number, paid_at, membership_start, membership_end
            FROM purchase_orders
            WHERE status = 'PAID'
              AND (paid_at IS NULL OR membership_start IS NULL OR membership_end IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_order_has_validity_window".to_string(),
                record_ids: vec![row.order_id],
                description: format!(
                    "Order {} is PAID without paid_at or validity window",
                    row.order_number
                ),
                context: serde_json::json!({
                    "has_paid_at": row.paid_at.is_some(),
                    "has_start": row.membership_start.is_some(),
                    "has_end": row.membership_end.is_some(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every activation writes a history row in the same transaction
    async fn check_active_member_has_history(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedMemberRow> = sqlx::query_as(
            r#"
            SELECT m.id AS member_id, m.association_id, m.user_id
            FROM association_members m
            WHERE m.status = 'ACTIVE'
              AND m.deleted_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM membership_history h WHERE h.member_id = m.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_member_has_history".to_string(),
                record_ids: vec![row.member_id],
                description: "Active member has no membership history".to_string(),
                context: serde_json::json!({
                    "association_id": row.association_id,
                    "user_id": row.user_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_converted_intent_order(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ConvertedIntentRow> = sqlx::query_as(
            r#"
            SELECT i.id AS intent_id, i.purchase_order_id, o.status AS order_status
            FROM purchase_intent_data i
            LEFT JOIN purchase_orders o ON o.id = i.purchase_order_id
            WHERE i.status = 'CONVERTED'
              AND (o.id IS NULL OR o.status <> 'PAID')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "converted_intent_has_paid_order".to_string(),
                record_ids: vec![row.intent_id],
                description: "Converted purchase intent is not linked to a paid order"
                    .to_string(),
                context: serde_json::json!({
                    "purchase_order_id": row.purchase_order_id,
                    "order_status": row.order_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Abandoned carts the reconciler no longer looks at
    async fn check_abandoned_orders(&self) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = OffsetDateTime::now_utc() - self.abandoned_after;
        let rows: Vec<AbandonedOrderRow> = sqlx::query_as(
            r#"
            SELECT id AS order_id, order_number, created_at
            FROM purchase_orders
            WHERE status = 'PENDING' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT 100
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_abandoned_pending_orders".to_string(),
                record_ids: vec![row.order_id],
                description: format!(
                    "Order {} has been PENDING since {}",
                    row.order_number, row.created_at
                ),
                context: serde_json::json!({
                    "created_at": row.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            record_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = summarize(
            datetime!(2025-06-01 00:00 UTC),
            5,
            vec![
                violation("paid_order_has_membership", ViolationSeverity::Critical),
                violation("paid_order_has_membership", ViolationSeverity::Critical),
                violation("active_member_has_history", ViolationSeverity::Medium),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_abandoned_carts_alone_are_healthy() {
        let summary = summarize(
            datetime!(2025-06-01 00:00 UTC),
            5,
            vec![violation("no_abandoned_pending_orders", ViolationSeverity::Low)],
        );
        assert_eq!(summary.checks_failed, 1);
        assert!(summary.healthy);
    }

    #[test]
    fn test_every_listed_check_is_distinct() {
        let unique: HashSet<_> = InvariantChecker::CHECKS.iter().collect();
        assert_eq!(unique.len(), InvariantChecker::CHECKS.len());
    }
}
