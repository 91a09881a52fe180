//! Scheduled housekeeping jobs

use std::sync::Arc;

use membra_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use tracing::{error, info, warn};

pub const DEFAULT_WEBHOOK_LOG_RETENTION_DAYS: i64 = 30;

/// `WEBHOOK_LOG_RETENTION_DAYS`, ignoring non-positive values
pub fn webhook_log_retention() -> time::Duration {
    parse_retention(std::env::var("WEBHOOK_LOG_RETENTION_DAYS").ok().as_deref())
}

fn parse_retention(value: Option<&str>) -> time::Duration {
    let days = value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_WEBHOOK_LOG_RETENTION_DAYS);
    time::Duration::days(days)
}

pub async fn run_invariant_checks(billing: Arc<BillingService>) {
    let Some(checker) = billing.invariants.as_ref() else {
        warn!("Invariant checker not configured, skipping");
        return;
    };

    match checker.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Invariant check run failed"),
    }
}

pub fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant checks complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                record_ids = ?violation.record_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                record_ids = ?violation.record_ids,
                "{}",
                violation.description
            ),
        }
    }
}

pub async fn purge_webhook_log(billing: Arc<BillingService>, retention: time::Duration) {
    if let Err(e) = billing.purge_webhook_log(retention).await {
        error!(error = %e, "Webhook log purge failed");
    }
}

pub fn heartbeat(billing: &BillingService) {
    info!(
        reconciler_running = billing.reconciler.is_running(),
        "Worker heartbeat"
    );
}
