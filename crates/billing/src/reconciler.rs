//! Polling reconciler
//!
//! Safety net for webhooks that never arrive. A background task periodically
//! asks the gateway about recent PENDING orders and feeds paid or expired
//! sessions through the same [`PaymentOutcomeProcessor`] the webhook uses.
//! Orders that never got a checkout session are failed once they are older
//! than the orphan grace period.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, SessionState};
use crate::models::PurchaseOrder;
use crate::outcome::{OutcomePayload, OutcomeSource, PaymentOutcomeProcessor, ProcessOutcome};
use crate::store::{OrderStore, PendingCursor};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: std::time::Duration,
    /// Only orders created within this window are swept
    pub lookback: time::Duration,
    /// Page size when walking the PENDING orders of one sweep
    pub batch_size: i64,
    /// Session-less orders younger than this are left alone
    pub orphan_grace: time::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(30),
            lookback: time::Duration::hours(24),
            batch_size: 100,
            orphan_grace: time::Duration::minutes(60),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        fn env_i64(key: &str) -> Option<i64> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            interval: env_i64("RECONCILE_INTERVAL_SECS")
                .and_then(|s| u64::try_from(s).ok())
                .filter(|s| *s > 0)
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.interval),
            lookback: env_i64("RECONCILE_LOOKBACK_HOURS")
                .map(time::Duration::hours)
                .unwrap_or(defaults.lookback),
            batch_size: env_i64("RECONCILE_BATCH_SIZE")
                .filter(|b| *b > 0)
                .unwrap_or(defaults.batch_size),
            orphan_grace: env_i64("ORPHAN_GRACE_MINUTES")
                .map(time::Duration::minutes)
                .unwrap_or(defaults.orphan_grace),
        }
    }
}

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub paid: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub orphaned: usize,
    pub errors: usize,
}

/// Result of checking one order against the gateway
#[derive(Debug, Clone)]
pub enum OrderCheck {
    Settled(ProcessOutcome),
    /// Order had no session and was failed after the grace period
    Orphaned(ProcessOutcome),
    /// Nothing to do yet; `state` is `None` for an orphan still inside its grace period
    StillPending { state: Option<SessionState> },
}

pub struct PollingReconciler {
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    processor: Arc<PaymentOutcomeProcessor>,
    config: ReconcilerConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingReconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        processor: Arc<PaymentOutcomeProcessor>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orders,
            gateway,
            processor,
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Spawn the sweep loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut guard = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Polling reconciler already running");
            return false;
        }

        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { this.run().await }));

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            lookback_hours = self.config.lookback.whole_hours(),
            batch_size = self.config.batch_size,
            "Polling reconciler started"
        );
        true
    }

    /// Abort the sweep loop. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!("Polling reconciler stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Reconciliation sweep failed");
            }
        }
    }

    /// Check every PENDING order inside the lookback window, a page of
    /// `batch_size` at a time, oldest first
    pub async fn sweep_once(&self) -> BillingResult<SweepSummary> {
        let now = OffsetDateTime::now_utc();
        let created_after = now - self.config.lookback;
        let page_size = self.config.batch_size.max(1);

        let mut summary = SweepSummary::default();
        let mut cursor: Option<PendingCursor> = None;
        loop {
            let page = self
                .orders
                .list_pending_orders(created_after, cursor, page_size)
                .await?;

            for order in &page {
                self.tally(&mut summary, order, now).await;
            }

            // A short page means the window is exhausted
            let Some(last) = page.last() else { break };
            if usize::try_from(page_size).is_ok_and(|n| page.len() < n) {
                break;
            }
            cursor = Some(PendingCursor::after(last));
        }

        if summary.checked > 0 {
            tracing::info!(
                checked = summary.checked,
                paid = summary.paid,
                failed = summary.failed,
                still_pending = summary.still_pending,
                orphaned = summary.orphaned,
                errors = summary.errors,
                "Reconciliation sweep finished"
            );
        } else {
            tracing::debug!("Reconciliation sweep found no pending orders");
        }

        Ok(summary)
    }

    async fn tally(
        &self,
        summary: &mut SweepSummary,
        order: &PurchaseOrder,
        now: OffsetDateTime,
    ) {
        summary.checked += 1;
        match self.check_order(order, now, OutcomeSource::Poll).await {
            Ok(OrderCheck::Settled(ProcessOutcome::Activated { .. })) => summary.paid += 1,
            Ok(OrderCheck::Settled(ProcessOutcome::Failed { .. })) => summary.failed += 1,
            Ok(OrderCheck::Settled(ProcessOutcome::AlreadySettled { .. })) => {}
            Ok(OrderCheck::Orphaned(_)) => summary.orphaned += 1,
            Ok(OrderCheck::StillPending { .. }) => summary.still_pending += 1,
            Err(e) if e.is_transient() => {
                summary.errors += 1;
                tracing::warn!(
                    order_id = %order.id,
                    error = %e,
                    "Failed to reconcile order, will retry next sweep"
                );
            }
            Err(e) => {
                summary.errors += 1;
                tracing::error!(
                    order_id = %order.id,
                    code = e.code(),
                    error = %e,
                    "Order cannot be reconciled automatically"
                );
            }
        }
    }

    /// Manual reconciliation of a single order
    pub async fn sync_order(&self, order_id: Uuid) -> BillingResult<OrderCheck> {
        let order = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;

        self.check_order(&order, OffsetDateTime::now_utc(), OutcomeSource::Manual)
            .await
    }

    async fn check_order(
        &self,
        order: &PurchaseOrder,
        now: OffsetDateTime,
        source: OutcomeSource,
    ) -> BillingResult<OrderCheck> {
        if order.status.is_terminal() {
            return Ok(OrderCheck::Settled(ProcessOutcome::AlreadySettled {
                order: order.clone(),
            }));
        }

        let Some(session_id) = order.session_id() else {
            if order.created_at < now - self.config.orphan_grace {
                tracing::warn!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "Order never received a checkout session, marking FAILED"
                );
                let mut payload = OutcomePayload::failed(source);
                payload.fields = payload
                    .fields
                    .with("failure_reason", "no_checkout_session");
                let outcome = self.processor.process(order.id, &payload).await?;
                return Ok(OrderCheck::Orphaned(outcome));
            }
            return Ok(OrderCheck::StillPending { state: None });
        };

        let status = self.gateway.get_session_status(session_id).await?;

        if let Some(reference) = status.order_ref.as_deref() {
            if reference != order.id.to_string() {
                return Err(BillingError::Internal(format!(
                    "Session {} references order {} but is stored on order {}",
                    status.session_id, reference, order.id
                )));
            }
        }

        if status.paid {
            let payload = OutcomePayload::from_session(&status, true, source);
            let outcome = self.processor.process(order.id, &payload).await?;
            return Ok(OrderCheck::Settled(outcome));
        }

        if status.state == SessionState::Expired {
            let payload = OutcomePayload::from_session(&status, false, source);
            let outcome = self.processor.process(order.id, &payload).await?;
            return Ok(OrderCheck::Settled(outcome));
        }

        tracing::debug!(
            order_id = %order.id,
            session_id = %status.session_id,
            state = ?status.state,
            "Session not paid yet"
        );
        Ok(OrderCheck::StillPending {
            state: Some(status.state),
        })
    }
}
