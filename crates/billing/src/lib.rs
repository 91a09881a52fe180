// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Membra Billing Module
//!
//! Turns Stripe checkout payments into association memberships exactly once.
//!
//! ## Features
//!
//! - **Orders**: Create purchase orders and hosted checkout sessions
//! - **Correlation**: Link orders to the pre-purchase intent they came from
//! - **Outcome processing**: Atomic order -> membership -> history settlement,
//!   then badge, lead conversion and confirmation email
//! - **Webhooks**: Verified, deduplicated checkout events
//! - **Reconciler**: Polling safety net for missed webhooks
//! - **Invariants**: Read-only consistency checks

pub mod client;
pub mod collaborators;
pub mod conversion;
pub mod correlation;
pub mod email;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod metadata;
pub mod models;
pub mod orders;
pub mod outcome;
pub mod reconciler;
pub mod store;
pub mod webhooks;


// Client
pub use client::{StripeClient, StripeConfig};

// Collaborators
pub use collaborators::{
    AccountDirectory, BadgeOutcome, BadgeService, PurchaseNotifier, PurchaseSummary,
};

// Conversion
pub use conversion::{ConversionReport, LeadConversion};

// Correlation
pub use correlation::{CorrelationMatch, CorrelationQuery, CorrelationResolver, CorrelationTier};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{CheckoutRequest, CheckoutSessionRef, PaymentGateway, SessionState, SessionStatus};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Metadata
pub use metadata::MetadataMap;

// Models
pub use models::{
    AssociationLead, AssociationMember, IntentStatus, LeadStatus, MemberStatus,
    MembershipHistory, OrderStatus, PricingPlan, Profile, PurchaseIntentData, PurchaseOrder,
    UserContact,
};

// Orders
pub use orders::{CheckoutConfig, CreateOrderRequest, CreatedOrder, OrderService};

// Outcome
pub use outcome::{
    OutcomePayload, OutcomeSource, PaymentOutcomeProcessor, ProcessOutcome, SideEffectReport,
};

// Reconciler
pub use reconciler::{OrderCheck, PollingReconciler, ReconcilerConfig, SweepSummary};

// Store
pub use store::{
    ClaimOutcome, LeadStore, MemoryStore, OrderStore, PendingCursor, PgStore, Settlement,
    WebhookEventRecord, WebhookEventStatus, WebhookLog,
};

// Webhooks
pub use webhooks::{CheckoutEvent, CheckoutEventKind, WebhookDisposition, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;

/// Ports the billing service is assembled from
#[derive(Clone)]
pub struct BillingDeps {
    pub orders: Arc<dyn OrderStore>,
    pub leads: Arc<dyn LeadStore>,
    pub webhook_log: Arc<dyn WebhookLog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub badges: Arc<dyn BadgeService>,
    pub directory: Arc<dyn AccountDirectory>,
    pub notifier: Arc<dyn PurchaseNotifier>,
}

impl BillingDeps {
    /// Every store and directory port backed by one [`MemoryStore`]
    pub fn in_memory(
        store: Arc<MemoryStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> Self {
        Self {
            orders: store.clone(),
            leads: store.clone(),
            webhook_log: store.clone(),
            badges: store.clone(),
            directory: store,
            gateway,
            notifier,
        }
    }

    /// Every store and directory port backed by Postgres
    pub fn postgres(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            orders: store.clone(),
            leads: store.clone(),
            webhook_log: store.clone(),
            badges: store.clone(),
            directory: store,
            gateway,
            notifier,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub webhook_secret: String,
    pub checkout: CheckoutConfig,
    pub reconciler: ReconcilerConfig,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub orders: OrderService,
    pub processor: Arc<PaymentOutcomeProcessor>,
    pub webhooks: WebhookHandler,
    pub reconciler: Arc<PollingReconciler>,
    pub invariants: Option<InvariantChecker>,
    webhook_log: Arc<dyn WebhookLog>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = BillingConfig {
            webhook_secret: stripe.config().webhook_secret.clone(),
            checkout: CheckoutConfig::from_env(),
            reconciler: ReconcilerConfig::from_env(),
        };
        let deps = BillingDeps::postgres(
            pool.clone(),
            Arc::new(stripe),
            Arc::new(BillingEmailService::from_env()),
        );

        let invariants =
            InvariantChecker::new(pool).with_abandoned_after(config.reconciler.lookback);
        Ok(Self::new(deps, config).with_invariants(invariants))
    }

    /// Create a new billing service from explicit ports
    pub fn new(deps: BillingDeps, config: BillingConfig) -> Self {
        let processor = Arc::new(PaymentOutcomeProcessor::new(
            deps.orders.clone(),
            LeadConversion::new(deps.leads.clone()),
            deps.badges.clone(),
            deps.directory.clone(),
            deps.notifier.clone(),
        ));

        let orders = OrderService::new(
            deps.orders.clone(),
            deps.leads.clone(),
            deps.gateway.clone(),
            deps.directory.clone(),
            config.checkout,
        );

        let webhooks = WebhookHandler::new(
            config.webhook_secret,
            deps.webhook_log.clone(),
            processor.clone(),
        );

        let reconciler = Arc::new(PollingReconciler::new(
            deps.orders,
            deps.gateway,
            processor.clone(),
            config.reconciler,
        ));

        Self {
            orders,
            processor,
            webhooks,
            reconciler,
            invariants: None,
            webhook_log: deps.webhook_log,
        }
    }

    pub fn with_invariants(mut self, checker: InvariantChecker) -> Self {
        self.invariants = Some(checker);
        self
    }

    /// Drop successfully processed webhook log rows older than `retention`
    pub async fn purge_webhook_log(&self, retention: time::Duration) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let purged = self.webhook_log.purge_processed(cutoff).await?;
        tracing::info!(
            purged = purged,
            retention_days = retention.whole_days(),
            "Webhook log purged"
        );
        Ok(purged)
    }
}
