//! Payment gateway port
//!
//! The reconciliation core only needs two things from the gateway: a hosted
//! checkout session for a priced subscription, and the authoritative status
//! of that session later on. [`crate::client::StripeClient`] is the production
//! implementation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::metadata::{self, MetadataMap};

/// Session metadata key carrying the order id back-reference
pub const META_ORDER_ID: &str = "order_id";
pub const META_ORDER_NUMBER: &str = "order_number";
pub const META_ASSOCIATION_ID: &str = "association_id";
pub const META_USER_ID: &str = "user_id";

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub association_id: Uuid,
    pub user_id: Uuid,
    /// Gateway price reference of the plan
    pub price_ref: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRef {
    pub session_id: String,
    pub url: String,
}

/// Lifecycle of a hosted checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Complete,
    Expired,
    Unknown,
}

/// Snapshot returned by the session-status endpoint
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub session_id: String,
    pub paid: bool,
    pub state: SessionState,
    pub payment_status: String,
    /// Raw back-reference found on the session, if any
    pub order_ref: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
}

impl SessionStatus {
    pub fn order_id(&self) -> Option<Uuid> {
        self.order_ref
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Gateway fields worth keeping on the order
    pub fn echo_fields(&self) -> MetadataMap {
        MetadataMap::new()
            .with(metadata::SESSION_ID, self.session_id.clone())
            .with("payment_status", self.payment_status.clone())
            .with_opt(metadata::PAYMENT_INTENT_ID, self.payment_intent_id.clone())
            .with_opt(metadata::SUBSCRIPTION_ID, self.subscription_id.clone())
            .with_opt(metadata::CUSTOMER_ID, self.customer_id.clone())
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a hosted checkout session with the order id as back-reference
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef>;

    /// Query the authoritative status of a session
    async fn get_session_status(&self, session_id: &str) -> BillingResult<SessionStatus>;
}
