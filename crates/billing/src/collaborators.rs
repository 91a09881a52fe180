//! Calls the reconciliation core makes into neighbouring services
//!
//! Badges, profiles and contacts are owned elsewhere; only the narrow shape
//! used after a settlement is described here.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Profile, UserContact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeOutcome {
    Created,
    AlreadyPresent,
}

#[async_trait]
pub trait BadgeService: Send + Sync {
    /// Insert the association badge on a profile unless it already exists
    async fn ensure_badge(&self, profile_id: Uuid, association_id: Uuid)
        -> BillingResult<BadgeOutcome>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_default_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>>;

    async fn find_contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>>;

    async fn find_association_name(&self, association_id: Uuid) -> BillingResult<Option<String>>;
}

/// Everything the confirmation email needs to render
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseSummary {
    pub order_number: String,
    pub association_name: String,
    pub recipient_name: Option<String>,
    pub amount_display: String,
    #[serde(with = "time::serde::rfc3339")]
    pub membership_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub membership_end: OffsetDateTime,
}

#[async_trait]
pub trait PurchaseNotifier: Send + Sync {
    async fn send_purchase_confirmation(
        &self,
        email: &str,
        summary: &PurchaseSummary,
    ) -> BillingResult<()>;
}
