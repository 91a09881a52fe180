//! Domain records touched by the reconciliation engine

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;
use crate::metadata::MetadataMap;

/// Lead `source` value written by the purchase-intent capture flow
pub const LEAD_SOURCE_PURCHASE_INTENT: &str = "PURCHASE_INTENT";

/// Default role for members created from a payment
pub const DEFAULT_MEMBER_ROLE: &str = "MEMBER";

// =============================================================================
// Statuses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Failed => "FAILED",
        }
    }

    /// PAID and FAILED accept no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl FromStr for OrderStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "Unknown order status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
    Expired,
    Terminated,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Pending => "PENDING",
            MemberStatus::Active => "ACTIVE",
            MemberStatus::Suspended => "SUSPENDED",
            MemberStatus::Cancelled => "CANCELLED",
            MemberStatus::Expired => "EXPIRED",
            MemberStatus::Terminated => "TERMINATED",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MemberStatus::Pending),
            "ACTIVE" => Ok(MemberStatus::Active),
            "SUSPENDED" => Ok(MemberStatus::Suspended),
            "CANCELLED" => Ok(MemberStatus::Cancelled),
            "EXPIRED" => Ok(MemberStatus::Expired),
            "TERMINATED" => Ok(MemberStatus::Terminated),
            other => Err(BillingError::Internal(format!(
                "Unknown member status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Pending,
    Converted,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "PENDING",
            IntentStatus::Converted => "CONVERTED",
        }
    }
}

impl FromStr for IntentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IntentStatus::Pending),
            "CONVERTED" => Ok(IntentStatus::Converted),
            other => Err(BillingError::Internal(format!(
                "Unknown intent status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "NEW",
            LeadStatus::Contacted => "CONTACTED",
            LeadStatus::Qualified => "QUALIFIED",
            LeadStatus::Converted => "CONVERTED",
            LeadStatus::Lost => "LOST",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Converted | LeadStatus::Lost)
    }
}

impl FromStr for LeadStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(LeadStatus::New),
            "CONTACTED" => Ok(LeadStatus::Contacted),
            "QUALIFIED" => Ok(LeadStatus::Qualified),
            "CONVERTED" => Ok(LeadStatus::Converted),
            "LOST" => Ok(LeadStatus::Lost),
            other => Err(BillingError::Internal(format!(
                "Unknown lead status '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Association-scoped subscription tier (read-only here)
#[derive(Debug, Clone, Serialize)]
pub struct PricingPlan {
    pub id: Uuid,
    pub association_id: Uuid,
    pub name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub stripe_price_id: String,
    pub membership_tier: String,
    pub is_active: bool,
}

/// One attempted purchase of a pricing plan
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOrder {
    pub id: Uuid,
    pub order_number: String,
    pub association_id: Uuid,
    pub user_id: Uuid,
    pub pricing_plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub session_ref: MetadataMap,
    #[serde(with = "time::serde::rfc3339::option")]
    pub membership_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub membership_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PurchaseOrder {
    pub fn session_id(&self) -> Option<&str> {
        self.session_ref.session_id()
    }

    /// Amount formatted for humans, e.g. `HKD 100.00`
    pub fn display_amount(&self) -> String {
        format_amount(self.amount_cents, &self.currency)
    }
}

/// Insert shape for a new PENDING order
#[derive(Debug, Clone)]
pub struct NewPurchaseOrder {
    pub id: Uuid,
    pub order_number: String,
    pub association_id: Uuid,
    pub user_id: Uuid,
    pub pricing_plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
}

/// Pre-purchase lead captured before checkout
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseIntentData {
    pub id: Uuid,
    pub email: String,
    pub user_id: Option<Uuid>,
    pub association_id: Option<Uuid>,
    pub pricing_plan_id: Option<Uuid>,
    pub status: IntentStatus,
    pub purchase_order_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub converted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PurchaseIntentData {
    /// PENDING and not past its expiry
    pub fn is_open(&self, now: OffsetDateTime) -> bool {
        self.status == IntentStatus::Pending && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Legacy lead record, converted alongside [`PurchaseIntentData`]
#[derive(Debug, Clone, Serialize)]
pub struct AssociationLead {
    pub id: Uuid,
    pub association_id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub source: String,
    pub status: LeadStatus,
    pub purchase_order_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub converted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociationMember {
    pub id: Uuid,
    pub association_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub tier: String,
    pub status: MemberStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub renewal_date: Option<OffsetDateTime>,
    pub payment_metadata: MetadataMap,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AssociationMember {
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active && self.deleted_at.is_none()
    }
}

/// Append-only audit row for a member status transition
#[derive(Debug, Clone, Serialize)]
pub struct MembershipHistory {
    pub id: Uuid,
    pub member_id: Uuid,
    pub previous_status: MemberStatus,
    pub new_status: MemberStatus,
    pub changed_by: Uuid,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContact {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Length of a membership bought on `tier`.
///
/// Every tier is sold as a yearly membership today.
pub fn membership_period_end(_tier: &str, start: OffsetDateTime) -> OffsetDateTime {
    start
        .replace_year(start.year() + 1)
        .unwrap_or_else(|_| start + Duration::days(365))
}

/// `HKD 100.00` from minor units
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!(
        "{} {}{}.{:02}",
        currency.to_uppercase(),
        sign,
        abs / 100,
        abs % 100
    )
}

/// Externally visible order number: `ORD-YYYYMMDD-XXXXXXXXXX`
pub fn generate_order_number(id: Uuid, now: OffsetDateTime) -> String {
    let suffix: String = id
        .simple()
        .to_string()
        .chars()
        .take(10)
        .collect::<String>()
        .to_uppercase();
    format!(
        "ORD-{:04}{:02}{:02}-{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        suffix
    )
}
