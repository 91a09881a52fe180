//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Pricing plan not found or inactive: {0}")]
    PlanNotFound(Uuid),

    #[error("User already holds an active membership in association {association_id}")]
    AlreadyActiveMember { association_id: Uuid },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment gateway timed out: {0}")]
    GatewayTimeout(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code surfaced to API callers
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            BillingError::AlreadyActiveMember { .. } => "ALREADY_ACTIVE_MEMBER",
            BillingError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            BillingError::InvalidInput(_) => "INVALID_INPUT",
            BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            BillingError::Gateway(_) => "GATEWAY_ERROR",
            BillingError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            BillingError::Notification(_) => "NOTIFICATION_FAILED",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Rejected before any order was written
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BillingError::PlanNotFound(_)
                | BillingError::AlreadyActiveMember { .. }
                | BillingError::InvalidInput(_)
        )
    }

    /// Worth retrying on a later sweep or gateway redelivery
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_) | BillingError::GatewayTimeout(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match e {
            stripe::StripeError::Timeout => BillingError::GatewayTimeout(e.to_string()),
            other => BillingError::Gateway(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_errors_have_stable_codes() {
        let plan = BillingError::PlanNotFound(Uuid::nil());
        assert_eq!(plan.code(), "PLAN_NOT_FOUND");
        assert!(plan.is_precondition());

        let member = BillingError::AlreadyActiveMember {
            association_id: Uuid::nil(),
        };
        assert_eq!(member.code(), "ALREADY_ACTIVE_MEMBER");
        assert!(member.is_precondition());
    }

    #[test]
    fn test_gateway_errors_are_not_preconditions() {
        assert!(!BillingError::Gateway("boom".into()).is_precondition());
        assert!(!BillingError::GatewayTimeout("slow".into()).is_precondition());
        assert!(BillingError::GatewayTimeout("slow".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
    }

    #[test]
    fn test_stripe_timeout_maps_to_gateway_timeout() {
        let err: BillingError = stripe::StripeError::Timeout.into();
        assert!(matches!(err, BillingError::GatewayTimeout(_)));
    }
}
