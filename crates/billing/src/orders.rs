//! Order creation and lookup

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::collaborators::AccountDirectory;
use crate::correlation::{CorrelationQuery, CorrelationResolver};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutRequest, PaymentGateway};
use crate::metadata::{self, MetadataMap};
use crate::models::{generate_order_number, NewPurchaseOrder, PurchaseOrder};
use crate::store::{LeadStore, OrderStore};

/// Redirect targets used when the caller supplies none
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutConfig {
    pub fn from_env() -> Self {
        let app_url =
            std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let defaults = Self::for_app_url(&app_url);

        Self {
            success_url: std::env::var("CHECKOUT_SUCCESS_URL").unwrap_or(defaults.success_url),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL").unwrap_or(defaults.cancel_url),
        }
    }

    pub fn for_app_url(app_url: &str) -> Self {
        let base = app_url.trim_end_matches('/');
        Self {
            success_url: format!(
                "{}/membership/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
                base
            ),
            cancel_url: format!("{}/membership/checkout/cancel", base),
        }
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self::for_app_url("http://localhost:3000")
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub pricing_plan_id: Uuid,
    /// Buyer email used for intent correlation; looked up when absent
    pub user_email: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedOrder {
    pub order: PurchaseOrder,
    pub checkout_url: String,
    /// Purchase intent linked to the order, if one correlated
    pub intent_id: Option<Uuid>,
}

pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    leads: Arc<dyn LeadStore>,
    gateway: Arc<dyn PaymentGateway>,
    directory: Arc<dyn AccountDirectory>,
    resolver: CorrelationResolver,
    config: CheckoutConfig,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        leads: Arc<dyn LeadStore>,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn AccountDirectory>,
        config: CheckoutConfig,
    ) -> Self {
        let resolver = CorrelationResolver::new(leads.clone());
        Self {
            orders,
            leads,
            gateway,
            directory,
            resolver,
            config,
        }
    }

    /// Open a PENDING order and a hosted checkout session for it.
    ///
    /// If the gateway call fails the order stays PENDING without a session
    /// reference and the reconciler eventually fails it as an orphan.
    pub async fn create_order(&self, request: CreateOrderRequest) -> BillingResult<CreatedOrder> {
        let plan = self
            .orders
            .find_plan(request.pricing_plan_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or(BillingError::PlanNotFound(request.pricing_plan_id))?;

        if let Some(member) = self
            .orders
            .find_member(plan.association_id, request.user_id)
            .await?
        {
            if member.is_active() {
                return Err(BillingError::AlreadyActiveMember {
                    association_id: plan.association_id,
                });
            }
        }

        let user_email = match request.user_email.clone() {
            Some(email) => Some(email),
            None => self.lookup_email(request.user_id).await,
        };

        let now = OffsetDateTime::now_utc();
        let order_id = Uuid::new_v4();
        let new_order = NewPurchaseOrder {
            id: order_id,
            order_number: generate_order_number(order_id, now),
            association_id: plan.association_id,
            user_id: request.user_id,
            pricing_plan_id: plan.id,
            amount_cents: plan.amount_cents,
            currency: plan.currency.clone(),
        };
        let order = self.orders.insert_order(&new_order, now).await?;

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            user_id = %order.user_id,
            pricing_plan_id = %plan.id,
            amount = %order.display_amount(),
            "Purchase order created"
        );

        let intent_id = self.correlate(&order, user_email.clone(), now).await;

        let checkout_request = CheckoutRequest {
            order_id: order.id,
            order_number: order.order_number.clone(),
            association_id: order.association_id,
            user_id: order.user_id,
            price_ref: plan.stripe_price_id.clone(),
            customer_email: user_email,
            success_url: request
                .success_url
                .unwrap_or_else(|| self.config.success_url.clone()),
            cancel_url: request
                .cancel_url
                .unwrap_or_else(|| self.config.cancel_url.clone()),
        };

        let session = match self.gateway.create_checkout_session(&checkout_request).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(
                    order_id = %order.id,
                    error = %e,
                    "Checkout session creation failed, order left PENDING without session"
                );
                return Err(e);
            }
        };

        let session_ref = MetadataMap::new()
            .with(metadata::SESSION_ID, session.session_id.clone())
            .with(metadata::CHECKOUT_URL, session.url.clone());
        let order = self.orders.merge_session_ref(order.id, &session_ref).await?;

        Ok(CreatedOrder {
            order,
            checkout_url: session.url,
            intent_id,
        })
    }

    pub async fn get_order(&self, order_id: Uuid) -> BillingResult<PurchaseOrder> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))
    }

    pub async fn get_order_by_session(&self, session_id: &str) -> BillingResult<PurchaseOrder> {
        self.orders
            .find_order_by_session(session_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(session_id.to_string()))
    }

    async fn lookup_email(&self, user_id: Uuid) -> Option<String> {
        match self.directory.find_contact(user_id).await {
            Ok(contact) => contact.map(|c| c.email),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Contact lookup failed");
                None
            }
        }
    }

    /// Link the best-matching intent to the order. Never fails creation.
    async fn correlate(
        &self,
        order: &PurchaseOrder,
        user_email: Option<String>,
        now: OffsetDateTime,
    ) -> Option<Uuid> {
        let query = CorrelationQuery {
            user_email,
            user_id: order.user_id,
            pricing_plan_id: order.pricing_plan_id,
            association_id: order.association_id,
        };

        let found = match self.resolver.resolve(&query, now).await {
            Ok(found) => found?,
            Err(e) => {
                tracing::warn!(order_id = %order.id, error = %e, "Intent correlation failed");
                return None;
            }
        };

        if let Err(e) = self
            .leads
            .link_intent_to_order(found.intent.id, order.id)
            .await
        {
            tracing::warn!(
                order_id = %order.id,
                intent_id = %found.intent.id,
                error = %e,
                "Failed to link purchase intent to order"
            );
            return None;
        }

        tracing::info!(
            order_id = %order.id,
            intent_id = %found.intent.id,
            tier = ?found.tier,
            "Purchase intent linked to order"
        );
        Some(found.intent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_redirects_carry_session_placeholder() {
        let config = CheckoutConfig::for_app_url("https://members.example.org/");
        assert_eq!(
            config.success_url,
            "https://members.example.org/membership/checkout/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            config.cancel_url,
            "https://members.example.org/membership/checkout/cancel"
        );
    }
}
