//! Stripe client wrapper
//!
//! One client is built at start-up and shared by reference. Every call runs
//! under a timeout and a small retry budget for transient failures (429, 5xx,
//! timeouts, connection errors).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, RequestStrategy, StripeError,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CheckoutRequest, CheckoutSessionRef, PaymentGateway, SessionState, SessionStatus,
    META_ASSOCIATION_ID, META_ORDER_ID, META_ORDER_NUMBER, META_USER_ID,
};

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Per-attempt timeout for API calls
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let timeout_secs = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let max_retries = std::env::var("STRIPE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            secret_key,
            webhook_secret,
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            retry_base_delay_ms: 200,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish_non_exhaustive()
    }
}

/// Failure of a single attempt, before retry classification
#[derive(Debug)]
enum AttemptError {
    Stripe(StripeError),
    TimedOut,
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::TimedOut => true,
            AttemptError::Stripe(StripeError::Stripe(request_error)) => {
                let status = request_error.http_status;
                status == 429 || (500..600).contains(&status)
            }
            AttemptError::Stripe(StripeError::Timeout) => true,
            AttemptError::Stripe(StripeError::ClientError(_)) => true,
            AttemptError::Stripe(_) => false,
        }
    }

    fn into_billing_error(self, operation: &str) -> BillingError {
        match self {
            AttemptError::TimedOut => {
                BillingError::GatewayTimeout(format!("{} timed out", operation))
            }
            AttemptError::Stripe(e) => {
                tracing::error!(operation = operation, error = %e, "Stripe API call failed");
                BillingError::from(e)
            }
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Stripe(e) => write!(f, "{}", e),
            AttemptError::TimedOut => write!(f, "request timed out"),
        }
    }
}

/// Shared Stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(&config.secret_key);
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.config.retry_base_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries)
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        let timeout = self.config.timeout;

        RetryIf::spawn(
            self.retry_strategy(),
            || {
                let attempt = call();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(AttemptError::Stripe(e)),
                        Err(_) => Err(AttemptError::TimedOut),
                    }
                }
            },
            |e: &AttemptError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(
                        operation = operation,
                        error = %e,
                        "Retrying Stripe API call after transient error"
                    );
                }
                retry
            },
        )
        .await
        .map_err(|e| e.into_billing_error(operation))
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef> {
        let order_id = request.order_id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert(META_ORDER_ID.to_string(), order_id.clone());
        metadata.insert(META_ORDER_NUMBER.to_string(), request.order_number.clone());
        metadata.insert(
            META_ASSOCIATION_ID.to_string(),
            request.association_id.to_string(),
        );
        metadata.insert(META_USER_ID.to_string(), request.user_id.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&order_id);
        params.customer_email = request.customer_email.as_deref();
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_ref.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        });

        // Same key for every retry so Stripe never opens two sessions per order
        let client = self
            .inner
            .clone()
            .with_strategy(RequestStrategy::Idempotent(format!("checkout_{}", order_id)));

        let session = self
            .call_with_retry("create_checkout_session", || {
                CheckoutSession::create(&client, params.clone())
            })
            .await?;

        let url = session.url.clone().ok_or_else(|| {
            BillingError::Gateway("Checkout session returned without a URL".to_string())
        })?;

        tracing::info!(
            order_id = %request.order_id,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(CheckoutSessionRef {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn get_session_status(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let id = session_id.parse::<CheckoutSessionId>().map_err(|e| {
            BillingError::InvalidInput(format!("Invalid checkout session id: {}", e))
        })?;

        let session = self
            .call_with_retry("get_session_status", || {
                CheckoutSession::retrieve(&self.inner, &id, &[])
            })
            .await?;

        Ok(session_status_from(&session))
    }
}

/// Map a Stripe checkout session onto the gateway-neutral status
pub(crate) fn session_status_from(session: &CheckoutSession) -> SessionStatus {
    let paid = matches!(
        session.payment_status,
        CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired
    );

    let state = match session.status {
        Some(CheckoutSessionStatus::Open) => SessionState::Open,
        Some(CheckoutSessionStatus::Complete) => SessionState::Complete,
        Some(CheckoutSessionStatus::Expired) => SessionState::Expired,
        None => SessionState::Unknown,
    };

    let order_ref = session
        .metadata
        .as_ref()
        .and_then(|m| m.get(META_ORDER_ID).cloned())
        .or_else(|| session.client_reference_id.clone());

    SessionStatus {
        session_id: session.id.to_string(),
        paid,
        state,
        payment_status: session.payment_status.as_str().to_string(),
        order_ref,
        amount_total: session.amount_total,
        currency: session.currency.map(|c| c.to_string()),
        payment_intent_id: session.payment_intent.as_ref().map(|p| p.id().to_string()),
        subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay_ms: 200,
        }
    }

    #[test]
    fn test_timeouts_and_server_errors_are_transient() {
        assert!(AttemptError::TimedOut.is_transient());
        assert!(AttemptError::Stripe(StripeError::Timeout).is_transient());
        assert!(AttemptError::Stripe(StripeError::ClientError("reset".into())).is_transient());
        assert!(!AttemptError::Stripe(StripeError::UnsupportedVersion).is_transient());
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let client = StripeClient::new(config());
        let delays: Vec<Duration> = client.retry_strategy().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let rendered = format!("{:?}", StripeClient::new(config()));
        assert!(!rendered.contains("sk_test_123"));
        assert!(!rendered.contains("whsec_test"));
    }
}
