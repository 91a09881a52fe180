//! Router tests
//!
//! Drive the full router with `tower::ServiceExt::oneshot` against an
//! in-memory store, a fake gateway and signed test tokens.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use membra_billing::{
    BillingConfig, BillingDeps, BillingResult, BillingService, CheckoutRequest,
    CheckoutSessionRef, MemoryStore, PaymentGateway, PricingPlan, PurchaseNotifier,
    PurchaseSummary, SessionState, SessionStatus,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::auth::{Claims, JwtManager};
use crate::state::AppState;

const SECRET: &str = "router-test-secret-at-least-32-characters";

#[derive(Default)]
struct FakeGateway {
    sessions: Mutex<HashMap<String, SessionStatus>>,
}

impl FakeGateway {
    fn pay(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).unwrap();
        session.paid = true;
        session.state = SessionState::Complete;
        session.payment_status = "paid".into();
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionRef> {
        let session_id = format!("cs_test_{}", request.order_id.simple());
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionStatus {
                session_id: session_id.clone(),
                paid: false,
                state: SessionState::Open,
                payment_status: "unpaid".into(),
                order_ref: Some(request.order_id.to_string()),
                amount_total: Some(10_000),
                currency: Some("hkd".into()),
                payment_intent_id: None,
                subscription_id: None,
                customer_id: None,
            },
        );
        Ok(CheckoutSessionRef {
            url: format!("https://checkout.stripe.test/{}", session_id),
            session_id,
        })
    }

    async fn get_session_status(&self, session_id: &str) -> BillingResult<SessionStatus> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| membra_billing::BillingError::Gateway("no such session".into()))
    }
}

struct SilentNotifier;

#[async_trait]
impl PurchaseNotifier for SilentNotifier {
    async fn send_purchase_confirmation(&self, _: &str, _: &PurchaseSummary) -> BillingResult<()> {
        Ok(())
    }
}

struct TestApp {
    router: Router,
    gateway: Arc<FakeGateway>,
    plan: PricingPlan,
}

async fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakeGateway::default());

    let plan = PricingPlan {
        id: Uuid::new_v4(),
        association_id: Uuid::new_v4(),
        name: "Annual membership".into(),
        amount_cents: 10_000,
        currency: "HKD".into(),
        stripe_price_id: "price_annual_hkd".into(),
        membership_tier: "standard".into(),
        is_active: true,
    };
    store.insert_plan(plan.clone()).await;

    let billing = BillingService::new(
        BillingDeps::in_memory(store, gateway.clone(), Arc::new(SilentNotifier)),
        BillingConfig {
            webhook_secret: "whsec_router_test".into(),
            ..Default::default()
        },
    );

    let state = AppState {
        billing: Arc::new(billing),
        jwt_manager: JwtManager::new(SECRET),
    };

    TestApp {
        router: create_router(state),
        gateway,
        plan,
    }
}

fn token(user_id: Uuid, role: &str) -> String {
    let claims = Claims {
        sub: user_id,
        role: role.into(),
        email: Some(format!("{}@example.com", user_id.simple())),
        exp: OffsetDateTime::now_utc().unix_timestamp() + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn create_order_request(token: Option<&str>, plan_id: Uuid) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/orders")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
        .body(Body::from(json!({ "pricing_plan_id": plan_id }).to_string()))
        .unwrap()
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_order_requires_auth() {
    let app = test_app().await;

    let (status, body) = send(&app.router, create_order_request(None, app.plan.id)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send(
        &app.router,
        create_order_request(Some("not-a-jwt"), app.plan.id),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_and_read_order() {
    let app = test_app().await;
    let user_id = Uuid::new_v4();
    let token = token(user_id, "member");

    let (status, body) = send(&app.router, create_order_request(Some(&token), app.plan.id)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["order"]["status"], "PENDING");
    assert_eq!(body["order"]["amount_cents"], 10_000);
    assert!(body["checkout_url"]
        .as_str()
        .unwrap()
        .starts_with("https://checkout.stripe.test/"));

    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let (status, body) = send(&app.router, get(&format!("/orders/{}", order_id), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], order_id.as_str());

    let session_id = body["session_ref"]["session_id"].as_str().unwrap().to_string();
    let (status, body) = send(
        &app.router,
        get(&format!("/orders/by-session/{}", session_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], order_id.as_str());
}

#[tokio::test]
async fn test_unknown_plan_is_unprocessable() {
    let app = test_app().await;
    let token = token(Uuid::new_v4(), "member");

    let request = create_order_request(Some(&token), Uuid::new_v4());
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "PLAN_NOT_FOUND");
}

#[tokio::test]
async fn test_orders_are_private_to_owner_and_admin() {
    let app = test_app().await;
    let owner = token(Uuid::new_v4(), "member");
    let (_, body) = send(&app.router, create_order_request(Some(&owner), app.plan.id)).await;
    let uri = format!("/orders/{}", body["order"]["id"].as_str().unwrap());

    let stranger = token(Uuid::new_v4(), "member");
    let (status, _) = send(&app.router, get(&uri, &stranger)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let admin = token(Uuid::new_v4(), "admin");
    let (status, _) = send(&app.router, get(&uri, &admin)).await;
    assert_eq!(status, StatusCode::OK);

    let missing = format!("/orders/{}", Uuid::new_v4());
    let (status, body) = send(&app.router, get(&missing, &admin)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_webhook_rejects_missing_and_bad_signatures() {
    let app = test_app().await;

    let missing = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from(r#"{"id":"evt_1"}"#))
        .unwrap();
    let (status, body) = send(&app.router, missing).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "WEBHOOK_SIGNATURE_INVALID");

    let forged = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Stripe-Signature", "t=1700000000,v1=deadbeef")
        .body(Body::from(r#"{"id":"evt_1"}"#))
        .unwrap();
    let (status, body) = send(&app.router, forged).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "WEBHOOK_SIGNATURE_INVALID");
}

#[tokio::test]
async fn test_manual_sync_is_admin_only() {
    let app = test_app().await;
    let member = token(Uuid::new_v4(), "member");
    let (_, body) = send(&app.router, create_order_request(Some(&member), app.plan.id)).await;
    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let session_id = body["order"]["session_ref"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    let uri = format!("/orders/{}/sync", order_id);

    let (status, body) = send(&app.router, post(&uri, &member)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let admin = token(Uuid::new_v4(), "admin");
    let (status, body) = send(&app.router, post(&uri, &admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "still_pending");
    assert_eq!(body["session_state"], "open");

    app.gateway.pay(&session_id);
    let (status, body) = send(&app.router, post(&uri, &admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "activated");
    assert_eq!(body["order"]["status"], "PAID");

    let (_, body) = send(&app.router, post(&uri, &admin)).await;
    assert_eq!(body["result"], "already_settled");
}

#[tokio::test]
async fn test_invariants_unavailable_without_database() {
    let app = test_app().await;
    let admin = token(Uuid::new_v4(), "admin");

    let (status, body) = send(&app.router, get("/admin/invariants", &admin)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
}
