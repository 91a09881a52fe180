//! Purchase order routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use membra_billing::{CreateOrderRequest, CreatedOrder, PurchaseOrder};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateOrderBody {
    pub pricing_plan_id: Uuid,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

/// POST /orders
pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CreateOrderBody>,
) -> ApiResult<(StatusCode, Json<CreatedOrder>)> {
    let (user_id, pricing_plan_id) = (auth_user.user_id, body.pricing_plan_id);
    let created = state
        .billing
        .orders
        .create_order(CreateOrderRequest {
            user_id,
            pricing_plan_id,
            user_email: auth_user.email,
            success_url: body.success_url,
            cancel_url: body.cancel_url,
        })
        .await
        .inspect_err(|e| {
            if e.is_precondition() {
                tracing::info!(
                    user_id = %user_id,
                    pricing_plan_id = %pricing_plan_id,
                    code = e.code(),
                    "Order creation rejected"
                );
            }
        })?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<PurchaseOrder>> {
    let order = state.billing.orders.get_order(order_id).await?;
    visible_to(order, &auth_user).map(Json)
}

/// GET /orders/by-session/{session_id}
pub async fn get_order_by_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<PurchaseOrder>> {
    let order = state.billing.orders.get_order_by_session(&session_id).await?;
    visible_to(order, &auth_user).map(Json)
}

/// Someone else's order reads as not found
fn visible_to(order: PurchaseOrder, auth_user: &AuthUser) -> ApiResult<PurchaseOrder> {
    if auth_user.can_view(order.user_id) {
        Ok(order)
    } else {
        tracing::warn!(
            order_id = %order.id,
            user_id = %auth_user.user_id,
            "Order lookup by non-owner"
        );
        Err(ApiError::NotFound)
    }
}
