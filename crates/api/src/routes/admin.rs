//! Admin routes: manual reconciliation and invariant checks

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use membra_billing::{InvariantCheckSummary, OrderCheck, ProcessOutcome, PurchaseOrder};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub result: &'static str,
    /// Gateway session state when the order is still pending
    pub session_state: Option<String>,
    pub order: PurchaseOrder,
}

/// POST /orders/{id}/sync
pub async fn sync_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    tracing::info!(
        order_id = %order_id,
        admin_user_id = %auth_user.user_id,
        "Manual order reconciliation requested"
    );

    let check = state.billing.reconciler.sync_order(order_id).await?;

    let (result, session_state, order) = match check {
        OrderCheck::Settled(outcome) => (outcome_label(&outcome), None, outcome.into_order()),
        OrderCheck::Orphaned(outcome) => ("orphaned", None, outcome.into_order()),
        OrderCheck::StillPending { state: session } => (
            "still_pending",
            session.map(|s| format!("{:?}", s).to_lowercase()),
            state.billing.orders.get_order(order_id).await?,
        ),
    };

    Ok(Json(SyncResponse {
        result,
        session_state,
        order,
    }))
}

fn outcome_label(outcome: &ProcessOutcome) -> &'static str {
    match outcome {
        ProcessOutcome::Activated { .. } => "activated",
        ProcessOutcome::Failed { .. } => "failed",
        ProcessOutcome::AlreadySettled { .. } => "already_settled",
    }
}

/// GET /admin/invariants
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state
        .billing
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Invariant checker not configured".into()))?;

    let summary = checker.run_all_checks().await?;
    Ok(Json(summary))
}
