//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use membra_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("Webhook processing failed: {0}")]
    WebhookProcessing(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::WebhookProcessing(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Billing(e) => match e {
                BillingError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                BillingError::InvalidInput(_) | BillingError::WebhookSignatureInvalid => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::PlanNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::AlreadyActiveMember { .. } => StatusCode::CONFLICT,
                BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
                BillingError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BillingError::Notification(_)
                | BillingError::Database(_)
                | BillingError::Config(_)
                | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::WebhookProcessing(_) => "WEBHOOK_PROCESSING_FAILED",
            ApiError::Billing(e) => e.code(),
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
            match status {
                StatusCode::BAD_GATEWAY => "Payment provider error".to_string(),
                StatusCode::GATEWAY_TIMEOUT => "Payment provider timed out".to_string(),
                StatusCode::SERVICE_UNAVAILABLE => self.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": self.code()
        }));

        (status, body).into_response()
    }
}
