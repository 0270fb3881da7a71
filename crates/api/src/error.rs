//! API error types and their HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use billsync_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    /// Status code and client-visible message. Provider and database
    /// failures keep their detail in the logs, not the response body.
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Billing(err) => match err {
                BillingError::SignatureInvalid | BillingError::MalformedPayload(_) => {
                    (StatusCode::BAD_REQUEST, err.to_string())
                }
                BillingError::OrganizationNotFound(_)
                | BillingError::CustomerNotFound(_)
                | BillingError::SubscriptionNotFound(_) => {
                    (StatusCode::NOT_FOUND, err.to_string())
                }
                BillingError::ProviderApi(_) => (
                    StatusCode::BAD_GATEWAY,
                    "billing provider request failed".to_string(),
                ),
                BillingError::Database(_) | BillingError::Email(_) | BillingError::Config(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}
