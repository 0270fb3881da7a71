//! Billing error types

use uuid::Uuid;

/// Errors produced by the billing crate
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Webhook signature did not verify against the shared secret
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Signature verified but the payload could not be parsed
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("organization not found: {0}")]
    OrganizationNotFound(Uuid),

    /// Organization has no billing customer yet (portal/seat flows)
    #[error("no billing customer for organization {0}")]
    CustomerNotFound(Uuid),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Upstream billing provider API failure
    #[error("billing provider error: {0}")]
    ProviderApi(String),

    #[error("database error: {0}")]
    Database(String),

    /// Email delivery failure. Never propagated out of the notification
    /// task; callers log and continue.
    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("billing configuration error: {0}")]
    Config(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProviderApi(err.to_string())
    }
}
