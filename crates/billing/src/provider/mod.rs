//! Billing provider adapters
//!
//! One polymorphic seam over the payment providers: each adapter verifies
//! webhook signatures for its own scheme, normalizes provider payloads into
//! the event model the reconciler routes on, and wraps the provider's
//! customer/checkout/portal operations.

pub mod creem;
pub mod stripe;

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

pub use creem::CreemProvider;
pub use stripe::StripeProvider;

/// Metadata key correlating a provider subscription with an organization.
/// Set at checkout-session creation; the sole linkage between systems.
pub const ORGANIZATION_METADATA_KEY: &str = "organization_id";

/// Normalized event kinds the reconciler routes on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentFailed,
    /// Anything else the provider sends; ignored by the router.
    Other(String),
}

/// A verified, normalized webhook event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Checkout(CheckoutPayload),
    Subscription(ProviderSubscription),
    Invoice(InvoicePayload),
    None,
}

/// Checkout-session payloads are intentionally minimal; they carry only a
/// reference to the subscription they created.
#[derive(Debug, Clone)]
pub struct CheckoutPayload {
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvoicePayload {
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
}

/// Provider subscription state, normalized across adapters
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    /// Raw provider status; mapped via `status::map_provider_status`.
    pub status: String,
    pub seats: i32,
    /// Human-readable plan label when the provider exposes one.
    pub plan: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// The organization this subscription belongs to, when resolvable.
    pub fn organization_id(&self) -> Option<Uuid> {
        self.metadata
            .get(ORGANIZATION_METADATA_KEY)
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Parameters for creating a provider customer
#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub organization_id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

/// Parameters for creating a checkout session
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub customer_id: String,
    pub organization_id: Uuid,
    pub price_id: String,
    pub quantity: u64,
    pub success_url: String,
    pub cancel_url: String,
}

/// A payment provider behind one uniform interface.
///
/// `verify_event` is synchronous and must operate on the exact raw request
/// bytes; everything else talks to the provider's API.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// HTTP header carrying this provider's webhook signature.
    fn signature_header(&self) -> &'static str;

    /// Verify a webhook payload and normalize it. Fails closed.
    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent>;

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<ProviderSubscription>;

    async fn retrieve_customer(&self, id: &str) -> BillingResult<ProviderCustomer>;

    /// Create a provider customer, returning its ID.
    async fn create_customer(&self, new: &NewCustomer) -> BillingResult<String>;

    /// Create a checkout session, returning the hosted URL.
    async fn create_checkout_session(&self, params: &CheckoutParams) -> BillingResult<String>;

    /// Create a billing portal session, returning the hosted URL.
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;

    /// Update the seat quantity on the subscription's primary item.
    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        quantity: u64,
    ) -> BillingResult<()>;
}

impl std::fmt::Debug for dyn BillingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingProvider")
            .field("name", &self.name())
            .finish()
    }
}

/// Which adapter a deployment runs. One provider per deployment; both are
/// compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Stripe,
    Creem,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::Creem => "creem",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::error::BillingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderKind::Stripe),
            "creem" => Ok(ProviderKind::Creem),
            other => Err(crate::error::BillingError::Config(format!(
                "unknown billing provider: {other}"
            ))),
        }
    }
}
