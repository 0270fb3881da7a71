// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billsync billing module
//!
//! Synchronizes payment-provider state onto organization records from
//! signed webhook events.
//!
//! ## Features
//!
//! - **Webhook reconciliation**: verify, route and idempotently apply
//!   subscription events
//! - **Status mapping**: provider statuses collapse onto one internal enum,
//!   unknown values land on `inactive`
//! - **Checkout & portal**: provider-hosted flows carrying the organization
//!   linkage in metadata
//! - **Seat management**: quantity updates pushed to the provider before
//!   they are persisted
//! - **Email notifications**: fire-and-forget sends for created, updated,
//!   canceled and payment-failed
//! - **Two providers**: Stripe and Creem behind one adapter trait

pub mod checkout;
pub mod email;
pub mod error;
pub mod notify;
pub mod provider;
pub mod reconciler;
pub mod status;
pub mod store;

// Checkout
pub use checkout::CheckoutService;

// Email
pub use email::{EmailClient, EmailConfig, EmailMessage, EmailSender};

// Error
pub use error::{BillingError, BillingResult};

// Notifications
pub use notify::{NotificationContext, NotificationKind, Notifier};

// Provider adapters
pub use provider::{
    BillingProvider, CheckoutParams, CheckoutPayload, CreemProvider, EventKind, EventPayload,
    InvoicePayload, NewCustomer, ProviderCustomer, ProviderKind, ProviderSubscription,
    StripeProvider, WebhookEvent, ORGANIZATION_METADATA_KEY,
};

// Reconciler
pub use reconciler::{Disposition, Reconciler};

// Status
pub use status::{map_provider_status, SubscriptionStatus};

// Store
pub use store::{BillingUpdate, Organization, OrganizationStore, PgOrganizationStore};

use std::sync::Arc;

use sqlx::PgPool;

/// Environment-driven billing settings
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub provider: ProviderKind,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub creem_api_key: Option<String>,
    pub creem_webhook_secret: Option<String>,
    pub creem_api_base: Option<String>,
    pub app_url: String,
    pub email: EmailConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let provider: ProviderKind = std::env::var("BILLING_PROVIDER")
            .unwrap_or_else(|_| "stripe".to_string())
            .parse()?;

        Ok(Self {
            provider,
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok(),
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            creem_api_key: std::env::var("CREEM_API_KEY").ok(),
            creem_webhook_secret: std::env::var("CREEM_WEBHOOK_SECRET").ok(),
            creem_api_base: std::env::var("CREEM_API_BASE").ok(),
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            email: EmailConfig::new(
                std::env::var("EMAIL_API_KEY").ok(),
                std::env::var("EMAIL_FROM").unwrap_or_else(|_| "noreply@localhost".to_string()),
            ),
        })
    }
}

/// Main billing service combining the webhook reconciler and the
/// checkout/portal/seat operations
pub struct BillingService {
    pub reconciler: Reconciler,
    pub checkout: CheckoutService,
    pub provider: Arc<dyn BillingProvider>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(&config, pool)
    }

    /// Create a new billing service with explicit config
    pub fn new(config: &BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let provider = build_provider(config)?;
        let store: Arc<dyn OrganizationStore> = Arc::new(PgOrganizationStore::new(pool));
        let sender: Arc<dyn EmailSender> = Arc::new(EmailClient::new(config.email.clone()));

        tracing::info!(provider = provider.name(), "Billing provider configured");

        Ok(Self::with_collaborators(
            provider,
            store,
            sender,
            &config.app_url,
        ))
    }

    /// Wire the service from explicit collaborators. Tests and embedders
    /// use this to swap in fakes for the provider, store or sender.
    pub fn with_collaborators(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn OrganizationStore>,
        sender: Arc<dyn EmailSender>,
        app_url: &str,
    ) -> Self {
        let notifier = Notifier::new(sender);
        let reconciler = Reconciler::new(provider.clone(), store.clone(), notifier);
        let checkout = CheckoutService::new(provider.clone(), store, app_url);

        Self {
            reconciler,
            checkout,
            provider,
        }
    }
}

fn build_provider(config: &BillingConfig) -> BillingResult<Arc<dyn BillingProvider>> {
    match config.provider {
        ProviderKind::Stripe => {
            let secret_key = config
                .stripe_secret_key
                .as_deref()
                .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY is not set".to_string()))?;
            let webhook_secret = config.stripe_webhook_secret.as_deref().ok_or_else(|| {
                BillingError::Config("STRIPE_WEBHOOK_SECRET is not set".to_string())
            })?;
            Ok(Arc::new(StripeProvider::new(secret_key, webhook_secret)))
        }
        ProviderKind::Creem => {
            let api_key = config
                .creem_api_key
                .as_deref()
                .ok_or_else(|| BillingError::Config("CREEM_API_KEY is not set".to_string()))?;
            let webhook_secret = config.creem_webhook_secret.as_deref().ok_or_else(|| {
                BillingError::Config("CREEM_WEBHOOK_SECRET is not set".to_string())
            })?;
            let provider = match config.creem_api_base.as_deref() {
                Some(base) => CreemProvider::with_api_base(api_key, webhook_secret, base),
                None => CreemProvider::new(api_key, webhook_secret),
            };
            Ok(Arc::new(provider))
        }
    }
}
