//! Application state

use std::sync::Arc;

use billsync_billing::BillingService;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build the shared state. The billing service is wired from the
    /// environment; a misconfigured provider is fatal at startup rather
    /// than a 500 on the first webhook.
    pub fn new(pool: PgPool) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool)?;
        tracing::info!(
            provider = billing.provider.name(),
            "Billing service initialized"
        );

        Ok(Self {
            billing: Arc::new(billing),
        })
    }
}
