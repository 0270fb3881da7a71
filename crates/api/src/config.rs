//! API server configuration
//!
//! Billing credentials live in `billsync_billing::BillingConfig`; this only
//! covers what the HTTP server itself needs.

use anyhow::Context;

/// Runtime configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string
    pub database_url: String,
    /// Address the HTTP server binds to
    pub bind_address: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Self {
            database_url,
            bind_address,
        })
    }
}
