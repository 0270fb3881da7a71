//! Checkout, portal and seat management
//!
//! The only place a provider customer gets created. Checkout threads the
//! organization id through session and subscription metadata so webhook
//! events can find their way back to the row.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, CheckoutParams, NewCustomer};
use crate::store::{Organization, OrganizationStore};

pub struct CheckoutService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn OrganizationStore>,
    app_url: String,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn OrganizationStore>,
        app_url: &str,
    ) -> Self {
        Self {
            provider,
            store,
            app_url: app_url.trim_end_matches('/').to_string(),
        }
    }

    /// Start a subscription checkout and return the provider-hosted URL.
    /// Quantity defaults to the organization's current seat count.
    pub async fn create_checkout(
        &self,
        org_id: Uuid,
        price_id: &str,
        quantity: Option<u32>,
    ) -> BillingResult<String> {
        let organization = self.require_organization(org_id).await?;
        let customer_id = self.ensure_customer(&organization).await?;

        let quantity = quantity
            .map(u64::from)
            .unwrap_or_else(|| organization.seats.max(1) as u64);

        let url = self
            .provider
            .create_checkout_session(&CheckoutParams {
                customer_id,
                organization_id: org_id,
                price_id: price_id.to_string(),
                quantity,
                success_url: format!("{}/billing?success=true", self.app_url),
                cancel_url: format!("{}/billing?canceled=true", self.app_url),
            })
            .await?;

        tracing::info!(
            org_id = %org_id,
            price_id = %price_id,
            quantity = quantity,
            "Created checkout session"
        );

        Ok(url)
    }

    /// Provider-hosted management page. Requires a billing customer.
    pub async fn create_portal(&self, org_id: Uuid) -> BillingResult<String> {
        let organization = self.require_organization(org_id).await?;
        let customer_id = organization
            .billing_customer_id
            .ok_or(BillingError::CustomerNotFound(org_id))?;

        let url = self
            .provider
            .create_portal_session(&customer_id, &format!("{}/billing", self.app_url))
            .await?;

        tracing::info!(org_id = %org_id, "Created billing portal session");

        Ok(url)
    }

    /// Push the new quantity to the provider first, then persist it.
    pub async fn update_seats(&self, org_id: Uuid, seats: u32) -> BillingResult<i32> {
        let seats = seats.max(1);
        let organization = self.require_organization(org_id).await?;
        let subscription_id = organization.billing_subscription_id.ok_or_else(|| {
            BillingError::SubscriptionNotFound(format!(
                "organization {org_id} has no active subscription"
            ))
        })?;

        self.provider
            .update_subscription_quantity(&subscription_id, u64::from(seats))
            .await?;
        self.store.set_seats(org_id, seats as i32).await?;

        tracing::info!(org_id = %org_id, seats = seats, "Updated subscription seats");

        Ok(seats as i32)
    }

    async fn require_organization(&self, org_id: Uuid) -> BillingResult<Organization> {
        self.store
            .find(org_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound(org_id))
    }

    /// Reuse the stored provider customer, or create one carrying the
    /// organization linkage and persist its id.
    async fn ensure_customer(&self, organization: &Organization) -> BillingResult<String> {
        if let Some(customer_id) = &organization.billing_customer_id {
            return Ok(customer_id.clone());
        }

        let customer_id = self
            .provider
            .create_customer(&NewCustomer {
                organization_id: organization.id,
                name: organization.name.clone(),
                email: organization.owner_email.clone(),
            })
            .await?;

        self.store
            .set_customer(organization.id, &customer_id)
            .await?;

        Ok(customer_id)
    }
}
