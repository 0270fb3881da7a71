//! Creem provider adapter
//!
//! Creem signs the raw body with a plain hex HMAC-SHA256 (no timestamp
//! scheme) and pushes `eventType`-tagged JSON envelopes. Server-side calls
//! go through its REST API with an `x-api-key` header.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutParams, CheckoutPayload, EventKind, EventPayload, NewCustomer,
    ProviderCustomer, ProviderSubscription, WebhookEvent, ORGANIZATION_METADATA_KEY,
};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.creem.io";

/// Creem-backed billing provider
pub struct CreemProvider {
    http: reqwest::Client,
    api_key: String,
    webhook_secret: String,
    api_base: String,
}

/// Fields that arrive either as a bare id string or an expanded object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaybeExpanded<T> {
    Object(T),
    Id(String),
}

#[derive(Debug, Deserialize)]
struct CreemEvent {
    id: String,
    #[serde(rename = "eventType")]
    event_type: String,
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreemCustomer {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreemProduct {
    #[allow(dead_code)]
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreemSubscriptionItem {
    id: String,
    units: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreemSubscription {
    id: String,
    customer: Option<MaybeExpanded<CreemCustomer>>,
    product: Option<MaybeExpanded<CreemProduct>>,
    status: String,
    #[serde(default)]
    items: Vec<CreemSubscriptionItem>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    current_period_end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreemCheckout {
    subscription: Option<MaybeExpanded<CreemSubscription>>,
}

#[derive(Debug, Deserialize)]
struct CreemCheckoutResponse {
    checkout_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreemPortalResponse {
    customer_portal_link: String,
}

#[derive(Debug, Deserialize)]
struct CreemCreatedCustomer {
    id: String,
}

impl CreemProvider {
    pub fn new(api_key: &str, webhook_secret: &str) -> Self {
        Self::with_api_base(api_key, webhook_secret, DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_key: &str, webhook_secret: &str, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            webhook_secret: webhook_secret.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed.as_bytes().ct_eq(signature.trim().as_bytes()).unwrap_u8() != 1 {
            tracing::error!("Creem webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        Ok(())
    }

    fn normalize(&self, event: CreemEvent) -> BillingResult<WebhookEvent> {
        let (kind, payload) = match event.event_type.as_str() {
            "checkout.completed" => {
                let checkout: CreemCheckout = parse_object(event.object)?;
                let subscription_id = checkout.subscription.map(|sub| match sub {
                    MaybeExpanded::Id(id) => id,
                    MaybeExpanded::Object(sub) => sub.id,
                });
                (
                    EventKind::CheckoutCompleted,
                    EventPayload::Checkout(CheckoutPayload { subscription_id }),
                )
            }
            "subscription.active"
            | "subscription.paid"
            | "subscription.update"
            | "subscription.trialing" => {
                let subscription: CreemSubscription = parse_object(event.object)?;
                (
                    EventKind::SubscriptionUpdated,
                    EventPayload::Subscription(normalize_subscription(subscription)),
                )
            }
            "subscription.canceled" | "subscription.expired" => {
                let subscription: CreemSubscription = parse_object(event.object)?;
                (
                    EventKind::SubscriptionDeleted,
                    EventPayload::Subscription(normalize_subscription(subscription)),
                )
            }
            other => (EventKind::Other(other.to_string()), EventPayload::None),
        };

        Ok(WebhookEvent {
            id: event.id,
            kind,
            payload,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> BillingResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .header("x-api-key", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| BillingError::ProviderApi(format!("creem request failed: {e}")))?;
        decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .header("x-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::ProviderApi(format!("creem request failed: {e}")))?;
        decode(response).await
    }
}

fn parse_object<T: DeserializeOwned>(object: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| BillingError::MalformedPayload(e.to_string()))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> BillingResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BillingError::ProviderApi(format!(
            "creem returned {status}: {body}"
        )));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BillingError::ProviderApi(format!("creem response decode failed: {e}")))
}

fn normalize_subscription(subscription: CreemSubscription) -> ProviderSubscription {
    let customer_id = subscription.customer.as_ref().map(|customer| match customer {
        MaybeExpanded::Id(id) => id.clone(),
        MaybeExpanded::Object(customer) => customer.id.clone(),
    });

    let plan = subscription.product.as_ref().and_then(|product| match product {
        MaybeExpanded::Id(_) => None,
        MaybeExpanded::Object(product) => product.name.clone(),
    });

    let metadata = subscription
        .metadata
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();

    ProviderSubscription {
        id: subscription.id,
        customer_id,
        status: subscription.status,
        seats: subscription
            .items
            .first()
            .and_then(|item| item.units)
            .unwrap_or(1) as i32,
        plan,
        current_period_end: subscription
            .current_period_end_date
            .as_deref()
            .and_then(|date| OffsetDateTime::parse(date, &Rfc3339).ok()),
        metadata,
    }
}

#[async_trait]
impl BillingProvider for CreemProvider {
    fn name(&self) -> &'static str {
        "creem"
    }

    fn signature_header(&self) -> &'static str {
        "creem-signature"
    }

    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_signature(payload, signature)?;

        let event: CreemEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Verified Creem payload failed to parse");
            BillingError::MalformedPayload(e.to_string())
        })?;

        self.normalize(event)
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<ProviderSubscription> {
        let response = self
            .http
            .get(format!("{}/v1/subscriptions", self.api_base))
            .header("x-api-key", &self.api_key)
            .query(&[("subscription_id", id)])
            .send()
            .await
            .map_err(|e| BillingError::ProviderApi(format!("creem request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::SubscriptionNotFound(id.to_string()));
        }

        let subscription: CreemSubscription = decode(response).await?;
        Ok(normalize_subscription(subscription))
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<ProviderCustomer> {
        let customer: CreemCustomer = self
            .get_json("/v1/customers", &[("customer_id", id)])
            .await?;
        Ok(ProviderCustomer {
            id: customer.id,
            email: customer.email,
        })
    }

    async fn create_customer(&self, new: &NewCustomer) -> BillingResult<String> {
        let created: CreemCreatedCustomer = self
            .post_json(
                "/v1/customers",
                &json!({
                    "email": new.email,
                    "name": new.name,
                    "metadata": { ORGANIZATION_METADATA_KEY: new.organization_id },
                }),
            )
            .await?;

        tracing::info!(
            org_id = %new.organization_id,
            customer_id = %created.id,
            "Created Creem customer"
        );

        Ok(created.id)
    }

    async fn create_checkout_session(&self, params: &CheckoutParams) -> BillingResult<String> {
        let checkout: CreemCheckoutResponse = self
            .post_json(
                "/v1/checkouts",
                &json!({
                    "product_id": params.price_id,
                    "units": params.quantity,
                    "customer": { "id": params.customer_id },
                    "success_url": params.success_url,
                    "metadata": { ORGANIZATION_METADATA_KEY: params.organization_id },
                }),
            )
            .await?;

        checkout.checkout_url.ok_or_else(|| {
            BillingError::ProviderApi("checkout session has no redirect URL".to_string())
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> BillingResult<String> {
        let portal: CreemPortalResponse = self
            .post_json("/v1/customers/billing", &json!({ "customer_id": customer_id }))
            .await?;
        Ok(portal.customer_portal_link)
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        quantity: u64,
    ) -> BillingResult<()> {
        let subscription: CreemSubscription = self
            .get_json("/v1/subscriptions", &[("subscription_id", subscription_id)])
            .await?;
        let item = subscription.items.first().ok_or_else(|| {
            BillingError::ProviderApi(format!("subscription {subscription_id} has no items"))
        })?;

        let _: serde_json::Value = self
            .post_json(
                &format!("/v1/subscriptions/{subscription_id}"),
                &json!({
                    "items": [{ "id": item.id, "units": quantity }],
                    "update_behavior": "proration-charge-immediately",
                }),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            quantity = quantity,
            "Updated Creem subscription quantity"
        );

        Ok(())
    }
}
