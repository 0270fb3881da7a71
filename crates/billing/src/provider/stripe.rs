//! Stripe provider adapter
//!
//! Verification goes through the SDK first, with a manual HMAC fallback to
//! work around SDK strictness on newer Stripe API payloads. The fallback
//! re-verifies over the exact raw bytes and extracts the handful of routed
//! fields from the raw JSON instead of the SDK's pinned event model. Both
//! paths fail closed.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CreateCustomer, Customer, CustomerId, Event, EventObject, EventType, Expandable, Subscription,
    SubscriptionId, UpdateSubscription, UpdateSubscriptionItems, Webhook,
};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutParams, CheckoutPayload, EventKind, EventPayload, InvoicePayload,
    NewCustomer, ProviderCustomer, ProviderSubscription, WebhookEvent, ORGANIZATION_METADATA_KEY,
};

type HmacSha256 = Hmac<Sha256>;

/// Signed timestamps older or newer than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Stripe-backed billing provider
pub struct StripeProvider {
    client: stripe::Client,
    webhook_secret: String,
}

impl StripeProvider {
    pub fn new(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Manual signature verification: parse `t=<unix>,v1=<hex>` out of the
    /// header, check the timestamp tolerance, then compare an HMAC-SHA256
    /// over `"{t}.{body}"` in constant time. Only a verified payload is
    /// parsed, and only as loose JSON.
    fn verify_manual(&self, payload: &[u8], signature: &str) -> BillingResult<serde_json::Value> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0].trim() {
                    "t" => timestamp = kv[1].trim().parse().ok(),
                    "v1" => v1_signature = Some(kv[1].trim().to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::SignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::SignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed.as_bytes().ct_eq(v1_signature.as_bytes()).unwrap_u8() != 1 {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Verified webhook payload failed to parse");
            BillingError::MalformedPayload(e.to_string())
        })
    }

    /// Collapse a verified, SDK-parsed Stripe event onto the normalized
    /// event model.
    fn normalize(&self, event: Event) -> BillingResult<WebhookEvent> {
        let id = event.id.to_string();
        let event_type = event.type_;
        let object = event.data.object;

        let (kind, payload) = match event_type {
            EventType::CheckoutSessionCompleted => {
                let session = match object {
                    EventObject::CheckoutSession(session) => session,
                    _ => return Err(unexpected_object("checkout.session.completed")),
                };
                let subscription_id = session.subscription.as_ref().map(|sub| match sub {
                    Expandable::Id(id) => id.to_string(),
                    Expandable::Object(sub) => sub.id.to_string(),
                });
                (
                    EventKind::CheckoutCompleted,
                    EventPayload::Checkout(CheckoutPayload { subscription_id }),
                )
            }
            EventType::CustomerSubscriptionCreated
            | EventType::CustomerSubscriptionUpdated
            | EventType::CustomerSubscriptionDeleted => {
                let subscription = match object {
                    EventObject::Subscription(subscription) => subscription,
                    _ => return Err(unexpected_object("customer.subscription.*")),
                };
                let kind = match event_type {
                    EventType::CustomerSubscriptionCreated => EventKind::SubscriptionCreated,
                    EventType::CustomerSubscriptionDeleted => EventKind::SubscriptionDeleted,
                    _ => EventKind::SubscriptionUpdated,
                };
                (
                    kind,
                    EventPayload::Subscription(normalize_subscription(&subscription)),
                )
            }
            EventType::InvoicePaymentFailed => {
                let invoice = match object {
                    EventObject::Invoice(invoice) => invoice,
                    _ => return Err(unexpected_object("invoice.payment_failed")),
                };
                let subscription_id = invoice.subscription.as_ref().map(|sub| match sub {
                    Expandable::Id(id) => id.to_string(),
                    Expandable::Object(sub) => sub.id.to_string(),
                });
                let customer_id = invoice.customer.as_ref().map(|customer| match customer {
                    Expandable::Id(id) => id.to_string(),
                    Expandable::Object(customer) => customer.id.to_string(),
                });
                (
                    EventKind::InvoicePaymentFailed,
                    EventPayload::Invoice(InvoicePayload {
                        subscription_id,
                        customer_id,
                    }),
                )
            }
            other => (EventKind::Other(other.to_string()), EventPayload::None),
        };

        Ok(WebhookEvent { id, kind, payload })
    }
}

fn unexpected_object(event_type: &str) -> BillingError {
    BillingError::MalformedPayload(format!("{event_type} event carried an unexpected object"))
}

fn normalize_subscription(subscription: &Subscription) -> ProviderSubscription {
    let status = match subscription.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    let item = subscription.items.data.first();

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id: Some(customer_id),
        status: status.to_string(),
        seats: item.and_then(|item| item.quantity).unwrap_or(1) as i32,
        plan: item
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.nickname.clone()),
        current_period_end: OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .ok(),
        metadata: subscription.metadata.clone(),
    }
}

/// Normalize an event the SDK's model rejected, from the raw JSON. Routed
/// fields only; everything else in the payload is ignored.
fn normalize_value(value: &serde_json::Value) -> BillingResult<WebhookEvent> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| BillingError::MalformedPayload("event id missing".to_string()))?
        .to_string();
    let event_type = value["type"]
        .as_str()
        .ok_or_else(|| BillingError::MalformedPayload("event type missing".to_string()))?;
    let object = &value["data"]["object"];

    let (kind, payload) = match event_type {
        "checkout.session.completed" => (
            EventKind::CheckoutCompleted,
            EventPayload::Checkout(CheckoutPayload {
                subscription_id: expandable_ref(&object["subscription"]),
            }),
        ),
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let kind = match event_type {
                "customer.subscription.created" => EventKind::SubscriptionCreated,
                "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
                _ => EventKind::SubscriptionUpdated,
            };
            (
                kind,
                EventPayload::Subscription(subscription_from_value(object)?),
            )
        }
        "invoice.payment_failed" => (
            EventKind::InvoicePaymentFailed,
            EventPayload::Invoice(InvoicePayload {
                subscription_id: expandable_ref(&object["subscription"]),
                customer_id: expandable_ref(&object["customer"]),
            }),
        ),
        other => (EventKind::Other(other.to_string()), EventPayload::None),
    };

    Ok(WebhookEvent { id, kind, payload })
}

fn subscription_from_value(object: &serde_json::Value) -> BillingResult<ProviderSubscription> {
    let id = object["id"]
        .as_str()
        .ok_or_else(|| BillingError::MalformedPayload("subscription id missing".to_string()))?;
    let status = object["status"]
        .as_str()
        .ok_or_else(|| BillingError::MalformedPayload("subscription status missing".to_string()))?;

    let item = object["items"]["data"].get(0);

    let metadata = object["metadata"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| {
                    value.as_str().map(|value| (key.clone(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ProviderSubscription {
        id: id.to_string(),
        customer_id: expandable_ref(&object["customer"]),
        status: status.to_string(),
        seats: item
            .and_then(|item| item["quantity"].as_u64())
            .unwrap_or(1) as i32,
        plan: item
            .and_then(|item| item["price"]["nickname"].as_str())
            .map(str::to_string),
        current_period_end: object["current_period_end"]
            .as_i64()
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        metadata,
    })
}

/// An expandable reference in raw JSON is either an ID string or the full
/// object.
fn expandable_ref(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(object) => object
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        if let Ok(text) = std::str::from_utf8(payload) {
            match Webhook::construct_event(text, signature, &self.webhook_secret) {
                Ok(event) => return self.normalize(event),
                Err(e) => {
                    tracing::debug!(
                        provider_error = %e,
                        "SDK webhook verification failed, trying manual verification"
                    );
                }
            }
        }

        let value = self.verify_manual(payload, signature)?;
        normalize_value(&value)
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<ProviderSubscription> {
        let subscription_id: SubscriptionId = id
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(id.to_string()))?;
        let subscription = Subscription::retrieve(&self.client, &subscription_id, &[]).await?;
        Ok(normalize_subscription(&subscription))
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<ProviderCustomer> {
        let customer_id: CustomerId = id
            .parse()
            .map_err(|_| BillingError::ProviderApi(format!("invalid customer id: {id}")))?;
        let customer = Customer::retrieve(&self.client, &customer_id, &[]).await?;
        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
        })
    }

    async fn create_customer(&self, new: &NewCustomer) -> BillingResult<String> {
        let metadata = HashMap::from([(
            ORGANIZATION_METADATA_KEY.to_string(),
            new.organization_id.to_string(),
        )]);

        let mut params = CreateCustomer::new();
        params.email = new.email.as_deref();
        params.name = Some(&new.name);
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params).await?;

        tracing::info!(
            org_id = %new.organization_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(&self, params: &CheckoutParams) -> BillingResult<String> {
        let customer_id: CustomerId = params
            .customer_id
            .parse()
            .map_err(|_| BillingError::ProviderApi(format!("invalid customer id: {}", params.customer_id)))?;

        let metadata = HashMap::from([(
            ORGANIZATION_METADATA_KEY.to_string(),
            params.organization_id.to_string(),
        )]);

        let create = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(params.price_id.clone()),
                quantity: Some(params.quantity),
                ..Default::default()
            }]),
            success_url: Some(&params.success_url),
            cancel_url: Some(&params.cancel_url),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client, create).await?;
        session
            .url
            .ok_or_else(|| BillingError::ProviderApi("checkout session has no redirect URL".to_string()))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer_id: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::ProviderApi(format!("invalid customer id: {customer_id}")))?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.client, params).await?;
        Ok(session.url)
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        quantity: u64,
    ) -> BillingResult<()> {
        let parsed_id: SubscriptionId = subscription_id
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        let subscription = Subscription::retrieve(&self.client, &parsed_id, &[]).await?;
        let item = subscription.items.data.first().ok_or_else(|| {
            BillingError::ProviderApi(format!("subscription {subscription_id} has no items"))
        })?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item.id.to_string()),
            quantity: Some(quantity),
            ..Default::default()
        }]);

        Subscription::update(&self.client, &parsed_id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            quantity = quantity,
            "Updated Stripe subscription quantity"
        );

        Ok(())
    }
}
