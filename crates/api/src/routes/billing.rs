//! Billing endpoints
//!
//! The provider webhook plus the dashboard-facing checkout, portal and
//! seat operations.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub organization_id: Uuid,
    pub price_id: String,
    pub quantity: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub organization_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct SeatsRequest {
    pub organization_id: Uuid,
    pub seats: u32,
}

#[derive(Debug, Serialize)]
pub struct SeatsResponse {
    pub seats: i32,
}

/// Provider webhook endpoint.
///
/// Signature verification runs over the exact raw request bytes, before any
/// parsing. Events that verify but cannot be attributed to an organization
/// are acknowledged with 200 so the provider stops retrying them.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let provider = &state.billing.provider;
    let header_name = provider.signature_header();

    let signature = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {header_name} header")))?;

    let event = provider.verify_event(&body, signature)?;
    let disposition = state.billing.reconciler.handle_event(event).await?;
    tracing::debug!(?disposition, "Webhook processed");

    Ok(Json(json!({ "received": true })))
}

/// Create a provider-hosted checkout session for an organization.
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let url = state
        .billing
        .checkout
        .create_checkout(req.organization_id, &req.price_id, req.quantity)
        .await?;

    Ok(Json(CheckoutResponse { url }))
}

/// Create a provider-hosted billing portal session.
pub async fn create_portal(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<PortalResponse>> {
    let url = state
        .billing
        .checkout
        .create_portal(req.organization_id)
        .await?;

    Ok(Json(PortalResponse { url }))
}

/// Change the seat count on an organization's subscription.
pub async fn update_seats(
    State(state): State<AppState>,
    Json(req): Json<SeatsRequest>,
) -> ApiResult<Json<SeatsResponse>> {
    let seats = state
        .billing
        .checkout
        .update_seats(req.organization_id, req.seats)
        .await?;

    Ok(Json(SeatsResponse { seats }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use billsync_billing::{
        BillingError, BillingProvider, BillingResult, BillingService, BillingUpdate,
        CheckoutParams, CheckoutPayload, EmailMessage, EmailSender, EventKind, EventPayload,
        NewCustomer, Organization, OrganizationStore, ProviderCustomer, ProviderSubscription,
        SubscriptionStatus, WebhookEvent, ORGANIZATION_METADATA_KEY,
    };
    use http_body_util::BodyExt;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use crate::routes::create_router;

    const VALID_SIGNATURE: &str = "sig-valid";

    // =========================================================================
    // Test doubles
    // =========================================================================

    /// Provider double. Signature checks are plain equality; subscription
    /// payloads are looked up from the registered subscriptions.
    #[derive(Default)]
    struct MockProvider {
        subscriptions: HashMap<String, ProviderSubscription>,
        customers: HashMap<String, ProviderCustomer>,
        quantity_updates: Mutex<Vec<(String, u64)>>,
    }

    impl MockProvider {
        fn with_subscription(mut self, subscription: ProviderSubscription) -> Self {
            self.subscriptions
                .insert(subscription.id.clone(), subscription);
            self
        }
    }

    #[async_trait]
    impl BillingProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn signature_header(&self) -> &'static str {
            "x-mock-signature"
        }

        fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
            if signature != VALID_SIGNATURE {
                return Err(BillingError::SignatureInvalid);
            }
            let value: Value = serde_json::from_slice(payload)
                .map_err(|err| BillingError::MalformedPayload(err.to_string()))?;
            let kind = match value["type"].as_str() {
                Some("checkout.completed") => EventKind::CheckoutCompleted,
                Some("subscription.updated") => EventKind::SubscriptionUpdated,
                Some(other) => EventKind::Other(other.to_string()),
                None => {
                    return Err(BillingError::MalformedPayload(
                        "event type missing".to_string(),
                    ))
                }
            };
            let subscription_ref = value["subscription"].as_str().map(str::to_string);
            let payload = match &kind {
                EventKind::CheckoutCompleted => EventPayload::Checkout(CheckoutPayload {
                    subscription_id: subscription_ref,
                }),
                EventKind::SubscriptionUpdated => {
                    let id = subscription_ref.ok_or_else(|| {
                        BillingError::MalformedPayload("subscription missing".to_string())
                    })?;
                    let subscription =
                        self.subscriptions.get(&id).cloned().ok_or_else(|| {
                            BillingError::MalformedPayload(format!("unknown subscription {id}"))
                        })?;
                    EventPayload::Subscription(subscription)
                }
                _ => EventPayload::None,
            };
            Ok(WebhookEvent {
                id: "evt_test".to_string(),
                kind,
                payload,
            })
        }

        async fn retrieve_subscription(&self, id: &str) -> BillingResult<ProviderSubscription> {
            self.subscriptions
                .get(id)
                .cloned()
                .ok_or_else(|| BillingError::ProviderApi(format!("retrieve failed for {id}")))
        }

        async fn retrieve_customer(&self, id: &str) -> BillingResult<ProviderCustomer> {
            self.customers
                .get(id)
                .cloned()
                .ok_or_else(|| BillingError::ProviderApi(format!("no customer {id}")))
        }

        async fn create_customer(&self, _new: &NewCustomer) -> BillingResult<String> {
            Ok("cus_new".to_string())
        }

        async fn create_checkout_session(&self, params: &CheckoutParams) -> BillingResult<String> {
            Ok(format!("https://pay.test/c/{}", params.price_id))
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            _return_url: &str,
        ) -> BillingResult<String> {
            Ok(format!("https://pay.test/portal/{customer_id}"))
        }

        async fn update_subscription_quantity(
            &self,
            subscription_id: &str,
            quantity: u64,
        ) -> BillingResult<()> {
            self.quantity_updates
                .lock()
                .unwrap()
                .push((subscription_id.to_string(), quantity));
            Ok(())
        }
    }

    /// In-memory store holding at most one organization row.
    #[derive(Default)]
    struct MockStore {
        row: Mutex<Option<Organization>>,
    }

    impl MockStore {
        fn with_row(row: Organization) -> Self {
            Self {
                row: Mutex::new(Some(row)),
            }
        }

        fn row(&self) -> Option<Organization> {
            self.row.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrganizationStore for MockStore {
        async fn update_billing(&self, org_id: Uuid, update: &BillingUpdate) -> BillingResult<u64> {
            let mut guard = self.row.lock().unwrap();
            match guard.as_mut().filter(|row| row.id == org_id) {
                Some(row) => {
                    row.billing_subscription_id = update.subscription_id.clone();
                    row.subscription_status = update.status.as_str().to_string();
                    row.seats = update.seats;
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        async fn cancel_billing(&self, org_id: Uuid) -> BillingResult<u64> {
            let mut guard = self.row.lock().unwrap();
            match guard.as_mut().filter(|row| row.id == org_id) {
                Some(row) => {
                    row.billing_subscription_id = None;
                    row.subscription_status = SubscriptionStatus::Canceled.as_str().to_string();
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        async fn set_status(&self, org_id: Uuid, status: SubscriptionStatus) -> BillingResult<u64> {
            let mut guard = self.row.lock().unwrap();
            match guard.as_mut().filter(|row| row.id == org_id) {
                Some(row) => {
                    row.subscription_status = status.as_str().to_string();
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        async fn find(&self, org_id: Uuid) -> BillingResult<Option<Organization>> {
            Ok(self.row().filter(|row| row.id == org_id))
        }

        async fn set_customer(&self, org_id: Uuid, customer_id: &str) -> BillingResult<()> {
            let mut guard = self.row.lock().unwrap();
            if let Some(row) = guard.as_mut().filter(|row| row.id == org_id) {
                row.billing_customer_id = Some(customer_id.to_string());
            }
            Ok(())
        }

        async fn set_seats(&self, org_id: Uuid, seats: i32) -> BillingResult<()> {
            let mut guard = self.row.lock().unwrap();
            if let Some(row) = guard.as_mut().filter(|row| row.id == org_id) {
                row.seats = seats;
            }
            Ok(())
        }
    }

    struct NullSender;

    #[async_trait]
    impl EmailSender for NullSender {
        async fn send(&self, _message: &EmailMessage) -> BillingResult<()> {
            Ok(())
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn org_id() -> Uuid {
        Uuid::parse_str("8c7f2f6e-5a24-47e5-9f3a-2f1f6f0f7a10").unwrap()
    }

    fn organization() -> Organization {
        let now = OffsetDateTime::now_utc();
        Organization {
            id: org_id(),
            name: "Acme".to_string(),
            owner_email: Some("owner@acme.test".to_string()),
            billing_customer_id: Some("cus_1".to_string()),
            billing_subscription_id: Some("sub_1".to_string()),
            subscription_status: "active".to_string(),
            seats: 2,
            created_at: now,
            updated_at: now,
        }
    }

    fn linked_subscription(seats: i32, status: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: Some("cus_1".to_string()),
            status: status.to_string(),
            seats,
            plan: Some("Team".to_string()),
            current_period_end: None,
            metadata: HashMap::from([(
                ORGANIZATION_METADATA_KEY.to_string(),
                org_id().to_string(),
            )]),
        }
    }

    fn unlinked_subscription() -> ProviderSubscription {
        ProviderSubscription {
            metadata: HashMap::new(),
            ..linked_subscription(3, "active")
        }
    }

    fn test_app(provider: Arc<MockProvider>, store: Arc<MockStore>) -> Router {
        let billing = BillingService::with_collaborators(
            provider,
            store,
            Arc::new(NullSender),
            "https://app.test",
        );

        create_router(AppState {
            billing: Arc::new(billing),
        })
    }

    async fn send_request(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn webhook_request(signature: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook");
        if let Some(signature) = signature {
            builder = builder.header("x-mock-signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // =========================================================================
    // Webhook endpoint
    // =========================================================================

    #[tokio::test]
    async fn webhook_without_signature_header_is_rejected() {
        let app = test_app(
            Arc::new(MockProvider::default()),
            Arc::new(MockStore::default()),
        );

        let (status, body) = send_request(
            app,
            webhook_request(None, json!({ "type": "subscription.updated" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("x-mock-signature"));
    }

    #[tokio::test]
    async fn webhook_with_invalid_signature_is_rejected() {
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(Arc::new(MockProvider::default()), store.clone());

        let (status, _) = send_request(
            app,
            webhook_request(Some("sig-wrong"), json!({ "type": "subscription.updated" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.row().unwrap().seats, 2);
    }

    #[tokio::test]
    async fn webhook_with_garbage_payload_is_rejected() {
        let app = test_app(
            Arc::new(MockProvider::default()),
            Arc::new(MockStore::default()),
        );

        let request = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook")
            .header("x-mock-signature", VALID_SIGNATURE)
            .body(Body::from("not json at all"))
            .unwrap();
        let (status, _) = send_request(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_applies_subscription_update() {
        let provider = Arc::new(
            MockProvider::default().with_subscription(linked_subscription(6, "past_due")),
        );
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(provider, store.clone());

        let (status, body) = send_request(
            app,
            webhook_request(
                Some(VALID_SIGNATURE),
                json!({ "type": "subscription.updated", "subscription": "sub_1" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);

        let row = store.row().unwrap();
        assert_eq!(row.subscription_status, "past_due");
        assert_eq!(row.seats, 6);
        assert_eq!(row.billing_subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn webhook_for_unlinked_subscription_is_acknowledged() {
        let provider =
            Arc::new(MockProvider::default().with_subscription(unlinked_subscription()));
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(provider, store.clone());

        let (status, body) = send_request(
            app,
            webhook_request(
                Some(VALID_SIGNATURE),
                json!({ "type": "subscription.updated", "subscription": "sub_1" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert_eq!(store.row().unwrap().seats, 2);
    }

    #[tokio::test]
    async fn webhook_ignores_unknown_event_kinds() {
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(Arc::new(MockProvider::default()), store.clone());

        let (status, body) = send_request(
            app,
            webhook_request(Some(VALID_SIGNATURE), json!({ "type": "pin.dropped" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert_eq!(store.row().unwrap().subscription_status, "active");
    }

    #[tokio::test]
    async fn webhook_checkout_completion_refetches_and_syncs() {
        let provider = Arc::new(
            MockProvider::default().with_subscription(linked_subscription(4, "active")),
        );
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(provider, store.clone());

        let (status, _) = send_request(
            app,
            webhook_request(
                Some(VALID_SIGNATURE),
                json!({ "type": "checkout.completed", "subscription": "sub_1" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.row().unwrap().seats, 4);
    }

    #[tokio::test]
    async fn webhook_refetch_failure_is_bad_gateway() {
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(Arc::new(MockProvider::default()), store.clone());

        let (status, body) = send_request(
            app,
            webhook_request(
                Some(VALID_SIGNATURE),
                json!({ "type": "checkout.completed", "subscription": "sub_gone" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "billing provider request failed");
        assert_eq!(store.row().unwrap().seats, 2);
    }

    // =========================================================================
    // Checkout, portal and seat endpoints
    // =========================================================================

    #[tokio::test]
    async fn checkout_returns_hosted_url() {
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(Arc::new(MockProvider::default()), store);

        let (status, body) = send_request(
            app,
            json_request(
                "POST",
                "/api/billing/checkout",
                json!({
                    "organization_id": org_id(),
                    "price_id": "price_team",
                    "quantity": 4,
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "https://pay.test/c/price_team");
    }

    #[tokio::test]
    async fn checkout_for_unknown_organization_is_not_found() {
        let app = test_app(
            Arc::new(MockProvider::default()),
            Arc::new(MockStore::default()),
        );

        let (status, body) = send_request(
            app,
            json_request(
                "POST",
                "/api/billing/checkout",
                json!({ "organization_id": org_id(), "price_id": "price_team" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("organization not found"));
    }

    #[tokio::test]
    async fn checkout_with_missing_fields_is_unprocessable() {
        let app = test_app(
            Arc::new(MockProvider::default()),
            Arc::new(MockStore::default()),
        );

        let (status, _) = send_request(
            app,
            json_request(
                "POST",
                "/api/billing/checkout",
                json!({ "price_id": "price_team" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn portal_returns_hosted_url() {
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(Arc::new(MockProvider::default()), store);

        let (status, body) = send_request(
            app,
            json_request(
                "POST",
                "/api/billing/portal",
                json!({ "organization_id": org_id() }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "https://pay.test/portal/cus_1");
    }

    #[tokio::test]
    async fn portal_without_customer_is_not_found() {
        let row = Organization {
            billing_customer_id: None,
            ..organization()
        };
        let app = test_app(
            Arc::new(MockProvider::default()),
            Arc::new(MockStore::with_row(row)),
        );

        let (status, body) = send_request(
            app,
            json_request(
                "POST",
                "/api/billing/portal",
                json!({ "organization_id": org_id() }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("no billing customer"));
    }

    #[tokio::test]
    async fn seats_update_pushes_provider_then_store() {
        let provider = Arc::new(MockProvider::default());
        let store = Arc::new(MockStore::with_row(organization()));
        let app = test_app(provider.clone(), store.clone());

        let (status, body) = send_request(
            app,
            json_request(
                "PUT",
                "/api/billing/seats",
                json!({ "organization_id": org_id(), "seats": 7 }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["seats"], 7);
        assert_eq!(
            *provider.quantity_updates.lock().unwrap(),
            vec![("sub_1".to_string(), 7)]
        );
        assert_eq!(store.row().unwrap().seats, 7);
    }

    #[tokio::test]
    async fn seats_without_subscription_is_not_found() {
        let row = Organization {
            billing_subscription_id: None,
            ..organization()
        };
        let provider = Arc::new(MockProvider::default());
        let app = test_app(provider.clone(), Arc::new(MockStore::with_row(row)));

        let (status, _) = send_request(
            app,
            json_request(
                "PUT",
                "/api/billing/seats",
                json!({ "organization_id": org_id(), "seats": 7 }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(provider.quantity_updates.lock().unwrap().is_empty());
    }
}
