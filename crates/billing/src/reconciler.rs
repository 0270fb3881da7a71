//! Event routing and subscription synchronization
//!
//! One verified event comes in, one disposition comes out. State changes
//! are pure overwrites keyed by the organization linkage in subscription
//! metadata, so duplicate and out-of-order deliveries stay safe without
//! locks or an event table.

use std::sync::Arc;

use crate::error::BillingResult;
use crate::notify::{NotificationContext, NotificationKind, Notifier};
use crate::provider::{
    BillingProvider, CheckoutPayload, EventKind, EventPayload, InvoicePayload,
    ProviderSubscription, WebhookEvent,
};
use crate::status::{map_provider_status, SubscriptionStatus};
use crate::store::{BillingUpdate, OrganizationStore};

/// Outcome of handling one verified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The event was routed and its state change applied.
    Handled,
    /// The event carried nothing to apply: unknown kind, missing linkage,
    /// or an organization no row matches.
    Ignored,
}

pub struct Reconciler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn OrganizationStore>,
    notifier: Notifier,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn OrganizationStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
        }
    }

    /// Route one verified event. Store and provider failures bubble up to
    /// the caller; everything else resolves to a disposition.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<Disposition> {
        tracing::info!(event_id = %event.id, kind = ?event.kind, "Handling billing event");

        match (event.kind, event.payload) {
            (EventKind::CheckoutCompleted, EventPayload::Checkout(checkout)) => {
                self.handle_checkout_completed(checkout).await
            }
            (EventKind::SubscriptionCreated, EventPayload::Subscription(subscription)) => {
                // The paired checkout event already sent the welcome email;
                // this sync stays silent.
                self.sync_subscription(&subscription, None).await
            }
            (EventKind::SubscriptionUpdated, EventPayload::Subscription(subscription)) => {
                self.sync_subscription(&subscription, Some(NotificationKind::SubscriptionUpdated))
                    .await
            }
            (EventKind::SubscriptionDeleted, EventPayload::Subscription(subscription)) => {
                self.handle_subscription_deleted(&subscription).await
            }
            (EventKind::InvoicePaymentFailed, EventPayload::Invoice(invoice)) => {
                self.handle_payment_failed(invoice).await
            }
            (EventKind::Other(kind), _) => {
                tracing::debug!(kind = %kind, "Ignoring unhandled event type");
                Ok(Disposition::Ignored)
            }
            (kind, _) => {
                tracing::warn!(kind = ?kind, "Event payload did not match its kind, ignoring");
                Ok(Disposition::Ignored)
            }
        }
    }

    /// Checkout payloads only reference the subscription; fetch the full
    /// object before syncing so status, seats and metadata are current.
    async fn handle_checkout_completed(
        &self,
        checkout: CheckoutPayload,
    ) -> BillingResult<Disposition> {
        let Some(subscription_id) = checkout.subscription_id else {
            tracing::info!("Checkout completed without a subscription, nothing to sync");
            return Ok(Disposition::Ignored);
        };

        let subscription = self.provider.retrieve_subscription(&subscription_id).await?;
        self.sync_subscription(&subscription, Some(NotificationKind::SubscriptionCreated))
            .await
    }

    async fn sync_subscription(
        &self,
        subscription: &ProviderSubscription,
        notify: Option<NotificationKind>,
    ) -> BillingResult<Disposition> {
        let Some(org_id) = subscription.organization_id() else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription carries no organization linkage, skipping"
            );
            return Ok(Disposition::Ignored);
        };

        let update = BillingUpdate {
            subscription_id: Some(subscription.id.clone()),
            status: map_provider_status(&subscription.status),
            seats: subscription.seats.max(1),
        };

        let rows = self.store.update_billing(org_id, &update).await?;
        if rows == 0 {
            tracing::warn!(
                org_id = %org_id,
                subscription_id = %subscription.id,
                "No organization matched the event metadata, skipping"
            );
            return Ok(Disposition::Ignored);
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            status = %update.status,
            seats = update.seats,
            "Synchronized subscription state"
        );

        if let Some(kind) = notify {
            self.notify_customer(
                kind,
                subscription.customer_id.as_deref(),
                NotificationContext {
                    plan: subscription.plan.clone(),
                    ends_at: None,
                },
            )
            .await;
        }

        Ok(Disposition::Handled)
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &ProviderSubscription,
    ) -> BillingResult<Disposition> {
        let Some(org_id) = subscription.organization_id() else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Deleted subscription carries no organization linkage, skipping"
            );
            return Ok(Disposition::Ignored);
        };

        let rows = self.store.cancel_billing(org_id).await?;
        if rows == 0 {
            tracing::warn!(
                org_id = %org_id,
                "No organization matched the event metadata, skipping"
            );
            return Ok(Disposition::Ignored);
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Subscription deleted, access canceled"
        );

        self.notify_customer(
            NotificationKind::SubscriptionCanceled,
            subscription.customer_id.as_deref(),
            NotificationContext {
                plan: subscription.plan.clone(),
                ends_at: subscription.current_period_end,
            },
        )
        .await;

        Ok(Disposition::Handled)
    }

    /// Invoices only reference the subscription; the organization linkage
    /// lives in subscription metadata, so re-fetch before forcing the
    /// status.
    async fn handle_payment_failed(&self, invoice: InvoicePayload) -> BillingResult<Disposition> {
        let Some(subscription_id) = invoice.subscription_id else {
            tracing::info!("Invoice failure not tied to a subscription, skipping");
            return Ok(Disposition::Ignored);
        };

        let subscription = self.provider.retrieve_subscription(&subscription_id).await?;
        let Some(org_id) = subscription.organization_id() else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription carries no organization linkage, skipping"
            );
            return Ok(Disposition::Ignored);
        };

        let rows = self
            .store
            .set_status(org_id, SubscriptionStatus::PastDue)
            .await?;
        if rows == 0 {
            tracing::warn!(
                org_id = %org_id,
                "No organization matched the event metadata, skipping"
            );
            return Ok(Disposition::Ignored);
        }

        tracing::warn!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Payment failed, subscription marked past due"
        );

        let customer_id = subscription.customer_id.clone().or(invoice.customer_id);
        self.notify_customer(
            NotificationKind::PaymentFailed,
            customer_id.as_deref(),
            NotificationContext {
                plan: subscription.plan.clone(),
                ends_at: None,
            },
        )
        .await;

        Ok(Disposition::Handled)
    }

    /// Resolve the recipient fresh from the provider, then fire the send.
    /// Any failure here only reaches the log; notifications never decide
    /// the webhook response.
    async fn notify_customer(
        &self,
        kind: NotificationKind,
        customer_id: Option<&str>,
        context: NotificationContext,
    ) {
        let Some(customer_id) = customer_id else {
            tracing::debug!("Subscription has no customer, skipping notification");
            return;
        };

        let email = match self.provider.retrieve_customer(customer_id).await {
            Ok(customer) => customer.email,
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to resolve customer for notification"
                );
                return;
            }
        };

        let Some(email) = email else {
            tracing::debug!(
                customer_id = %customer_id,
                "Customer has no email address, skipping notification"
            );
            return;
        };

        self.notifier.dispatch(kind, email, context);
    }
}
