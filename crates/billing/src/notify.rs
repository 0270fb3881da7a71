//! Notification dispatch
//!
//! Emails ride a spawned task. The webhook request path never waits on
//! delivery and a failed send only reaches the log, so provider retries
//! are driven purely by verification and persistence outcomes.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::email::{EmailMessage, EmailSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentFailed,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationContext {
    pub plan: Option<String>,
    pub ends_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn EmailSender>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }

    /// Spawn the send and return immediately. The handle exists for tests;
    /// the request path drops it.
    pub fn dispatch(
        &self,
        kind: NotificationKind,
        to: String,
        context: NotificationContext,
    ) -> JoinHandle<()> {
        let sender = Arc::clone(&self.sender);
        tokio::spawn(async move {
            let message = compose(kind, to, &context);
            if let Err(e) = sender.send(&message).await {
                tracing::error!(
                    error = %e,
                    subject = %message.subject,
                    "Failed to send billing notification"
                );
            }
        })
    }
}

fn compose(kind: NotificationKind, to: String, context: &NotificationContext) -> EmailMessage {
    let label = plan_label(context.plan.as_deref());

    let (subject, html) = match kind {
        NotificationKind::SubscriptionCreated => (
            format!("Your {label} is active"),
            format!(
                "<p>Thanks for subscribing! Your {label} is now active.</p>\
                 <p>You can manage billing from your account at any time.</p>"
            ),
        ),
        NotificationKind::SubscriptionUpdated => (
            format!("Your {label} was updated"),
            format!("<p>Your {label} was updated. The latest changes are live on your account.</p>"),
        ),
        NotificationKind::SubscriptionCanceled => {
            let access_note = match context.ends_at {
                Some(ends_at) => {
                    format!("<p>You keep access until {}.</p>", format_date(ends_at))
                }
                None => String::new(),
            };
            (
                format!("Your {label} has been canceled"),
                format!("<p>Your {label} has been canceled.</p>{access_note}"),
            )
        }
        NotificationKind::PaymentFailed => (
            format!("Payment failed for your {label}"),
            format!(
                "<p>We could not process the latest payment for your {label}.</p>\
                 <p>Please update your payment method to keep your subscription active.</p>"
            ),
        ),
    };

    EmailMessage { to, subject, html }
}

fn plan_label(plan: Option<&str>) -> String {
    match plan {
        Some(plan) => format!("{plan} plan"),
        None => "subscription".to_string(),
    }
}

fn format_date(date: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
