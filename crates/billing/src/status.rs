//! Internal subscription status and the provider status mapping

use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal subscription status for an organization.
///
/// Transitions are driven solely by inbound webhook events; client requests
/// never move this state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Canceled,
    PastDue,
    Trialing,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Trialing => "trialing",
        }
    }

    /// Decode a stored status column. Unknown values fall back to
    /// `Inactive` rather than failing the row.
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "active" => SubscriptionStatus::Active,
            "canceled" => SubscriptionStatus::Canceled,
            "past_due" => SubscriptionStatus::PastDue,
            "trialing" => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Inactive,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a provider-reported subscription status onto the internal enum.
///
/// Total over all inputs: anything outside the table degrades to
/// `Inactive`, never to `Active`.
pub fn map_provider_status(raw: &str) -> SubscriptionStatus {
    match raw {
        "active" => SubscriptionStatus::Active,
        "canceled" => SubscriptionStatus::Canceled,
        "past_due" => SubscriptionStatus::PastDue,
        "trialing" => SubscriptionStatus::Trialing,
        "unpaid" => SubscriptionStatus::PastDue,
        "incomplete" | "incomplete_expired" | "paused" => SubscriptionStatus::Inactive,
        _ => SubscriptionStatus::Inactive,
    }
}
