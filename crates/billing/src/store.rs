//! Organization persistence
//!
//! The reconciler and checkout service only see the `OrganizationStore`
//! trait; SQL lives in the Postgres implementation below.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::status::SubscriptionStatus;

/// Billing fields overwritten by the synchronizer in one atomic UPDATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingUpdate {
    pub subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub seats: i32,
}

/// Organization row as the billing services read it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub owner_email: Option<String>,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub subscription_status: String,
    pub seats: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Organization {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_db(&self.subscription_status)
    }
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    /// Overwrite the billing fields for one organization. Returns the number
    /// of rows matched so callers can spot unresolvable organizations.
    async fn update_billing(&self, org_id: Uuid, update: &BillingUpdate) -> BillingResult<u64>;

    /// Deleted-subscription path: force `canceled` and drop the subscription
    /// reference. Seats are left untouched.
    async fn cancel_billing(&self, org_id: Uuid) -> BillingResult<u64>;

    /// Forced status write, used when an invoice failure overrides whatever
    /// the subscription itself reports.
    async fn set_status(&self, org_id: Uuid, status: SubscriptionStatus) -> BillingResult<u64>;

    async fn find(&self, org_id: Uuid) -> BillingResult<Option<Organization>>;

    async fn set_customer(&self, org_id: Uuid, customer_id: &str) -> BillingResult<()>;

    async fn set_seats(&self, org_id: Uuid, seats: i32) -> BillingResult<()>;
}

/// Postgres-backed store
pub struct PgOrganizationStore {
    pool: PgPool,
}

impl PgOrganizationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationStore for PgOrganizationStore {
    async fn update_billing(&self, org_id: Uuid, update: &BillingUpdate) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET billing_subscription_id = $2,
                subscription_status = $3,
                seats = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(&update.subscription_id)
        .bind(update.status.as_str())
        .bind(update.seats)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_billing(&self, org_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET billing_subscription_id = NULL,
                subscription_status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(SubscriptionStatus::Canceled.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn set_status(&self, org_id: Uuid, status: SubscriptionStatus) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET subscription_status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find(&self, org_id: Uuid) -> BillingResult<Option<Organization>> {
        let organization = sqlx::query_as::<_, Organization>(
            r#"
            SELECT id, name, owner_email, billing_customer_id,
                   billing_subscription_id, subscription_status, seats,
                   created_at, updated_at
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    async fn set_customer(&self, org_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE organizations
            SET billing_customer_id = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_seats(&self, org_id: Uuid, seats: i32) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE organizations
            SET seats = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(seats)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
