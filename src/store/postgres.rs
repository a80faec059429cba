//! PostgreSQL implementation of the store ports using `sqlx`.
//!
//! Each [`StoreTx`] maps to one `sqlx::Transaction`; the version CAS is
//! a single conditional `UPDATE`. Schema lives under `migrations/` and
//! is applied with [`PgStore::migrate`].

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use super::models::{EventRow, RefundTaskRow, RegistrationRow};
use super::{Store, StoreTx};
use crate::config::EngineConfig;
use crate::domain::{
    Event, EventId, RefundTask, RefundTaskId, Registration, RegistrationId, RegistrationStatus,
    UserId,
};
use crate::error::EngineError;

const OCCUPYING_STATUSES: [&str; 4] = [
    "confirmed",
    "pending_payment",
    "manual_payment_required",
    "manual_payment_verification",
];

/// PostgreSQL-backed [`Store`] using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a store around an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool according to the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] when the pool cannot be
    /// established.
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.database_connect_timeout_secs,
            ))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] when a migration fails.
    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// One open `sqlx` transaction.
#[derive(Debug)]
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn event_by_id(&mut self, id: EventId) -> Result<Option<Event>, EngineError> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT id, title, capacity, version, price_subscriber_cents, price_guest_cents, \
             currency, requires_active_subscription, manual_payment_enabled, \
             manual_payment_instructions, manual_payment_deadline_hours, \
             cancellation_cutoff_hours, points_awarded, start_at \
             FROM events WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Event::from))
    }

    async fn bump_event_version(
        &mut self,
        id: EventId,
        expected_version: i64,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query("UPDATE events SET version = version + 1 WHERE id = $1 AND version = $2")
            .bind(id.as_uuid())
            .bind(expected_version)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn registration_by_id(
        &mut self,
        id: RegistrationId,
    ) -> Result<Option<Registration>, EngineError> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            "SELECT id, user_id, event_id, occurrence_date, status, payment_reference, \
             manual_payment_declared_at, manual_payment_due_at, promoted_from_waitlist_at, \
             waitlist_notification_sent, waitlist_notified_at, created_at, updated_at \
             FROM registrations WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Registration::try_from).transpose()
    }

    async fn registration_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> Result<Option<Registration>, EngineError> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            "SELECT id, user_id, event_id, occurrence_date, status, payment_reference, \
             manual_payment_declared_at, manual_payment_due_at, promoted_from_waitlist_at, \
             waitlist_notification_sent, waitlist_notified_at, created_at, updated_at \
             FROM registrations WHERE payment_reference = $1 LIMIT 1",
        )
        .bind(payment_reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Registration::try_from).transpose()
    }

    async fn registration_for_user(
        &mut self,
        user_id: UserId,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            "SELECT id, user_id, event_id, occurrence_date, status, payment_reference, \
             manual_payment_declared_at, manual_payment_due_at, promoted_from_waitlist_at, \
             waitlist_notification_sent, waitlist_notified_at, created_at, updated_at \
             FROM registrations \
             WHERE user_id = $1 AND event_id = $2 AND occurrence_date = $3",
        )
        .bind(user_id.as_uuid())
        .bind(event_id.as_uuid())
        .bind(occurrence_date)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Registration::try_from).transpose()
    }

    async fn occupying_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<i64, EngineError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM registrations \
             WHERE event_id = $1 AND occurrence_date = $2 AND status = ANY($3)",
        )
        .bind(event_id.as_uuid())
        .bind(occurrence_date)
        .bind(OCCUPYING_STATUSES.map(String::from).to_vec())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn status_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
        status: RegistrationStatus,
    ) -> Result<i64, EngineError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM registrations \
             WHERE event_id = $1 AND occurrence_date = $2 AND status = $3",
        )
        .bind(event_id.as_uuid())
        .bind(occurrence_date)
        .bind(status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn oldest_waitlisted(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            "SELECT id, user_id, event_id, occurrence_date, status, payment_reference, \
             manual_payment_declared_at, manual_payment_due_at, promoted_from_waitlist_at, \
             waitlist_notification_sent, waitlist_notified_at, created_at, updated_at \
             FROM registrations \
             WHERE event_id = $1 AND occurrence_date = $2 AND status = 'waitlist' \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(event_id.as_uuid())
        .bind(occurrence_date)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Registration::try_from).transpose()
    }

    async fn upsert_registration(
        &mut self,
        registration: &Registration,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO registrations (id, user_id, event_id, occurrence_date, status, \
             payment_reference, manual_payment_declared_at, manual_payment_due_at, \
             promoted_from_waitlist_at, waitlist_notification_sent, waitlist_notified_at, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET \
             status = EXCLUDED.status, \
             payment_reference = EXCLUDED.payment_reference, \
             manual_payment_declared_at = EXCLUDED.manual_payment_declared_at, \
             manual_payment_due_at = EXCLUDED.manual_payment_due_at, \
             promoted_from_waitlist_at = EXCLUDED.promoted_from_waitlist_at, \
             waitlist_notification_sent = EXCLUDED.waitlist_notification_sent, \
             waitlist_notified_at = EXCLUDED.waitlist_notified_at, \
             created_at = EXCLUDED.created_at, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(registration.id.as_uuid())
        .bind(registration.user_id.as_uuid())
        .bind(registration.event_id.as_uuid())
        .bind(registration.occurrence_date)
        .bind(registration.status.as_str())
        .bind(&registration.payment_reference)
        .bind(registration.manual_payment_declared_at)
        .bind(registration.manual_payment_due_at)
        .bind(registration.promoted_from_waitlist_at)
        .bind(registration.waitlist_notification_sent)
        .bind(registration.waitlist_notified_at)
        .bind(registration.created_at)
        .bind(registration.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn refund_task_by_id(
        &mut self,
        id: RefundTaskId,
    ) -> Result<Option<RefundTask>, EngineError> {
        let row = sqlx::query_as::<_, RefundTaskRow>(
            "SELECT id, registration_id, refund_eligible, recommended_refund, should_refund, \
             marked_paid, override_reason, reviewed_at, reviewed_by, created_at, updated_at \
             FROM refund_tasks WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(RefundTask::from))
    }

    async fn refund_task_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> Result<Option<RefundTask>, EngineError> {
        let row = sqlx::query_as::<_, RefundTaskRow>(
            "SELECT id, registration_id, refund_eligible, recommended_refund, should_refund, \
             marked_paid, override_reason, reviewed_at, reviewed_by, created_at, updated_at \
             FROM refund_tasks WHERE registration_id = $1",
        )
        .bind(registration_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(RefundTask::from))
    }

    async fn upsert_refund_task(&mut self, task: &RefundTask) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO refund_tasks (id, registration_id, refund_eligible, recommended_refund, \
             should_refund, marked_paid, override_reason, reviewed_at, reviewed_by, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET \
             refund_eligible = EXCLUDED.refund_eligible, \
             recommended_refund = EXCLUDED.recommended_refund, \
             should_refund = EXCLUDED.should_refund, \
             marked_paid = EXCLUDED.marked_paid, \
             override_reason = EXCLUDED.override_reason, \
             reviewed_at = EXCLUDED.reviewed_at, \
             reviewed_by = EXCLUDED.reviewed_by, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(task.id.as_uuid())
        .bind(task.registration_id.as_uuid())
        .bind(task.refund_eligible)
        .bind(task.recommended_refund)
        .bind(task.should_refund)
        .bind(task.marked_paid)
        .bind(&task.override_reason)
        .bind(task.reviewed_at)
        .bind(task.reviewed_by.as_deref())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        self.tx.commit().await?;
        Ok(())
    }
}
