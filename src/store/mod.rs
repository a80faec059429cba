//! Persistence ports and implementations.
//!
//! The engine talks to storage through [`Store`] / [`StoreTx`]: every
//! operation runs inside one transaction obtained from [`Store::begin`],
//! mutates through [`StoreTx`], and either commits or rolls back by
//! dropping the transaction. Two implementations ship with the crate:
//! [`postgres::PgStore`] for production and [`memory::MemoryStore`] for
//! tests and local runs.
//!
//! The conditional version bump ([`StoreTx::bump_event_version`]) is
//! the engine's only concurrency primitive — no row or table locks.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::{
    Event, EventId, RefundTask, RefundTaskId, Registration, RegistrationId, RegistrationStatus,
    UserId,
};
use crate::error::EngineError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Transactional store factory.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Opens a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] when a transaction cannot
    /// be opened.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError>;
}

/// One open transaction. Dropping without [`StoreTx::commit`] rolls
/// everything back.
#[async_trait]
pub trait StoreTx: Send {
    /// Loads an event by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn event_by_id(&mut self, id: EventId) -> Result<Option<Event>, EngineError>;

    /// Conditionally increments the event's version: succeeds only if
    /// the stored version still equals `expected_version`. Returns
    /// `false` (no mutation) on mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn bump_event_version(
        &mut self,
        id: EventId,
        expected_version: i64,
    ) -> Result<bool, EngineError>;

    /// Loads a registration by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn registration_by_id(
        &mut self,
        id: RegistrationId,
    ) -> Result<Option<Registration>, EngineError>;

    /// Loads the registration holding the given payment reference.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn registration_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> Result<Option<Registration>, EngineError>;

    /// Loads the user's registration row for one event occurrence.
    /// At most one exists, in any status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn registration_for_user(
        &mut self,
        user_id: UserId,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError>;

    /// Counts registrations in capacity-occupying statuses for the
    /// occurrence. This is the capacity accounting — there is no
    /// separate counter column.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn occupying_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<i64, EngineError>;

    /// Counts registrations in one specific status for the occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn status_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
        status: RegistrationStatus,
    ) -> Result<i64, EngineError>;

    /// Returns the oldest waitlisted registration for the occurrence
    /// (FIFO by creation time, id as tie-break).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn oldest_waitlisted(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError>;

    /// Inserts or updates a registration row by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn upsert_registration(&mut self, registration: &Registration)
    -> Result<(), EngineError>;

    /// Loads a refund task by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn refund_task_by_id(
        &mut self,
        id: RefundTaskId,
    ) -> Result<Option<RefundTask>, EngineError>;

    /// Loads the refund task linked to a registration (1:1).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn refund_task_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> Result<Option<RefundTask>, EngineError>;

    /// Inserts or updates a refund task by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] on storage failure.
    async fn upsert_refund_task(&mut self, task: &RefundTask) -> Result<(), EngineError>;

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] when the commit fails; all
    /// writes are rolled back.
    async fn commit(self: Box<Self>) -> Result<(), EngineError>;
}
