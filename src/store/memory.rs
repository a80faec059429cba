//! In-memory store for tests and local runs.
//!
//! Transactions take an async mutex over the whole state and work on a
//! cloned copy; commit writes the copy back, rollback (drop) discards
//! it. That serializes transactions — strictly stronger isolation than
//! the engine needs — while keeping the version-CAS semantics identical
//! to the PostgreSQL store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Store, StoreTx};
use crate::domain::{
    Event, EventId, RefundTask, RefundTaskId, Registration, RegistrationId, RegistrationStatus,
    UserId,
};
use crate::error::EngineError;

#[derive(Debug, Default, Clone)]
struct MemoryState {
    events: HashMap<EventId, Event>,
    registrations: HashMap<RegistrationId, Registration>,
    refund_tasks: HashMap<RefundTaskId, RefundTask>,
}

/// Deterministic in-memory [`Store`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an event. Event management is an external collaborator in
    /// production; tests use this to stand in for it.
    pub async fn seed_event(&self, event: Event) {
        self.state.lock().await.events.insert(event.id, event);
    }

    /// Reads an event outside any transaction, for test assertions.
    pub async fn event(&self, id: EventId) -> Option<Event> {
        self.state.lock().await.events.get(&id).cloned()
    }

    /// Reads a registration outside any transaction, for test
    /// assertions.
    pub async fn registration(&self, id: RegistrationId) -> Option<Registration> {
        self.state.lock().await.registrations.get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

/// One open transaction over the cloned state.
#[derive(Debug)]
struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn event_by_id(&mut self, id: EventId) -> Result<Option<Event>, EngineError> {
        Ok(self.working.events.get(&id).cloned())
    }

    async fn bump_event_version(
        &mut self,
        id: EventId,
        expected_version: i64,
    ) -> Result<bool, EngineError> {
        match self.working.events.get_mut(&id) {
            Some(event) if event.version == expected_version => {
                event.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn registration_by_id(
        &mut self,
        id: RegistrationId,
    ) -> Result<Option<Registration>, EngineError> {
        Ok(self.working.registrations.get(&id).cloned())
    }

    async fn registration_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> Result<Option<Registration>, EngineError> {
        Ok(self
            .working
            .registrations
            .values()
            .find(|r| r.payment_reference.as_deref() == Some(payment_reference))
            .cloned())
    }

    async fn registration_for_user(
        &mut self,
        user_id: UserId,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError> {
        Ok(self
            .working
            .registrations
            .values()
            .find(|r| {
                r.user_id == user_id
                    && r.event_id == event_id
                    && r.occurrence_date == occurrence_date
            })
            .cloned())
    }

    async fn occupying_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<i64, EngineError> {
        Ok(self
            .working
            .registrations
            .values()
            .filter(|r| {
                r.event_id == event_id
                    && r.occurrence_date == occurrence_date
                    && r.status.occupies_capacity()
            })
            .count() as i64)
    }

    async fn status_count(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
        status: RegistrationStatus,
    ) -> Result<i64, EngineError> {
        Ok(self
            .working
            .registrations
            .values()
            .filter(|r| {
                r.event_id == event_id
                    && r.occurrence_date == occurrence_date
                    && r.status == status
            })
            .count() as i64)
    }

    async fn oldest_waitlisted(
        &mut self,
        event_id: EventId,
        occurrence_date: NaiveDate,
    ) -> Result<Option<Registration>, EngineError> {
        Ok(self
            .working
            .registrations
            .values()
            .filter(|r| {
                r.event_id == event_id
                    && r.occurrence_date == occurrence_date
                    && r.status == RegistrationStatus::Waitlist
            })
            .min_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn upsert_registration(
        &mut self,
        registration: &Registration,
    ) -> Result<(), EngineError> {
        self.working
            .registrations
            .insert(registration.id, registration.clone());
        Ok(())
    }

    async fn refund_task_by_id(
        &mut self,
        id: RefundTaskId,
    ) -> Result<Option<RefundTask>, EngineError> {
        Ok(self.working.refund_tasks.get(&id).cloned())
    }

    async fn refund_task_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> Result<Option<RefundTask>, EngineError> {
        Ok(self
            .working
            .refund_tasks
            .values()
            .find(|t| t.registration_id == registration_id)
            .cloned())
    }

    async fn upsert_refund_task(&mut self, task: &RefundTask) -> Result<(), EngineError> {
        self.working.refund_tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), EngineError> {
        *self.guard = self.working;
        Ok(())
    }
}
