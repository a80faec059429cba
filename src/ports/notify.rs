//! Notification port: best-effort outbound side effects.
//!
//! Promotion notifications and calendar sync are fired after state
//! transitions; a failure here is logged and swallowed, never fatal to
//! the transition that triggered it.

use async_trait::async_trait;

use crate::domain::{Event, UserId};
use crate::error::EngineError;

/// Narrow port to the notification/calendar collaborator.
#[async_trait]
pub trait NotifyPort: Send + Sync + std::fmt::Debug {
    /// Tells a user their waitlisted registration was promoted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] on collaborator failure; the
    /// engine logs and swallows it.
    async fn notify_waitlist_promotion(
        &self,
        user_id: UserId,
        event: &Event,
    ) -> Result<(), EngineError>;

    /// Pushes a confirmed registration to the user's external calendar.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] on collaborator failure; the
    /// engine logs and swallows it.
    async fn sync_calendar(&self, user_id: UserId, event: &Event) -> Result<(), EngineError>;
}

/// No-op notifier for tests and headless deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl NotifyPort for NoopNotifier {
    async fn notify_waitlist_promotion(
        &self,
        user_id: UserId,
        event: &Event,
    ) -> Result<(), EngineError> {
        tracing::debug!(%user_id, event_id = %event.id, "noop promotion notification");
        Ok(())
    }

    async fn sync_calendar(&self, user_id: UserId, event: &Event) -> Result<(), EngineError> {
        tracing::debug!(%user_id, event_id = %event.id, "noop calendar sync");
        Ok(())
    }
}
