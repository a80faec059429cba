//! Membership port: subscriber status and attendance points.
//!
//! Consumed to resolve a user's price tier and to award points on
//! confirmation. Point awards are best-effort from the engine's point
//! of view — a failure never rolls back a confirmed registration.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::UserId;
use crate::error::EngineError;

/// Narrow port to the subscription/points collaborator.
#[async_trait]
pub trait MembershipPort: Send + Sync + std::fmt::Debug {
    /// Returns whether the user holds an active subscription as of `at`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] on collaborator failure.
    async fn is_active_subscriber(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Adds attendance points to the user's account.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] on collaborator failure.
    async fn award_points(&self, user_id: UserId, points: i32) -> Result<(), EngineError>;
}

/// In-memory membership fake with a fixed subscriber set.
#[derive(Debug, Default)]
pub struct StaticMembership {
    subscribers: Mutex<HashSet<UserId>>,
    points: Mutex<HashMap<UserId, i32>>,
}

impl StaticMembership {
    /// Creates a fake with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a user as an active subscriber.
    pub fn add_subscriber(&self, user_id: UserId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(user_id);
        }
    }

    /// Returns the points recorded for a user, for test assertions.
    #[must_use]
    pub fn points_of(&self, user_id: UserId) -> i32 {
        self.points
            .lock()
            .map(|points| points.get(&user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MembershipPort for StaticMembership {
    async fn is_active_subscriber(
        &self,
        user_id: UserId,
        _at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .subscribers
            .lock()
            .map(|subscribers| subscribers.contains(&user_id))
            .unwrap_or(false))
    }

    async fn award_points(&self, user_id: UserId, points: i32) -> Result<(), EngineError> {
        if let Ok(mut map) = self.points.lock() {
            *map.entry(user_id).or_insert(0) += points;
        }
        Ok(())
    }
}
