//! Event entity: a schedulable activity with capacity and pricing policy.
//!
//! Events are created and edited by an external event-management
//! collaborator; from this engine's perspective they are read-mostly.
//! The one field the engine mutates is `version`, the optimistic lock
//! token bumped on every successful capacity acquisition.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EventId;
use crate::error::EngineError;

/// A single-occurrence event with capacity and pricing policy.
///
/// All monetary amounts are integer minor units (cents) and never
/// negative. `capacity` of `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier. Also the bank-transfer reference for manual
    /// payments.
    pub id: EventId,
    /// Human-readable title.
    pub title: String,
    /// Maximum number of occupying registrations, `None` = unlimited.
    pub capacity: Option<i32>,
    /// Optimistic lock token. Incremented only by a successful
    /// capacity acquisition; never reset.
    pub version: i64,
    /// Price for active subscribers, in minor units.
    pub price_subscriber_cents: i64,
    /// Price for guests (non-subscribers), in minor units.
    pub price_guest_cents: i64,
    /// ISO 4217 currency code for both price tiers.
    pub currency: String,
    /// Whether registration is restricted to active subscribers.
    pub requires_active_subscription: bool,
    /// Whether the offline bank-transfer flow replaces the online
    /// gateway for this event.
    pub manual_payment_enabled: bool,
    /// Transfer instructions shown to the user in manual mode.
    pub manual_payment_instructions: Option<String>,
    /// Hours a user has to declare a bank transfer after being asked.
    pub manual_payment_deadline_hours: i64,
    /// Hours before `start_at` after which cancellation is refused.
    pub cancellation_cutoff_hours: i64,
    /// Attendance points awarded on confirmation.
    pub points_awarded: i32,
    /// Event start. All engine timestamps are timezone-aware UTC.
    pub start_at: DateTime<Utc>,
}

impl Event {
    /// Creates an event with the given start time and policy defaults:
    /// unlimited capacity, free, online payments, 48h manual deadline,
    /// 24h cancellation cutoff.
    #[must_use]
    pub fn new(id: EventId, title: impl Into<String>, start_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            capacity: None,
            version: 0,
            price_subscriber_cents: 0,
            price_guest_cents: 0,
            currency: "EUR".to_string(),
            requires_active_subscription: false,
            manual_payment_enabled: false,
            manual_payment_instructions: None,
            manual_payment_deadline_hours: 48,
            cancellation_cutoff_hours: 24,
            points_awarded: 0,
            start_at,
        }
    }

    /// Returns the occurrence date key. Single-occurrence policy: every
    /// registration for this event carries exactly this date.
    #[must_use]
    pub fn occurrence_date(&self) -> NaiveDate {
        self.start_at.date_naive()
    }

    /// Resolves the effective price for a user, in minor units.
    #[must_use]
    pub const fn price_cents(&self, is_subscriber: bool) -> i64 {
        if is_subscriber {
            self.price_subscriber_cents
        } else {
            self.price_guest_cents
        }
    }

    /// The bank-transfer reference users must quote: the event's own id.
    #[must_use]
    pub fn transfer_reference(&self) -> String {
        self.id.to_string()
    }

    /// Returns `true` if the event has already started at `now`.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now
    }

    /// The instant after which cancellation is refused.
    #[must_use]
    pub fn cancellation_deadline(&self) -> DateTime<Utc> {
        self.start_at - Duration::hours(self.cancellation_cutoff_hours)
    }

    /// Returns `true` while cancellation (with refund eligibility) is
    /// still open at `now`.
    #[must_use]
    pub fn cancellation_window_open(&self, now: DateTime<Utc>) -> bool {
        self.cancellation_deadline() > now
    }

    /// Computes a fresh manual-payment due timestamp from `now`.
    #[must_use]
    pub fn manual_payment_due_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::hours(self.manual_payment_deadline_hours)
    }

    /// Checks the event's own policy invariants.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] when manual payment is enabled
    /// with a positive price but no transfer instructions, or when a
    /// numeric policy field is out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.price_subscriber_cents < 0 || self.price_guest_cents < 0 {
            return Err(EngineError::Internal(format!(
                "event {} has a negative price tier",
                self.id
            )));
        }
        if self.manual_payment_deadline_hours < 1 {
            return Err(EngineError::Internal(format!(
                "event {} manual payment deadline must be at least 1h",
                self.id
            )));
        }
        if self.cancellation_cutoff_hours < 0 || self.points_awarded < 0 {
            return Err(EngineError::Internal(format!(
                "event {} has a negative policy field",
                self.id
            )));
        }
        let max_price = self.price_subscriber_cents.max(self.price_guest_cents);
        if self.manual_payment_enabled && max_price > 0 && self.manual_payment_instructions.is_none()
        {
            return Err(EngineError::Internal(format!(
                "event {} enables manual payment without transfer instructions",
                self.id
            )));
        }
        Ok(())
    }
}
