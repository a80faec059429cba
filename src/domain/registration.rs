//! Registration entity and its lifecycle state machine.
//!
//! A [`Registration`] is one user's claim on one occurrence of one
//! event. Rows are never deleted: cancellation is a status transition,
//! and a later re-registration reactivates the same row, preserving the
//! one-row-per-(user, event, occurrence) invariant.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EventId, RegistrationId, UserId};
use crate::error::EngineError;

/// Lifecycle state of a registration.
///
/// Closed enum with exhaustive matching at every transition site —
/// status strings exist only at the serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Awaiting completion of an online gateway payment.
    PendingPayment,
    /// Holds a spot; fully settled.
    Confirmed,
    /// Queued for a spot; does not count against capacity.
    Waitlist,
    /// Holds a spot; awaiting the user's bank-transfer declaration.
    ManualPaymentRequired,
    /// Holds a spot; transfer declared, awaiting admin verification.
    ManualPaymentVerification,
    /// Terminal: cancelled by the user or an admin.
    Cancelled,
    /// Terminal: cancelled and refund executed.
    Refunded,
    /// Terminal: payment failed or was abandoned.
    Failed,
}

impl RegistrationStatus {
    /// Returns `true` if this status counts against event capacity.
    #[must_use]
    pub const fn occupies_capacity(&self) -> bool {
        matches!(
            self,
            Self::Confirmed
                | Self::PendingPayment
                | Self::ManualPaymentRequired
                | Self::ManualPaymentVerification
        )
    }

    /// Returns `true` for terminal states. Terminal rows may only be
    /// reactivated by a fresh registration attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded | Self::Failed)
    }

    /// Stable string form used in the database and in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Waitlist => "waitlist",
            Self::ManualPaymentRequired => "manual_payment_required",
            Self::ManualPaymentVerification => "manual_payment_verification",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(Self::PendingPayment),
            "confirmed" => Ok(Self::Confirmed),
            "waitlist" => Ok(Self::Waitlist),
            "manual_payment_required" => Ok(Self::ManualPaymentRequired),
            "manual_payment_verification" => Ok(Self::ManualPaymentVerification),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Persistence(format!(
                "unknown registration status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's claim on one occurrence of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Row identifier, stable across reactivation.
    pub id: RegistrationId,
    /// The registering user.
    pub user_id: UserId,
    /// The event being registered for.
    pub event_id: EventId,
    /// Occurrence date key; equals the event's own occurrence date.
    pub occurrence_date: NaiveDate,
    /// Current lifecycle state.
    pub status: RegistrationStatus,
    /// Opaque reference to the linked payment, if any.
    pub payment_reference: Option<String>,
    /// When the user declared their bank transfer.
    pub manual_payment_declared_at: Option<DateTime<Utc>>,
    /// Deadline for declaring the bank transfer.
    pub manual_payment_due_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the waitlist promotion engine advances
    /// this row.
    pub promoted_from_waitlist_at: Option<DateTime<Utc>>,
    /// Whether the promoted user has been notified.
    pub waitlist_notification_sent: bool,
    /// When the promotion notification went out.
    pub waitlist_notified_at: Option<DateTime<Utc>>,
    /// Row creation time; FIFO key for waitlist ordering.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Registration {
    /// Creates a fresh registration row in the given initial status.
    #[must_use]
    pub fn new(
        user_id: UserId,
        event_id: EventId,
        occurrence_date: NaiveDate,
        status: RegistrationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RegistrationId::new(),
            user_id,
            event_id,
            occurrence_date,
            status,
            payment_reference: None,
            manual_payment_declared_at: None,
            manual_payment_due_at: None,
            promoted_from_waitlist_at: None,
            waitlist_notification_sent: false,
            waitlist_notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resets a terminal row for a fresh registration attempt.
    ///
    /// Clears payment, manual-payment, promotion and notification
    /// fields; the caller then places the row exactly as it would a
    /// brand-new one. `created_at` is reset so a reactivated row queues
    /// at the back of the waitlist, not at its original position.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRegistered`] if the row is not in
    /// a terminal state.
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.is_terminal() {
            return Err(EngineError::AlreadyRegistered);
        }
        self.payment_reference = None;
        self.manual_payment_declared_at = None;
        self.manual_payment_due_at = None;
        self.promoted_from_waitlist_at = None;
        self.waitlist_notification_sent = false;
        self.waitlist_notified_at = None;
        self.created_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Places the row in an occupying or waitlisted status, used both
    /// for fresh rows and reactivated ones.
    pub fn place(&mut self, status: RegistrationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// Marks the row confirmed.
    pub fn confirm(&mut self, now: DateTime<Utc>) {
        self.status = RegistrationStatus::Confirmed;
        self.updated_at = now;
    }

    /// Marks the row failed after the gateway reports its payment
    /// failed or abandoned.
    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.status = RegistrationStatus::Failed;
        self.updated_at = now;
    }

    /// User declares their bank transfer.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotAwaitingPayment`] if the row is not in
    ///   `ManualPaymentRequired`.
    /// - [`EngineError::DeadlineExceeded`] if `now` is past the due
    ///   timestamp. The row is left untouched.
    pub fn declare_manual_payment(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != RegistrationStatus::ManualPaymentRequired {
            return Err(EngineError::NotAwaitingPayment {
                status: self.status.to_string(),
            });
        }
        if let Some(due_at) = self.manual_payment_due_at
            && now > due_at
        {
            return Err(EngineError::DeadlineExceeded { due_at });
        }
        self.status = RegistrationStatus::ManualPaymentVerification;
        self.manual_payment_declared_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Admin approves the declared transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotAwaitingVerification`] unless the row
    /// is in `ManualPaymentVerification`. A second approval of an
    /// already-confirmed row lands here — the conflict is stable under
    /// repeated calls, never a silent success.
    pub fn approve_manual_payment(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != RegistrationStatus::ManualPaymentVerification {
            return Err(EngineError::NotAwaitingVerification {
                status: self.status.to_string(),
            });
        }
        self.status = RegistrationStatus::Confirmed;
        self.updated_at = now;
        Ok(())
    }

    /// Cancels the row.
    ///
    /// Cutoff-window gating is the orchestrator's job; this transition
    /// only refuses rows that are already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RegistrationNotFound`] for a row already
    /// in a terminal state.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::RegistrationNotFound(*self.id.as_uuid()));
        }
        self.status = RegistrationStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// Marks a cancelled row refunded. Only reachable through an admin
    /// marking the linked refund task paid.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRefundState`] unless the row is
    /// currently `Cancelled`.
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != RegistrationStatus::Cancelled {
            return Err(EngineError::InvalidRefundState(format!(
                "registration {} is {}, not cancelled",
                self.id, self.status
            )));
        }
        self.status = RegistrationStatus::Refunded;
        self.updated_at = now;
        Ok(())
    }

    /// Promotion engine advances this waitlisted row into `status`.
    ///
    /// Records `promoted_from_waitlist_at` (set exactly once) and, for
    /// a paid promotion, the fresh manual-payment deadline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if the row is not waitlisted.
    pub fn promote(
        &mut self,
        status: RegistrationStatus,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.status != RegistrationStatus::Waitlist {
            return Err(EngineError::Internal(format!(
                "promotion of non-waitlisted registration {}",
                self.id
            )));
        }
        self.status = status;
        if self.promoted_from_waitlist_at.is_none() {
            self.promoted_from_waitlist_at = Some(now);
        }
        self.manual_payment_due_at = due_at;
        self.updated_at = now;
        Ok(())
    }

    /// Records that the promotion notification went out.
    pub fn mark_waitlist_notified(&mut self, now: DateTime<Utc>) {
        self.waitlist_notification_sent = true;
        self.waitlist_notified_at = Some(now);
        self.updated_at = now;
    }
}
