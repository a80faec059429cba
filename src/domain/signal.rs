//! Domain signals reflecting registration state mutations.
//!
//! Every state mutation publishes a [`RegistrationSignal`] through the
//! [`SignalBus`], a `tokio::broadcast` wrapper. Consumers — an audit
//! log, a live admin dashboard, a metrics exporter — subscribe from the
//! embedding application; the engine itself only publishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::ids::{EventId, RefundTaskId, RegistrationId};
use super::registration::RegistrationStatus;

/// Domain signal emitted after every registration state mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum RegistrationSignal {
    /// A registration reached `confirmed`.
    RegistrationConfirmed {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// Whether confirmation came through a waitlist promotion.
        via_promotion: bool,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Capacity was exhausted; the user was queued.
    RegistrationWaitlisted {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// 1-based queue position at placement time.
        position: i64,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A spot was held pending a bank transfer.
    ManualPaymentRequested {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// Declaration deadline.
        due_at: DateTime<Utc>,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The user declared their bank transfer.
    ManualPaymentDeclared {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// Linked payment reference.
        payment_reference: String,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A registration was cancelled.
    RegistrationCancelled {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// Status the row held before cancellation.
        previous_status: RegistrationStatus,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The promotion engine advanced a waitlisted registration.
    WaitlistPromoted {
        /// Registration identifier.
        registration_id: RegistrationId,
        /// Event identifier.
        event_id: EventId,
        /// Status the row was promoted into.
        new_status: RegistrationStatus,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// An admin reviewed or resolved a refund task.
    RefundTaskReviewed {
        /// Task identifier.
        task_id: RefundTaskId,
        /// Registration under review.
        registration_id: RegistrationId,
        /// Whether the task is now resolved.
        resolved: bool,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A refund was executed against the linked payment.
    RefundExecuted {
        /// Task identifier.
        task_id: RefundTaskId,
        /// Registration that was refunded.
        registration_id: RegistrationId,
        /// Mutation timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl RegistrationSignal {
    /// Returns the registration ID associated with this signal.
    #[must_use]
    pub const fn registration_id(&self) -> RegistrationId {
        match self {
            Self::RegistrationConfirmed { registration_id, .. }
            | Self::RegistrationWaitlisted { registration_id, .. }
            | Self::ManualPaymentRequested { registration_id, .. }
            | Self::ManualPaymentDeclared { registration_id, .. }
            | Self::RegistrationCancelled { registration_id, .. }
            | Self::WaitlistPromoted { registration_id, .. }
            | Self::RefundTaskReviewed { registration_id, .. }
            | Self::RefundExecuted { registration_id, .. } => *registration_id,
        }
    }

    /// Returns the signal type as a static string slice.
    #[must_use]
    pub const fn signal_type_str(&self) -> &'static str {
        match self {
            Self::RegistrationConfirmed { .. } => "registration_confirmed",
            Self::RegistrationWaitlisted { .. } => "registration_waitlisted",
            Self::ManualPaymentRequested { .. } => "manual_payment_requested",
            Self::ManualPaymentDeclared { .. } => "manual_payment_declared",
            Self::RegistrationCancelled { .. } => "registration_cancelled",
            Self::WaitlistPromoted { .. } => "waitlist_promoted",
            Self::RefundTaskReviewed { .. } => "refund_task_reviewed",
            Self::RefundExecuted { .. } => "refund_executed",
        }
    }
}

/// Broadcast bus for [`RegistrationSignal`]s.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity.
/// When the ring buffer is full, the oldest signals are dropped for
/// lagging receivers.
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<RegistrationSignal>,
}

impl SignalBus {
    /// Creates a new `SignalBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes a signal to all subscribers.
    ///
    /// Returns the number of receivers that received the signal.
    /// With no active receivers, the signal is silently dropped.
    pub fn publish(&self, signal: RegistrationSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }

    /// Creates a new receiver that will receive all future signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationSignal> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
