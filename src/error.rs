//! Engine error types.
//!
//! [`EngineError`] is the central error type for the registration engine.
//! Every operation returns a typed failure from this closed taxonomy;
//! callers (an HTTP layer, a CLI, a test harness) map variants to their
//! own transport however they like, keyed off [`EngineError::error_code`].

use uuid::Uuid;

/// Engine-wide error enum with a stable numeric code per variant.
///
/// # Error Code Ranges
///
/// | Range     | Category                          |
/// |-----------|-----------------------------------|
/// | 1000–1999 | Validation                        |
/// | 2000–2099 | Not Found                         |
/// | 2100–2199 | State Conflict                    |
/// | 3000–3999 | Server / Infrastructure           |
/// | 4000–4999 | Policy (window, deadline, gating) |
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Event with the given ID was not found.
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Registration with the given ID was not found (or is not visible
    /// to the calling user).
    #[error("registration not found: {0}")]
    RegistrationNotFound(Uuid),

    /// Refund task with the given ID was not found.
    #[error("refund task not found: {0}")]
    RefundTaskNotFound(Uuid),

    /// The user already holds an active or waitlisted registration for
    /// this event occurrence.
    #[error("user already registered for this occurrence")]
    AlreadyRegistered,

    /// The event is restricted to active subscribers.
    #[error("event requires an active subscription")]
    SubscriptionRequired,

    /// Registration attempted after the event has started.
    #[error("event has already started")]
    PastEvent,

    /// The capacity-acquisition retry budget was exhausted.
    #[error("capacity acquisition lost {attempts} consecutive races; giving up")]
    ConcurrencyConflict {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Cancellation attempted inside the cutoff window.
    #[error("cancellation window closed {cutoff_hours}h before event start")]
    CancellationWindowClosed {
        /// The event's cutoff in hours before start.
        cutoff_hours: i64,
    },

    /// Manual payment declared after its due timestamp.
    #[error("manual payment deadline exceeded (was due {due_at})")]
    DeadlineExceeded {
        /// The deadline that was missed.
        due_at: chrono::DateTime<chrono::Utc>,
    },

    /// Manual payment declared for a non-positive computed price.
    #[error("manual payment requires a positive amount")]
    InvalidAmount,

    /// Manual payment declared on a registration that is not awaiting
    /// a bank transfer.
    #[error("registration is not awaiting a manual payment (status: {status})")]
    NotAwaitingPayment {
        /// Current status of the registration.
        status: String,
    },

    /// Admin approval on a registration that is not awaiting
    /// verification. Double-approving lands here the second time.
    #[error("registration is not awaiting verification (status: {status})")]
    NotAwaitingVerification {
        /// Current status of the registration.
        status: String,
    },

    /// Refund decision overridden without an adequate justification.
    #[error("override reason of at least {min_len} characters is required")]
    OverrideReasonRequired {
        /// Minimum accepted reason length.
        min_len: usize,
    },

    /// Refund task update violates the task's own invariants.
    #[error("invalid refund state: {0}")]
    InvalidRefundState(String),

    /// Payment port failure.
    #[error("payment port error: {0}")]
    Payment(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the stable numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::PastEvent => 1001,
            Self::InvalidAmount => 1002,
            Self::OverrideReasonRequired { .. } => 1003,
            Self::EventNotFound(_) => 2001,
            Self::RegistrationNotFound(_) => 2002,
            Self::RefundTaskNotFound(_) => 2003,
            Self::AlreadyRegistered => 2101,
            Self::NotAwaitingPayment { .. } => 2102,
            Self::NotAwaitingVerification { .. } => 2103,
            Self::ConcurrencyConflict { .. } => 2104,
            Self::InvalidRefundState(_) => 2105,
            Self::Internal(_) => 3000,
            Self::Persistence(_) => 3001,
            Self::Payment(_) => 3002,
            Self::SubscriptionRequired => 4001,
            Self::CancellationWindowClosed { .. } => 4002,
            Self::DeadlineExceeded { .. } => 4003,
        }
    }

    /// Returns `true` for conflicts that a caller may resolve by
    /// retrying against fresh state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::Persistence("row not found".to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_unique() {
        let codes = [
            EngineError::PastEvent.error_code(),
            EngineError::InvalidAmount.error_code(),
            EngineError::OverrideReasonRequired { min_len: 8 }.error_code(),
            EngineError::EventNotFound(Uuid::new_v4()).error_code(),
            EngineError::RegistrationNotFound(Uuid::new_v4()).error_code(),
            EngineError::RefundTaskNotFound(Uuid::new_v4()).error_code(),
            EngineError::AlreadyRegistered.error_code(),
            EngineError::NotAwaitingPayment {
                status: "confirmed".to_string(),
            }
            .error_code(),
            EngineError::NotAwaitingVerification {
                status: "confirmed".to_string(),
            }
            .error_code(),
            EngineError::ConcurrencyConflict { attempts: 3 }.error_code(),
            EngineError::InvalidRefundState("x".to_string()).error_code(),
            EngineError::Internal("x".to_string()).error_code(),
            EngineError::Persistence("x".to_string()).error_code(),
            EngineError::Payment("x".to_string()).error_code(),
            EngineError::SubscriptionRequired.error_code(),
            EngineError::CancellationWindowClosed { cutoff_hours: 24 }.error_code(),
            EngineError::DeadlineExceeded {
                due_at: chrono::Utc::now(),
            }
            .error_code(),
        ];
        let mut seen = std::collections::HashSet::new();
        for code in codes {
            assert!(seen.insert(code), "duplicate error code {code}");
        }
    }

    #[test]
    fn only_concurrency_conflict_is_retryable() {
        assert!(EngineError::ConcurrencyConflict { attempts: 3 }.is_retryable());
        assert!(!EngineError::AlreadyRegistered.is_retryable());
        assert!(!EngineError::PastEvent.is_retryable());
    }
}
