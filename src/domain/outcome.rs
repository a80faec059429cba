//! Operation outcomes returned to callers.
//!
//! Every engine operation resolves to a definitive outcome — confirmed,
//! waitlisted, awaiting a payment step, or a typed error. There is no
//! "pending indefinitely" response. Waitlisting is a success outcome,
//! never an error.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::RegistrationId;
use super::refund::RefundTask;
use super::registration::Registration;

/// Terminal outcome of a registration or manual-payment operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// Spot held and fully settled.
    Confirmed {
        /// The confirmed registration.
        registration: Registration,
    },

    /// Capacity was exhausted; the user is queued.
    Waitlisted {
        /// The waitlisted registration.
        registration: Registration,
        /// Queue position (1-based, FIFO).
        position: i64,
    },

    /// Spot held; the user must complete a bank transfer.
    ManualPaymentRequired {
        /// The registration holding the spot.
        registration: Registration,
        /// Amount due, in minor units.
        amount_cents: i64,
        /// ISO 4217 currency code.
        currency: String,
        /// Reference the transfer must quote (the event id).
        transfer_reference: String,
        /// Bank details / instructions for the transfer.
        instructions: Option<String>,
        /// Deadline for declaring the transfer.
        due_at: DateTime<Utc>,
    },

    /// Spot held; the user must complete an online checkout.
    PaymentPending {
        /// The registration holding the spot.
        registration: Registration,
        /// The created payment's identifier.
        payment_id: String,
        /// Gateway URL to redirect the user to.
        redirect_url: String,
    },

    /// Bank transfer declared; an admin will verify it.
    AwaitingVerification {
        /// The registration awaiting verification.
        registration: Registration,
    },
}

impl RegistrationOutcome {
    /// Returns the registration carried by this outcome.
    #[must_use]
    pub const fn registration(&self) -> &Registration {
        match self {
            Self::Confirmed { registration }
            | Self::Waitlisted { registration, .. }
            | Self::ManualPaymentRequired { registration, .. }
            | Self::PaymentPending { registration, .. }
            | Self::AwaitingVerification { registration } => registration,
        }
    }

    /// Returns the outcome discriminant as a static string slice.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Confirmed { .. } => "confirmed",
            Self::Waitlisted { .. } => "waitlisted",
            Self::ManualPaymentRequired { .. } => "manual_payment_required",
            Self::PaymentPending { .. } => "payment_pending",
            Self::AwaitingVerification { .. } => "awaiting_verification",
        }
    }
}

/// Outcome of a cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    /// The cancelled registration.
    pub registration: Registration,
    /// Refund review task; `None` when the row never occupied capacity
    /// (a waitlist cancellation).
    pub refund_task: Option<RefundTask>,
    /// Registration promoted into the freed spot, if any.
    pub promoted: Option<RegistrationId>,
}

/// Point-in-time availability snapshot for one event occurrence.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Availability {
    /// Registrations currently confirmed.
    pub confirmed_count: i64,
    /// Registrations currently queued.
    pub waitlist_count: i64,
    /// Spots left; `None` for unlimited-capacity events.
    pub available_spots: Option<i64>,
    /// Whether a new registration would get a spot right now.
    pub is_available: bool,
}
