//! Domain layer: entities, the registration state machine, refund
//! review protocol, operation outcomes, and the signal bus.
//!
//! Everything in this module is pure state and policy — no I/O. The
//! store and service layers drive these types inside transactions.

pub mod event;
pub mod ids;
pub mod outcome;
pub mod refund;
pub mod registration;
pub mod signal;

pub use event::Event;
pub use ids::{EventId, RefundTaskId, RegistrationId, UserId};
pub use outcome::{Availability, CancellationOutcome, RegistrationOutcome};
pub use refund::{RefundRecommendation, RefundTask, RefundTaskPatch, RefundUpdateEffect};
pub use registration::{Registration, RegistrationStatus};
pub use signal::{RegistrationSignal, SignalBus};
