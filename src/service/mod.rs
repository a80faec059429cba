//! Service layer: capacity accounting, waitlist promotion and the
//! registration orchestrator.

pub mod capacity;
pub mod engine;
pub mod promotion;

pub use capacity::{AcquireOutcome, try_acquire};
pub use engine::RegistrationEngine;
pub use promotion::promote_next;
