//! External collaborator ports.
//!
//! The engine consumes three narrow interfaces: payments, membership,
//! and notifications. Each ships with a deterministic in-process
//! implementation; production adapters live in the embedding
//! application and are injected at construction time.

pub mod membership;
pub mod notify;
pub mod payment;

pub use membership::{MembershipPort, StaticMembership};
pub use notify::{NoopNotifier, NotifyPort};
pub use payment::{
    CreatedPayment, FakePaymentGateway, PaymentPort, PaymentStatus, RefundResult, WebhookResult,
};
