//! # signup-engine
//!
//! Transactional registration engine for capacity-constrained events:
//! spot acquisition under concurrency, waitlists with FIFO promotion,
//! online and bank-transfer payment flows, and an admin refund
//! protocol. The engine is a library — the embedding application owns
//! the transport layer and injects the payment, membership and
//! notification collaborators.
//!
//! ## Architecture
//!
//! ```text
//! Embedding application (HTTP, jobs, CLI)
//!     │
//!     ├── RegistrationEngine (service/)
//!     │       ├── capacity ledger (service/capacity)
//!     │       └── waitlist promotion (service/promotion)
//!     │
//!     ├── SignalBus (domain/)
//!     ├── Registration state machine (domain/)
//!     │
//!     ├── PaymentPort / MembershipPort / NotifyPort (ports/)
//!     │
//!     └── Store: PostgreSQL or in-memory (store/)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;
pub mod store;
