//! Payment-gated lock actuation.
//!
//! A PagBank payment notification comes in, the payment is confirmed, and a
//! TTLock smart lock is opened for a fixed hold time before closing itself.
//!
//! # Pieces
//!
//! - [`NotificationGate`] authenticates, deduplicates and acknowledges
//!   notifications, then verifies and actuates in the background
//! - [`PaymentVerifier`] decides paid / not paid ([`PagBankVerifier`])
//! - [`LockStateMachine`] serializes open/close requests and owns the
//!   auto-close timer
//! - [`LockActuator`] sends commands to the lock ([`TtlockActuator`] or
//!   [`SimulatedActuator`])
//! - [`CredentialCache`] keeps one vendor access token and refreshes it
//!   single-flight
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use paylock::{
//!     GateConfig, InMemoryNotificationStore, LockStateMachine, NotificationGate,
//!     PagBankVerifier, SimulatedActuator,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let machine = LockStateMachine::new("1234567", SimulatedActuator::new());
//! let verifier = PagBankVerifier::new(
//!     reqwest::Client::new(),
//!     paylock::constants::PAGBANK_API_BASE,
//!     "shop@example.com",
//!     "pagbank-token",
//!     Duration::from_secs(5),
//! );
//! let gate = NotificationGate::new(
//!     verifier,
//!     machine,
//!     Arc::new(InMemoryNotificationStore::default()),
//!     GateConfig::default(),
//! );
//! # let _ = gate;
//! # }
//! ```

pub mod actuator;
pub mod constants;
pub mod credential;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod payment;
pub mod security;
pub mod signature;
pub mod state_machine;

pub use actuator::{Actuator, LockActuator, LockCommand, SimulatedActuator, TtlockActuator};
pub use credential::{
    Credential, CredentialCache, CredentialStatus, IssuedToken, TokenExchange,
    TtlockTokenExchange, VendorCredentials,
};
pub use dedup::{InMemoryNotificationStore, NotificationStore};
pub use error::{ActuationError, AuthError, GateError, StateError};
pub use gate::{Ack, GateConfig, InboundNotification, NotificationGate, Submission};
pub use payment::{
    NotificationSource, PagBankVerifier, PaymentOutcome, PaymentVerifier, TransactionReference,
};
pub use state_machine::{AutoCloseTimer, LockState, LockStateMachine, LockStatus, Transition};
