use thiserror::Error;

use crate::state_machine::LockState;

/// Failures while exchanging vendor credentials for an access token.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Transport(String),

    #[error("token endpoint returned HTTP {0}")]
    Status(u16),

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("vendor rejected credentials: {0}")]
    Rejected(String),
}

/// A lock or unlock command that did not complete with the vendor's success code.
#[derive(Debug, Clone, Error)]
#[error("actuation failed (code {code}): {message}")]
pub struct ActuationError {
    /// Vendor `errcode`, or one of the local sentinels below.
    pub code: i64,
    pub message: String,
}

impl ActuationError {
    /// Credential could not be obtained.
    pub const AUTH: i64 = -1;
    /// Transport failure or timeout.
    pub const TRANSPORT: i64 = -2;
    /// Response body was not the expected JSON.
    pub const MALFORMED: i64 = -3;
    /// Non-2xx HTTP status.
    pub const HTTP: i64 = -4;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AuthError> for ActuationError {
    fn from(e: AuthError) -> Self {
        Self::new(Self::AUTH, e.to_string())
    }
}

/// Errors surfaced by [`LockStateMachine`](crate::state_machine::LockStateMachine) operations.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("cannot {operation} while lock is {from}")]
    InvalidTransition {
        from: LockState,
        operation: &'static str,
    },

    #[error(transparent)]
    Actuation(#[from] ActuationError),
}

/// Synchronous rejections of an inbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}
