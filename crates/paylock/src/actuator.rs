//! Lock and unlock commands.
//!
//! [`TtlockActuator`] talks to the vendor cloud, [`SimulatedActuator`] stands
//! in for it when no hardware is reachable. [`Actuator`] picks one at runtime.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::constants::{VENDOR_OK, VENDOR_TOKEN_REJECTED};
use crate::credential::{CredentialCache, TokenExchange, TtlockTokenExchange};
use crate::error::{ActuationError, AuthError};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    Unlock,
    Lock,
}

impl LockCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockCommand::Unlock => "unlock",
            LockCommand::Lock => "lock",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            LockCommand::Unlock => "/v3/lock/unlock",
            LockCommand::Lock => "/v3/lock/lock",
        }
    }
}

/// Issues commands to the physical lock.
///
/// Implementations are not assumed to be idempotent; callers serialize
/// commands through the state machine.
pub trait LockActuator: Send + Sync {
    fn unlock(&self, lock_id: &str) -> impl Future<Output = Result<(), ActuationError>> + Send;

    fn lock(&self, lock_id: &str) -> impl Future<Output = Result<(), ActuationError>> + Send;
}

#[derive(Deserialize)]
struct CommandResponse {
    errcode: Option<i64>,
    errmsg: Option<String>,
}

/// Interpret a vendor command body. Only `errcode == 0` is success.
pub fn parse_command_response(body: &[u8]) -> Result<(), ActuationError> {
    let parsed: CommandResponse = serde_json::from_slice(body)
        .map_err(|e| ActuationError::new(ActuationError::MALFORMED, e.to_string()))?;
    match parsed.errcode {
        Some(VENDOR_OK) => Ok(()),
        Some(code) => Err(ActuationError::new(
            code,
            parsed.errmsg.unwrap_or_else(|| "unknown vendor error".to_string()),
        )),
        None => Err(ActuationError::new(
            ActuationError::MALFORMED,
            "response has no errcode",
        )),
    }
}

/// TTLock cloud actuator.
///
/// Generic over the token source so the command path can be driven by any
/// [`TokenExchange`]; production uses [`TtlockTokenExchange`].
pub struct TtlockActuator<E = TtlockTokenExchange> {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    credentials: Arc<CredentialCache<E>>,
    timeout: Duration,
}

enum Attempt {
    Done(Result<(), ActuationError>),
    /// Credential could not be used; worth one more try with a fresh one.
    RetryWithFreshToken(ActuationError),
}

impl<E: TokenExchange> TtlockActuator<E> {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        credentials: Arc<CredentialCache<E>>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            credentials,
            timeout,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialCache<E>> {
        &self.credentials
    }

    async fn send(&self, command: LockCommand, lock_id: &str) -> Result<(), ActuationError> {
        let started = Instant::now();
        let result = match self.attempt(command, lock_id).await {
            Attempt::Done(r) => r,
            Attempt::RetryWithFreshToken(e) => {
                tracing::warn!(
                    command = command.as_str(),
                    lock_id,
                    error = %e,
                    "retrying once with a fresh vendor token"
                );
                match self.attempt(command, lock_id).await {
                    Attempt::Done(r) => r,
                    Attempt::RetryWithFreshToken(e) => Err(e),
                }
            }
        };

        let elapsed = started.elapsed();
        metrics::ACTUATION_LATENCY
            .with_label_values(&[command.as_str()])
            .observe(elapsed.as_secs_f64());
        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(()) => {
                metrics::ACTUATIONS
                    .with_label_values(&[command.as_str(), "success"])
                    .inc();
                tracing::info!(
                    command = command.as_str(),
                    lock_id,
                    elapsed_ms,
                    "lock command accepted"
                );
            }
            Err(e) => {
                metrics::ACTUATIONS
                    .with_label_values(&[command.as_str(), "error"])
                    .inc();
                tracing::error!(
                    command = command.as_str(),
                    lock_id,
                    elapsed_ms,
                    code = e.code,
                    error = %e.message,
                    "lock command failed"
                );
            }
        }
        result
    }

    async fn attempt(&self, command: LockCommand, lock_id: &str) -> Attempt {
        let credential = match self.credentials.get_credential().await {
            Ok(c) => c,
            Err(e @ AuthError::Transport(_)) | Err(e @ AuthError::Status(_)) => {
                return Attempt::RetryWithFreshToken(e.into())
            }
            Err(e) => return Attempt::Done(Err(e.into())),
        };

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), command.path());
        let date = chrono::Utc::now().timestamp_millis().to_string();
        let form = [
            ("clientId", self.client_id.as_str()),
            ("accessToken", credential.token()),
            ("lockId", lock_id),
            ("date", date.as_str()),
        ];

        let resp = match self
            .http
            .post(&url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let kind = if e.is_timeout() { "timed out" } else { "failed" };
                return Attempt::Done(Err(ActuationError::new(
                    ActuationError::TRANSPORT,
                    format!("{} request {kind}: {e}", command.as_str()),
                )));
            }
        };

        if !resp.status().is_success() {
            return Attempt::Done(Err(ActuationError::new(
                ActuationError::HTTP,
                format!("vendor returned HTTP {}", resp.status().as_u16()),
            )));
        }

        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return Attempt::Done(Err(ActuationError::new(
                    ActuationError::TRANSPORT,
                    format!("failed to read vendor response: {e}"),
                )))
            }
        };

        match parse_command_response(&body) {
            Err(e) if VENDOR_TOKEN_REJECTED.contains(&e.code) => {
                self.credentials.invalidate();
                Attempt::RetryWithFreshToken(e)
            }
            other => Attempt::Done(other),
        }
    }
}

impl<E: TokenExchange> LockActuator for TtlockActuator<E> {
    async fn unlock(&self, lock_id: &str) -> Result<(), ActuationError> {
        self.send(LockCommand::Unlock, lock_id).await
    }

    async fn lock(&self, lock_id: &str) -> Result<(), ActuationError> {
        self.send(LockCommand::Lock, lock_id).await
    }
}

/// Actuator for environments without lock hardware. Always succeeds.
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    unlocks: AtomicUsize,
    locks: AtomicUsize,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }
}

impl LockActuator for SimulatedActuator {
    async fn unlock(&self, lock_id: &str) -> Result<(), ActuationError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        metrics::ACTUATIONS
            .with_label_values(&["unlock", "simulated"])
            .inc();
        tracing::info!(lock_id, "[simulation] lock opened");
        Ok(())
    }

    async fn lock(&self, lock_id: &str) -> Result<(), ActuationError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        metrics::ACTUATIONS
            .with_label_values(&["lock", "simulated"])
            .inc();
        tracing::info!(lock_id, "[simulation] lock closed");
        Ok(())
    }
}

/// Runtime choice between the vendor cloud and the simulation.
pub enum Actuator {
    Vendor(TtlockActuator),
    Simulated(SimulatedActuator),
}

impl Actuator {
    pub fn is_simulated(&self) -> bool {
        matches!(self, Actuator::Simulated(_))
    }

    /// The vendor credential cache, when talking to real hardware.
    pub fn credentials(&self) -> Option<&Arc<CredentialCache<TtlockTokenExchange>>> {
        match self {
            Actuator::Vendor(a) => Some(a.credentials()),
            Actuator::Simulated(_) => None,
        }
    }
}

impl LockActuator for Actuator {
    async fn unlock(&self, lock_id: &str) -> Result<(), ActuationError> {
        match self {
            Actuator::Vendor(a) => a.unlock(lock_id).await,
            Actuator::Simulated(a) => a.unlock(lock_id).await,
        }
    }

    async fn lock(&self, lock_id: &str) -> Result<(), ActuationError> {
        match self {
            Actuator::Vendor(a) => a.lock(lock_id).await,
            Actuator::Simulated(a) => a.lock(lock_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::VendorCredentials;

    fn unreachable_actuator() -> TtlockActuator {
        let http = reqwest::Client::new();
        let exchange = TtlockTokenExchange::new(
            http.clone(),
            "http://127.0.0.1:1",
            VendorCredentials::new("client", "secret", "owner@example.com", "pw"),
            Duration::from_millis(200),
        );
        TtlockActuator::new(
            http,
            "http://127.0.0.1:1",
            "client",
            Arc::new(CredentialCache::new(exchange)),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_errcode_zero_is_success() {
        assert!(parse_command_response(br#"{"errcode":0,"errmsg":"none error message"}"#).is_ok());
    }

    #[test]
    fn test_nonzero_errcode_is_failure() {
        let e = parse_command_response(br#"{"errcode":-3003,"errmsg":"gateway busy"}"#).unwrap_err();
        assert_eq!(e.code, -3003);
        assert_eq!(e.message, "gateway busy");
    }

    #[test]
    fn test_missing_errcode_is_failure() {
        let e = parse_command_response(br#"{"errmsg":"ok?"}"#).unwrap_err();
        assert_eq!(e.code, ActuationError::MALFORMED);
    }

    #[test]
    fn test_malformed_body_is_failure() {
        let e = parse_command_response(b"<html>502</html>").unwrap_err();
        assert_eq!(e.code, ActuationError::MALFORMED);
    }

    #[tokio::test]
    async fn test_unreachable_vendor_surfaces_auth_failure() {
        let actuator = unreachable_actuator();
        let e = actuator.unlock("lock-1").await.unwrap_err();
        assert_eq!(e.code, ActuationError::AUTH);
        assert_eq!(actuator.credentials().status().as_str(), "empty");
    }

    #[tokio::test]
    async fn test_simulated_actuator_counts_commands() {
        let actuator = Actuator::Simulated(SimulatedActuator::new());
        assert!(actuator.is_simulated());
        assert!(actuator.credentials().is_none());
        actuator.unlock("lock-1").await.unwrap();
        actuator.unlock("lock-1").await.unwrap();
        actuator.lock("lock-1").await.unwrap();
        let Actuator::Simulated(sim) = &actuator else {
            unreachable!()
        };
        assert_eq!(sim.unlock_count(), 2);
        assert_eq!(sim.lock_count(), 1);
    }
}
