#![allow(dead_code)]

pub mod stub;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use paylock::{
    ActuationError, GateConfig, InMemoryNotificationStore, InboundNotification, LockActuator,
    LockStateMachine, NotificationGate, PaymentOutcome, PaymentVerifier, TransactionReference,
};

pub const SECRET: &[u8] = b"webhook-test-secret-0123456789ab";
pub const HOLD: Duration = Duration::from_secs(8);

/// Verifier that answers with a fixed outcome after an optional delay.
pub struct FixedVerifier {
    outcome: PaymentOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedVerifier {
    pub fn new(outcome: PaymentOutcome) -> Self {
        Self::delayed(outcome, Duration::ZERO)
    }

    pub fn delayed(outcome: PaymentOutcome, delay: Duration) -> Self {
        Self {
            outcome,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PaymentVerifier for FixedVerifier {
    async fn verify(&self, _tx: &TransactionReference) -> PaymentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome
    }
}

/// Actuator that counts commands and can be told to fail unlocks.
#[derive(Default)]
pub struct CountingActuator {
    unlocks: AtomicUsize,
    locks: AtomicUsize,
    fail_unlock: AtomicBool,
}

impl CountingActuator {
    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn fail_unlocks(&self, fail: bool) {
        self.fail_unlock.store(fail, Ordering::SeqCst);
    }
}

impl LockActuator for CountingActuator {
    async fn unlock(&self, _lock_id: &str) -> Result<(), ActuationError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail_unlock.load(Ordering::SeqCst) {
            return Err(ActuationError::new(-3003, "gateway busy"));
        }
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lock(&self, _lock_id: &str) -> Result<(), ActuationError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub type TestGate = NotificationGate<FixedVerifier, CountingActuator>;

pub fn gate(verifier: FixedVerifier) -> TestGate {
    NotificationGate::new(
        verifier,
        LockStateMachine::new("lock-1", CountingActuator::default()),
        Arc::new(InMemoryNotificationStore::default()),
        GateConfig {
            shared_secret: Some(SECRET.to_vec()),
            hold: HOLD,
            max_concurrent: 4,
        },
    )
}

pub fn form_callback(code: &str) -> InboundNotification {
    InboundNotification {
        content_type: Some("application/x-www-form-urlencoded".to_string()),
        signature: None,
        body: Bytes::from(format!(
            "notificationCode={code}&notificationType=transaction"
        )),
    }
}

pub fn signed_json(body: &str) -> InboundNotification {
    InboundNotification {
        content_type: Some("application/json".to_string()),
        signature: Some(paylock::signature::signature_header_value(
            SECRET,
            body.as_bytes(),
        )),
        body: Bytes::from(body.to_string()),
    }
}
