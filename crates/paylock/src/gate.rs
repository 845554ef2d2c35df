//! Inbound notification handling.
//!
//! [`NotificationGate::handle`] does only the synchronous part of the work
//! (authenticate, parse, deduplicate) and returns an [`Ack`] straight away.
//! Verification and actuation run on a spawned worker, bounded by a
//! semaphore, so the payment provider never waits on the lock vendor.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::actuator::LockActuator;
use crate::constants::{DEFAULT_HOLD, DEFAULT_MAX_CONCURRENT_NOTIFICATIONS};
use crate::dedup::NotificationStore;
use crate::error::GateError;
use crate::metrics;
use crate::payment::{
    is_paid_status, NotificationSource, PaymentOutcome, PaymentVerifier, TransactionReference,
};
use crate::signature;
use crate::state_machine::LockStateMachine;

/// Transport-independent view of a webhook request.
#[derive(Debug, Clone)]
pub struct InboundNotification {
    pub content_type: Option<String>,
    /// Value of the `X-Signature` header, if present.
    pub signature: Option<String>,
    pub body: Bytes,
}

/// What the caller is told. Every variant maps to HTTP 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Ack {
    /// New notification; verification is running in the background.
    Accepted { id: String },
    /// Seen inside the dedup window; nothing new was started.
    Duplicate { id: String },
    /// Valid but not actionable.
    Ignored { reason: String },
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Accepted { .. } => "accepted",
            Ack::Duplicate { .. } => "duplicate",
            Ack::Ignored { .. } => "ignored",
        }
    }
}

/// An ack plus, for accepted notifications, the worker processing it.
pub struct Submission {
    pub ack: Ack,
    pub task: Option<JoinHandle<PaymentOutcome>>,
}

#[derive(Clone)]
pub struct GateConfig {
    /// Secret for the signed JSON path. Without it that path is closed.
    pub shared_secret: Option<Vec<u8>>,
    /// How long the lock stays open after a confirmed payment.
    pub hold: Duration,
    pub max_concurrent: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            hold: DEFAULT_HOLD,
            max_concurrent: DEFAULT_MAX_CONCURRENT_NOTIFICATIONS,
        }
    }
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("hold", &self.hold)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedNotification {
    status: String,
    #[serde(alias = "notificationId")]
    id: Option<String>,
    reference: Option<String>,
}

pub struct NotificationGate<V, A> {
    verifier: Arc<V>,
    machine: LockStateMachine<A>,
    store: Arc<dyn NotificationStore>,
    shared_secret: Option<Vec<u8>>,
    hold: Duration,
    workers: Arc<Semaphore>,
}

impl<V, A> NotificationGate<V, A>
where
    V: PaymentVerifier + 'static,
    A: LockActuator + 'static,
{
    pub fn new(
        verifier: V,
        machine: LockStateMachine<A>,
        store: Arc<dyn NotificationStore>,
        config: GateConfig,
    ) -> Self {
        Self {
            verifier: Arc::new(verifier),
            machine,
            store,
            shared_secret: config.shared_secret,
            hold: config.hold,
            workers: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    pub fn machine(&self) -> &LockStateMachine<A> {
        &self.machine
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Validate, deduplicate and dispatch one notification.
    pub fn handle(&self, notification: InboundNotification) -> Result<Ack, GateError> {
        self.submit(notification).map(|s| s.ack)
    }

    /// Like [`handle`](Self::handle), but also returns the worker task.
    pub fn submit(&self, notification: InboundNotification) -> Result<Submission, GateError> {
        let result = self.admit(notification);
        let label = match &result {
            Ok(Admission::Ignored(_)) => "ignored",
            Ok(Admission::New(_)) => "accepted",
            Ok(Admission::Duplicate(_)) => "duplicate",
            Err(GateError::Unauthorized(_)) => "unauthorized",
            Err(GateError::MalformedRequest(_)) => "malformed",
        };
        metrics::NOTIFICATIONS.with_label_values(&[label]).inc();

        match result? {
            Admission::Ignored(reason) => {
                tracing::info!(reason = %reason, "notification ignored");
                Ok(Submission {
                    ack: Ack::Ignored { reason },
                    task: None,
                })
            }
            Admission::Duplicate(id) => {
                tracing::info!(id = %id, "duplicate notification acknowledged");
                Ok(Submission {
                    ack: Ack::Duplicate { id },
                    task: None,
                })
            }
            Admission::New(tx) => {
                let id = tx.id().to_string();
                tracing::info!(id = %id, "notification accepted, verifying payment");
                let task = self.dispatch(tx);
                Ok(Submission {
                    ack: Ack::Accepted { id },
                    task: Some(task),
                })
            }
        }
    }

    fn admit(&self, notification: InboundNotification) -> Result<Admission, GateError> {
        let content_type = notification
            .content_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();

        let tx = if content_type.contains("application/x-www-form-urlencoded") {
            match parse_provider_callback(&notification.body) {
                Ok(code) => TransactionReference::new(
                    code.clone(),
                    notification.body,
                    NotificationSource::ProviderCallback { code },
                ),
                Err(reason) => return Ok(Admission::Ignored(reason)),
            }
        } else if content_type.contains("application/json") {
            self.authenticate(&notification)?;
            let payload: SignedNotification = serde_json::from_slice(&notification.body)
                .map_err(|e| GateError::MalformedRequest(e.to_string()))?;

            if !is_paid_status(&payload.status) {
                return Ok(Admission::Ignored(format!(
                    "status '{}' is not actionable",
                    payload.status
                )));
            }
            let id = payload
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| signature::body_digest(&notification.body));
            TransactionReference::new(
                id,
                notification.body,
                NotificationSource::SignedPayload {
                    claimed_status: payload.status,
                    reference: payload.reference,
                },
            )
        } else {
            return Ok(Admission::Ignored(format!(
                "unsupported content type '{content_type}'"
            )));
        };

        if self.store.try_claim(tx.id()) {
            Ok(Admission::New(tx))
        } else {
            Ok(Admission::Duplicate(tx.id().to_string()))
        }
    }

    /// Checks the HMAC over the raw body before anything parses it.
    fn authenticate(&self, notification: &InboundNotification) -> Result<(), GateError> {
        let Some(secret) = self.shared_secret.as_deref() else {
            tracing::warn!("signed notification received but no shared secret is configured");
            metrics::SIGNATURE_FAILURES
                .with_label_values(&["unconfigured"])
                .inc();
            return Err(GateError::Unauthorized("signing secret not configured"));
        };
        let Some(header) = notification.signature.as_deref() else {
            tracing::warn!("signed notification without signature header");
            metrics::SIGNATURE_FAILURES
                .with_label_values(&["missing"])
                .inc();
            return Err(GateError::Unauthorized("signature required"));
        };
        if !signature::verify_signature_header(secret, &notification.body, header) {
            tracing::warn!("notification signature mismatch");
            metrics::SIGNATURE_FAILURES
                .with_label_values(&["invalid"])
                .inc();
            return Err(GateError::Unauthorized("invalid signature"));
        }
        Ok(())
    }

    fn dispatch(&self, tx: TransactionReference) -> JoinHandle<PaymentOutcome> {
        let verifier = Arc::clone(&self.verifier);
        let machine = self.machine.clone();
        let store = Arc::clone(&self.store);
        let workers = Arc::clone(&self.workers);
        let hold = self.hold;

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                store.release(tx.id());
                return PaymentOutcome::VerificationFailed;
            };

            let outcome = verifier.verify(&tx).await;
            match outcome {
                PaymentOutcome::Paid => {
                    tracing::info!(id = %tx.id(), "payment confirmed, opening lock");
                    if let Err(e) = machine.request_open(hold).await {
                        tracing::error!(id = %tx.id(), error = %e, "lock did not open");
                    }
                }
                PaymentOutcome::NotPaid => {
                    tracing::warn!(id = %tx.id(), "payment not confirmed, lock stays closed");
                }
                PaymentOutcome::VerificationFailed => {
                    // Let a provider retry of this id through.
                    store.release(tx.id());
                    tracing::warn!(id = %tx.id(), "payment could not be verified, lock stays closed");
                }
            }
            outcome
        })
    }
}

enum Admission {
    New(TransactionReference),
    Duplicate(String),
    Ignored(String),
}

/// Extract the lookup code from a PagBank form callback.
fn parse_provider_callback(body: &[u8]) -> Result<String, String> {
    let mut notification_type = None;
    let mut code = None;
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "notificationType" => notification_type = Some(value.into_owned()),
            "notificationCode" => code = Some(value.into_owned()),
            "reference" if code.is_none() => code = Some(value.into_owned()),
            _ => {}
        }
    }

    match notification_type.as_deref() {
        Some("transaction") => {}
        Some(other) => return Err(format!("notification type '{other}' is not actionable")),
        None => return Err("missing notificationType".to_string()),
    }
    code.map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "missing notificationCode".to_string())
}
