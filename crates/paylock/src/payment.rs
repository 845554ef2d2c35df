//! Payment confirmation.
//!
//! A notification only tells us that *something* happened to a transaction.
//! [`PaymentVerifier::verify`] decides whether it is actually paid: provider
//! callbacks are re-queried against PagBank by notification code, signed
//! payloads are classified from their authenticated status field.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::constants::{PAID_STATUS_CODES, PAID_STATUS_WORDS};
use crate::metrics;

/// Where a notification came from, and therefore what may be trusted in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationSource {
    /// Form-encoded provider callback. Carries nothing but a code to look up.
    ProviderCallback { code: String },
    /// JSON body whose HMAC signature has already been checked.
    SignedPayload {
        claimed_status: String,
        reference: Option<String>,
    },
}

/// One inbound notification, as accepted by the gate.
#[derive(Debug, Clone)]
pub struct TransactionReference {
    id: String,
    raw_payload: Bytes,
    received_at: DateTime<Utc>,
    source: NotificationSource,
}

impl TransactionReference {
    pub fn new(id: impl Into<String>, raw_payload: Bytes, source: NotificationSource) -> Self {
        Self {
            id: id.into(),
            raw_payload,
            received_at: Utc::now(),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw_payload(&self) -> &Bytes {
        &self.raw_payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn source(&self) -> &NotificationSource {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Paid,
    NotPaid,
    /// Status could not be determined. Treated exactly like `NotPaid` for
    /// actuation purposes.
    VerificationFailed,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Paid => "paid",
            PaymentOutcome::NotPaid => "not_paid",
            PaymentOutcome::VerificationFailed => "verification_failed",
        }
    }
}

/// Provider status field: PagBank v3 uses integers, other channels use words.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProviderStatus {
    Code(i64),
    Text(String),
}

impl ProviderStatus {
    pub fn is_paid(&self) -> bool {
        match self {
            ProviderStatus::Code(code) => PAID_STATUS_CODES.contains(code),
            ProviderStatus::Text(text) => is_paid_status(text),
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderStatus::Code(code) => write!(f, "{code}"),
            ProviderStatus::Text(text) => f.write_str(text),
        }
    }
}

/// Whether a textual status belongs to the accepted "paid" set.
///
/// Numeric strings are accepted too, since some callbacks stringify the
/// PagBank status code.
pub fn is_paid_status(status: &str) -> bool {
    let status = status.trim();
    if let Ok(code) = status.parse::<i64>() {
        return PAID_STATUS_CODES.contains(&code);
    }
    PAID_STATUS_WORDS
        .iter()
        .any(|w| w.eq_ignore_ascii_case(status))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub status: ProviderStatus,
    pub reference: Option<String>,
    #[serde(alias = "amount")]
    pub gross_amount: Option<serde_json::Value>,
}

/// Parse a provider transaction lookup body.
pub fn parse_transaction_status(body: &[u8]) -> Result<TransactionStatusResponse, String> {
    serde_json::from_slice(body).map_err(|e| format!("invalid transaction response: {e}"))
}

/// Classifies a transaction as paid or not.
pub trait PaymentVerifier: Send + Sync {
    /// Read-only; calling it twice on the same reference has no side effects.
    fn verify(
        &self,
        tx: &TransactionReference,
    ) -> impl Future<Output = PaymentOutcome> + Send;
}

/// PagBank v3 notification lookup.
pub struct PagBankVerifier {
    http: reqwest::Client,
    base_url: String,
    email: String,
    token: String,
    timeout: Duration,
}

impl PagBankVerifier {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            email: email.into(),
            token: token.into(),
            timeout,
        }
    }

    async fn query(&self, code: &str) -> Result<TransactionStatusResponse, String> {
        let url = format!(
            "{}/v3/transactions/notifications/{}",
            self.base_url.trim_end_matches('/'),
            code
        );
        let resp = self
            .http
            .get(&url)
            .query(&[("email", self.email.as_str()), ("token", self.token.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("provider request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("provider returned HTTP {}", resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| format!("provider body read failed: {e}"))?;
        parse_transaction_status(&body)
    }
}

impl std::fmt::Debug for PagBankVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagBankVerifier")
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .field("token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PaymentVerifier for PagBankVerifier {
    async fn verify(&self, tx: &TransactionReference) -> PaymentOutcome {
        let outcome = match tx.source() {
            NotificationSource::SignedPayload {
                claimed_status,
                reference,
            } => {
                let paid = is_paid_status(claimed_status);
                tracing::info!(
                    id = %tx.id(),
                    reference = reference.as_deref().unwrap_or("N/A"),
                    status = %claimed_status,
                    "signed payment notification classified"
                );
                if paid {
                    PaymentOutcome::Paid
                } else {
                    PaymentOutcome::NotPaid
                }
            }
            NotificationSource::ProviderCallback { code } => match self.query(code).await {
                Ok(resp) => {
                    tracing::info!(
                        id = %tx.id(),
                        reference = resp.reference.as_deref().unwrap_or("N/A"),
                        amount = ?resp.gross_amount,
                        status = %resp.status,
                        "transaction status fetched"
                    );
                    if resp.status.is_paid() {
                        PaymentOutcome::Paid
                    } else {
                        PaymentOutcome::NotPaid
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %tx.id(), error = %e, "transaction verification failed");
                    PaymentOutcome::VerificationFailed
                }
            },
        };
        metrics::VERIFICATIONS
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }
}
