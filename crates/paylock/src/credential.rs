//! Vendor access-token cache.
//!
//! [`CredentialCache`] hands out a cached TTLock bearer token while it is
//! fresh and performs a single-flight refresh when it is not. The network
//! exchange itself sits behind [`TokenExchange`] so the cache can be driven by
//! a fake in tests.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::constants::{
    DEFAULT_TOKEN_LIFETIME_SECS, MAX_TOKEN_LIFETIME_SECS, TOKEN_LIFETIME_FACTOR,
};
use crate::error::AuthError;
use crate::metrics;
use crate::signature::hex;

/// A bearer token plus the window in which we are willing to use it.
#[derive(Clone)]
pub struct Credential {
    token: String,
    issued_at: Instant,
    expires_at: Instant,
}

impl Credential {
    /// `expires_at` is placed at 90% of the advertised lifetime to absorb
    /// clock skew and request latency. Fails if that point is not
    /// representable as an [`Instant`].
    pub fn new(token: String, issued_at: Instant, lifetime: Duration) -> Result<Self, AuthError> {
        let expires_at = Duration::try_from_secs_f64(lifetime.as_secs_f64() * TOKEN_LIFETIME_FACTOR)
            .ok()
            .and_then(|usable| issued_at.checked_add(usable))
            .ok_or_else(|| {
                AuthError::Malformed(format!(
                    "token lifetime of {}s is out of range",
                    lifetime.as_secs()
                ))
            })?;
        Ok(Self {
            token,
            issued_at,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// `now < expires_at - margin`. A margin too large to add to `now`
    /// means the credential is never valid.
    pub fn is_valid_at(&self, now: Instant, margin: Duration) -> bool {
        now.checked_add(margin)
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of one successful token exchange.
#[derive(Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub lifetime: Duration,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"[REDACTED]")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// One authenticated round trip to the vendor's token endpoint.
pub trait TokenExchange: Send + Sync {
    fn exchange(&self) -> impl Future<Output = Result<IssuedToken, AuthError>> + Send;
}

/// Freshness of the cache, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CredentialStatus {
    Empty,
    Cached {
        #[serde(rename = "expiresInSecs")]
        expires_in_secs: u64,
    },
    Expired,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Empty => "empty",
            CredentialStatus::Cached { .. } => "cached",
            CredentialStatus::Expired => "expired",
        }
    }
}

/// Caches the vendor credential and refreshes it at most once at a time.
pub struct CredentialCache<E> {
    exchange: E,
    cached: RwLock<Option<Credential>>,
    /// Held for the duration of a refresh; waiters queue here.
    refresh: Mutex<Option<AuthError>>,
    /// Number of finished refresh attempts, successful or not.
    completed: AtomicU64,
    margin: Duration,
}

impl<E: TokenExchange> CredentialCache<E> {
    pub fn new(exchange: E) -> Self {
        Self::with_margin(exchange, Duration::ZERO)
    }

    /// `margin` is subtracted from `expires_at` when deciding whether a cached
    /// credential may still be handed out.
    pub fn with_margin(exchange: E, margin: Duration) -> Self {
        Self {
            exchange,
            cached: RwLock::new(None),
            refresh: Mutex::new(None),
            completed: AtomicU64::new(0),
            margin,
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Return a valid credential, refreshing it if needed.
    ///
    /// Callers that arrive while a refresh is in flight wait for it and share
    /// its outcome, including its error, instead of starting their own.
    pub async fn get_credential(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.valid_cached() {
            return Ok(credential);
        }

        let seen = self.completed.load(Ordering::Acquire);
        let mut last_error = self.refresh.lock().await;

        if self.completed.load(Ordering::Acquire) != seen {
            // A refresh finished while we were queued behind it.
            if let Some(credential) = self.valid_cached() {
                return Ok(credential);
            }
            if let Some(e) = last_error.as_ref() {
                return Err(e.clone());
            }
        }
        if let Some(credential) = self.valid_cached() {
            return Ok(credential);
        }

        let started = Instant::now();
        let result = self.exchange.exchange().await.and_then(|issued| {
            Credential::new(issued.access_token, Instant::now(), issued.lifetime)
                .map(|credential| (credential, issued.lifetime))
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok((credential, lifetime)) => {
                *self.write_cached() = Some(credential.clone());
                *last_error = None;
                metrics::CREDENTIAL_REFRESHES
                    .with_label_values(&["success"])
                    .inc();
                tracing::info!(
                    elapsed_ms,
                    lifetime_secs = lifetime.as_secs(),
                    "vendor token refreshed"
                );
                Ok(credential)
            }
            Err(e) => {
                *last_error = Some(e.clone());
                metrics::CREDENTIAL_REFRESHES.with_label_values(&["error"]).inc();
                tracing::warn!(elapsed_ms, error = %e, "vendor token refresh failed");
                Err(e)
            }
        };
        self.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Drop the cached credential, e.g. after the vendor rejected it.
    pub fn invalidate(&self) {
        if self.write_cached().take().is_some() {
            tracing::info!("vendor token invalidated");
        }
    }

    pub fn status(&self) -> CredentialStatus {
        let now = Instant::now();
        match self.read_cached().as_ref() {
            None => CredentialStatus::Empty,
            Some(c) if c.is_valid_at(now, self.margin) => CredentialStatus::Cached {
                expires_in_secs: c.expires_at().saturating_duration_since(now).as_secs(),
            },
            Some(_) => CredentialStatus::Expired,
        }
    }

    fn valid_cached(&self) -> Option<Credential> {
        let now = Instant::now();
        self.read_cached()
            .as_ref()
            .filter(|c| c.is_valid_at(now, self.margin))
            .cloned()
    }

    fn read_cached(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        match self.cached.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("credential cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cached(&self) -> RwLockWriteGuard<'_, Option<Credential>> {
        match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("credential cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Account credentials for the vendor's OAuth password grant.
#[derive(Clone)]
pub struct VendorCredentials {
    pub client_id: String,
    client_secret: String,
    username: String,
    password_md5: String,
}

impl VendorCredentials {
    /// The plaintext password is digested immediately and not retained.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: &str,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password_md5: password_digest(password),
        }
    }
}

impl std::fmt::Debug for VendorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("username", &self.username)
            .field("password_md5", &"[REDACTED]")
            .finish()
    }
}

/// Lowercase hex MD5 of the password, as the TTLock token endpoint requires.
pub fn password_digest(password: &str) -> String {
    hex::encode(Md5::digest(password.as_bytes()))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
    error_description: Option<String>,
}

/// Interpret a token endpoint body.
pub fn parse_token_response(body: &[u8]) -> Result<IssuedToken, AuthError> {
    let parsed: TokenResponse =
        serde_json::from_slice(body).map_err(|e| AuthError::Malformed(e.to_string()))?;

    match parsed.access_token.filter(|t| !t.is_empty()) {
        Some(access_token) => {
            let lifetime_secs = parsed.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
            if lifetime_secs > MAX_TOKEN_LIFETIME_SECS {
                return Err(AuthError::Malformed(format!(
                    "expires_in {lifetime_secs} exceeds {MAX_TOKEN_LIFETIME_SECS}"
                )));
            }
            Ok(IssuedToken {
                access_token,
                lifetime: Duration::from_secs(lifetime_secs),
            })
        }
        None => {
            let reason = parsed
                .errmsg
                .or(parsed.error_description)
                .unwrap_or_else(|| "no access_token in response".to_string());
            match parsed.errcode {
                Some(code) => Err(AuthError::Rejected(format!("{reason} (errcode {code})"))),
                None => Err(AuthError::Rejected(reason)),
            }
        }
    }
}

/// Password-grant exchange against `{base}/oauth2/token`.
pub struct TtlockTokenExchange {
    http: reqwest::Client,
    base_url: String,
    credentials: VendorCredentials,
    timeout: Duration,
}

impl TtlockTokenExchange {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: VendorCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
            timeout,
        }
    }
}

impl TokenExchange for TtlockTokenExchange {
    async fn exchange(&self) -> Result<IssuedToken, AuthError> {
        let url = format!("{}/oauth2/token", self.base_url.trim_end_matches('/'));
        let form = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password_md5.as_str()),
        ];

        let resp = self
            .http
            .post(&url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AuthError::Status(resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        parse_token_response(&body)
    }
}
