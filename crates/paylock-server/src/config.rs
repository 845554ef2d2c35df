use std::env;
use std::str::FromStr;
use std::time::Duration;

use paylock::constants::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW, DEFAULT_HOLD,
    DEFAULT_MAX_CONCURRENT_NOTIFICATIONS, DEFAULT_PROVIDER_TIMEOUT, DEFAULT_VENDOR_TIMEOUT,
    MAX_HOLD, PAGBANK_API_BASE, TTLOCK_API_BASE,
};
use url::Url;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

/// TTLock account used for the OAuth password grant.
#[derive(Clone)]
pub struct VendorAccount {
    pub client_id: String,
    pub client_secret: String,
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for VendorAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorAccount")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct ControllerConfig {
    pub port: u16,
    /// Mocked actuation; payments are still verified.
    pub simulation_mode: bool,
    /// HMAC secret for signed JSON notifications (None = JSON path closed)
    pub webhook_secret: Option<Vec<u8>>,
    pub pag_email: Option<String>,
    pub pag_token: Option<String>,
    pub pag_api_base: String,
    /// Required unless simulating.
    pub vendor: Option<VendorAccount>,
    pub lock_id: String,
    pub tt_api_base: String,
    pub hold: Duration,
    pub provider_timeout: Duration,
    pub vendor_timeout: Duration,
    pub auth_timeout: Duration,
    pub credential_margin: Duration,
    pub dedup_capacity: usize,
    pub dedup_window: Duration,
    pub max_concurrent: usize,
    pub rate_limit_rpm: u64,
    /// CORS allowed origins (empty = localhost only)
    pub allowed_origins: Vec<String>,
    /// Bearer token required for /metrics (None = forbidden unless public)
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
    /// Bearer token for POST /lock/close (None = endpoint disabled)
    pub admin_token: Option<Vec<u8>>,
}

impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("port", &self.port)
            .field("simulation_mode", &self.simulation_mode)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pag_email", &self.pag_email)
            .field("pag_token", &self.pag_token.as_ref().map(|_| "[REDACTED]"))
            .field("pag_api_base", &self.pag_api_base)
            .field("vendor", &self.vendor)
            .field("lock_id", &self.lock_id)
            .field("tt_api_base", &self.tt_api_base)
            .field("hold", &self.hold)
            .field("provider_timeout", &self.provider_timeout)
            .field("vendor_timeout", &self.vendor_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("credential_margin", &self.credential_margin)
            .field("dedup_capacity", &self.dedup_capacity)
            .field("dedup_window", &self.dedup_window)
            .field("max_concurrent", &self.max_concurrent)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let lock_id = get("TT_LOCK_ID").ok_or(ConfigError::MissingRequired("TT_LOCK_ID"))?;

        let simulation_mode = match get("SIMULATION_MODE") {
            Some(v) => parse_flag("SIMULATION_MODE", &v)?,
            None => true,
        };

        let pag_api_base = get("PAG_API_BASE").unwrap_or_else(|| PAGBANK_API_BASE.to_string());
        validate_url(&pag_api_base)?;
        let tt_api_base = get("TT_API_BASE").unwrap_or_else(|| TTLOCK_API_BASE.to_string());
        validate_url(&tt_api_base)?;

        let pag_email = get("PAG_EMAIL");
        let pag_token = get("PAG_TOKEN");

        let vendor = match (
            get("TT_CLIENT_ID"),
            get("TT_CLIENT_SECRET"),
            get("TT_EMAIL"),
            get("TT_PASSWORD"),
        ) {
            (Some(client_id), Some(client_secret), Some(email), Some(password)) => {
                Some(VendorAccount {
                    client_id,
                    client_secret,
                    email,
                    password,
                })
            }
            (client_id, client_secret, email, _) => {
                if !simulation_mode {
                    let missing = if client_id.is_none() {
                        "TT_CLIENT_ID"
                    } else if client_secret.is_none() {
                        "TT_CLIENT_SECRET"
                    } else if email.is_none() {
                        "TT_EMAIL"
                    } else {
                        "TT_PASSWORD"
                    };
                    return Err(ConfigError::MissingRequired(missing));
                }
                None
            }
        };

        if !simulation_mode {
            if pag_email.is_none() {
                return Err(ConfigError::MissingRequired("PAG_EMAIL"));
            }
            if pag_token.is_none() {
                return Err(ConfigError::MissingRequired("PAG_TOKEN"));
            }
        } else if pag_email.is_none() || pag_token.is_none() {
            tracing::warn!(
                "PAG_EMAIL/PAG_TOKEN not set; provider callbacks cannot be verified"
            );
        }

        let webhook_secret = get("WEBHOOK_SHARED_SECRET").map(String::into_bytes);
        match &webhook_secret {
            Some(secret) if secret.len() < 32 => tracing::warn!(
                "WEBHOOK_SHARED_SECRET is only {} bytes (minimum 32 recommended); \
                 use `openssl rand -hex 32` to generate a secure secret",
                secret.len()
            ),
            Some(_) => {}
            None => tracing::warn!(
                "WEBHOOK_SHARED_SECRET not set; signed JSON notifications will be rejected"
            ),
        }

        let allowed_origins: Vec<String> = get("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::InvalidValue {
                var: "ALLOWED_ORIGINS",
                value: "*".to_string(),
            });
        }

        let metrics_token = get("METRICS_TOKEN").map(String::into_bytes);
        let public_metrics = match get("PAYLOCK_PUBLIC_METRICS") {
            Some(v) => parse_flag("PAYLOCK_PUBLIC_METRICS", &v)?,
            None => false,
        };
        let admin_token = get("ADMIN_TOKEN").map(String::into_bytes);
        if admin_token.is_none() {
            tracing::info!("ADMIN_TOKEN not set; POST /lock/close is disabled");
        }

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(name) {
                Some(v) => parse_value::<u64>(name, &v).map(Duration::from_secs),
                None => Ok(default),
            }
        };
        let number = |name: &'static str, default: usize| -> Result<usize, ConfigError> {
            match get(name) {
                Some(v) => parse_value(name, &v),
                None => Ok(default),
            }
        };

        let hold = secs("OPEN_SECONDS", DEFAULT_HOLD)?;
        // A zero dedup window would let every redelivery actuate again.
        let dedup_window = secs("DEDUP_WINDOW_SECS", DEFAULT_DEDUP_WINDOW)?;
        for (var, value) in [("OPEN_SECONDS", hold), ("DEDUP_WINDOW_SECS", dedup_window)] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    var,
                    value: "0".to_string(),
                });
            }
        }
        if hold > MAX_HOLD {
            return Err(ConfigError::InvalidValue {
                var: "OPEN_SECONDS",
                value: hold.as_secs().to_string(),
            });
        }

        Ok(Self {
            port: match get("PORT") {
                Some(v) => parse_value("PORT", &v)?,
                None => DEFAULT_PORT,
            },
            simulation_mode,
            webhook_secret,
            pag_email,
            pag_token,
            pag_api_base,
            vendor,
            lock_id,
            tt_api_base,
            hold,
            provider_timeout: secs("PROVIDER_TIMEOUT_SECS", DEFAULT_PROVIDER_TIMEOUT)?,
            vendor_timeout: secs("VENDOR_TIMEOUT_SECS", DEFAULT_VENDOR_TIMEOUT)?,
            auth_timeout: secs("AUTH_TIMEOUT_SECS", DEFAULT_AUTH_TIMEOUT)?,
            credential_margin: secs("CREDENTIAL_MARGIN_SECS", Duration::ZERO)?,
            dedup_capacity: number("DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY)?,
            dedup_window,
            max_concurrent: number(
                "MAX_CONCURRENT_NOTIFICATIONS",
                DEFAULT_MAX_CONCURRENT_NOTIFICATIONS,
            )?,
            rate_limit_rpm: match get("RATE_LIMIT_RPM") {
                Some(v) => parse_value("RATE_LIMIT_RPM", &v)?,
                None => DEFAULT_RATE_LIMIT_RPM,
            },
            allowed_origins,
            metrics_token,
            public_metrics,
            admin_token,
        })
    }
}

fn validate_url(value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl(value.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ConfigError::InvalidUrl(value.to_string())),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ControllerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|name| map.get(name).cloned())
    }

    const VENDOR: [(&str, &str); 6] = [
        ("TT_CLIENT_ID", "client"),
        ("TT_CLIENT_SECRET", "client-secret"),
        ("TT_EMAIL", "owner@example.com"),
        ("TT_PASSWORD", "hunter2"),
        ("PAG_EMAIL", "shop@example.com"),
        ("PAG_TOKEN", "pag-token"),
    ];

    #[test]
    fn test_defaults_in_simulation() {
        let cfg = config(&[("TT_LOCK_ID", "1234567")]).unwrap();
        assert!(cfg.simulation_mode);
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.hold, Duration::from_secs(8));
        assert_eq!(cfg.tt_api_base, "https://euapi.sciener.com");
        assert_eq!(cfg.pag_api_base, "https://ws.pagseguro.uol.com.br");
        assert_eq!(cfg.dedup_capacity, 1024);
        assert_eq!(cfg.max_concurrent, 16);
        assert_eq!(cfg.rate_limit_rpm, 120);
        assert!(cfg.vendor.is_none());
        assert!(cfg.admin_token.is_none());
        assert!(!cfg.public_metrics);
    }

    #[test]
    fn test_lock_id_required() {
        let err = config(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("TT_LOCK_ID")));
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let err = config(&[("TT_LOCK_ID", "1"), ("SIMULATION_MODE", "false")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("TT_CLIENT_ID")));

        let mut vars = vec![("TT_LOCK_ID", "1"), ("SIMULATION_MODE", "false")];
        vars.extend_from_slice(&VENDOR[..4]);
        let err = config(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("PAG_EMAIL")));

        vars.extend_from_slice(&VENDOR[4..]);
        let cfg = config(&vars).unwrap();
        assert!(!cfg.simulation_mode);
        assert_eq!(cfg.vendor.unwrap().client_id, "client");
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("TT_LOCK_ID", "1"),
            ("OPEN_SECONDS", "15"),
            ("PORT", "8080"),
            ("DEDUP_WINDOW_SECS", "60"),
            ("ALLOWED_ORIGINS", "https://shop.example.com, https://admin.example.com"),
            ("PAYLOCK_PUBLIC_METRICS", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.hold, Duration::from_secs(15));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.dedup_window, Duration::from_secs(60));
        assert_eq!(cfg.allowed_origins.len(), 2);
        assert!(cfg.public_metrics);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("OPEN_SECONDS", "eight")]),
            Err(ConfigError::InvalidValue { var: "OPEN_SECONDS", .. })
        ));
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("OPEN_SECONDS", "0")]),
            Err(ConfigError::InvalidValue { var: "OPEN_SECONDS", .. })
        ));
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("DEDUP_WINDOW_SECS", "0")]),
            Err(ConfigError::InvalidValue { var: "DEDUP_WINDOW_SECS", .. })
        ));
        assert!(config(&[("TT_LOCK_ID", "1"), ("DEDUP_WINDOW_SECS", "1")]).is_ok());
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("OPEN_SECONDS", "86401")]),
            Err(ConfigError::InvalidValue { var: "OPEN_SECONDS", .. })
        ));
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("SIMULATION_MODE", "maybe")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("TT_API_BASE", "not a url")]),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            config(&[("TT_LOCK_ID", "1"), ("ALLOWED_ORIGINS", "*")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = vec![
            ("TT_LOCK_ID", "1"),
            ("WEBHOOK_SHARED_SECRET", "super-secret-webhook-key"),
            ("ADMIN_TOKEN", "admin-token-value"),
        ];
        vars.extend_from_slice(&VENDOR);
        let debug = format!("{:?}", config(&vars).unwrap());
        for secret in [
            "super-secret-webhook-key",
            "admin-token-value",
            "hunter2",
            "client-secret",
            "pag-token",
        ] {
            assert!(!debug.contains(secret), "{secret} leaked");
        }
    }
}
