use std::time::Duration;

/// Default TTLock (Sciener) cloud API base URL.
pub const TTLOCK_API_BASE: &str = "https://euapi.sciener.com";

/// Default PagBank (PagSeguro) web service base URL.
pub const PAGBANK_API_BASE: &str = "https://ws.pagseguro.uol.com.br";

/// How long the lock stays open after a confirmed payment.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(8);

/// Longest hold accepted; longer requests are clamped.
pub const MAX_HOLD: Duration = Duration::from_secs(24 * 3600);

/// Token endpoint timeout.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Lock/unlock command timeout.
pub const DEFAULT_VENDOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction status query timeout.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Token lifetime assumed when the vendor omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Longest `expires_in` accepted from the token endpoint (TTLock issues 90-day tokens).
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 90 * 24 * 3600;

/// Fraction of the advertised token lifetime we are willing to use.
pub const TOKEN_LIFETIME_FACTOR: f64 = 0.9;

/// Vendor `errcode` meaning success.
pub const VENDOR_OK: i64 = 0;

/// Vendor `errcode` values that mean the access token is no longer accepted.
pub const VENDOR_TOKEN_REJECTED: [i64; 2] = [10003, 10004];

/// Numeric PagBank statuses that count as paid: 3 = paid, 4 = available for withdrawal.
pub const PAID_STATUS_CODES: [i64; 2] = [3, 4];

/// Textual statuses that count as paid (compared case-insensitively).
pub const PAID_STATUS_WORDS: [&str; 4] = ["paid", "approved", "available", "completed"];

/// Default size of the recent-notification set.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Default dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3600);

/// Default number of notifications processed concurrently.
pub const DEFAULT_MAX_CONCURRENT_NOTIFICATIONS: usize = 16;

/// Header carrying `sha256=<hex>` on the signed JSON path.
pub const SIGNATURE_HEADER: &str = "X-Signature";
