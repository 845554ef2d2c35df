//! Secret comparison helpers shared by the service's bearer-token checks.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before the
/// `subtle` comparison, so timing reveals neither content nor length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Check an `Authorization: Bearer <token>` header value against `expected`.
pub fn bearer_matches(header: Option<&str>, expected: &[u8]) -> bool {
    header
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token.as_bytes(), expected))
        .unwrap_or(false)
}
