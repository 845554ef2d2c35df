//! HMAC-SHA256 signatures for the signed JSON notification path.
//!
//! Senders put `X-Signature: sha256=<hex>` on the request, where the MAC is
//! computed over the raw body with the shared webhook secret.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SCHEME_PREFIX: &str = "sha256=";

/// Compute HMAC-SHA256 over `body` and return it hex-encoded.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value a sender should attach for `body`.
pub fn signature_header_value(secret: &[u8], body: &[u8]) -> String {
    format!("{SCHEME_PREFIX}{}", compute_hmac(secret, body))
}

/// Verify an `X-Signature` header value against the raw body.
///
/// The `sha256=` prefix is required. Malformed hex is compared against a
/// zeroed MAC so the rejection path does the same work as a mismatch.
pub fn verify_signature_header(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(signature) = header.trim().strip_prefix(SCHEME_PREFIX) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = hex::decode(signature).unwrap_or_else(|| vec![0u8; 32]);
    // verify_slice compares in constant time
    mac.verify_slice(&expected).is_ok()
}

/// Hex SHA-256 of a body, used as a notification id when the sender gives none.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Lowercase hex for digests and MACs.
pub(crate) mod hex {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(DIGITS[usize::from(b >> 4)] as char);
            out.push(DIGITS[usize::from(b & 0x0f)] as char);
        }
        out
    }

    /// `None` for odd length or any non-hex character. Either case is accepted.
    pub fn decode(text: &str) -> Option<Vec<u8>> {
        let pairs = text.as_bytes().chunks_exact(2);
        if !pairs.remainder().is_empty() {
            return None;
        }
        pairs
            .map(|pair| Some((nibble(pair[0])? << 4) | nibble(pair[1])?))
            .collect()
    }

    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
}
