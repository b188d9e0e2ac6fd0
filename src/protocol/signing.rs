//! HMAC-SHA256 request signing.
//!
//! A signed request carries two headers: the unix timestamp it was signed at
//! and `hex(HMAC(secret, "{timestamp}.{body}"))`. Verifiers reject requests
//! whose timestamp is further than [`MAX_CLOCK_SKEW_SECS`] from their clock.

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-relay-signature";
pub const TIMESTAMP_HEADER: &str = "x-relay-timestamp";

/// Accepted distance between the signer's and verifier's clocks.
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

fn mac(secret: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}

/// Compute the hex signature for `body` signed at `timestamp`.
pub fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature produced by [`sign`], checking freshness against `now`.
pub fn verify(
    secret: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(SignatureError::Missing),
    };
    let timestamp: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::Malformed)?;
    let expected = hex::decode(signature.trim()).map_err(|_| SignatureError::Malformed)?;

    let skew = now.checked_sub(timestamp).map(i64::unsigned_abs);
    if !skew.is_some_and(|skew| skew <= MAX_CLOCK_SKEW_SECS) {
        return Err(SignatureError::Expired);
    }

    let mut mac = mac(secret);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verify the signature headers of an incoming axum request.
pub fn verify_headers(
    headers: &HeaderMap,
    secret: &[u8],
    body: &[u8],
) -> Result<(), SignatureError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    verify(
        secret,
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        body,
        Utc::now().timestamp(),
    )
}

/// Derive the per-task callback secret from the coordinator's webhook secret.
///
/// Deterministic, so the coordinator can re-derive it when a callback arrives
/// instead of storing one secret per task.
pub fn derive_task_secret(master: &[u8], task_id: Uuid) -> String {
    let mut mac = mac(master);
    mac.update(task_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// A serialized JSON body together with its signature headers.
#[derive(Debug, Clone)]
pub struct SignedBody {
    pub body: Vec<u8>,
    pub timestamp: i64,
    pub signature: String,
}

impl SignedBody {
    /// Serialize `payload` and sign it with `secret` at the current time.
    pub fn new<T: Serialize>(secret: &[u8], payload: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(payload)?;
        let timestamp = Utc::now().timestamp();
        let signature = sign(secret, timestamp, &body);
        Ok(Self {
            body,
            timestamp,
            signature,
        })
    }

    /// Signature headers for a request without a body, such as a GET.
    pub fn empty(secret: &[u8]) -> Self {
        let timestamp = Utc::now().timestamp();
        Self {
            body: Vec::new(),
            timestamp,
            signature: sign(secret, timestamp, b""),
        }
    }

    /// Attach the body and signature headers to a reqwest request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, self.timestamp.to_string())
            .header(SIGNATURE_HEADER, &self.signature)
            .body(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"dispatch-secret";

    #[test]
    fn sign_then_verify() {
        let body = br#"{"taskId":"x"}"#;
        let sig = sign(SECRET, 1_700_000_000, body);
        assert_eq!(sig.len(), 64);
        verify(SECRET, Some("1700000000"), Some(&sig), body, 1_700_000_010).unwrap();
    }

    #[test]
    fn rejects_missing_headers() {
        assert_eq!(
            verify(SECRET, None, Some("ab"), b"{}", 0),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify(SECRET, Some("0"), None, b"{}", 0),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn rejects_tampered_body() {
        let sig = sign(SECRET, 100, b"original");
        assert_eq!(
            verify(SECRET, Some("100"), Some(&sig), b"tampered", 100),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let sig = sign(b"other", 100, b"body");
        assert_eq!(
            verify(SECRET, Some("100"), Some(&sig), b"body", 100),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let sig = sign(SECRET, 100, b"body");
        let now = 100 + MAX_CLOCK_SKEW_SECS as i64 + 1;
        assert_eq!(
            verify(SECRET, Some("100"), Some(&sig), b"body", now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn extreme_timestamps_are_expired() {
        let now = 1_700_000_000;
        for ts in [i64::MIN, i64::MAX] {
            let header = ts.to_string();
            assert_eq!(
                verify(SECRET, Some(&header), Some("00"), b"{}", now),
                Err(SignatureError::Expired)
            );
        }
        assert_eq!(
            verify(SECRET, Some("0"), Some("00"), b"{}", i64::MIN),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn rejects_malformed_signature() {
        assert_eq!(
            verify(SECRET, Some("100"), Some("not-hex"), b"body", 100),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(SECRET, Some("soon"), Some("abcd"), b"body", 100),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn verify_headers_reads_axum_headers() {
        let signed = SignedBody::new(SECRET, &serde_json::json!({"a": 1})).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            TIMESTAMP_HEADER,
            signed.timestamp.to_string().parse().unwrap(),
        );
        headers.insert(SIGNATURE_HEADER, signed.signature.parse().unwrap());
        verify_headers(&headers, SECRET, &signed.body).unwrap();
    }

    #[test]
    fn empty_body_signature_verifies() {
        let signed = SignedBody::empty(SECRET);
        assert!(signed.body.is_empty());
        let ts = signed.timestamp.to_string();
        verify(SECRET, Some(&ts), Some(&signed.signature), b"", signed.timestamp).unwrap();
    }

    #[test]
    fn task_secrets_are_stable_and_distinct() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(derive_task_secret(SECRET, a), derive_task_secret(SECRET, a));
        assert_ne!(derive_task_secret(SECRET, a), derive_task_secret(SECRET, b));
    }
}
