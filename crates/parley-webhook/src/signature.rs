//! HMAC-SHA256 notification signatures.
//!
//! ```text
//! signature = "sha256=" + hex(HMAC-SHA256(secret, "{timestamp}.{canonical-json(payload)}"))
//! ```
//!
//! A notification passes only when a secret is configured, the timestamp is
//! within the tolerance window of `now` (either direction), and the
//! signature matches. Every check failure is `false`; nothing here panics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::canonical::to_canonical_string;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Replay window.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

fn signing_mac(payload: &Value, timestamp: &str, secret: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(to_canonical_string(payload).as_bytes());
    Some(mac)
}

/// Produce the `sha256=<hex>` signature header value.
pub fn sign(payload: &Value, timestamp: &str, secret: &[u8]) -> String {
    signing_mac(payload, timestamp, secret)
        .map(|mac| format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
        .unwrap_or_default()
}

/// One-shot verification with the default tolerance.
pub fn verify(payload: &Value, signature_header: &str, timestamp: &str, secret: Option<&[u8]>) -> bool {
    match secret {
        Some(secret) => NotificationVerifier::new(secret).verify(payload, signature_header, timestamp),
        None => false,
    }
}

/// Accepts integer epoch seconds (or milliseconds) and RFC 3339.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return if n.unsigned_abs() >= 100_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Verifies inbound notifications against one shared secret.
#[derive(Clone)]
pub struct NotificationVerifier {
    secret: Option<Vec<u8>>,
    tolerance: Duration,
}

impl NotificationVerifier {
    /// Verifier for one shared secret with the default window.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Some(secret.as_ref().to_vec()),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// A verifier that rejects everything.
    pub fn unconfigured() -> Self {
        Self {
            secret: None,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Empty strings count as "not configured".
    pub fn from_optional(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => Self::new(s),
            _ => Self::unconfigured(),
        }
    }

    /// Change the replay window.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Whether a secret is set.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Current replay window.
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Check a signature against the current time. Never panics; any malformed input is `false`.
    pub fn verify(&self, payload: &Value, signature_header: &str, timestamp: &str) -> bool {
        self.verify_at(payload, signature_header, timestamp, Utc::now())
    }

    /// Same as [`verify`](Self::verify) against an explicit clock.
    pub fn verify_at(
        &self,
        payload: &Value,
        signature_header: &str,
        timestamp: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            debug!("notification rejected: no webhook secret configured");
            return false;
        };

        let Some(sent_at) = parse_timestamp(timestamp) else {
            debug!(timestamp, "notification rejected: unparseable timestamp");
            return false;
        };
        let skew = (now - sent_at).num_milliseconds().unsigned_abs();
        if u128::from(skew) > self.tolerance.as_millis() {
            debug!(skew_ms = skew, "notification rejected: outside freshness window");
            return false;
        }

        let Some(hex_sig) = signature_header.trim().strip_prefix(SIGNATURE_PREFIX) else {
            debug!("notification rejected: signature header missing sha256= prefix");
            return false;
        };
        let Ok(expected) = hex::decode(hex_sig) else {
            debug!("notification rejected: signature is not hex");
            return false;
        };

        signing_mac(payload, timestamp, secret)
            .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
    }

    /// Verify using raw header values; a missing header fails.
    pub fn verify_headers(
        &self,
        payload: &Value,
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
    ) -> bool {
        match (signature_header, timestamp_header) {
            (Some(sig), Some(ts)) => self.verify(payload, sig, ts),
            _ => false,
        }
    }
}

impl fmt::Debug for NotificationVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationVerifier")
            .field("configured", &self.secret.is_some())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use serde_json::json;

    const SECRET: &[u8] = b"whsec_test";

    fn payload() -> Value {
        json!({"taskId": "w1", "status": "completed", "result": {"status": "ok"}})
    }

    fn ts(at: DateTime<Utc>) -> String {
        at.timestamp().to_string()
    }

    #[test]
    fn signature_format() {
        let sig = sign(&payload(), "1700000000", SECRET);
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
    }

    #[test]
    fn round_trip() {
        let now = Utc::now();
        let t = ts(now);
        let sig = sign(&payload(), &t, SECRET);
        assert!(NotificationVerifier::new(SECRET).verify_at(&payload(), &sig, &t, now));
    }

    #[test]
    fn freshness_boundary() {
        let now = Utc::now();
        let v = NotificationVerifier::new(SECRET);

        let fresh = ts(now - ChronoDuration::seconds(299));
        assert!(v.verify_at(&payload(), &sign(&payload(), &fresh, SECRET), &fresh, now));

        let stale = ts(now - ChronoDuration::seconds(301));
        assert!(!v.verify_at(&payload(), &sign(&payload(), &stale, SECRET), &stale, now));

        let future = ts(now + ChronoDuration::seconds(302));
        assert!(!v.verify_at(&payload(), &sign(&payload(), &future, SECRET), &future, now));
    }

    #[test]
    fn unconfigured_never_passes() {
        let now = Utc::now();
        let t = ts(now);
        let sig = sign(&payload(), &t, SECRET);
        assert!(!NotificationVerifier::unconfigured().verify_at(&payload(), &sig, &t, now));
        assert!(!NotificationVerifier::from_optional(Some("")).is_configured());
        assert!(!verify(&payload(), &sig, &t, None));
    }

    #[test]
    fn wrong_secret_or_tampered_payload_fails() {
        let now = Utc::now();
        let t = ts(now);
        let sig = sign(&payload(), &t, SECRET);
        assert!(!NotificationVerifier::new("other").verify_at(&payload(), &sig, &t, now));

        let mut tampered = payload();
        tampered["status"] = json!("failed");
        assert!(!NotificationVerifier::new(SECRET).verify_at(&tampered, &sig, &t, now));
    }

    #[test]
    fn timestamp_is_part_of_the_signature() {
        let now = Utc::now();
        let t1 = ts(now);
        let t2 = ts(now - ChronoDuration::seconds(1));
        let sig = sign(&payload(), &t1, SECRET);
        assert!(!NotificationVerifier::new(SECRET).verify_at(&payload(), &sig, &t2, now));
    }

    #[test]
    fn malformed_headers_fail_quietly() {
        let now = Utc::now();
        let t = ts(now);
        let v = NotificationVerifier::new(SECRET);
        assert!(!v.verify_at(&payload(), "md5=abc", &t, now));
        assert!(!v.verify_at(&payload(), "sha256=zz-not-hex", &t, now));
        assert!(!v.verify_at(&payload(), "sha256=abcd", &t, now));
        assert!(!v.verify_at(&payload(), &sign(&payload(), &t, SECRET), "yesterday", now));
        assert!(!v.verify_headers(&payload(), None, Some(&t)));
        for extreme in ["-9223372036854775808", "9223372036854775807", "-99999999999"] {
            assert!(!v.verify_at(&payload(), &sign(&payload(), extreme, SECRET), extreme, now));
        }
    }

    #[test]
    fn rfc3339_and_millis_timestamps() {
        let now = Utc::now();
        let v = NotificationVerifier::new(SECRET);
        let rfc = now.to_rfc3339();
        assert!(v.verify_at(&payload(), &sign(&payload(), &rfc, SECRET), &rfc, now));
        let ms = now.timestamp_millis().to_string();
        assert!(v.verify_at(&payload(), &sign(&payload(), &ms, SECRET), &ms, now));
    }

    #[test]
    fn reordered_keys_still_verify() {
        let now = Utc::now();
        let t = ts(now);
        let sig = sign(&payload(), &t, SECRET);
        let reordered: Value =
            serde_json::from_str(r#"{"result":{"status":"ok"},"status":"completed","taskId":"w1"}"#)
                .unwrap();
        assert!(NotificationVerifier::new(SECRET).verify_at(&reordered, &sig, &t, now));
    }

    #[test]
    fn debug_hides_secret() {
        let dbg = format!("{:?}", NotificationVerifier::new("topsecret"));
        assert!(!dbg.contains("topsecret"));
    }

    proptest! {
        #[test]
        fn integer_timestamps_far_from_now_are_rejected(n in any::<i64>()) {
            let now = Utc::now();
            prop_assume!(n.abs_diff(now.timestamp()) > 600 && n.abs_diff(now.timestamp_millis()) > 600_000);
            let t = n.to_string();
            let v = NotificationVerifier::new(SECRET);
            prop_assert!(!v.verify_at(&payload(), &sign(&payload(), &t, SECRET), &t, now));
        }

        #[test]
        fn any_payload_and_secret_round_trips(
            secret in proptest::collection::vec(any::<u8>(), 1..64),
            key in "[a-z]{1,8}",
            text in ".*",
            n in any::<i64>(),
        ) {
            let payload = json!({ key: { "text": text, "n": n } });
            let now = Utc::now();
            let t = ts(now);
            let sig = sign(&payload, &t, &secret);
            prop_assert!(NotificationVerifier::new(&secret).verify_at(&payload, &sig, &t, now));
        }
    }
}
