//! Webhook signature verification
//!
//! Stripe signs each delivery with HMAC-SHA256 over `"{timestamp}.{body}"`
//! and sends the result in the `stripe-signature` header:
//!
//! ```text
//! stripe-signature: t=1700000000,v1=5257a869...,v1=(second secret during rotation)
//! ```

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::stripe::error::{StripeWebhookError, StripeWebhookResult};
use crate::stripe::events::StripeEvent;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for timestamps from the future
const FUTURE_SKEW_SECS: i64 = 60;

/// Verifies `stripe-signature` headers against the shared signing secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

/// Parsed `stripe-signature` header
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader<'a> {
    timestamp: i64,
    timestamp_raw: &'a str,
    signatures: Vec<&'a str>,
}

impl<'a> SignatureHeader<'a> {
    fn parse(header: &'a str) -> StripeWebhookResult<Self> {
        let mut timestamp_raw = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let part = part.trim();
            if let Some(t) = part.strip_prefix("t=") {
                timestamp_raw = Some(t);
            } else if let Some(s) = part.strip_prefix("v1=") {
                signatures.push(s);
            }
        }

        let timestamp_raw = timestamp_raw.ok_or_else(|| {
            StripeWebhookError::InvalidSignature("no timestamp in header".to_string())
        })?;
        if signatures.is_empty() {
            return Err(StripeWebhookError::InvalidSignature(
                "no v1 signature in header".to_string(),
            ));
        }
        let timestamp = timestamp_raw.parse::<i64>().map_err(|_| {
            StripeWebhookError::InvalidSignature("timestamp is not a number".to_string())
        })?;

        Ok(Self {
            timestamp,
            timestamp_raw,
            signatures,
        })
    }
}

impl SignatureVerifier {
    /// Create a verifier for `secret` accepting timestamps up to `tolerance` old
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify `header` for `payload` at the current time
    pub fn verify(&self, payload: &[u8], header: &str) -> StripeWebhookResult<()> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Verify `header` for `payload` as if the current time were `now`
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> StripeWebhookResult<()> {
        let parsed = SignatureHeader::parse(header)?;

        let age = now - parsed.timestamp;
        if age > self.tolerance.as_secs() as i64 {
            tracing::warn!(age, max = self.tolerance.as_secs(), "Webhook timestamp too old");
            return Err(StripeWebhookError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }
        if age < -FUTURE_SKEW_SECS {
            tracing::warn!(age, "Webhook timestamp in the future");
            return Err(StripeWebhookError::InvalidSignature(
                "timestamp in the future".to_string(),
            ));
        }

        let expected = self.compute(parsed.timestamp_raw, payload)?;
        let matched = parsed.signatures.iter().any(|candidate| {
            // Length is not secret: always 64 hex chars for SHA-256.
            candidate.len() == expected.len()
                && bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
        });

        if matched {
            Ok(())
        } else {
            Err(StripeWebhookError::InvalidSignature(
                "signature mismatch".to_string(),
            ))
        }
    }

    /// Verify and decode a delivery into a typed event
    ///
    /// A missing header or empty body is rejected the same way as a bad
    /// signature: nothing from the request is trusted.
    pub fn construct_event(
        &self,
        payload: &[u8],
        header: Option<&str>,
    ) -> StripeWebhookResult<StripeEvent> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| StripeWebhookError::MissingSignature("stripe-signature".to_string()))?;
        if payload.is_empty() {
            return Err(StripeWebhookError::MissingSignature("empty body".to_string()));
        }

        self.verify(payload, header)?;
        StripeEvent::from_bytes(payload)
    }

    /// Produce a header value for `payload` signed at `timestamp`
    ///
    /// Used by tests and local tooling that replays captured events.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> StripeWebhookResult<String> {
        let signature = self.compute(&timestamp.to_string(), payload)?;
        Ok(format!("t={timestamp},v1={signature}"))
    }

    fn compute(&self, timestamp: &str, payload: &[u8]) -> StripeWebhookResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| StripeWebhookError::ConfigError("invalid webhook secret".to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const BODY: &[u8] = br#"{"id":"evt_1","type":"charge.refunded","created":1700000000,"livemode":false,"data":{"object":{}}}"#;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new("whsec_test_secret", Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        assert!(v.verify_at(BODY, &header, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        let err = v.verify_at(b"{\"id\":\"evt_2\"}", &header, NOW).unwrap_err();
        assert!(matches!(err, StripeWebhookError::InvalidSignature(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = SignatureVerifier::new("whsec_other", Duration::from_secs(300))
            .sign(BODY, NOW)
            .unwrap();
        assert!(verifier().verify_at(BODY, &header, NOW).is_err());
    }

    #[test]
    fn test_stale_and_future_timestamps_rejected() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        assert!(v.verify_at(BODY, &header, NOW + 301).is_err());
        assert!(v.verify_at(BODY, &header, NOW - 61).is_err());
        assert!(v.verify_at(BODY, &header, NOW - 59).is_ok());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let v = verifier();
        let good = v.sign(BODY, NOW).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1={},v1={good_sig}", "0".repeat(64));
        assert!(v.verify_at(BODY, &header, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers() {
        let v = verifier();
        assert!(v.verify_at(BODY, "v1=abc", NOW).is_err());
        assert!(v.verify_at(BODY, &format!("t={NOW}"), NOW).is_err());
        assert!(v.verify_at(BODY, "t=soon,v1=abc", NOW).is_err());
    }

    #[test]
    fn test_construct_event_requires_header_and_body() {
        let v = verifier();
        let err = v.construct_event(BODY, None).unwrap_err();
        assert!(matches!(err, StripeWebhookError::MissingSignature(_)));

        let err = v.construct_event(b"", Some("t=1,v1=00")).unwrap_err();
        assert!(matches!(err, StripeWebhookError::MissingSignature(_)));

        let err = v.construct_event(BODY, Some("   ")).unwrap_err();
        assert!(matches!(err, StripeWebhookError::MissingSignature(_)));
    }

    #[test]
    fn test_construct_event_decodes() {
        let v = verifier();
        let header = v.sign(BODY, chrono::Utc::now().timestamp()).unwrap();
        let event = v.construct_event(BODY, Some(&header)).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "charge.refunded");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", verifier());
        assert!(!debug.contains("whsec_test_secret"));
    }
}
