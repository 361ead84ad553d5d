use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::warn;

use crate::{audit::AppStatus, credentials::Credentials, gate::ClientIp, AppState};

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Default freshness window for `x-timestamp`, applied in both directions.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Largest request body the signature check will buffer.
pub const MAX_SIGNED_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("Unauthorized: invalid or missing API key")]
    InvalidApiKey,
    #[error("Missing signature")]
    MissingSignature,
    #[error("Timestamp outside the allowed window")]
    StaleOrFutureTimestamp,
    #[error("Invalid HMAC signature")]
    InvalidSignature,
}

/// The authentication headers of one request, borrowed from its header map.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedHeaders<'a> {
    pub api_key: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
}

impl<'a> SignedHeaders<'a> {
    pub fn from_headers(headers: &'a HeaderMap) -> Self {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self {
            api_key: get(API_KEY_HEADER),
            signature: get(SIGNATURE_HEADER),
            timestamp: get(TIMESTAMP_HEADER),
        }
    }
}

// ── SecurityValidator ────────────────────────────────────────────────────────

/// Decides whether a request carries a valid API key and a fresh, correct
/// HMAC signature.
///
/// Replay protection is limited to the timestamp window: a captured
/// signature stays valid until its timestamp leaves the window.
#[derive(Clone)]
pub struct SecurityValidator {
    credentials: Arc<Credentials>,
    window: Duration,
}

impl SecurityValidator {
    pub fn new(credentials: Arc<Credentials>, window: Duration) -> Self {
        Self {
            credentials,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn validate(&self, headers: &SignedHeaders<'_>, body: &[u8]) -> Result<(), AuthRejection> {
        self.validate_at(headers, body, Utc::now())
    }

    /// Same as [`validate`](Self::validate) against an explicit clock.
    pub fn validate_at(
        &self,
        headers: &SignedHeaders<'_>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), AuthRejection> {
        let expected_key = self.credentials.api_key();
        match headers.api_key {
            Some(key) if constant_time_eq(key.as_bytes(), expected_key.as_bytes()) => {}
            _ => return Err(AuthRejection::InvalidApiKey),
        }

        let Some(secret) = self.credentials.hmac_secret() else {
            return Ok(());
        };

        let (signature, timestamp) = match (headers.signature, headers.timestamp) {
            (Some(s), Some(t)) if !s.is_empty() && !t.is_empty() => (s, t),
            _ => return Err(AuthRejection::MissingSignature),
        };

        let issued = parse_timestamp(timestamp).ok_or(AuthRejection::StaleOrFutureTimestamp)?;
        let skew = now
            .timestamp()
            .checked_sub(issued.timestamp())
            .map(i64::unsigned_abs)
            .ok_or(AuthRejection::StaleOrFutureTimestamp)?;
        if skew > self.window.as_secs() {
            return Err(AuthRejection::StaleOrFutureTimestamp);
        }

        let expected = compute_signature(secret, body, timestamp);
        let supplied = signature.to_ascii_lowercase();
        if constant_time_eq(expected.as_bytes(), supplied.as_bytes()) {
            Ok(())
        } else {
            Err(AuthRejection::InvalidSignature)
        }
    }
}

// ── Signing helpers ──────────────────────────────────────────────────────────

/// `hex(HMAC-SHA256(secret, body || timestamp))`, lowercase.
pub fn compute_signature(secret: &[u8], body: &[u8], timestamp: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Parses an `x-timestamp` value.
///
/// All-digit strings are Unix seconds. Everything else must be RFC 3339 or
/// an offset-less ISO-8601 datetime, which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = raw.parse().ok()?;
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Axum middleware guarding the VM routes: API key, then signature over the
/// buffered body. Outcomes are written to the app log; accepted requests are
/// forwarded with their body restored.
pub async fn require_signed_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = request
        .extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or_default();
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_owned();

    let bytes = match axum::body::to_bytes(body, MAX_SIGNED_BODY).await {
        Ok(b) => b,
        Err(_) => {
            state.logs.app(
                &method,
                &path,
                &client_ip.to_string(),
                AppStatus::Rejected,
                "request body too large",
            );
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "request body too large"})),
            )
                .into_response();
        }
    };

    let headers = SignedHeaders::from_headers(&parts.headers);
    match state.validator.validate(&headers, &bytes) {
        Ok(()) => {
            state.logs.app(
                &method,
                &path,
                &client_ip.to_string(),
                AppStatus::Authenticated,
                "api key and signature verified",
            );
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Err(reason) => {
            warn!(%client_ip, %path, %reason, "authentication rejected");
            state.logs.app(
                &method,
                &path,
                &client_ip.to_string(),
                AppStatus::Rejected,
                &reason.to_string(),
            );
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": reason.to_string()})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AllowList;
    use chrono::TimeZone;

    const KEY: &str = "test_api_key_12345";
    const SECRET: &[u8] = b"test_hmac_secret_67890";

    fn validator() -> SecurityValidator {
        let creds = Credentials::new(KEY, Some(SECRET.to_vec()), AllowList::default());
        SecurityValidator::new(Arc::new(creds), DEFAULT_REPLAY_WINDOW)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn signed<'a>(ts: &'a str, sig: &'a str) -> SignedHeaders<'a> {
        SignedHeaders {
            api_key: Some(KEY),
            signature: Some(sig),
            timestamp: Some(ts),
        }
    }

    #[test]
    fn accepts_valid_request() {
        let ts = now().timestamp().to_string();
        let body = br#"{"vm_name": "test"}"#;
        let sig = compute_signature(SECRET, body, &ts);
        assert_eq!(validator().validate_at(&signed(&ts, &sig), body, now()), Ok(()));
    }

    #[test]
    fn accepts_empty_body() {
        let ts = now().timestamp().to_string();
        let sig = compute_signature(SECRET, b"", &ts);
        assert_eq!(validator().validate_at(&signed(&ts, &sig), b"", now()), Ok(()));
    }

    #[test]
    fn accepts_iso_timestamp() {
        let ts = "2025-06-01T11:58:30Z";
        let sig = compute_signature(SECRET, b"", ts);
        assert_eq!(validator().validate_at(&signed(ts, &sig), b"", now()), Ok(()));

        let naive = "2025-06-01T12:03:00";
        let sig = compute_signature(SECRET, b"", naive);
        assert_eq!(validator().validate_at(&signed(naive, &sig), b"", now()), Ok(()));
    }

    #[test]
    fn accepts_uppercase_hex_signature() {
        let ts = now().timestamp().to_string();
        let sig = compute_signature(SECRET, b"", &ts).to_ascii_uppercase();
        assert_eq!(validator().validate_at(&signed(&ts, &sig), b"", now()), Ok(()));
    }

    #[test]
    fn rejects_missing_or_wrong_api_key() {
        let ts = now().timestamp().to_string();
        let sig = compute_signature(SECRET, b"", &ts);
        let v = validator();

        for key in [None, Some(""), Some("wrong_key"), Some("  test_api_key_12345  ")] {
            let headers = SignedHeaders {
                api_key: key,
                ..signed(&ts, &sig)
            };
            assert_eq!(
                v.validate_at(&headers, b"", now()),
                Err(AuthRejection::InvalidApiKey),
                "key {key:?}"
            );
        }
    }

    #[test]
    fn rejects_missing_signature_or_timestamp() {
        let v = validator();
        let no_sig = SignedHeaders {
            api_key: Some(KEY),
            signature: None,
            timestamp: Some("1748779200"),
        };
        let no_ts = SignedHeaders {
            api_key: Some(KEY),
            signature: Some("abcd"),
            timestamp: None,
        };
        let blank = signed("", "");
        for headers in [no_sig, no_ts, blank] {
            assert_eq!(
                v.validate_at(&headers, b"", now()),
                Err(AuthRejection::MissingSignature)
            );
        }
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let v = validator();
        for offset in [-301i64, 301, -1_000_000_000] {
            let ts = (now().timestamp() + offset).to_string();
            let sig = compute_signature(SECRET, b"", &ts);
            assert_eq!(
                v.validate_at(&signed(&ts, &sig), b"", now()),
                Err(AuthRejection::StaleOrFutureTimestamp),
                "offset {offset}"
            );
        }
        // Window edges are inclusive.
        for offset in [-300i64, 300] {
            let ts = (now().timestamp() + offset).to_string();
            let sig = compute_signature(SECRET, b"", &ts);
            assert_eq!(v.validate_at(&signed(&ts, &sig), b"", now()), Ok(()));
        }
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let v = validator();
        for ts in ["yesterday", "-17", "99999999999999999999", "2025-13-45T00:00:00Z"] {
            let sig = compute_signature(SECRET, b"", ts);
            assert_eq!(
                v.validate_at(&signed(ts, &sig), b"", now()),
                Err(AuthRejection::StaleOrFutureTimestamp),
                "timestamp {ts}"
            );
        }
    }

    #[test]
    fn perturbed_body_or_signature_is_rejected() {
        let v = validator();
        let ts = now().timestamp().to_string();
        let body = b"{\"vm\":\"TestVM\"}".to_vec();
        let sig = compute_signature(SECRET, &body, &ts);

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                v.validate_at(&signed(&ts, &sig), &tampered, now()),
                Err(AuthRejection::InvalidSignature)
            );
        }

        for i in 0..sig.len() {
            let mut tampered = sig.clone().into_bytes();
            tampered[i] = if tampered[i] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(tampered).unwrap();
            assert_eq!(
                v.validate_at(&signed(&ts, &tampered), &body, now()),
                Err(AuthRejection::InvalidSignature)
            );
        }
    }

    #[test]
    fn signature_covers_timestamp() {
        let v = validator();
        let ts = now().timestamp().to_string();
        let sig = compute_signature(SECRET, b"", &ts);
        let other_ts = (now().timestamp() - 1).to_string();
        assert_eq!(
            v.validate_at(&signed(&other_ts, &sig), b"", now()),
            Err(AuthRejection::InvalidSignature)
        );
    }

    #[test]
    fn hmac_disabled_only_checks_api_key() {
        let creds = Credentials::new(KEY, None, AllowList::default());
        let v = SecurityValidator::new(Arc::new(creds), DEFAULT_REPLAY_WINDOW);
        let headers = SignedHeaders {
            api_key: Some(KEY),
            ..Default::default()
        };
        assert_eq!(v.validate_at(&headers, b"anything", now()), Ok(()));
    }

    #[test]
    fn signature_matches_reference_vector() {
        // body + timestamp concatenated, no separator.
        let a = compute_signature(b"secret", b"body", "123");
        let b = compute_signature(b"secret", b"body1", "23");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)));
    }

    #[test]
    fn parses_both_timestamp_forms() {
        assert_eq!(parse_timestamp("1748779200"), Some(now()));
        assert_eq!(parse_timestamp("2025-06-01T12:00:00+00:00"), Some(now()));
        assert_eq!(parse_timestamp("2025-06-01T14:00:00+02:00"), Some(now()));
        assert_eq!(parse_timestamp("2025-06-01T12:00:00.000"), Some(now()));
        assert_eq!(parse_timestamp(""), None);
    }
}
