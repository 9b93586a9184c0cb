//! AUTH PLAIN/LOGIN (RFC 4954) mechanism decoding and the `AuthService` /
//! `AuthRateLimiter` SPI surfaces consumed by the session dispatcher.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::AuthError;

/// Decodes a base64 AUTH response, rejecting the `*` cancellation token by
/// returning [`AuthError::Cancelled`].
pub fn decode_response(raw: &str) -> Result<Vec<u8>, AuthError> {
    if raw == "*" {
        return Err(AuthError::Cancelled);
    }
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| AuthError::NotBase64)
}

/// Decoded `authzid\0authcid\0password` fields from an AUTH PLAIN response.
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
}

/// Parses a decoded AUTH PLAIN response per RFC 4616.
pub fn parse_plain(decoded: &[u8]) -> Result<PlainCredentials, AuthError> {
    let text = std::str::from_utf8(decoded).map_err(|_| AuthError::NotUtf8)?;
    let mut parts = text.split('\0');
    let _authzid = parts.next().ok_or(AuthError::MalformedPlain)?;
    let authcid = parts.next().ok_or(AuthError::MalformedPlain)?;
    let password = parts.next().ok_or(AuthError::MalformedPlain)?;
    if parts.next().is_some() {
        return Err(AuthError::MalformedPlain);
    }
    Ok(PlainCredentials {
        username: authcid.to_string(),
        password: password.to_string(),
    })
}

/// Decodes a base64-encoded username or password line for AUTH LOGIN.
pub fn decode_login_field(raw: &str) -> Result<String, AuthError> {
    let bytes = decode_response(raw)?;
    String::from_utf8(bytes).map_err(|_| AuthError::NotUtf8)
}

/// Credential verification, implemented by the embedder.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Whether AUTH is offered at all.
    fn enabled(&self) -> bool;

    /// Whether MAIL FROM requires prior successful authentication.
    fn required_for_mail(&self) -> bool;

    /// Verifies a username/password pair.
    async fn verify(&self, username: &str, password: &str) -> bool;
}

/// An `AuthService` that never authenticates anyone; the harmless default
/// for listeners that don't enable AUTH.
#[derive(Debug, Default)]
pub struct DisabledAuthService;

#[async_trait]
impl AuthService for DisabledAuthService {
    fn enabled(&self) -> bool {
        false
    }

    fn required_for_mail(&self) -> bool {
        false
    }

    async fn verify(&self, _username: &str, _password: &str) -> bool {
        false
    }
}

/// Tracks failed AUTH attempts keyed by (client IP, username) and enforces
/// an exponential lockout, surviving reconnects from the same peer.
#[async_trait]
pub trait AuthRateLimiter: Send + Sync {
    /// Returns the remaining lockout duration, if the key is currently
    /// locked out.
    async fn check_lock(&self, key: &str) -> Option<Duration>;

    /// Records a failed attempt, returning the new lockout duration.
    async fn record_failure(&self, key: &str) -> Duration;

    /// Clears all recorded failures for a key after a successful AUTH.
    async fn record_success(&self, key: &str);
}

struct LockoutState {
    attempts: u32,
    locked_until: Option<Instant>,
}

/// In-process AUTH rate limiter using a concurrent map of atomics-guarded
/// state, mirroring the token-bucket shape used elsewhere in this crate's
/// delivery-side rate limiting.
pub struct LocalAuthRateLimiter {
    state: DashMap<String, Arc<Mutex<LockoutState>>>,
    cap_secs: u64,
}

impl Default for LocalAuthRateLimiter {
    fn default() -> Self {
        Self::new(600)
    }
}

impl LocalAuthRateLimiter {
    #[must_use]
    pub fn new(cap_secs: u64) -> Self {
        Self {
            state: DashMap::new(),
            cap_secs,
        }
    }

    fn backoff_for(&self, attempts: u32) -> Duration {
        let secs = 5u64.saturating_mul(1u64 << attempts.saturating_sub(1).min(20));
        Duration::from_secs(secs.min(self.cap_secs))
    }
}

#[async_trait]
impl AuthRateLimiter for LocalAuthRateLimiter {
    async fn check_lock(&self, key: &str) -> Option<Duration> {
        let entry = self.state.get(key)?;
        let state = entry.lock();
        let until = state.locked_until?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }

    async fn record_failure(&self, key: &str) -> Duration {
        let entry = self
            .state
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(LockoutState {
                    attempts: 0,
                    locked_until: None,
                }))
            })
            .clone();

        let mut state = entry.lock();
        state.attempts += 1;
        let backoff = self.backoff_for(state.attempts);
        state.locked_until = Some(Instant::now() + backoff);
        backoff
    }

    async fn record_success(&self, key: &str) {
        self.state.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_credentials() {
        let decoded = decode_response("AGEAcGFzcw==").unwrap();
        let creds = parse_plain(&decoded).unwrap();
        assert_eq!(creds.username, "a");
        assert_eq!(creds.password, "pass");
    }

    #[test]
    fn rejects_cancellation_token() {
        assert!(matches!(decode_response("*"), Err(AuthError::Cancelled)));
    }

    #[test]
    fn rejects_malformed_plain() {
        let decoded = decode_response("dGVzdA==").unwrap();
        assert!(matches!(parse_plain(&decoded), Err(AuthError::MalformedPlain)));
    }

    #[tokio::test]
    async fn lockout_backoff_grows_and_caps() {
        let limiter = LocalAuthRateLimiter::new(600);
        let first = limiter.record_failure("1.2.3.4:user").await;
        let second = limiter.record_failure("1.2.3.4:user").await;
        assert!(second >= first);

        for _ in 0..10 {
            limiter.record_failure("1.2.3.4:user").await;
        }
        let capped = limiter.record_failure("1.2.3.4:user").await;
        assert!(capped <= Duration::from_secs(600));
    }

    #[tokio::test]
    async fn success_clears_lockout() {
        let limiter = LocalAuthRateLimiter::new(600);
        limiter.record_failure("1.2.3.4:user").await;
        limiter.record_success("1.2.3.4:user").await;
        assert!(limiter.check_lock("1.2.3.4:user").await.is_none());
    }
}
