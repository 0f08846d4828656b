//! Challenge-response authentication, session tokens, rate limiting
//!
//! The client never sends the shared password. It derives a key with
//! PBKDF2-HMAC-SHA256 (salt = its origin) and proves possession by hashing
//! the derived key with a timestamp; the server recomputes and compares in
//! constant time. The per-IP rate-limit check runs before anything else:
//! a throttled caller must never cost the server a PBKDF2 derivation.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::storage::{Item, ItemStore, Key, ReturnValues, StorageError, Update};
use crate::types::RATE_LIMIT_PREFIX;

/// PBKDF2 rounds; advertised to clients via /api/auth/params.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Sessions live for 30 days.
pub const SESSION_DURATION_SECONDS: i64 = 30 * 24 * 60 * 60;
/// Hard interop bound on client clock skew.
const TIMESTAMP_SKEW_SECONDS: i64 = 300;
const MAX_NAME_LENGTH: usize = 50;

type HmacSha256 = Hmac<Sha256>;

/// Client challenge body for POST /api/auth/verify.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthChallenge {
    pub origin: String,
    pub timestamp: i64,
    pub hash: String,
    pub name: String,
}

/// Verification result, mapped to 200/401/429 by the API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Granted { token: String, name: String },
    Denied,
    RateLimited { retry_after_seconds: i64 },
}

/// Authenticated session, extracted from a Bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUser {
    /// Requester name; absent for legacy two-part tokens.
    pub name: Option<String>,
}

/// Rate-limit knobs, all env-driven.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_attempts: i64,
    pub window_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            window_seconds: 900,
        }
    }
}

// ============================================================================
// Challenge hashing
// ============================================================================

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The hash the client is expected to present:
/// `SHA256(hex(PBKDF2(password, salt=origin)) ":" timestamp)`, lowercase hex.
pub fn challenge_hash(password: &str, origin: &str, timestamp: i64) -> String {
    let mut derived = [0u8; 32];
    if pbkdf2::pbkdf2::<HmacSha256>(
        password.as_bytes(),
        origin.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut derived,
    )
    .is_err()
    {
        // Unreachable for HMAC-SHA256, but never panic in the auth path.
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(hex_encode(&derived).as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.to_string().as_bytes());
    hex_encode(hasher.finalize().as_slice())
}

// ============================================================================
// Session tokens
// ============================================================================

fn sign(secret: &str, message: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn create_session_token_at(secret: &str, name: &str, now: i64) -> String {
    let name_b64 = URL_SAFE_NO_PAD.encode(name.as_bytes());
    let payload = format!("{now}.{name_b64}");
    let signature = sign(secret, &payload);
    format!("{payload}.{signature}")
}

/// Create a signed session token carrying the requester name.
pub fn create_session_token(secret: &str, name: &str) -> String {
    create_session_token_at(secret, name, Utc::now().timestamp())
}

fn verify_session_token_at(secret: &str, token: &str, now: i64) -> Option<SessionUser> {
    let parts: Vec<&str> = token.split('.').collect();
    let (timestamp_str, name_b64, provided_sig) = match parts.as_slice() {
        // Current form: timestamp.name.signature
        [ts, name, sig] => (*ts, Some(*name), *sig),
        // Legacy form: timestamp.signature
        [ts, sig] => (*ts, None, *sig),
        _ => return None,
    };

    let timestamp: i64 = timestamp_str.parse().ok()?;
    let age = now - timestamp;
    if !(0..=SESSION_DURATION_SECONDS).contains(&age) {
        return None;
    }

    let signed_message = match name_b64 {
        Some(name) => format!("{timestamp_str}.{name}"),
        None => timestamp_str.to_string(),
    };
    let expected_sig = sign(secret, &signed_message);
    let matches: bool = expected_sig
        .as_bytes()
        .ct_eq(provided_sig.as_bytes())
        .into();
    if !matches {
        return None;
    }

    let name = match name_b64 {
        Some(encoded) => Some(String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).ok()?).ok()?),
        None => None,
    };
    Some(SessionUser { name })
}

/// Verify a session token and extract the requester name.
pub fn verify_session_token(secret: &str, token: &str) -> Option<SessionUser> {
    verify_session_token_at(secret, token, Utc::now().timestamp())
}

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed,
    Denied { retry_after_seconds: i64 },
}

/// Per-IP sliding-window failure counter over the item store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn ItemStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ItemStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn bucket_key(ip: &str) -> Key {
        Key::new(format!("{RATE_LIMIT_PREFIX}{ip}"), 0)
    }

    fn bucket_fields(item: &Item) -> (i64, i64) {
        let attempts = item
            .get("failed_attempts")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        let first = item
            .get("first_attempt")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        (attempts, first)
    }

    fn check_at(&self, ip: &str, now: i64) -> Result<RateLimitStatus, StorageError> {
        if !self.config.enabled {
            return Ok(RateLimitStatus::Allowed);
        }
        let Some(bucket) = self.store.get(&Self::bucket_key(ip))? else {
            return Ok(RateLimitStatus::Allowed);
        };
        let (attempts, first_attempt) = Self::bucket_fields(&bucket);
        if now - first_attempt > self.config.window_seconds {
            // Window expired; the next failure resets the bucket.
            return Ok(RateLimitStatus::Allowed);
        }
        if attempts >= self.config.max_attempts {
            let retry_after = (first_attempt + self.config.window_seconds - now).max(1);
            return Ok(RateLimitStatus::Denied {
                retry_after_seconds: retry_after,
            });
        }
        Ok(RateLimitStatus::Allowed)
    }

    pub fn check(&self, ip: &str) -> Result<RateLimitStatus, StorageError> {
        self.check_at(ip, Utc::now().timestamp())
    }

    fn record_failure_at(&self, ip: &str, now: i64) -> Result<(), StorageError> {
        if !self.config.enabled {
            return Ok(());
        }
        let key = Self::bucket_key(ip);
        let ttl = now + self.config.window_seconds + 60;

        if let Some(bucket) = self.store.get(&key)? {
            let (_, first_attempt) = Self::bucket_fields(&bucket);
            if now - first_attempt > self.config.window_seconds {
                // Stale window: clean put instead of incrementing forever.
                let mut fresh = Item::new();
                fresh.insert("failed_attempts".into(), 1.into());
                fresh.insert("first_attempt".into(), now.into());
                fresh.insert("last_attempt".into(), now.into());
                fresh.insert("ttl".into(), ttl.into());
                return self.store.put(&key, fresh, None);
            }
        }

        self.store.update(
            &key,
            Update::new()
                .add("failed_attempts", 1)
                .set_if_absent("first_attempt", now)
                .set("last_attempt", now)
                .set("ttl", ttl),
            ReturnValues::None,
        )?;
        Ok(())
    }

    pub fn record_failure(&self, ip: &str) -> Result<(), StorageError> {
        self.record_failure_at(ip, Utc::now().timestamp())
    }

    pub fn clear(&self, ip: &str) -> Result<(), StorageError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.delete(&Self::bucket_key(ip))
    }
}

// ============================================================================
// Verification service
// ============================================================================

/// Orders the cheap checks before the expensive one: rate limit, then
/// timestamp window, then PBKDF2.
#[derive(Clone)]
pub struct AuthService {
    secret_key: String,
    password: String,
    rate_limiter: RateLimiter,
}

impl AuthService {
    pub fn new(
        secret_key: String,
        password: String,
        store: Arc<dyn ItemStore>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            secret_key,
            password,
            rate_limiter: RateLimiter::new(store, rate_limit),
        }
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    fn verify_at(
        &self,
        challenge: &AuthChallenge,
        client_ip: &str,
        now: i64,
    ) -> Result<VerifyOutcome, StorageError> {
        if let RateLimitStatus::Denied {
            retry_after_seconds,
        } = self.rate_limiter.check_at(client_ip, now)?
        {
            warn!(client_ip, "auth attempt rate limited");
            return Ok(VerifyOutcome::RateLimited {
                retry_after_seconds,
            });
        }

        let name = challenge.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
            self.rate_limiter.record_failure_at(client_ip, now)?;
            return Ok(VerifyOutcome::Denied);
        }

        if (now - challenge.timestamp).abs() > TIMESTAMP_SKEW_SECONDS {
            self.rate_limiter.record_failure_at(client_ip, now)?;
            return Ok(VerifyOutcome::Denied);
        }

        let expected = challenge_hash(&self.password, &challenge.origin, challenge.timestamp);
        let provided = challenge.hash.to_lowercase();
        let matches: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();
        if !matches {
            self.rate_limiter.record_failure_at(client_ip, now)?;
            return Ok(VerifyOutcome::Denied);
        }

        self.rate_limiter.clear(client_ip)?;
        info!(name, "session granted");
        Ok(VerifyOutcome::Granted {
            token: create_session_token_at(&self.secret_key, name, now),
            name: name.to_string(),
        })
    }

    pub fn verify(
        &self,
        challenge: &AuthChallenge,
        client_ip: &str,
    ) -> Result<VerifyOutcome, StorageError> {
        self.verify_at(challenge, client_ip, Utc::now().timestamp())
    }

    /// Verify a Bearer session token.
    pub fn session_from_token(&self, token: &str) -> Option<SessionUser> {
        verify_session_token(&self.secret_key, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;

    const SECRET: &str = "test-secret";
    const PASSWORD: &str = "hunter2";
    const ORIGIN: &str = "https://requests.example.com";

    fn service(config: RateLimitConfig) -> AuthService {
        let store = Arc::new(SledStore::temporary().unwrap());
        AuthService::new(SECRET.into(), PASSWORD.into(), store, config)
    }

    fn enabled_config(max_attempts: i64, window_seconds: i64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            max_attempts,
            window_seconds,
        }
    }

    fn challenge(now: i64) -> AuthChallenge {
        AuthChallenge {
            origin: ORIGIN.into(),
            timestamp: now,
            hash: challenge_hash(PASSWORD, ORIGIN, now),
            name: "alice".into(),
        }
    }

    // ------------------------------------------------------------------ tokens

    #[test]
    fn token_round_trips_within_lifetime() {
        let now = 1_700_000_000;
        let token = create_session_token_at(SECRET, "alice", now);

        for delta in [0, 1, 3600, SESSION_DURATION_SECONDS] {
            let session = verify_session_token_at(SECRET, &token, now + delta)
                .unwrap_or_else(|| panic!("token should verify at delta {delta}"));
            assert_eq!(session.name.as_deref(), Some("alice"));
        }
        // expired and not-yet-valid are both rejected
        assert!(verify_session_token_at(SECRET, &token, now + SESSION_DURATION_SECONDS + 1).is_none());
        assert!(verify_session_token_at(SECRET, &token, now - 1).is_none());
    }

    #[test]
    fn token_name_survives_unicode() {
        let now = 1_700_000_000;
        let token = create_session_token_at(SECRET, "ålice çidré", now);
        let session = verify_session_token_at(SECRET, &token, now).unwrap();
        assert_eq!(session.name.as_deref(), Some("ålice çidré"));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let now = 1_700_000_000;
        let token = create_session_token_at(SECRET, "alice", now);
        let forged = token.replace("alice", "mallory");
        assert!(verify_session_token_at(SECRET, &forged, now).is_none());

        // swap the embedded name while keeping the original signature
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(b"mallory"),
            parts[2]
        );
        assert!(verify_session_token_at(SECRET, &forged, now).is_none());

        assert!(verify_session_token_at("other-secret", &token, now).is_none());
        assert!(verify_session_token_at(SECRET, "garbage", now).is_none());
    }

    #[test]
    fn legacy_two_part_token_still_verifies() {
        let now = 1_700_000_000;
        let legacy = format!("{now}.{}", sign(SECRET, &now.to_string()));
        let session = verify_session_token_at(SECRET, &legacy, now + 10).unwrap();
        assert_eq!(session.name, None);
        assert!(verify_session_token_at(SECRET, &legacy, now + SESSION_DURATION_SECONDS + 1).is_none());
    }

    // --------------------------------------------------------------- challenge

    #[test]
    fn challenge_hash_is_stable_lowercase_hex() {
        let hash = challenge_hash(PASSWORD, ORIGIN, 1_700_000_000);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, challenge_hash(PASSWORD, ORIGIN, 1_700_000_000));
        assert_ne!(hash, challenge_hash(PASSWORD, ORIGIN, 1_700_000_001));
        assert_ne!(hash, challenge_hash("other", ORIGIN, 1_700_000_000));
    }

    #[test]
    fn valid_challenge_grants_named_session() {
        let svc = service(RateLimitConfig::default());
        let now = 1_700_000_000;
        let outcome = svc.verify_at(&challenge(now), "1.2.3.4", now).unwrap();
        match outcome {
            VerifyOutcome::Granted { token, name } => {
                assert_eq!(name, "alice");
                let session = verify_session_token_at(SECRET, &token, now).unwrap();
                assert_eq!(session.name.as_deref(), Some("alice"));
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn uppercase_hash_is_accepted() {
        let svc = service(RateLimitConfig::default());
        let now = 1_700_000_000;
        let mut ch = challenge(now);
        ch.hash = ch.hash.to_uppercase();
        assert!(matches!(
            svc.verify_at(&ch, "1.2.3.4", now).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
    }

    #[test]
    fn stale_timestamp_is_denied() {
        let svc = service(RateLimitConfig::default());
        let now = 1_700_000_000;
        let mut ch = challenge(now - 301);
        ch.hash = challenge_hash(PASSWORD, ORIGIN, now - 301);
        assert_eq!(svc.verify_at(&ch, "ip", now).unwrap(), VerifyOutcome::Denied);

        // 300 seconds of skew is still inside the window
        let mut ch = challenge(now - 300);
        ch.hash = challenge_hash(PASSWORD, ORIGIN, now - 300);
        assert!(matches!(
            svc.verify_at(&ch, "ip", now).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
    }

    #[test]
    fn bad_names_are_denied() {
        let svc = service(RateLimitConfig::default());
        let now = 1_700_000_000;
        let mut ch = challenge(now);
        ch.name = "   ".into();
        assert_eq!(svc.verify_at(&ch, "ip", now).unwrap(), VerifyOutcome::Denied);
        let mut ch = challenge(now);
        ch.name = "x".repeat(51);
        assert_eq!(svc.verify_at(&ch, "ip", now).unwrap(), VerifyOutcome::Denied);
    }

    #[test]
    fn wrong_hash_is_denied() {
        let svc = service(RateLimitConfig::default());
        let now = 1_700_000_000;
        let mut ch = challenge(now);
        ch.hash = challenge_hash("wrong-password", ORIGIN, now);
        assert_eq!(svc.verify_at(&ch, "ip", now).unwrap(), VerifyOutcome::Denied);
    }

    // -------------------------------------------------------------- rate limit

    #[test]
    fn bucket_denies_after_max_attempts() {
        let svc = service(enabled_config(3, 900));
        let now = 1_700_000_000;
        let mut bad = challenge(now);
        bad.hash = "0".repeat(64);

        for _ in 0..3 {
            assert_eq!(svc.verify_at(&bad, "9.9.9.9", now).unwrap(), VerifyOutcome::Denied);
        }
        // 4th attempt is throttled, even with valid credentials
        match svc.verify_at(&challenge(now), "9.9.9.9", now).unwrap() {
            VerifyOutcome::RateLimited {
                retry_after_seconds,
            } => assert!(retry_after_seconds > 0 && retry_after_seconds <= 900),
            other => panic!("expected rate limit, got {other:?}"),
        }
        // other IPs are unaffected
        assert!(matches!(
            svc.verify_at(&challenge(now), "8.8.8.8", now).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
    }

    #[test]
    fn window_expiry_reopens_the_bucket() {
        let svc = service(enabled_config(3, 900));
        let now = 1_700_000_000;
        let mut bad = challenge(now);
        bad.hash = "0".repeat(64);
        for _ in 0..3 {
            svc.verify_at(&bad, "ip", now).unwrap();
        }
        assert!(matches!(
            svc.verify_at(&challenge(now), "ip", now).unwrap(),
            VerifyOutcome::RateLimited { .. }
        ));

        // 901 seconds later the window has passed
        let later = now + 901;
        let ch = challenge(later);
        assert!(matches!(
            svc.verify_at(&ch, "ip", later).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
    }

    #[test]
    fn success_clears_the_bucket() {
        let svc = service(enabled_config(3, 900));
        let now = 1_700_000_000;
        let mut bad = challenge(now);
        bad.hash = "0".repeat(64);
        svc.verify_at(&bad, "ip", now).unwrap();
        svc.verify_at(&bad, "ip", now).unwrap();

        assert!(matches!(
            svc.verify_at(&challenge(now), "ip", now).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
        // bucket is gone: the full budget is available again
        for _ in 0..2 {
            svc.verify_at(&bad, "ip", now).unwrap();
        }
        assert!(matches!(
            svc.verify_at(&challenge(now), "ip", now).unwrap(),
            VerifyOutcome::Granted { .. }
        ));
    }

    #[test]
    fn stale_bucket_resets_on_next_failure() {
        let store: Arc<SledStore> = Arc::new(SledStore::temporary().unwrap());
        let limiter = RateLimiter::new(store, enabled_config(3, 900));
        let now = 1_700_000_000;
        for _ in 0..3 {
            limiter.record_failure_at("ip", now).unwrap();
        }
        // After the window, a new failure starts a fresh count of 1.
        let later = now + 1000;
        limiter.record_failure_at("ip", later).unwrap();
        assert_eq!(limiter.check_at("ip", later).unwrap(), RateLimitStatus::Allowed);
    }

    #[test]
    fn disabled_limiter_touches_nothing() {
        let store: Arc<SledStore> = Arc::new(SledStore::temporary().unwrap());
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
        let now = 1_700_000_000;
        for _ in 0..10 {
            limiter.record_failure_at("ip", now).unwrap();
        }
        assert_eq!(limiter.check_at("ip", now).unwrap(), RateLimitStatus::Allowed);
        use crate::storage::ItemStore;
        assert!(store.get(&RateLimiter::bucket_key("ip")).unwrap().is_none());
    }
}
