// src/auth.rs
//! Time-limited credential issuance and verification.
//!
//! Credentials follow the TURN REST scheme: the username embeds an
//! absolute expiry (`"<unix-expiry>:<identity>"`) and the password is
//! `base64(HMAC-SHA1(secret, username))`. Validity is a pure function
//! of (username, shared secret, current time) — the server stores
//! nothing at issuance time, so issuance and verification are safe to
//! call concurrently without coordination.
//!
//! The module also provides the stateless nonce used by the 401/438
//! challenge round: an HMAC-stamped token embedding its own issue time
//! and the client IP, so replayed or borrowed nonces fail verification
//! without any server-side nonce table.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::error::AuthError;

type HmacSha1 = Hmac<Sha1>;

/// A (username, password, expiry) triple issued for one identity
#[derive(Debug, Clone)]
pub struct Credential {
    /// `"<unix-expiry>:<identity>"`
    pub username: String,
    /// Keyed digest of the username under the shared secret
    pub password: String,
    /// Absolute expiry encoded in the username
    pub expires_at: SystemTime,
}

/// Issue a credential pair for `identity`, valid for `ttl` from `now`
pub fn issue(identity: &str, secret: &str, ttl: Duration, now: SystemTime) -> Credential {
    let expires_at = now + ttl;
    let expiry_secs = unix_secs(expires_at);
    let username = format!("{expiry_secs}:{identity}");
    let password = password_for(&username, secret);
    Credential { username, password, expires_at }
}

/// Verify a credential pair against the shared secret at `now`.
///
/// Distinguishes [`AuthError::Expired`] from [`AuthError::Forged`] so
/// callers can log the difference; the protocol layer treats both as
/// authentication failure.
pub fn verify(
    username: &str,
    password: &str,
    secret: &str,
    now: SystemTime,
) -> Result<(), AuthError> {
    // Compared via the MAC to stay constant-time
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(username.as_bytes());
    let given = URL_SAFE_NO_PAD
        .decode(password)
        .map_err(|_| AuthError::Forged)?;
    mac.verify_slice(&given).map_err(|_| AuthError::Forged)?;

    check_expiry(username, now)
}

/// Check only the expiry embedded in a username
pub fn check_expiry(username: &str, now: SystemTime) -> Result<(), AuthError> {
    let (expiry, _) = username
        .split_once(':')
        .ok_or(AuthError::MalformedUsername)?;
    let expiry: u64 = expiry.parse().map_err(|_| AuthError::MalformedUsername)?;
    if unix_secs(now) >= expiry {
        return Err(AuthError::Expired);
    }
    Ok(())
}

/// Deterministic password for a username under the shared secret
pub(crate) fn password_for(username: &str, secret: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(username.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

/// Stateless nonce generator for the long-term credential challenge.
///
/// Nonce format: `"<issue-unix-hex>.<base64(hmac(key, issue || ip))>"`.
/// Validation recomputes the stamp, so no used-nonce table is needed;
/// age beyond `lifetime` is reported as [`AuthError::StaleNonce`] and
/// answered with a fresh 438 challenge.
pub struct NonceManager {
    key: [u8; 32],
    lifetime: Duration,
}

impl NonceManager {
    /// New manager with a process-local random key
    pub fn new(lifetime: Duration) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key, lifetime }
    }

    /// Generate a nonce bound to `client_ip`
    pub fn generate(&self, client_ip: IpAddr) -> String {
        let issued = unix_secs(SystemTime::now());
        format!("{issued:x}.{}", self.stamp(issued, client_ip))
    }

    /// Validate a nonce presented by `client_ip`
    pub fn validate(&self, nonce: &str, client_ip: IpAddr) -> Result<(), AuthError> {
        let (issued_hex, stamp) = nonce.split_once('.').ok_or(AuthError::InvalidNonce)?;
        let issued = u64::from_str_radix(issued_hex, 16).map_err(|_| AuthError::InvalidNonce)?;
        if self.stamp(issued, client_ip) != stamp {
            return Err(AuthError::InvalidNonce);
        }
        let now = unix_secs(SystemTime::now());
        if now > issued + self.lifetime.as_secs() {
            return Err(AuthError::StaleNonce);
        }
        Ok(())
    }

    fn stamp(&self, issued: u64, client_ip: IpAddr) -> String {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("HMAC key");
        mac.update(&issued.to_be_bytes());
        match client_ip {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        URL_SAFE_NO_PAD.encode(&mac.finalize().into_bytes()[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "shared-secret";

    #[test]
    fn issued_credential_verifies_until_expiry() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let cred = issue("alice", SECRET, Duration::from_secs(3600), now);

        assert!(cred.username.ends_with(":alice"));
        assert!(verify(&cred.username, &cred.password, SECRET, now).is_ok());

        let last_valid = now + Duration::from_secs(3599);
        assert!(verify(&cred.username, &cred.password, SECRET, last_valid).is_ok());

        let at_expiry = now + Duration::from_secs(3600);
        assert!(matches!(
            verify(&cred.username, &cred.password, SECRET, at_expiry),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn forged_password_is_rejected() {
        let now = SystemTime::now();
        let cred = issue("bob", SECRET, Duration::from_secs(600), now);
        assert!(matches!(
            verify(&cred.username, "bm90LXRoZS1wYXNzd29yZA", SECRET, now),
            Err(AuthError::Forged)
        ));
        // A credential issued under a different secret is forged too
        let other = issue("bob", "other-secret", Duration::from_secs(600), now);
        assert!(matches!(
            verify(&other.username, &other.password, SECRET, now),
            Err(AuthError::Forged)
        ));
    }

    #[test]
    fn malformed_username_is_rejected() {
        let now = SystemTime::now();
        assert!(matches!(
            check_expiry("no-colon-here", now),
            Err(AuthError::MalformedUsername)
        ));
        assert!(matches!(
            check_expiry("notanumber:alice", now),
            Err(AuthError::MalformedUsername)
        ));
    }

    #[test]
    fn issuance_is_stateless() {
        // Same inputs, same credential — nothing is stored server-side
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = issue("carol", SECRET, Duration::from_secs(60), now);
        let b = issue("carol", SECRET, Duration::from_secs(60), now);
        assert_eq!(a.username, b.username);
        assert_eq!(a.password, b.password);
    }

    #[test]
    fn nonce_round_trip_and_binding() {
        let nonces = NonceManager::new(Duration::from_secs(3600));
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let nonce = nonces.generate(ip);

        assert!(nonces.validate(&nonce, ip).is_ok());

        // A different client cannot reuse the nonce
        let other: IpAddr = "192.0.2.8".parse().unwrap();
        assert!(matches!(
            nonces.validate(&nonce, other),
            Err(AuthError::InvalidNonce)
        ));

        // A nonce from another server instance is invalid
        let foreign = NonceManager::new(Duration::from_secs(3600));
        assert!(matches!(
            foreign.validate(&nonce, ip),
            Err(AuthError::InvalidNonce)
        ));
    }

    #[test]
    fn aged_nonce_is_stale() {
        let nonces = NonceManager::new(Duration::ZERO);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let issued = unix_secs(SystemTime::now()) - 10;
        let nonce = format!("{issued:x}.{}", nonces.stamp(issued, ip));
        assert!(matches!(
            nonces.validate(&nonce, ip),
            Err(AuthError::StaleNonce)
        ));
    }
}
