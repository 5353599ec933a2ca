//! MESSAGE-INTEGRITY for the long-term credential mechanism.
//!
//! The session key is `MD5(username ":" realm ":" password)` (RFC 5389
//! Section 15.4) and the digest is HMAC-SHA1 over every byte of the
//! message before the MESSAGE-INTEGRITY attribute, with the header
//! length field adjusted to end at that attribute.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use super::HEADER_SIZE;
use crate::error::AuthError;

type HmacSha1 = Hmac<Sha1>;

/// Derive the 16-byte long-term session key
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// HMAC-SHA1 digest over an already length-adjusted message prefix
pub(crate) fn compute(key: &[u8], message: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Verify the MESSAGE-INTEGRITY attribute of a raw message.
///
/// Scans the raw attribute list for the first MESSAGE-INTEGRITY,
/// recomputes the digest over the preceding bytes with the length field
/// rewritten to cover exactly up to that attribute, and compares in
/// constant time. A missing attribute or a mismatch is an
/// [`AuthError::BadIntegrity`].
pub fn verify(raw: &[u8], key: &[u8]) -> Result<(), AuthError> {
    let pos = find_attribute(raw, 0x0008).ok_or(AuthError::BadIntegrity)?;
    if raw.len() < pos + 24 {
        return Err(AuthError::BadIntegrity);
    }
    let digest = &raw[pos + 4..pos + 24];

    let mut prefix = raw[..pos].to_vec();
    let adjusted_len = (pos + 24 - HEADER_SIZE) as u16;
    prefix[2..4].copy_from_slice(&adjusted_len.to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key");
    mac.update(&prefix);
    mac.verify_slice(digest).map_err(|_| AuthError::BadIntegrity)
}

/// Byte offset of the first attribute with the given type, if any
fn find_attribute(raw: &[u8], attr_type: u16) -> Option<usize> {
    let mut pos = HEADER_SIZE;
    while pos + 4 <= raw.len() {
        let t = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
        if t == attr_type {
            return Some(pos);
        }
        pos += 4 + len + (4 - (len % 4)) % 4;
    }
    None
}
