//! Request signatures shared by the frontend handshake and DDNS updates.
//!
//! A signature is `salt || hex(HMAC-SHA256(secret, payload || salt))`,
//! truncated to the requested length. Time-bucketed salts give a signature
//! a short validity window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the salt prefix in characters.
pub const SALT_LEN: usize = 8;

/// Seconds covered by one time-bucket salt.
pub const SIGNATURE_WINDOW_SECS: u64 = 600;

/// Sign `payload` with `secret` using the given salt.
///
/// The returned string is at most `length` characters and never shorter
/// than the salt.
pub fn sign(secret: &str, payload: &str, salt: &str, length: usize) -> String {
    let salt: String = format!("{salt:0>width$}", width = SALT_LEN)
        .chars()
        .take(SALT_LEN)
        .collect();
    // HMAC-SHA256 accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return salt,
    };
    mac.update(payload.as_bytes());
    mac.update(salt.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());

    let mut signature = salt;
    let room = length.saturating_sub(signature.len());
    signature.extend(digest.chars().take(room));
    signature
}

/// Salt derived from the current time bucket.
pub fn time_salt(unix_secs: u64) -> String {
    format!("{:08x}", unix_secs / SIGNATURE_WINDOW_SECS)
}

/// Check `signature` against `payload`, accepting the current and the
/// previous time bucket.
#[cfg(test)]
pub fn verify_timed(secret: &str, payload: &str, signature: &str, unix_secs: u64) -> bool {
    let length = signature.len();
    [unix_secs, unix_secs.saturating_sub(SIGNATURE_WINDOW_SECS)]
        .iter()
        .any(|t| sign(secret, payload, &time_salt(*t), length) == signature)
}
