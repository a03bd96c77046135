//! Signed cookies and the CSRF token they carry.
//!
//! A secure cookie value is `base64url(value)|timestamp_nanos|hex(hmac_sha256(key, b64 + ts))`.
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use cookie::Cookie;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Cookie holding the signed CSRF token
pub const XSRF_COOKIE: &str = "_xsrf";

const TOKEN_LENGTH: usize = 32;
const TOKEN_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Fresh random token
pub fn random_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

fn signature(key: &str, encoded: &str, timestamp: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(encoded.as_bytes());
    mac.update(timestamp.as_bytes());
    Some(
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect(),
    )
}

/// Sign `value` with `key` at the current time
pub fn sign_value(key: &str, value: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .to_string();
    let encoded = URL_SAFE.encode(value.as_bytes());
    let sig = signature(key, &encoded, &timestamp).unwrap_or_default();
    format!("{encoded}|{timestamp}|{sig}")
}

/// Original value of a signed cookie, or `None` when the signature does not verify
pub fn verify_secure_value(key: &str, raw: &str) -> Option<String> {
    let mut parts = raw.splitn(3, '|');
    let (encoded, timestamp, sig) = (parts.next()?, parts.next()?, parts.next()?);
    let expected = signature(key, encoded, timestamp)?;
    if !tokens_match(sig, &expected) {
        return None;
    }
    let decoded = URL_SAFE.decode(encoded).ok()?;
    String::from_utf8(decoded).ok()
}

/// Build a signed cookie; `expire_secs == 0` makes it a session cookie
pub fn secure_cookie(key: &str, name: &str, value: &str, expire_secs: u64) -> Cookie<'static> {
    let builder = Cookie::build((name.to_string(), sign_value(key, value))).path("/");
    let builder = if expire_secs > 0 {
        builder.max_age(cookie::time::Duration::seconds(
            i64::try_from(expire_secs).unwrap_or(i64::MAX),
        ))
    } else {
        builder
    };
    builder.build()
}

/// Constant-time comparison
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
