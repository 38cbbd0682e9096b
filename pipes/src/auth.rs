//! Cluster-wide cookie authentication.
//!
//! An auth cookie value is `user-expiry-signature` where `signature` is the hex HMAC of
//! `user-expiry` under a key shared by every node and client. `expiry` is in milliseconds
//! since the epoch, `0` never expires.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Sha256, Sha512};

use pipes_conf::HmacAlgo;
use pipes_utils::{format_http_date, timestamp_millis, TimestampMillis};

pub const AUTH_COOKIE_NAME: &str = "auth";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub user: String,
    pub expiry: TimestampMillis,
    pub expired: bool,
    pub authenticated: bool,
}

impl Default for AuthResult {
    fn default() -> Self {
        AuthResult { user: "none".into(), expiry: 0, expired: true, authenticated: false }
    }
}

impl AuthResult {
    /// The authenticated user name, if any.
    #[inline]
    pub fn user(&self) -> Option<&str> {
        if self.authenticated {
            Some(self.user.as_str())
        } else {
            None
        }
    }

    #[inline]
    pub fn is_user(&self, user: &str) -> bool {
        self.authenticated && self.user == user
    }
}

fn signature(algo: HmacAlgo, key: &str, data: &str) -> Vec<u8> {
    //HMAC accepts keys of any length, new_from_slice cannot fail here.
    match algo {
        HmacAlgo::Sha256 => match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
            Ok(mut mac) => {
                mac.update(data.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
        HmacAlgo::Sha512 => match Hmac::<Sha512>::new_from_slice(key.as_bytes()) {
            Ok(mut mac) => {
                mac.update(data.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
    }
}

fn verify(algo: HmacAlgo, key: &str, data: &str, sig: &[u8]) -> bool {
    match algo {
        HmacAlgo::Sha256 => Hmac::<Sha256>::new_from_slice(key.as_bytes())
            .map(|mut mac| {
                mac.update(data.as_bytes());
                mac.verify_slice(sig).is_ok()
            })
            .unwrap_or(false),
        HmacAlgo::Sha512 => Hmac::<Sha512>::new_from_slice(key.as_bytes())
            .map(|mut mac| {
                mac.update(data.as_bytes());
                mac.verify_slice(sig).is_ok()
            })
            .unwrap_or(false),
    }
}

/// `name=user-expiry-signature`, ready for a `Cookie` request header.
pub fn generate_auth_cookie(
    algo: HmacAlgo,
    key: &str,
    user: &str,
    expiry: TimestampMillis,
    name: &str,
) -> String {
    let data = format!("{user}-{expiry}");
    let sig = hex::encode(signature(algo, key, &data));
    format!("{name}={data}-{sig}")
}

/// The auth cookie with `Expires`, `Path` and `Domain` attributes for a `Set-Cookie` header.
pub fn generate_auth_set_cookie(
    algo: HmacAlgo,
    key: &str,
    user: &str,
    expiry: TimestampMillis,
    name: &str,
    path: &str,
    domain: &str,
) -> String {
    let mut cookie = generate_auth_cookie(algo, key, user, expiry, name);
    if expiry != 0 {
        cookie.push_str(&format!("; Expires={}", format_http_date(expiry)));
    }
    cookie.push_str(&format!("; Path={path}; Domain={domain}"));
    cookie
}

/// Checks a cookie value (without the `name=` part).
///
/// A cookie authenticates only if its signature matches and it has not expired.
pub fn authenticate_cookie(algo: HmacAlgo, key: &str, cookie: &str) -> AuthResult {
    let mut auth = AuthResult::default();

    let mut parts = cookie.trim().rsplitn(3, '-');
    let (sig, expiry, user) = match (parts.next(), parts.next(), parts.next()) {
        (Some(sig), Some(expiry), Some(user)) => (sig, expiry, user),
        _ => return auth,
    };
    let expiry_ms = match expiry.parse::<TimestampMillis>() {
        Ok(e) => e,
        Err(_) => return auth,
    };

    auth.user = user.to_owned();
    auth.expiry = expiry_ms;
    //Valid only while expiry is strictly in the future.
    auth.expired = expiry_ms != 0 && expiry_ms <= timestamp_millis();

    let signed = match hex::decode(sig) {
        Ok(sig) => verify(algo, key, &format!("{user}-{expiry}"), &sig),
        Err(_) => false,
    };
    auth.authenticated = signed && !auth.expired;
    if !auth.authenticated {
        log::debug!("cookie rejected, user: {}, expired: {}, signed: {}", user, auth.expired, signed);
    }
    auth
}

/// Parses a `Cookie` request header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> std::collections::HashMap<String, String> {
    header
        .split(';')
        .filter_map(|kv| {
            let kv = kv.trim();
            if kv.is_empty() {
                return None;
            }
            match kv.split_once('=') {
                Some((k, v)) => Some((k.trim().to_owned(), v.trim().to_owned())),
                None => Some((kv.to_owned(), String::new())),
            }
        })
        .collect()
}
