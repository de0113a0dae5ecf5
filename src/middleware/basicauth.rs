//! Basic authentication middleware with htpasswd-style credential storage.
//!
//! Supported hash formats: APR1 MD5 (`$apr1$`), SHA1 (`{SHA}`) and plain
//! text. Comparison is constant-time.

use crate::http::{HttpHandler, SharedHandler};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::AUTHORIZATION;
use hyper::{Body, Request, Response, StatusCode};
use md5::{Digest, Md5};
use sha1::Sha1;
use std::sync::Arc;

pub struct BasicAuthHandler {
    users: Vec<(String, String)>,
    realm: String,
    next: SharedHandler,
}

impl BasicAuthHandler {
    pub fn new(users: &[String], realm: Option<&str>, next: SharedHandler) -> Arc<Self> {
        let users = users
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once(':')
                    .map(|(user, hash)| (user.to_string(), hash.to_string()))
            })
            .collect();

        Arc::new(Self {
            users,
            realm: realm.unwrap_or("fluxgate").to_string(),
            next,
        })
    }

    fn authorized(&self, req: &Request<Body>) -> bool {
        let Some(header) = req.headers().get(AUTHORIZATION) else {
            return false;
        };
        let Ok(header) = header.to_str() else {
            return false;
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return false;
        };

        self.users
            .iter()
            .any(|(name, hash)| name == user && verify(password, hash))
    }

    fn challenge(&self) -> Response<Body> {
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                "WWW-Authenticate",
                format!("Basic realm=\"{}\"", self.realm),
            )
            .body(Body::from("Unauthorized"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl HttpHandler for BasicAuthHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if self.authorized(&req) {
            self.next.handle(req).await
        } else {
            self.challenge()
        }
    }
}

/// Verifies a password against a stored hash, detecting the format.
pub fn verify(password: &str, hash: &str) -> bool {
    if hash.starts_with("$apr1$") {
        verify_apr1(password, hash)
    } else if let Some(encoded) = hash.strip_prefix("{SHA}") {
        verify_sha1(password, encoded)
    } else {
        constant_time_eq(password.as_bytes(), hash.as_bytes())
    }
}

/// Constant-time byte comparison that does not leak length through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_eq = a.len() == b.len();
    let max_len = a.len().max(b.len());
    let mut result = 0u8;

    for i in 0..max_len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        result |= x ^ y;
    }

    result == 0 && len_eq
}

fn verify_sha1(password: &str, encoded: &str) -> bool {
    let mut hasher = Sha1::new();
    sha1::Digest::update(&mut hasher, password.as_bytes());
    let digest = sha1::Digest::finalize(hasher);
    let computed = STANDARD.encode(digest);
    constant_time_eq(computed.as_bytes(), encoded.as_bytes())
}

const APR1_ALPHABET: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Apache APR1 MD5 crypt.
fn verify_apr1(password: &str, hash: &str) -> bool {
    let mut parts = hash.splitn(4, '$');
    let (_, magic, salt, expected) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    );
    let (Some(magic), Some(salt), Some(expected)) = (magic, salt, expected) else {
        return false;
    };
    if magic != "apr1" {
        return false;
    }

    let computed = apr1_crypt(password.as_bytes(), salt.as_bytes());
    constant_time_eq(computed.as_bytes(), expected.as_bytes())
}

fn apr1_crypt(password: &[u8], salt: &[u8]) -> String {
    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(b"$apr1$");
    ctx.update(salt);

    let mut alt = Md5::new();
    alt.update(password);
    alt.update(salt);
    alt.update(password);
    let alt_sum = alt.finalize();

    let mut len = password.len();
    while len > 0 {
        ctx.update(&alt_sum[..len.min(16)]);
        len = len.saturating_sub(16);
    }

    let mut len = password.len();
    while len > 0 {
        if len & 1 != 0 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        len >>= 1;
    }

    let mut sum = ctx.finalize();

    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 != 0 {
            ctx.update(password);
        } else {
            ctx.update(sum);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(password);
        }
        if round & 1 != 0 {
            ctx.update(sum);
        } else {
            ctx.update(password);
        }
        sum = ctx.finalize();
    }

    let order = [
        (0usize, 6usize, 12usize),
        (1, 7, 13),
        (2, 8, 14),
        (3, 9, 15),
        (4, 10, 5),
    ];

    let mut out = String::with_capacity(22);
    for (a, b, c) in order {
        let v = (u32::from(sum[a]) << 16) | (u32::from(sum[b]) << 8) | u32::from(sum[c]);
        encode_24_bits(v, 4, &mut out);
    }
    encode_24_bits(u32::from(sum[11]), 2, &mut out);
    out
}

fn encode_24_bits(mut v: u32, count: usize, out: &mut String) {
    for _ in 0..count {
        out.push(APR1_ALPHABET[(v & 0x3f) as usize] as char);
        v >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusHandler;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_plain_and_sha1_verify() {
        assert!(verify("bar", "bar"));
        assert!(!verify("bar", "baz"));
        // htpasswd -s output for password "bar".
        assert!(verify("bar", "{SHA}Ys23Ag/5IOWqZCw9QGaVDdHwH00="));
        assert!(!verify("wrong", "{SHA}Ys23Ag/5IOWqZCw9QGaVDdHwH00="));
    }

    #[test]
    fn test_apr1_verify() {
        // htpasswd -m output for password "password".
        assert!(verify("password", "$apr1$H6uskkkW$IgXLP6ewTrSuBkTrqE8wj/"));
        assert!(!verify("wrong", "$apr1$H6uskkkW$IgXLP6ewTrSuBkTrqE8wj/"));
    }

    #[tokio::test]
    async fn test_missing_credentials_are_challenged() {
        let handler = BasicAuthHandler::new(
            &["foo:bar".to_string()],
            None,
            StatusHandler::new(StatusCode::OK),
        );
        let resp = handler.handle(Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("WWW-Authenticate"));
    }

    #[tokio::test]
    async fn test_valid_credentials_pass() {
        let handler = BasicAuthHandler::new(
            &["foo:bar".to_string()],
            None,
            StatusHandler::new(StatusCode::OK),
        );
        let token = STANDARD.encode("foo:bar");
        let req = Request::builder()
            .header(AUTHORIZATION, format!("Basic {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let handler = BasicAuthHandler::new(
            &["foo:bar".to_string()],
            None,
            StatusHandler::new(StatusCode::OK),
        );
        let token = STANDARD.encode("foo:nope");
        let req = Request::builder()
            .header(AUTHORIZATION, format!("Basic {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
