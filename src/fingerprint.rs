//! Request fingerprinting
//!
//! A fingerprint identifies one logical request for both caching and
//! coalescing. It is a SHA-256 digest over the method, the path with its query
//! string, the caller's identity token and, for mutating methods, a digest of
//! the body.

use axum::http::Method;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::origin::ProxyRequest;

/// Hex-encoded SHA-256 digest identifying a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines and request ids.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Rebuild a fingerprint from a stored key suffix.
    pub fn from_hex(hex: &str) -> Option<Self> {
        (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| Self(hex.to_ascii_lowercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hashes_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub fn fingerprint(request: &ProxyRequest) -> Fingerprint {
    let mut hasher = Sha256::new();

    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.path_and_query.as_bytes());

    // Presence is tagged so "no credential" never collides with an empty one.
    match request.identity() {
        Some(identity) => {
            hasher.update(b"\nauth:");
            hasher.update(identity);
        }
        None => hasher.update(b"\nanon"),
    }

    if hashes_body(&request.method) && !request.body.is_empty() {
        let body_digest = Sha256::digest(&request.body);
        hasher.update(b"\nbody:");
        hasher.update(body_digest);
    }

    Fingerprint(hex::encode(hasher.finalize()))
}
