// Digest authentication (RFC 2617 as profiled by RFC 3261 22)
//
// The proxy challenges with 401 + WWW-Authenticate and verifies the
// Authorization the client sends back. Nonces are issued here and expire by
// age; verification is constant-time and costs the same whether the user
// exists or not.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;

use crate::sip::message::SipRequest;

/// How long an issued nonce stays valid.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Password hashed for requests naming an unknown user, so lookup failures
/// are indistinguishable from wrong passwords on the wire.
const DUMMY_PASSWORD: &str = "0000000000000000";

/// Parameters extracted from an Authorization header value.
#[derive(Debug, Clone, PartialEq, Default)]
struct AuthParams {
    username: Option<String>,
    realm: Option<String>,
    nonce: Option<String>,
    uri: Option<String>,
    response: Option<String>,
    algorithm: Option<String>,
    qop: Option<String>,
    nc: Option<String>,
    cnonce: Option<String>,
}

/// Challenge issuer and credential verifier.
pub struct DigestAuthenticator {
    nonces: DashMap<String, Instant>,
}

impl DigestAuthenticator {
    pub fn new() -> Self {
        DigestAuthenticator {
            nonces: DashMap::new(),
        }
    }

    /// Issue a fresh nonce and build the WWW-Authenticate value.
    pub fn create_challenge(&self, realm: &str) -> String {
        let nonce = self.issue_nonce();
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
            realm, nonce
        )
    }

    fn issue_nonce(&self) -> String {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        let nonce: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        self.nonces.insert(nonce.clone(), Instant::now());
        nonce
    }

    /// Verify the Authorization (or Proxy-Authorization) header of a request
    /// against the configured user map.
    pub fn verify(&self, request: &SipRequest, users: &HashMap<String, String>, realm: &str) -> bool {
        let header = match request
            .headers
            .other("Authorization")
            .or_else(|| request.headers.other("Proxy-Authorization"))
        {
            Some(v) => v,
            None => return false,
        };

        let params = match parse_digest_value(header) {
            Some(p) => p,
            None => return false,
        };

        let (username, supplied_realm, nonce, uri, response) = match (
            &params.username,
            &params.realm,
            &params.nonce,
            &params.uri,
            &params.response,
        ) {
            (Some(u), Some(r), Some(n), Some(d), Some(resp)) => (u, r, n, d, resp),
            _ => return false,
        };

        if supplied_realm != realm {
            return false;
        }
        if !self.nonce_is_valid(nonce) {
            return false;
        }

        // Unknown users hash a dummy password; the compare below fails
        // without an early return.
        let password = users
            .get(username)
            .map(String::as_str)
            .unwrap_or(DUMMY_PASSWORD);

        let algorithm = params.algorithm.as_deref().unwrap_or("MD5");
        let method = request.method.as_str();

        let ha1 = hash_hex(algorithm, &format!("{}:{}:{}", username, realm, password));
        let ha2 = hash_hex(algorithm, &format!("{}:{}", method, uri));
        let expected = match (&params.qop, &params.nc, &params.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) if !qop.is_empty() => hash_hex(
                algorithm,
                &format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2),
            ),
            _ => hash_hex(algorithm, &format!("{}:{}:{}", ha1, nonce, ha2)),
        };

        constant_time_eq(expected.as_bytes(), response.to_ascii_lowercase().as_bytes())
            && users.contains_key(username)
    }

    fn nonce_is_valid(&self, nonce: &str) -> bool {
        match self.nonces.get(nonce) {
            Some(issued) => issued.elapsed() <= NONCE_LIFETIME,
            None => false,
        }
    }

    /// Drop nonces past their lifetime. Returns how many were removed.
    pub fn sweep_nonces(&self) -> usize {
        let before = self.nonces.len();
        self.nonces.retain(|_, issued| issued.elapsed() <= NONCE_LIFETIME);
        before - self.nonces.len()
    }

    #[cfg(test)]
    fn insert_nonce_at(&self, nonce: &str, issued: Instant) {
        self.nonces.insert(nonce.to_string(), issued);
    }
}

impl Default for DigestAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `Digest key="value", key=value, ...`.
fn parse_digest_value(value: &str) -> Option<AuthParams> {
    let value = value.trim();
    let rest = value
        .strip_prefix("Digest ")
        .or_else(|| value.strip_prefix("digest "))?;

    let mut params = AuthParams::default();
    for part in split_quoted_commas(rest) {
        let (key, val) = match part.trim().split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "username" => params.username = Some(val),
            "realm" => params.realm = Some(val),
            "nonce" => params.nonce = Some(val),
            "uri" => params.uri = Some(val),
            "response" => params.response = Some(val),
            "algorithm" => params.algorithm = Some(val),
            "qop" => params.qop = Some(val),
            "nc" => params.nc = Some(val),
            "cnonce" => params.cnonce = Some(val),
            _ => {}
        }
    }
    Some(params)
}

/// Split on commas that are outside quoted strings.
fn split_quoted_commas(s: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                result.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        result.push(&s[start..]);
    }
    result
}

/// Hash with the negotiated algorithm, lowercase hex output.
fn hash_hex(algorithm: &str, input: &str) -> String {
    if algorithm.eq_ignore_ascii_case("SHA-256") {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        format!("{:064x}", hasher.finalize())
    } else {
        let mut hasher = Md5::new();
        hasher.update(input.as_bytes());
        format!("{:032x}", hasher.finalize())
    }
}

/// Length-leaking-only comparison: examines every byte regardless of where
/// the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
