//! Digest access authentication for monerod's `--rpc-login` option.
//!
//! Monerod answers unauthenticated requests with a `WWW-Authenticate` digest
//! challenge (MD5, qop `auth`). The client answers the challenge once per
//! request; a nonce counter and a random cnonce are maintained here.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use hyper::{
    header::{HeaderValue, InvalidHeaderValue},
    http::uri::PathAndQuery,
    Method, Uri,
};
use md5::{Digest, Md5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use thiserror::Error;

/// Digest authentication state for one daemon login.
#[derive(Debug)]
pub(crate) struct AuthInfo {
    username: String,
    password: String,
    counter: AtomicU32,
    rng: Mutex<ChaCha12Rng>,
}

impl AuthInfo {
    pub(crate) fn new(username: String, password: String, seed: Option<u64>) -> AuthInfo {
        let rng = seed.map_or_else(ChaCha12Rng::from_entropy, ChaCha12Rng::seed_from_u64);
        AuthInfo {
            username,
            password,
            counter: AtomicU32::new(1),
            rng: Mutex::new(rng),
        }
    }

    /// Answer a `WWW-Authenticate` challenge with an `AUTHORIZATION` header
    /// value.
    pub(crate) fn answer(
        &self,
        challenge: &HeaderValue,
        uri: &Uri,
        method: &Method,
    ) -> Result<HeaderValue, AuthError> {
        let challenge = parse_challenge(challenge)?;
        if !matches!(challenge.algorithm.as_deref(), None | Some("MD5")) {
            return Err(AuthError::UnsupportedAlgorithm(
                challenge.algorithm.unwrap_or_default(),
            ));
        }

        let mut cnonce_bytes = [0_u8; 16];
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(&mut cnonce_bytes[..]);
        let cnonce = hex::encode(cnonce_bytes);
        let nc = format!("{:08x}", self.counter.fetch_add(1, Ordering::Relaxed));

        let path_and_query = uri
            .path_and_query()
            .map_or(uri.path(), PathAndQuery::as_str);
        let response = digest_response(
            &self.username,
            &challenge.realm,
            &self.password,
            method.as_str(),
            path_and_query,
            &challenge.nonce,
            &nc,
            &cnonce,
        );

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\", algorithm=MD5",
            self.username, challenge.realm, challenge.nonce, path_and_query, nc, cnonce, response,
        );
        if let Some(opaque) = challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        Ok(HeaderValue::from_str(&header)?)
    }
}

#[derive(Debug)]
struct Challenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Option<String>,
}

fn parse_challenge(header: &HeaderValue) -> Result<Challenge, AuthError> {
    let value = header.to_str().map_err(|_| AuthError::InvalidChallenge)?;
    let params = value
        .strip_prefix("Digest ")
        .ok_or(AuthError::InvalidChallenge)?;

    let mut fields = HashMap::new();
    for param in params.split(',') {
        let Some((key, val)) = param.split_once('=') else {
            continue;
        };
        fields.insert(key.trim(), val.trim().trim_matches('"').to_string());
    }

    Ok(Challenge {
        realm: fields.remove("realm").ok_or(AuthError::InvalidChallenge)?,
        nonce: fields.remove("nonce").ok_or(AuthError::InvalidChallenge)?,
        opaque: fields.remove("opaque"),
        algorithm: fields.remove("algorithm"),
    })
}

/// RFC 7616 `response` for qop `auth` with MD5.
#[allow(clippy::too_many_arguments)]
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// An error answering a digest challenge.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The daemon requires authentication but no login was configured.
    #[error("daemon requires authentication, but no login is configured")]
    Unauthorized,
    /// The `WWW-Authenticate` header could not be interpreted.
    #[error("invalid digest challenge")]
    InvalidChallenge,
    /// The daemon asked for an algorithm other than MD5.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// The computed header contained invalid characters.
    #[error("failed to build authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use hyper::{header::HeaderValue, Method, Uri};

    use super::{digest_response, parse_challenge, AuthInfo};

    #[test]
    fn rfc_test_vector() {
        // The worked example from RFC 2617 §3.5.
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "00000001",
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn parses_monerod_style_challenge() {
        let header = HeaderValue::from_static(
            "Digest qop=\"auth\", algorithm=MD5, realm=\"monero-rpc\", nonce=\"AbCd==\", stale=false",
        );
        let challenge = parse_challenge(&header).unwrap();
        assert_eq!(challenge.realm, "monero-rpc");
        assert_eq!(challenge.nonce, "AbCd==");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert!(challenge.opaque.is_none());
    }

    #[test]
    fn rejects_non_digest_challenge() {
        let header = HeaderValue::from_static("Basic realm=\"monero-rpc\"");
        parse_challenge(&header).unwrap_err();
    }

    #[test]
    fn answer_builds_complete_header() {
        let auth = AuthInfo::new("user".to_string(), "pass".to_string(), Some(7));
        let challenge = HeaderValue::from_static(
            "Digest qop=\"auth\", algorithm=MD5, realm=\"monero-rpc\", nonce=\"xyz\"",
        );
        let uri: Uri = "http://node.example.com:18081/json_rpc".parse().unwrap();

        let header = auth.answer(&challenge, &uri, &Method::POST).unwrap();
        let value = header.to_str().unwrap();
        assert!(value.starts_with("Digest username=\"user\""));
        assert!(value.contains("uri=\"/json_rpc\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("response="));

        // The nonce counter advances per answered challenge.
        let header = auth.answer(&challenge, &uri, &Method::POST).unwrap();
        assert!(header.to_str().unwrap().contains("nc=00000002"));
    }
}
