use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use reqwest::Method;
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay literal, everything else is encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const SIGNATURE_METHOD: &str = "HMAC-SHA1";
const OAUTH_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("credential field {0} is empty")]
    MissingField(&'static str),
    #[error("target uri is not absolute: {0}")]
    RelativeUri(String),
    #[error("unsupported http method {0}")]
    UnsupportedMethod(String),
    #[error("invalid signing key: {0}")]
    Key(String),
}

/// Long-lived session credentials. Secrets never leave this process; only
/// signatures derived from them do.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedCredential {
    consumer_key: String,
    consumer_secret: String,
    access_token: String,
    access_secret: String,
}

impl DelegatedCredential {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        access_token: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            access_token: access_token.into(),
            access_secret: access_secret.into(),
        }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn validate(&self) -> Result<(), SignError> {
        let fields = [
            ("consumer_key", &self.consumer_key),
            ("consumer_secret", &self.consumer_secret),
            ("access_token", &self.access_token),
            ("access_secret", &self.access_secret),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(SignError::MissingField(name));
            }
        }
        Ok(())
    }

    fn signing_key(&self) -> String {
        format!(
            "{}&{}",
            encode(&self.consumer_secret),
            encode(&self.access_secret)
        )
    }
}

impl fmt::Debug for DelegatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedCredential")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &self.access_token)
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

/// Per-request replay protection. A fresh one must back every signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce {
    pub value: String,
    pub timestamp: i64,
}

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let value = URL_SAFE_NO_PAD
            .encode(bytes)
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        Self {
            value,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Computes an `Authorization` value for `target` with a freshly generated
/// nonce and timestamp.
pub fn sign(
    method: &Method,
    target: &str,
    body: Option<&[(String, String)]>,
    credential: &DelegatedCredential,
    realm: Option<&str>,
) -> Result<String, SignError> {
    sign_with(method, target, body, credential, realm, &Nonce::generate())
}

/// Deterministic variant of [`sign`]: identical inputs and nonce yield an
/// identical value.
pub fn sign_with(
    method: &Method,
    target: &str,
    body: Option<&[(String, String)]>,
    credential: &DelegatedCredential,
    realm: Option<&str>,
    nonce: &Nonce,
) -> Result<String, SignError> {
    credential.validate()?;
    let method = normalize_method(method)?;
    let url = parse_target(target)?;

    let timestamp = nonce.timestamp.to_string();
    let mut oauth_params = vec![
        ("oauth_consumer_key", credential.consumer_key.as_str()),
        ("oauth_nonce", nonce.value.as_str()),
        ("oauth_signature_method", SIGNATURE_METHOD),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_token", credential.access_token.as_str()),
        ("oauth_version", OAUTH_VERSION),
    ];

    let mut params: Vec<(String, String)> = oauth_params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    params.extend(url.query_pairs().map(|(k, v)| (encode(&k), encode(&v))));
    if let Some(body) = body {
        params.extend(body.iter().map(|(k, v)| (encode(k), encode(v))));
    }
    params.sort();

    let normalized = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let base_string = format!(
        "{}&{}&{}",
        method,
        encode(&base_uri(&url)),
        encode(&normalized)
    );

    let mut mac = HmacSha1::new_from_slice(credential.signing_key().as_bytes())
        .map_err(|err| SignError::Key(err.to_string()))?;
    mac.update(base_string.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    oauth_params.push(("oauth_signature", signature.as_str()));
    oauth_params.sort();

    let mut parts = Vec::with_capacity(oauth_params.len() + 1);
    if let Some(realm) = realm {
        parts.push(format!("realm=\"{}\"", encode(realm)));
    }
    parts.extend(
        oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v))),
    );
    Ok(format!("OAuth {}", parts.join(", ")))
}

pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}

fn normalize_method(method: &Method) -> Result<&'static str, SignError> {
    match method.as_str() {
        "GET" => Ok("GET"),
        "POST" => Ok("POST"),
        "PUT" => Ok("PUT"),
        "DELETE" => Ok("DELETE"),
        "PATCH" => Ok("PATCH"),
        "HEAD" => Ok("HEAD"),
        other => Err(SignError::UnsupportedMethod(other.to_string())),
    }
}

fn parse_target(target: &str) -> Result<Url, SignError> {
    let url = Url::parse(target).map_err(|_| SignError::RelativeUri(target.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(SignError::RelativeUri(target.to_string()));
    }
    Ok(url)
}

/// Scheme, host, non-default port and path; no query or fragment.
fn base_uri(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}
