//! Delegated authentication for third-party services.
//!
//! A partner service cannot see the session secret, so every request routed
//! through [`AuthForwarder`] carries a pre-signed request for the primary
//! service's verify-identity endpoint instead. The partner replays it to
//! confirm who the caller is.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, Request, Response};
use tracing::debug;
use url::Url;

use crate::oauth::{self, DelegatedCredential, SignError};

pub const AUTH_SERVICE_PROVIDER: HeaderName = HeaderName::from_static("x-auth-service-provider");
pub const VERIFY_CREDENTIALS_AUTHORIZATION: HeaderName =
    HeaderName::from_static("x-verify-credentials-authorization");

/// Verify-identity endpoint of the primary service.
pub const VERIFY_CREDENTIALS_URL: &str =
    "https://api.twitter.com/1.1/account/verify_credentials.json";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("header {0} already present on request")]
    HeaderExists(HeaderName),
    #[error("invalid provider uri: {0}")]
    InvalidProvider(String),
    #[error("invalid header value for {0}")]
    InvalidHeaderValue(HeaderName),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One stage of the outbound request pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, ForwardError>;
}

/// Terminal stage: hands the request to a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpPipeline {
    client: Client,
}

impl HttpPipeline {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Pipeline for HttpPipeline {
    async fn send(&self, request: Request) -> Result<Response, ForwardError> {
        Ok(self.client.execute(request).await?)
    }
}

pub struct AuthForwarder<P = HttpPipeline> {
    inner: P,
    provider: Url,
    provider_value: HeaderValue,
    authorization: HeaderValue,
}

impl<P: Pipeline> AuthForwarder<P> {
    pub fn new(inner: P, provider_uri: &str, authorization: &str) -> Result<Self, ForwardError> {
        let provider = Url::parse(provider_uri)
            .map_err(|_| ForwardError::InvalidProvider(provider_uri.to_string()))?;
        let provider_value = HeaderValue::from_str(provider.as_str())
            .map_err(|_| ForwardError::InvalidHeaderValue(AUTH_SERVICE_PROVIDER))?;
        let mut authorization = HeaderValue::from_str(authorization)
            .map_err(|_| ForwardError::InvalidHeaderValue(VERIFY_CREDENTIALS_AUTHORIZATION))?;
        authorization.set_sensitive(true);
        Ok(Self {
            inner,
            provider,
            provider_value,
            authorization,
        })
    }

    /// Signs a GET against `provider_uri` once and binds the result to the
    /// forwarder.
    pub fn for_credential(
        inner: P,
        provider_uri: &str,
        credential: &DelegatedCredential,
        realm: Option<&str>,
    ) -> Result<Self, ForwardError> {
        let authorization = oauth::sign(&Method::GET, provider_uri, None, credential, realm)?;
        Self::new(inner, provider_uri, &authorization)
    }

    pub fn provider(&self) -> &Url {
        &self.provider
    }

    /// The header pair attached to every forwarded request.
    pub fn headers(&self) -> [(HeaderName, &HeaderValue); 2] {
        [
            (AUTH_SERVICE_PROVIDER, &self.provider_value),
            (VERIFY_CREDENTIALS_AUTHORIZATION, &self.authorization),
        ]
    }
}

#[async_trait]
impl<P: Pipeline> Pipeline for AuthForwarder<P> {
    async fn send(&self, mut request: Request) -> Result<Response, ForwardError> {
        let pair = self.headers();
        let headers = request.headers_mut();
        if let Some((name, _)) = pair.iter().find(|(name, _)| headers.contains_key(name)) {
            return Err(ForwardError::HeaderExists(name.clone()));
        }
        for (name, value) in pair {
            headers.insert(name, value.clone());
        }
        debug!(provider = %self.provider, url = %request.url(), "forwarding delegated request");
        self.inner.send(request).await
    }
}
