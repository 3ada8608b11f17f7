use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::LOCATION;
use reqwest::{redirect, Client as HttpClient};
use tracing::{debug, warn};
use url::Url;

const DEFAULT_SHORTENERS: &[&str] = &[
    "t.co",
    "bit.ly",
    "j.mp",
    "goo.gl",
    "tinyurl.com",
    "ow.ly",
    "is.gd",
    "buff.ly",
    "dlvr.it",
    "htn.to",
    "ift.tt",
    "amzn.to",
];

#[async_trait]
pub trait UrlExpander: Send + Sync {
    /// Resolves `url` to its final destination, or returns it unchanged.
    async fn expand(&self, url: &str) -> String;
}

/// Follows redirects of well-known shortener hosts and remembers results.
pub struct ShortUrlExpander {
    http: HttpClient,
    hosts: HashSet<String>,
    cache: Mutex<HashMap<String, String>>,
}

impl ShortUrlExpander {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            hosts: DEFAULT_SHORTENERS.iter().map(|h| h.to_string()).collect(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    fn is_shortened(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.hosts.contains(&host.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Issues a single HEAD request and returns the redirect target, if any.
    async fn resolve(&self, url: &Url) -> Option<Url> {
        let resp = match self.http.head(url.clone()).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%url, error = %err, "short url expansion failed");
                return None;
            }
        };
        if !resp.status().is_redirection() {
            return None;
        }
        resp.headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| url.join(location).ok())
    }
}

#[async_trait]
impl UrlExpander for ShortUrlExpander {
    async fn expand(&self, url: &str) -> String {
        let Ok(parsed) = Url::parse(url) else {
            return url.to_string();
        };
        if !self.is_shortened(&parsed) {
            return url.to_string();
        }
        if let Some(hit) = self.cache.lock().get(url) {
            return hit.clone();
        }

        let Some(target) = self.resolve(&parsed).await else {
            return url.to_string();
        };
        let expanded = target.to_string();
        debug!(from = url, to = %expanded, "expanded short url");
        self.cache
            .lock()
            .insert(url.to_string(), expanded.clone());
        expanded
    }
}
