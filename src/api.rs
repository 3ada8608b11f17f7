use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::multipart::Form;
use reqwest::{Client as HttpClient, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::media::{self, MediaItem};
use crate::oauth::{self, DelegatedCredential, SignError};

pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com/1.1/";

const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Error raised by the primary service. `Display` is the human-readable
/// message shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Remote { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// The authenticated account the client acts as.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionIdentity {
    pub user_id: u64,
    pub screen_name: String,
}

impl SessionIdentity {
    pub fn is(&self, user: &UserProfile) -> bool {
        self.user_id == user.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    #[serde(default)]
    pub id_str: String,
    pub screen_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub friends_count: u64,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub favourites_count: u64,
    #[serde(default)]
    pub statuses_count: u64,
    #[serde(default)]
    pub profile_image_url_https: Option<String>,
    #[serde(default)]
    pub entities: UserEntities,
    #[serde(default)]
    pub status: Option<RecentStatus>,
}

impl UserProfile {
    pub fn created(&self) -> Option<DateTime<FixedOffset>> {
        parse_created_at(&self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserEntities {
    #[serde(default)]
    pub url: Option<EntityGroup>,
    #[serde(default)]
    pub description: EntityGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityGroup {
    #[serde(default)]
    pub urls: Vec<UrlEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlEntity {
    pub url: String,
    #[serde(default)]
    pub expanded_url: Option<String>,
    #[serde(default)]
    pub display_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentStatus {
    pub id: u64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, alias = "text")]
    pub full_text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub entities: EntityGroup,
}

impl RecentStatus {
    pub fn created(&self) -> Option<DateTime<FixedOffset>> {
        parse_created_at(&self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relationship {
    pub following: bool,
    pub followed_by: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostResult {
    pub id: u64,
    #[serde(default, alias = "full_text")]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileEdit {
    pub name: String,
    pub url: String,
    pub location: String,
    pub description: String,
}

/// Limits the platform advertises and may change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_short_url_length")]
    pub short_url_length: usize,
    #[serde(default = "default_short_url_length")]
    pub short_url_length_https: usize,
    #[serde(default = "default_photo_size_limit")]
    pub photo_size_limit: u64,
    #[serde(default = "default_max_media_per_upload")]
    pub max_media_per_upload: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            short_url_length: default_short_url_length(),
            short_url_length_https: default_short_url_length(),
            photo_size_limit: default_photo_size_limit(),
            max_media_per_upload: default_max_media_per_upload(),
        }
    }
}

fn default_short_url_length() -> usize {
    23
}

fn default_photo_size_limit() -> u64 {
    5 * 1024 * 1024
}

fn default_max_media_per_upload() -> usize {
    4
}

/// The primary service operations this crate consumes.
#[async_trait]
pub trait PrimaryApi: Send + Sync {
    async fn create_post(&self, text: &str, in_reply_to: Option<u64>)
        -> Result<PostResult, ApiError>;
    async fn fetch_relationship(&self, source: &str, target: &str)
        -> Result<Relationship, ApiError>;
    async fn show_user(&self, screen_name: &str) -> Result<UserProfile, ApiError>;
    async fn update_profile(&self, edit: &ProfileEdit) -> Result<UserProfile, ApiError>;
    async fn update_profile_image(&self, item: &dyn MediaItem) -> Result<UserProfile, ApiError>;
    async fn follow(&self, screen_name: &str) -> Result<(), ApiError>;
    async fn unfollow(&self, screen_name: &str) -> Result<(), ApiError>;
    async fn block(&self, screen_name: &str) -> Result<(), ApiError>;
    async fn unblock(&self, screen_name: &str) -> Result<(), ApiError>;
    /// Reports the account as spam, which also blocks it.
    async fn report_spam(&self, screen_name: &str) -> Result<(), ApiError>;
    async fn configuration(&self) -> Result<PlatformConfig, ApiError>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    credential: DelegatedCredential,
}

impl Client {
    pub fn new(credential: DelegatedCredential, config: ClientConfig) -> Result<Self, ApiError> {
        credential.validate()?;
        if config.user_agent.trim().is_empty() {
            return Err(ApiError::Decode("user agent required".into()));
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base).map_err(|err| ApiError::Decode(err.to_string()))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            credential,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, ApiError> {
        let mut url = self.endpoint(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        let authorization = oauth::sign(&Method::GET, url.as_str(), None, &self.credential, None)?;
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, authorization)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: Vec<(String, String)>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let authorization =
            oauth::sign(&Method::POST, url.as_str(), Some(&form), &self.credential, None)?;
        let resp = self
            .http
            .post(url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, authorization)
            .form(&form)
            .send()
            .await?;
        decode(resp).await
    }

    /// POSTs `screen_name` to a per-user endpoint, ignoring the response body.
    #[instrument(skip(self))]
    async fn user_action(&self, path: &str, screen_name: &str) -> Result<(), ApiError> {
        let form = vec![("screen_name".to_string(), screen_name.to_string())];
        let _: serde_json::Value = self.post_form(path, form).await?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[async_trait]
impl PrimaryApi for Client {
    #[instrument(skip(self, text), fields(len = text.chars().count()))]
    async fn create_post(
        &self,
        text: &str,
        in_reply_to: Option<u64>,
    ) -> Result<PostResult, ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::Decode("post text is required".into()));
        }
        let mut form = vec![("status".to_string(), text.to_string())];
        if let Some(id) = in_reply_to {
            form.push(("in_reply_to_status_id".into(), id.to_string()));
        }
        self.post_form("statuses/update.json", form).await
    }

    async fn fetch_relationship(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Relationship, ApiError> {
        let params = vec![
            ("source_screen_name".to_string(), source.to_string()),
            ("target_screen_name".to_string(), target.to_string()),
        ];
        let payload: FriendshipEnvelope = self.get("friendships/show.json", &params).await?;
        let source = payload.relationship.source;
        Ok(Relationship {
            following: source.following,
            followed_by: source.followed_by,
        })
    }

    async fn show_user(&self, screen_name: &str) -> Result<UserProfile, ApiError> {
        let params = vec![
            ("screen_name".to_string(), screen_name.to_string()),
            ("include_entities".to_string(), "true".to_string()),
        ];
        self.get("users/show.json", &params).await
    }

    async fn update_profile(&self, edit: &ProfileEdit) -> Result<UserProfile, ApiError> {
        let form = vec![
            ("name".to_string(), edit.name.clone()),
            ("url".to_string(), edit.url.clone()),
            ("location".to_string(), edit.location.clone()),
            ("description".to_string(), edit.description.clone()),
            ("include_entities".to_string(), "true".to_string()),
        ];
        self.post_form("account/update_profile.json", form).await
    }

    #[instrument(skip(self, item), fields(name = item.name()))]
    async fn update_profile_image(&self, item: &dyn MediaItem) -> Result<UserProfile, ApiError> {
        let url = self.endpoint("account/update_profile_image.json")?;
        // Multipart fields are not part of the signature base string.
        let authorization = oauth::sign(&Method::POST, url.as_str(), None, &self.credential, None)?;
        let form = Form::new().part("image", media::multipart_part(item).await?);
        let resp = self
            .http
            .post(url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, authorization)
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }

    async fn follow(&self, screen_name: &str) -> Result<(), ApiError> {
        self.user_action("friendships/create.json", screen_name).await
    }

    async fn unfollow(&self, screen_name: &str) -> Result<(), ApiError> {
        self.user_action("friendships/destroy.json", screen_name).await
    }

    async fn block(&self, screen_name: &str) -> Result<(), ApiError> {
        self.user_action("blocks/create.json", screen_name).await
    }

    async fn unblock(&self, screen_name: &str) -> Result<(), ApiError> {
        self.user_action("blocks/destroy.json", screen_name).await
    }

    async fn report_spam(&self, screen_name: &str) -> Result<(), ApiError> {
        self.user_action("users/report_spam.json", screen_name).await
    }

    async fn configuration(&self) -> Result<PlatformConfig, ApiError> {
        self.get("help/configuration.json", &[]).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        debug!(status = status.as_u16(), "primary api request failed");
        return Err(remote_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
}

fn remote_error(status: u16, body: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.errors.into_iter().next())
        .map(|err| err.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| match status {
            401 => "unauthorized".to_string(),
            403 => "forbidden".to_string(),
            429 => "rate limited".to_string(),
            _ => format!("api error {}", status),
        });
    ApiError::Remote { status, message }
}

pub fn parse_created_at(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, CREATED_AT_FORMAT).ok()
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct FriendshipEnvelope {
    relationship: FriendshipRelationship,
}

#[derive(Debug, Deserialize)]
struct FriendshipRelationship {
    source: FriendshipSource,
}

#[derive(Debug, Deserialize)]
struct FriendshipSource {
    #[serde(default)]
    following: bool,
    #[serde(default)]
    followed_by: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;

    fn client(base: &str) -> Client {
        Client::new(
            DelegatedCredential::new("ck", "cs", "at", "as"),
            ClientConfig {
                user_agent: "perch-test/0.1".into(),
                base_url: Some(format!("{}/1.1/", base)),
                ..ClientConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_post_signs_and_sends_form() {
        let server = MockServer::start().await;
        let api = client(&server.base_url);
        let handle = tokio::spawn(async move {
            server
                .respond_once(200, r#"{"id": 42, "text": "hello there"}"#)
                .await
        });

        let result = api.create_post("hello there", Some(7)).await.unwrap();
        assert_eq!(result.id, 42);
        assert_eq!(result.text, "hello there");

        let raw = String::from_utf8_lossy(&handle.await.unwrap()).to_string();
        assert!(raw.starts_with("POST /1.1/statuses/update.json "));
        assert!(raw.contains("status=hello+there"));
        assert!(raw.contains("in_reply_to_status_id=7"));
        assert!(raw.to_lowercase().contains("authorization: oauth "));
    }

    #[tokio::test]
    async fn remote_errors_carry_message() {
        let server = MockServer::start().await;
        let api = client(&server.base_url);
        let handle = tokio::spawn(async move {
            server
                .respond_once(403, r#"{"errors":[{"code":187,"message":"Status is a duplicate."}]}"#)
                .await
        });

        let err = api.create_post("again", None).await.unwrap_err();
        handle.await.unwrap();
        assert!(matches!(err, ApiError::Remote { status: 403, .. }));
        assert_eq!(err.to_string(), "Status is a duplicate.");
    }

    #[tokio::test]
    async fn relationship_reads_source_flags() {
        let server = MockServer::start().await;
        let api = client(&server.base_url);
        let body = r#"{"relationship":{"source":{"following":true,"followed_by":false},"target":{}}}"#;
        let handle = tokio::spawn(async move { server.respond_once(200, body).await });

        let rel = api.fetch_relationship("me", "them").await.unwrap();
        let raw = String::from_utf8_lossy(&handle.await.unwrap()).to_string();
        assert!(raw.contains("source_screen_name=me"));
        assert_eq!(
            rel,
            Relationship {
                following: true,
                followed_by: false
            }
        );
    }

    #[tokio::test]
    async fn user_actions_post_screen_name() {
        let server = MockServer::start().await;
        let api = client(&server.base_url);
        let responses = vec![
            (200, r#"{"id": 2}"#.to_string()),
            (200, r#"{"id": 2}"#.to_string()),
            (200, r#"{"id": 2}"#.to_string()),
        ];
        let handle = tokio::spawn(async move { server.respond_many(responses).await });

        api.block("spammer").await.unwrap();
        api.unblock("spammer").await.unwrap();
        api.report_spam("spammer").await.unwrap();

        let requests: Vec<String> = handle
            .await
            .unwrap()
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).to_string())
            .collect();
        assert!(requests[0].starts_with("POST /1.1/blocks/create.json "));
        assert!(requests[1].starts_with("POST /1.1/blocks/destroy.json "));
        assert!(requests[2].starts_with("POST /1.1/users/report_spam.json "));
        for request in &requests {
            assert!(request.contains("screen_name=spammer"));
            assert!(request.to_lowercase().contains("authorization: oauth "));
        }
    }

    #[tokio::test]
    async fn configuration_falls_back_to_defaults() {
        let server = MockServer::start().await;
        let api = client(&server.base_url);
        let handle =
            tokio::spawn(async move { server.respond_once(200, r#"{"short_url_length": 24}"#).await });

        let cfg = api.configuration().await.unwrap();
        handle.await.unwrap();
        assert_eq!(cfg.short_url_length, 24);
        assert_eq!(cfg.max_media_per_upload, 4);
    }

    #[test]
    fn user_profile_decodes_minimal_payload() {
        let user: UserProfile = serde_json::from_str(
            r#"{"id": 1, "screen_name": "perch", "created_at": "Wed Oct 10 20:19:24 +0000 2018",
                "entities": {"description": {"urls": []}},
                "status": {"id": 9, "text": "hi", "source": "web"}}"#,
        )
        .unwrap();
        assert_eq!(user.screen_name, "perch");
        assert_eq!(user.status.as_ref().map(|s| s.full_text.as_str()), Some("hi"));
        assert_eq!(user.created().map(|d| d.timestamp()), Some(1539202764));
    }

    #[test]
    fn rejects_incomplete_credential() {
        let result = Client::new(
            DelegatedCredential::new("ck", "", "at", "as"),
            ClientConfig {
                user_agent: "ua".into(),
                ..ClientConfig::default()
            },
        );
        assert!(matches!(result, Err(ApiError::Sign(_))));
    }
}
