use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::Form;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{compose_text, validate_items, UploadBackend, UploadError, UploadLimits};
use crate::api::{PlatformConfig, PostResult, PrimaryApi};
use crate::media::{self, MediaItem};

pub const UPLOAD_ENDPOINT: &str = "https://api.imgur.com/3/image";

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "gif", "png", "tif", "tiff", "bmp", "pdf", "xcf",
];

/// Anonymous image hosting identified by a static client id.
pub struct Imgur {
    api: Arc<dyn PrimaryApi>,
    http: HttpClient,
    endpoint: String,
    client_id: String,
    platform: RwLock<PlatformConfig>,
}

impl Imgur {
    pub fn new(api: Arc<dyn PrimaryApi>, http: HttpClient, client_id: impl Into<String>) -> Self {
        Self {
            api,
            http,
            endpoint: UPLOAD_ENDPOINT.to_string(),
            client_id: client_id.into(),
            platform: RwLock::new(PlatformConfig::default()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn upload_file(&self, item: &dyn MediaItem, title: &str) -> Result<String, UploadError> {
        let form = Form::new()
            .part("image", media::multipart_part(item).await?)
            .text("title", title.to_string());

        let resp = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Client-ID {}", self.client_id))
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(UploadError::Provider(format!("HTTP {}", status.as_u16())));
            }
            Err(err) => {
                return Err(UploadError::Provider(format!("malformed response: {}", err)));
            }
        };

        if !envelope.success {
            let message = envelope
                .data
                .error
                .as_ref()
                .map(error_message)
                .unwrap_or_else(|| format!("status {}", envelope.status));
            warn!(status = envelope.status, %message, "imgur rejected upload");
            return Err(UploadError::Provider(message));
        }

        envelope
            .data
            .link
            .filter(|link| !link.trim().is_empty())
            .ok_or_else(|| UploadError::Provider("response missing link".into()))
    }
}

#[async_trait]
impl UploadBackend for Imgur {
    fn name(&self) -> &'static str {
        "imgur"
    }

    fn limits(&self) -> UploadLimits {
        UploadLimits::new(1, SUPPORTED_EXTENSIONS).with_default_max_size(MAX_FILE_SIZE)
    }

    fn reserved_text_length(&self, _media_count: usize) -> usize {
        // The link plus the separating space.
        self.platform.read().short_url_length + 1
    }

    fn update_configuration(&self, config: &PlatformConfig) {
        *self.platform.write() = *config;
    }

    #[instrument(skip(self, text, items), fields(backend = "imgur", items = items.len()))]
    async fn upload(
        &self,
        text: &str,
        in_reply_to: Option<u64>,
        items: &[&dyn MediaItem],
    ) -> Result<PostResult, UploadError> {
        validate_items(self, items)?;
        let item = items[0];

        let link = self.upload_file(item, text).await?;
        debug!(%link, "imgur upload complete");

        let composed = compose_text(text, &link);
        Ok(self.api.create_post(&composed, in_reply_to).await?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: EnvelopeData,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: u16,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

/// Imgur reports errors either as a plain string or as `{"message": ..}`.
fn error_message(value: &Value) -> String {
    match value {
        Value::String(message) => message.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
