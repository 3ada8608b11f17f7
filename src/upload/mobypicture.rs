use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart::Form;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{compose_text, validate_items, UploadBackend, UploadError, UploadLimits};
use crate::api::{PlatformConfig, PostResult, PrimaryApi};
use crate::echo::{AuthForwarder, HttpPipeline, Pipeline, VERIFY_CREDENTIALS_URL};
use crate::media::{self, MediaItem};
use crate::oauth::DelegatedCredential;

pub const UPLOAD_ENDPOINT: &str = "https://api.mobypicture.com/2.0/upload.json";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "gif", "png", "tif", "tiff", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["avi", "wmv", "flv", "m4v", "mp4", "mov", "3gp", "3g2"];

const MAX_IMAGE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_VIDEO_SIZE: u64 = 15 * 1024 * 1024;

/// Photo and video host that identifies the user through delegated
/// credentials rather than an account of its own.
pub struct Mobypicture {
    api: Arc<dyn PrimaryApi>,
    http: HttpClient,
    endpoint: String,
    verify_url: String,
    api_key: String,
    credential: DelegatedCredential,
    platform: RwLock<PlatformConfig>,
}

impl Mobypicture {
    pub fn new(
        api: Arc<dyn PrimaryApi>,
        http: HttpClient,
        api_key: impl Into<String>,
        credential: DelegatedCredential,
    ) -> Self {
        Self {
            api,
            http,
            endpoint: UPLOAD_ENDPOINT.to_string(),
            verify_url: VERIFY_CREDENTIALS_URL.to_string(),
            api_key: api_key.into(),
            credential,
            platform: RwLock::new(PlatformConfig::default()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn upload_file(&self, item: &dyn MediaItem, message: &str) -> Result<String, UploadError> {
        let mut form = Form::new()
            .text("key", self.api_key.clone())
            .text("message", message.to_string());
        if let Some(alt) = item.alt_text() {
            form = form.text("description", alt.to_string());
        }
        let form = form.part("media", media::multipart_part(item).await?);

        // A fresh signature per upload keeps the echo value single-use.
        let forwarder = AuthForwarder::for_credential(
            HttpPipeline::new(self.http.clone()),
            &self.verify_url,
            &self.credential,
            None,
        )?;
        let request = self.http.post(&self.endpoint).multipart(form).build()?;
        let resp = forwarder.send(request).await?;

        let status = resp.status();
        let body = resp.text().await?;
        let envelope: Envelope = serde_json::from_str(&body).map_err(|err| {
            if status.is_success() {
                UploadError::Provider(format!("malformed response: {}", err))
            } else {
                UploadError::Provider(format!("HTTP {}", status.as_u16()))
            }
        })?;

        match envelope.media.and_then(|m| m.mediaurl) {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => {
                let message = envelope
                    .result
                    .map(|r| r.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
                warn!(%message, "mobypicture rejected upload");
                Err(UploadError::Provider(message))
            }
        }
    }
}

#[async_trait]
impl UploadBackend for Mobypicture {
    fn name(&self) -> &'static str {
        "mobypicture"
    }

    fn limits(&self) -> UploadLimits {
        let mut limits = UploadLimits::new(1, IMAGE_EXTENSIONS.iter().chain(VIDEO_EXTENSIONS))
            .with_max_size(IMAGE_EXTENSIONS, MAX_IMAGE_SIZE)
            .with_max_size(VIDEO_EXTENSIONS, MAX_VIDEO_SIZE);
        limits.supports_alt_text = true;
        limits
    }

    fn reserved_text_length(&self, _media_count: usize) -> usize {
        self.platform.read().short_url_length + 1
    }

    fn update_configuration(&self, config: &PlatformConfig) {
        *self.platform.write() = *config;
    }

    #[instrument(skip(self, text, items), fields(backend = "mobypicture", items = items.len()))]
    async fn upload(
        &self,
        text: &str,
        in_reply_to: Option<u64>,
        items: &[&dyn MediaItem],
    ) -> Result<PostResult, UploadError> {
        validate_items(self, items)?;

        let url = self.upload_file(items[0], text).await?;
        debug!(%url, "mobypicture upload complete");

        let composed = compose_text(text, &url);
        Ok(self.api.create_post(&composed, in_reply_to).await?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    media: Option<MediaInfo>,
    #[serde(default)]
    result: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    mediaurl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    message: String,
}
