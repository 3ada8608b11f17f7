//! Interchangeable media upload destinations.
//!
//! A backend uploads the attachments to its own host, appends the resulting
//! URL to the post text and creates the post through the primary service.

mod dispatcher;
mod imgur;
mod mobypicture;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

pub use dispatcher::UploadDispatcher;
pub use imgur::Imgur;
pub use mobypicture::Mobypicture;

use crate::api::{ApiError, PlatformConfig, PostResult};
use crate::echo::ForwardError;
use crate::media::{normalize_extension, MediaItem};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("expected between 1 and {max} media items, got {count}")]
    ItemCount { count: usize, max: usize },
    #[error("media not found: {0}")]
    MediaNotFound(String),
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
    #[error("{name} is {size} bytes, over the limit for .{extension}")]
    FileTooLarge {
        name: String,
        extension: String,
        size: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("upload failed: {0}")]
    Provider(String),
    #[error("upload timed out")]
    Timeout,
    #[error("no upload backend selected")]
    NoBackend,
    #[error("unknown upload backend: {0}")]
    UnknownBackend(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout
        } else {
            UploadError::Provider(err.to_string())
        }
    }
}

impl From<ForwardError> for UploadError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Http(err) => err.into(),
            other => UploadError::Provider(other.to_string()),
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Provider(err.to_string())
    }
}

/// Static capabilities of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_item_count: usize,
    /// Keys are lowercase extensions without the dot.
    pub max_file_size_by_extension: HashMap<String, u64>,
    /// Applies to extensions missing from the map. `None` means unlimited.
    pub default_max_file_size: Option<u64>,
    pub supported_extensions: BTreeSet<String>,
    pub supports_alt_text: bool,
}

impl UploadLimits {
    pub fn new<I, S>(max_item_count: usize, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_item_count,
            max_file_size_by_extension: HashMap::new(),
            default_max_file_size: None,
            supported_extensions: extensions
                .into_iter()
                .map(|ext| normalize_extension(ext.as_ref()))
                .collect(),
            supports_alt_text: false,
        }
    }

    pub fn with_default_max_size(mut self, bytes: u64) -> Self {
        self.default_max_file_size = Some(bytes);
        self
    }

    pub fn with_max_size<I, S>(mut self, extensions: I, bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for ext in extensions {
            self.max_file_size_by_extension
                .insert(normalize_extension(ext.as_ref()), bytes);
        }
        self
    }

    pub fn check_extension(&self, extension: &str) -> bool {
        self.supported_extensions
            .contains(&normalize_extension(extension))
    }

    pub fn max_file_size(&self, extension: &str) -> Option<u64> {
        self.max_file_size_by_extension
            .get(&normalize_extension(extension))
            .copied()
            .or(self.default_max_file_size)
    }

    pub fn check_size(&self, extension: &str, bytes: u64) -> bool {
        self.max_file_size(extension)
            .map_or(true, |limit| bytes <= limit)
    }

    /// `*.jpg;*.png;...` for a file picker.
    pub fn file_filter(&self) -> String {
        self.supported_extensions
            .iter()
            .map(|ext| format!("*.{};", ext))
            .collect()
    }
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn limits(&self) -> UploadLimits;

    fn max_item_count(&self) -> usize {
        self.limits().max_item_count
    }

    fn check_extension(&self, extension: &str) -> bool {
        self.limits().check_extension(extension)
    }

    fn check_size(&self, extension: &str, bytes: u64) -> bool {
        self.limits().check_size(extension, bytes)
    }

    fn supports_alt_text(&self) -> bool {
        self.limits().supports_alt_text
    }

    /// Characters the post text must leave free for the inserted result.
    fn reserved_text_length(&self, media_count: usize) -> usize;

    fn update_configuration(&self, _config: &PlatformConfig) {}

    /// Uploads `items` and posts `text` with the resulting URL appended.
    /// Each call performs exactly one upload and one post.
    async fn upload(
        &self,
        text: &str,
        in_reply_to: Option<u64>,
        items: &[&dyn MediaItem],
    ) -> Result<PostResult, UploadError>;
}

/// Checks `items` against the backend's limits, count first.
pub fn validate_items(
    backend: &dyn UploadBackend,
    items: &[&dyn MediaItem],
) -> Result<(), ValidationError> {
    let max = backend.max_item_count();
    if items.is_empty() || items.len() > max {
        return Err(ValidationError::ItemCount {
            count: items.len(),
            max,
        });
    }
    for item in items {
        if !item.exists() {
            return Err(ValidationError::MediaNotFound(item.name().to_string()));
        }
        let extension = item.extension();
        if !backend.check_extension(&extension) {
            return Err(ValidationError::UnsupportedExtension(extension));
        }
        let size = item
            .size()
            .map_err(|_| ValidationError::MediaNotFound(item.name().to_string()))?;
        if !backend.check_size(&extension, size) {
            return Err(ValidationError::FileTooLarge {
                name: item.name().to_string(),
                extension,
                size,
            });
        }
    }
    Ok(())
}

/// Appends the uploaded resource URL to the caller's text.
pub fn compose_text(text: &str, resource_url: &str) -> String {
    let url = resource_url.trim();
    if text.is_empty() {
        url.to_string()
    } else {
        format!("{} {}", text, url)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::api::*;
    use crate::media::MediaItem;

    /// Records posts and answers everything else with an error.
    #[derive(Default)]
    pub struct RecordingApi {
        pub posts: Arc<Mutex<Vec<(String, Option<u64>)>>>,
    }

    #[async_trait]
    impl PrimaryApi for RecordingApi {
        async fn create_post(
            &self,
            text: &str,
            in_reply_to: Option<u64>,
        ) -> Result<PostResult, ApiError> {
            self.posts.lock().push((text.to_string(), in_reply_to));
            Ok(PostResult {
                id: 1,
                text: text.to_string(),
            })
        }

        async fn fetch_relationship(&self, _: &str, _: &str) -> Result<Relationship, ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn show_user(&self, _: &str) -> Result<UserProfile, ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn update_profile(&self, _: &ProfileEdit) -> Result<UserProfile, ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn update_profile_image(&self, _: &dyn MediaItem) -> Result<UserProfile, ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn follow(&self, _: &str) -> Result<(), ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn unfollow(&self, _: &str) -> Result<(), ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn block(&self, _: &str) -> Result<(), ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn unblock(&self, _: &str) -> Result<(), ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn report_spam(&self, _: &str) -> Result<(), ApiError> {
            Err(ApiError::Network("unused".into()))
        }

        async fn configuration(&self) -> Result<PlatformConfig, ApiError> {
            Ok(PlatformConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMediaItem;

    struct Fixed;

    #[async_trait]
    impl UploadBackend for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn limits(&self) -> UploadLimits {
            UploadLimits::new(2, ["jpg", ".PNG", "mp4"])
                .with_default_max_size(10)
                .with_max_size(["mp4"], 100)
        }

        fn reserved_text_length(&self, _media_count: usize) -> usize {
            0
        }

        async fn upload(
            &self,
            _text: &str,
            _in_reply_to: Option<u64>,
            _items: &[&dyn MediaItem],
        ) -> Result<PostResult, UploadError> {
            Err(UploadError::Timeout)
        }
    }

    #[test]
    fn extension_check_ignores_case_and_dot() {
        assert!(Fixed.check_extension("JPG"));
        assert!(Fixed.check_extension(".png"));
        assert!(!Fixed.check_extension("gif"));
    }

    #[test]
    fn size_check_uses_per_extension_then_default() {
        assert!(Fixed.check_size("mp4", 100));
        assert!(!Fixed.check_size("MP4", 101));
        assert!(Fixed.check_size("jpg", 10));
        assert!(!Fixed.check_size("jpg", 11));
        let unlimited = UploadLimits::new(1, ["png"]);
        assert!(unlimited.check_size("png", u64::MAX));
    }

    #[test]
    fn validation_error_kinds_are_distinct() {
        let ok = MemoryMediaItem::new("a.jpg", vec![0; 5]);
        let big = MemoryMediaItem::new("b.jpg", vec![0; 11]);
        let gif = MemoryMediaItem::new("c.gif", vec![0; 1]);

        let three: [&dyn MediaItem; 3] = [&ok, &ok, &ok];
        let unsupported: [&dyn MediaItem; 1] = [&gif];
        let oversized: [&dyn MediaItem; 2] = [&ok, &big];
        let single: [&dyn MediaItem; 1] = [&ok];

        assert_eq!(
            validate_items(&Fixed, &[]),
            Err(ValidationError::ItemCount { count: 0, max: 2 })
        );
        assert_eq!(
            validate_items(&Fixed, &three),
            Err(ValidationError::ItemCount { count: 3, max: 2 })
        );
        assert!(matches!(
            validate_items(&Fixed, &unsupported),
            Err(ValidationError::UnsupportedExtension(ext)) if ext == "gif"
        ));
        assert!(matches!(
            validate_items(&Fixed, &oversized),
            Err(ValidationError::FileTooLarge { size: 11, .. })
        ));
        assert_eq!(validate_items(&Fixed, &single), Ok(()));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let gone = crate::media::FileMediaItem::new(dir.path().join("gone.jpg"));
        let items: [&dyn MediaItem; 1] = [&gone];
        assert!(matches!(
            validate_items(&Fixed, &items),
            Err(ValidationError::MediaNotFound(name)) if name == "gone.jpg"
        ));
    }

    #[test]
    fn compose_trims_url() {
        assert_eq!(compose_text("look", " https://i.example/x.png\n"), "look https://i.example/x.png");
        assert_eq!(compose_text("", "https://i.example/x.png"), "https://i.example/x.png");
    }

    #[test]
    fn file_filter_lists_extensions() {
        assert_eq!(Fixed.limits().file_filter(), "*.jpg;*.mp4;*.png;");
    }
}
