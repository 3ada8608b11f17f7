use std::sync::Arc;

use tracing::info;

use super::{UploadBackend, UploadError};
use crate::api::{PlatformConfig, PostResult};
use crate::media::MediaItem;

/// Registered backends plus the one the configuration currently selects.
#[derive(Default)]
pub struct UploadDispatcher {
    backends: Vec<Arc<dyn UploadBackend>>,
    selected: Option<usize>,
}

impl UploadDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `backend`, replacing an earlier one with the same name.
    pub fn register(&mut self, backend: Arc<dyn UploadBackend>) {
        match self.position(backend.name()) {
            Some(idx) => self.backends[idx] = backend,
            None => self.backends.push(backend),
        }
    }

    pub fn select(&mut self, name: &str) -> Result<(), UploadError> {
        let idx = self
            .position(name)
            .ok_or_else(|| UploadError::UnknownBackend(name.to_string()))?;
        self.selected = Some(idx);
        info!(backend = name, "upload backend selected");
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Result<Arc<dyn UploadBackend>, UploadError> {
        self.selected
            .and_then(|idx| self.backends.get(idx))
            .cloned()
            .ok_or(UploadError::NoBackend)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UploadBackend>> {
        self.position(name).map(|idx| self.backends[idx].clone())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Pushes new platform limits to every registered backend.
    pub fn update_configuration(&self, config: &PlatformConfig) {
        for backend in &self.backends {
            backend.update_configuration(config);
        }
    }

    /// Uploads through the selected backend; errors pass through unchanged.
    pub async fn upload(
        &self,
        text: &str,
        in_reply_to: Option<u64>,
        items: &[&dyn MediaItem],
    ) -> Result<PostResult, UploadError> {
        let backend = self.selected()?;
        backend.upload(text, in_reply_to, items).await
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMediaItem;
    use crate::upload::test_support::RecordingApi;
    use crate::upload::{Imgur, ValidationError};

    fn dispatcher() -> UploadDispatcher {
        let api = Arc::new(RecordingApi::default());
        let mut dispatcher = UploadDispatcher::new();
        dispatcher.register(Arc::new(Imgur::new(api, reqwest::Client::new(), "id")));
        dispatcher
    }

    #[test]
    fn nothing_selected_is_an_error() {
        let dispatcher = dispatcher();
        assert!(matches!(dispatcher.selected(), Err(UploadError::NoBackend)));
    }

    #[test]
    fn select_by_name() {
        let mut dispatcher = dispatcher();
        dispatcher.select("imgur").unwrap();
        assert_eq!(dispatcher.selected().unwrap().name(), "imgur");
        assert!(matches!(
            dispatcher.select("flickr"),
            Err(UploadError::UnknownBackend(name)) if name == "flickr"
        ));
        // A failed select keeps the previous choice.
        assert_eq!(dispatcher.selected().unwrap().name(), "imgur");
        dispatcher.clear_selection();
        assert!(dispatcher.selected().is_err());
    }

    #[test]
    fn configuration_reaches_backends() {
        let dispatcher = dispatcher();
        dispatcher.update_configuration(&PlatformConfig {
            short_url_length_https: 40,
            ..PlatformConfig::default()
        });
        let imgur = dispatcher.get("imgur").unwrap();
        assert_eq!(imgur.reserved_text_length(1), 41);
    }

    #[test]
    fn register_replaces_same_name() {
        let mut dispatcher = dispatcher();
        let api = Arc::new(RecordingApi::default());
        dispatcher.register(Arc::new(Imgur::new(api, reqwest::Client::new(), "other")));
        assert_eq!(dispatcher.names(), vec!["imgur"]);
    }

    #[tokio::test]
    async fn upload_passes_backend_errors_through() {
        let mut dispatcher = dispatcher();
        dispatcher.select("imgur").unwrap();
        let item = MemoryMediaItem::new("doc.txt", vec![1]);
        let items: [&dyn MediaItem; 1] = [&item];
        let err = dispatcher.upload("x", None, &items).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Validation(ValidationError::UnsupportedExtension(_))
        ));
    }
}
