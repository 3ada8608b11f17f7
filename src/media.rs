use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use reqwest::multipart::Part;
use reqwest::Body;
use tokio_util::io::ReaderStream;

/// Bodies up to this size are buffered; larger ones are streamed from disk.
pub const INLINE_BODY_LIMIT: u64 = 4 * 1024 * 1024;

/// A caller-owned media resource. The upload layer only reads it.
#[async_trait]
pub trait MediaItem: Send + Sync + fmt::Debug {
    /// Display name, also used as the multipart file name.
    fn name(&self) -> &str;

    /// Lowercase extension without the leading dot, empty when absent.
    fn extension(&self) -> String;

    fn exists(&self) -> bool;

    fn size(&self) -> io::Result<u64>;

    async fn open_body(&self) -> io::Result<Body>;

    fn alt_text(&self) -> Option<&str> {
        None
    }
}

/// Builds a multipart part for `item` carrying its file name and a mime type
/// derived from the extension.
pub async fn multipart_part(item: &dyn MediaItem) -> io::Result<Part> {
    let size = item.size()?;
    let body = item.open_body().await?;
    let part = Part::stream_with_length(body, size).file_name(item.name().to_string());
    part.mime_str(mime_for_extension(&item.extension()))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        _ => "application/octet-stream",
    }
}

pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct FileMediaItem {
    path: PathBuf,
    name: String,
    alt_text: Option<String>,
}

impl FileMediaItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path,
            name,
            alt_text: None,
        }
    }

    pub fn with_alt_text(mut self, alt_text: impl Into<String>) -> Self {
        self.alt_text = Some(alt_text.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MediaItem for FileMediaItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn extension(&self) -> String {
        self.path
            .extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .unwrap_or_default()
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    async fn open_body(&self) -> io::Result<Body> {
        if self.size()? <= INLINE_BODY_LIMIT {
            let data = tokio::fs::read(&self.path).await?;
            return Ok(Body::from(data));
        }
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Body::wrap_stream(ReaderStream::new(file)))
    }

    fn alt_text(&self) -> Option<&str> {
        self.alt_text.as_deref()
    }
}

/// Media that only lives in memory, e.g. a pasted screenshot.
#[derive(Clone)]
pub struct MemoryMediaItem {
    name: String,
    data: Arc<Vec<u8>>,
    alt_text: Option<String>,
}

impl MemoryMediaItem {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data),
            alt_text: None,
        }
    }

    pub fn with_alt_text(mut self, alt_text: impl Into<String>) -> Self {
        self.alt_text = Some(alt_text.into());
        self
    }
}

impl fmt::Debug for MemoryMediaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMediaItem")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl MediaItem for MemoryMediaItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .unwrap_or_default()
    }

    fn exists(&self) -> bool {
        true
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn open_body(&self) -> io::Result<Body> {
        Ok(Body::from(self.data.as_ref().clone()))
    }

    fn alt_text(&self) -> Option<&str> {
        self.alt_text.as_deref()
    }
}

struct DecodedImage {
    image: DynamicImage,
    format: Option<ImageFormat>,
}

/// A decoded image owned by exactly one holder. Dropping it releases the
/// pixel buffer.
pub struct MemoryImage {
    inner: Arc<DecodedImage>,
}

impl MemoryImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let format = image::guess_format(bytes).ok();
        let image = image::load_from_memory(bytes)?;
        Ok(Self {
            inner: Arc::new(DecodedImage { image, format }),
        })
    }

    pub fn image(&self) -> &DynamicImage {
        &self.inner.image
    }

    pub fn width(&self) -> u32 {
        self.inner.image.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.image.height()
    }

    pub fn mime_type(&self) -> &'static str {
        match self.inner.format {
            Some(ImageFormat::Jpeg) => "image/jpeg",
            Some(ImageFormat::Png) => "image/png",
            Some(ImageFormat::Gif) => "image/gif",
            Some(ImageFormat::WebP) => "image/webp",
            _ => "application/octet-stream",
        }
    }

    /// A handle that reports whether this image is still alive, without
    /// keeping it alive.
    pub fn watch(&self) -> ImageWatch {
        ImageWatch(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("mime", &self.mime_type())
            .finish()
    }
}

#[derive(Clone)]
pub struct ImageWatch(Weak<DecodedImage>);

impl ImageWatch {
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::new_rgba8(width, height)
        .write_to(&mut io::Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn file_item_reports_extension_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Photo.JPG");
        fs::write(&path, b"0123456789").unwrap();
        let item = FileMediaItem::new(&path);
        assert_eq!(item.name(), "Photo.JPG");
        assert_eq!(item.extension(), "jpg");
        assert!(item.exists());
        assert_eq!(item.size().unwrap(), 10);
    }

    #[test]
    fn missing_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let item = FileMediaItem::new(dir.path().join("gone.png"));
        assert!(!item.exists());
        assert!(item.size().is_err());
    }

    #[tokio::test]
    async fn small_and_large_files_both_open() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small.png");
        fs::write(&small, vec![1u8; 32]).unwrap();
        let large = dir.path().join("large.png");
        fs::write(&large, vec![2u8; (INLINE_BODY_LIMIT + 1) as usize]).unwrap();

        let small_body = FileMediaItem::new(&small).open_body().await.unwrap();
        assert_eq!(small_body.as_bytes().map(<[u8]>::len), Some(32));
        // Streamed bodies have no in-memory representation.
        let large_body = FileMediaItem::new(&large).open_body().await.unwrap();
        assert!(large_body.as_bytes().is_none());
    }

    #[test]
    fn memory_item_uses_name_extension() {
        let item = MemoryMediaItem::new("clip.PNG", vec![0; 4]).with_alt_text("a cat");
        assert_eq!(item.extension(), "png");
        assert_eq!(item.size().unwrap(), 4);
        assert_eq!(item.alt_text(), Some("a cat"));
    }

    #[test]
    fn decode_png_and_watch_release() {
        let image = MemoryImage::decode(&png_bytes(3, 2)).unwrap();
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(image.mime_type(), "image/png");
        let watch = image.watch();
        assert!(watch.is_alive());
        drop(image);
        assert!(!watch.is_alive());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(MemoryImage::decode(b"not an image").is_err());
    }

    #[test]
    fn normalize_strips_dot_and_case() {
        assert_eq!(normalize_extension(".JPeG"), "jpeg");
        assert_eq!(mime_for_extension("tiff"), "image/tiff");
    }
}
