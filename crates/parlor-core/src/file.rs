//! File attachments.

use std::time::Duration;

use parlor_proto::{Props, Result, payloads::FileAttrs};

/// A URL closer than this to its expiry must be described again before use.
pub const URL_REFRESH_MARGIN: Duration = Duration::from_secs(15 * 60);

/// Attachment metadata, as known to the chat history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Backend file id.
    pub file_id: String,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Download URL, once described.
    pub url: Option<String>,
    /// URL expiry, milliseconds since the Unix epoch.
    pub url_expiry_ms: Option<u64>,
}

impl FileInfo {
    /// Attachment with no URL yet.
    pub fn new(file_id: impl Into<String>, attrs: &FileAttrs) -> Self {
        Self {
            file_id: file_id.into(),
            name: attrs.name.clone(),
            mime_type: attrs.mime_type.clone(),
            size: attrs.size,
            url: None,
            url_expiry_ms: None,
        }
    }

    /// `image/*`.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// `video/*`.
    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    /// `application/pdf`.
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    /// Whether the chat shows this file as an attachment bubble.
    pub fn is_displayable(&self) -> bool {
        self.is_image() || self.is_video() || self.is_pdf()
    }

    /// Whether the URL is missing or expires within [`URL_REFRESH_MARGIN`].
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        match (&self.url, self.url_expiry_ms) {
            (Some(_), Some(expiry)) => expiry < now_ms + URL_REFRESH_MARGIN.as_millis() as u64,
            _ => true,
        }
    }

    /// Take over URL and expiry from a fresh description.
    pub fn apply(&mut self, description: &FileDescription) {
        self.url = Some(description.url.clone());
        self.url_expiry_ms = description.url_expiry_ms;
    }
}

/// Reply to `describe_file`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescription {
    /// Backend file id.
    pub file_id: String,
    /// Download URL.
    pub url: String,
    /// URL expiry, milliseconds since the Unix epoch.
    pub url_expiry_ms: Option<u64>,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Original file name.
    pub name: String,
    /// Width / height for images and videos.
    pub aspect_ratio: Option<f64>,
}

impl FileDescription {
    /// Parse a `file_found` event.
    pub fn from_props(props: &Props) -> Result<Self> {
        let attrs = props.object("file_attrs").unwrap_or_default();
        let aspect_ratio = attrs.object("thumbnail").and_then(|thumb| {
            let width = thumb.float("width")?;
            let height = thumb.float("height")?;
            (height > 0.0).then_some(width / height)
        });
        Ok(Self {
            file_id: props.require_str("file_id")?.to_owned(),
            url: props.require_str("file_url")?.to_owned(),
            url_expiry_ms: props.float("url_expiry").map(|secs| (secs * 1000.0) as u64),
            mime_type: attrs.str("type").unwrap_or_default().to_owned(),
            size: attrs.int("size").unwrap_or_default().max(0) as u64,
            name: attrs.str("name").unwrap_or_default().to_owned(),
            aspect_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(mime: &str) -> FileInfo {
        FileInfo::new("f1", &FileAttrs { name: "x".into(), mime_type: mime.into(), size: 1 })
    }

    #[test]
    fn classification() {
        assert!(info("image/png").is_image());
        assert!(info("video/mp4").is_video());
        assert!(info("application/pdf").is_pdf());
        assert!(!info("text/plain").is_displayable());
    }

    #[test]
    fn refresh_margin() {
        let now_ms = 1_000_000_000;
        let mut file = info("image/png");
        assert!(file.needs_refresh(now_ms));

        file.url = Some("https://files.example/f1".into());
        file.url_expiry_ms = Some(now_ms + 14 * 60 * 1000);
        assert!(file.needs_refresh(now_ms));

        file.url_expiry_ms = Some(now_ms + 16 * 60 * 1000);
        assert!(!file.needs_refresh(now_ms));
    }

    #[test]
    fn parses_file_found() {
        let props = Props::new()
            .with("event", "file_found")
            .with("file_id", "f1")
            .with("file_url", "https://files.example/f1")
            .with("url_expiry", 1_700_000_000)
            .with(
                "file_attrs",
                Props::new().with("name", "cat.png").with("type", "image/png").with("size", 2048).with(
                    "thumbnail",
                    Props::new().with("width", 400).with("height", 200),
                ),
            );
        let description = FileDescription::from_props(&props).unwrap();
        assert_eq!(description.url_expiry_ms, Some(1_700_000_000_000));
        assert_eq!(description.aspect_ratio, Some(2.0));
        assert_eq!(description.size, 2048);

        let mut file = info("image/png");
        file.apply(&description);
        assert_eq!(file.url.as_deref(), Some("https://files.example/f1"));
    }
}
