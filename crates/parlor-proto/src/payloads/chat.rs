//! Chat message bodies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of a `ninchat.com/text` or `ninchat.com/file` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attached files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

impl MessageBody {
    /// Text-only body.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), files: Vec::new() }
    }
}

/// Reference to an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// Backend file identifier.
    pub file_id: String,
    /// File attributes.
    pub file_attrs: FileAttrs,
}

/// Attributes of an uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttrs {
    /// Original file name.
    #[serde(default)]
    pub name: String,
    /// MIME type.
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// One element of a `ninchat.com/ui/compose` message
///
/// Only `element` is interpreted; the remaining attributes (label, class,
/// options, href) travel back untouched in a UI action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeContent {
    /// Element kind (`button`, `select`, ...).
    pub element: String,
    /// Remaining element attributes.
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl ComposeContent {
    /// Whether this client can present the element.
    pub fn is_supported(&self) -> bool {
        matches!(self.element.as_str(), "button" | "select")
    }

    /// Display label, if any.
    pub fn label(&self) -> Option<&str> {
        self.attrs.get("label").and_then(Value::as_str)
    }
}

/// Body of a `ninchat.com/ui/action` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiActionBody {
    /// Action verb, always `click` for compose widgets.
    pub action: String,
    /// The compose element acted upon.
    pub target: Value,
}

impl UiActionBody {
    /// Click on `target`.
    pub fn click(target: Value) -> Self {
        Self { action: "click".to_owned(), target }
    }
}

/// Body of a rating `ninchat.com/metadata` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingBody {
    /// Rating payload.
    pub data: RatingData,
}

/// Rating value wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingData {
    /// -1, 0 or 1.
    pub rating: i8,
}

impl RatingBody {
    /// Body for the given rating value.
    pub fn new(rating: i8) -> Self {
        Self { data: RatingData { rating } }
    }
}
