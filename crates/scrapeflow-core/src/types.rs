use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LlmConfig;

/// Unique identifier of one source execution.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of raw content returned by a fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Html,
    Markdown,
    Text,
    Json,
    Xml,
    Csv,
    Pdf,
    Image,
    Unknown,
}

impl ContentKind {
    /// Classify an HTTP `content-type` header value.
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("html") {
            Self::Html
        } else if ct.contains("markdown") {
            Self::Markdown
        } else if ct.contains("json") {
            Self::Json
        } else if ct.contains("xml") {
            Self::Xml
        } else if ct.contains("csv") {
            Self::Csv
        } else if ct.contains("pdf") {
            Self::Pdf
        } else if ct.starts_with("image/") {
            Self::Image
        } else if ct.starts_with("text/") {
            Self::Text
        } else {
            Self::Unknown
        }
    }

    /// Classify a file by its extension.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Html,
            "md" | "markdown" => Self::Markdown,
            "txt" => Self::Text,
            "json" => Self::Json,
            "xml" => Self::Xml,
            "csv" => Self::Csv,
            "pdf" => Self::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" => Self::Image,
            _ => Self::Unknown,
        }
    }

    /// Whether the content is expected to be valid UTF-8 text.
    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Pdf | Self::Image)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(Self::Html),
            "markdown" => Ok(Self::Markdown),
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "csv" => Ok(Self::Csv),
            "pdf" => Ok(Self::Pdf),
            "image" => Ok(Self::Image),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown content kind '{}'", other)),
        }
    }
}

/// Raw content as returned by a fetch collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContent {
    /// The locator the content was fetched from (used to resolve relative URLs).
    pub locator: String,
    pub kind: ContentKind,
    pub body: Vec<u8>,
}

impl RawContent {
    pub fn new(locator: impl Into<String>, kind: ContentKind, body: impl Into<Vec<u8>>) -> Self {
        Self {
            locator: locator.into(),
            kind,
            body: body.into(),
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Normalized content as returned by a parse collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedContent {
    pub text: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
    /// Problems that did not prevent extraction; non-empty means partial.
    pub warnings: Vec<String>,
}

/// A single completion request for the LLM collaborator.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub context: String,
    pub schema: Option<serde_json::Value>,
    pub model: LlmConfig,
}

/// An image handed to the image-to-text collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    Url(String),
    Bytes(Vec<u8>),
}

/// Answer of a rate limiter / token budget gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    Denied { retry_after: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_from_content_type() {
        assert_eq!(ContentKind::from_content_type("text/html; charset=utf-8"), ContentKind::Html);
        assert_eq!(ContentKind::from_content_type("application/json"), ContentKind::Json);
        assert_eq!(ContentKind::from_content_type("image/png"), ContentKind::Image);
        assert_eq!(ContentKind::from_content_type("text/plain"), ContentKind::Text);
        assert_eq!(ContentKind::from_content_type("application/octet-stream"), ContentKind::Unknown);
    }

    #[test]
    fn test_content_kind_round_trip_str() {
        for kind in [ContentKind::Html, ContentKind::Pdf, ContentKind::Unknown] {
            assert_eq!(kind.as_str().parse::<ContentKind>().unwrap(), kind);
        }
        assert!("word".parse::<ContentKind>().is_err());
    }

    #[test]
    fn test_raw_content_text_lossy() {
        let raw = RawContent::new("mem://x", ContentKind::Text, vec![b'h', b'i', 0xff]);
        assert!(raw.text().starts_with("hi"));
    }
}
