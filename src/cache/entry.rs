//! Stored entry model.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MIME: &str = "text/html; charset=utf-8";

/// Page classification reported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageKind {
    Home,
    Feed,
    Archive,
    Single,
    #[default]
    Unknown,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::Home => "home",
            PageKind::Feed => "feed",
            PageKind::Archive => "archive",
            PageKind::Single => "single",
            PageKind::Unknown => "unknown",
        }
    }

    /// Best-effort classification when the renderer did not report one.
    pub fn infer(path: &str, mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        let feed_path = path.ends_with("/feed/") || path.ends_with("/feed");
        if mime.contains("rss") || mime.contains("atom") || feed_path {
            PageKind::Feed
        } else if path == "/" {
            PageKind::Home
        } else {
            PageKind::Unknown
        }
    }
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("meta entry is empty")]
    Empty,
    #[error("meta entry is not valid: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Metadata stored next to a page body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    #[serde(rename = "type", default)]
    pub kind: PageKind,
    /// Absolute expiry, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmodified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default = "default_mime")]
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortlink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pingback: Option<String>,
}

fn default_mime() -> String {
    DEFAULT_MIME.to_string()
}

impl Default for MetaRecord {
    fn default() -> Self {
        Self {
            kind: PageKind::Unknown,
            expire: None,
            lastmodified: None,
            status: None,
            redirect: None,
            mime: default_mime(),
            shortlink: None,
            pingback: None,
        }
    }
}

impl MetaRecord {
    pub fn encode(&self) -> Bytes {
        // Serializing plain strings and integers cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EntryError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(EntryError::Empty);
        }
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// A resolved hit: both halves present and non-empty.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: MetaRecord,
    pub data: Bytes,
}
