//! Storage backends for bulk object operations.
//!
//! [`S3Bucket`] wraps an S3-compatible store behind the AWS SDK;
//! [`LocalFs`] covers the local filesystem side of transfers. Both
//! enumerate into channels of [`ObjectResult`] so that listing errors
//! travel in-band with the objects they interrupt.

pub mod error;
pub mod local_fs;
pub mod ordered_writer;
pub mod s3_bucket;
mod tls;

use std::collections::HashMap;
use std::time::SystemTime;

use object_url::ObjectUrl;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use error::StorageError;
pub use local_fs::LocalFs;
pub use ordered_writer::OrderedWriter;
pub use s3_bucket::{AddressingStyle, S3Bucket, S3Options};

/// As defined in S3 docs: one DeleteObjects request carries at most this
/// many keys.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

/// Concurrent DeleteObjects requests per multi-delete.
pub const MULTI_DELETE_CONCURRENCY: usize = 10;

/// Channel buffer used by enumerations.
pub const LIST_CHANNEL_BUFFER: usize = 1000;

pub type ObjectResult = Result<Object, StorageError>;
pub type ObjectStream = mpsc::Receiver<ObjectResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    File,
    Dir,
    Symlink,
}

/// Storage class reported by the remote store. Cold classes need an explicit
/// force flag before their objects are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    GlacierIr,
    DeepArchive,
    Other(String),
}

impl StorageClass {
    pub fn from_api(s: &str) -> Self {
        match s {
            "STANDARD" => Self::Standard,
            "REDUCED_REDUNDANCY" => Self::ReducedRedundancy,
            "STANDARD_IA" => Self::StandardIa,
            "ONEZONE_IA" => Self::OnezoneIa,
            "INTELLIGENT_TIERING" => Self::IntelligentTiering,
            "GLACIER" => Self::Glacier,
            "GLACIER_IR" => Self::GlacierIr,
            "DEEP_ARCHIVE" => Self::DeepArchive,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Standard => "STANDARD",
            Self::ReducedRedundancy => "REDUCED_REDUNDANCY",
            Self::StandardIa => "STANDARD_IA",
            Self::OnezoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
            Self::Glacier => "GLACIER",
            Self::GlacierIr => "GLACIER_IR",
            Self::DeepArchive => "DEEP_ARCHIVE",
            Self::Other(s) => s,
        }
    }

    /// Glacier and Deep Archive objects cannot be read without a restore;
    /// transfers skip them unless forced.
    pub fn is_cold(&self) -> bool {
        matches!(self, Self::Glacier | Self::DeepArchive)
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enumerated object. Immutable once emitted on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub url: ObjectUrl,
    pub kind: ObjectKind,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
    pub etag: Option<String>,
    pub storage_class: Option<StorageClass>,
    pub version_id: Option<String>,
    /// Relative component captured by the match or walk that produced this
    /// object; used for destination key derivation and sync ordering.
    pub relative: Option<String>,
}

impl Object {
    pub fn new(url: ObjectUrl, kind: ObjectKind) -> Self {
        Self {
            url,
            kind,
            size: 0,
            mod_time: None,
            etag: None,
            storage_class: None,
            version_id: None,
            relative: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Dir
    }

    pub fn is_cold(&self) -> bool {
        self.storage_class
            .as_ref()
            .map(StorageClass::is_cold)
            .unwrap_or(false)
    }

    /// The relative component when one was captured, the URL's base name
    /// otherwise (single-object transfers).
    pub fn relative_or_base(&self) -> String {
        self.relative
            .clone()
            .unwrap_or_else(|| self.url.base())
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Headers applied to uploads and server-side copies.
#[derive(Debug, Clone, Default)]
pub struct PutMetadata {
    pub storage_class: Option<String>,
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub acl: Option<String>,
    pub cache_control: Option<String>,
    /// RFC3339 timestamp, parsed when the request is built.
    pub expires: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub user_defined: HashMap<String, String>,
}

impl PutMetadata {
    /// True when any replace-style header is present, which switches
    /// server-side copies to metadata replacement.
    pub fn has_overrides(&self) -> bool {
        self.storage_class.is_some()
            || self.sse.is_some()
            || self.sse_kms_key_id.is_some()
            || self.acl.is_some()
            || self.cache_control.is_some()
            || self.expires.is_some()
            || self.content_type.is_some()
            || self.content_encoding.is_some()
            || self.content_disposition.is_some()
            || !self.user_defined.is_empty()
    }

    /// Resolved content type: the explicit header, then the extension
    /// lookup, then the octet-stream fallback.
    pub fn guess_content_type(&self, path: &str) -> String {
        if let Some(explicit) = &self.content_type {
            return explicit.clone();
        }
        mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_classes() {
        assert!(StorageClass::Glacier.is_cold());
        assert!(StorageClass::DeepArchive.is_cold());
        assert!(!StorageClass::Standard.is_cold());
        assert!(!StorageClass::GlacierIr.is_cold());
        assert!(!StorageClass::Other("EXPRESS_ONEZONE".to_string()).is_cold());
    }

    #[test]
    fn storage_class_api_round_trip() {
        for name in ["STANDARD", "GLACIER", "DEEP_ARCHIVE", "WEIRD_CLASS"] {
            assert_eq!(StorageClass::from_api(name).as_str(), name);
        }
    }

    #[test]
    fn content_type_guessing() {
        let meta = PutMetadata::default();
        assert_eq!(meta.guess_content_type("report.pdf"), "application/pdf");
        assert_eq!(meta.guess_content_type("index.html"), "text/html");
        assert_eq!(
            meta.guess_content_type("no-extension"),
            "application/octet-stream"
        );

        let explicit = PutMetadata {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        assert_eq!(explicit.guess_content_type("report.pdf"), "text/plain");
    }

    #[test]
    fn relative_or_base_falls_back() {
        let url = object_url::ObjectUrl::parse("s3://bucket/a/b.txt").unwrap();
        let mut obj = Object::new(url, ObjectKind::File);
        assert_eq!(obj.relative_or_base(), "b.txt");
        obj.relative = Some("a/b.txt".to_string());
        assert_eq!(obj.relative_or_base(), "a/b.txt");
    }
}
