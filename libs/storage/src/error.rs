//! Error kinds shared by both storage backends.

use std::fmt;

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Remote API failure, carrying the provider code and HTTP status when the
/// response got far enough to have them.
#[derive(Debug)]
pub struct RemoteError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("remote error")?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        if let Some(status) = self.status {
            write!(f, " (http {status})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Stat of a nonexistent key or path. Distinct so that existence probes
    /// stay quiet.
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// Terminal sentinel of an enumeration that matched nothing.
    #[error("no object found")]
    NoObjectFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] object_url::ParseError),

    /// Integrity failures and anything else unclassifiable.
    #[error("{0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_no_object_found(&self) -> bool {
        matches!(self, Self::NoObjectFound)
    }

    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote(remote) => remote.code.as_deref(),
            _ => None,
        }
    }

    /// Access failures and missing buckets abort a whole sync instead of
    /// being skipped per-object.
    pub fn is_access_or_missing_bucket(&self) -> bool {
        matches!(
            self.remote_code(),
            Some("AccessDenied") | Some("NoSuchBucket")
        )
    }

    /// Converts an SDK error into [`StorageError::Remote`], preserving the
    /// provider code and HTTP status.
    pub fn from_sdk<E>(err: SdkError<E>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let code = err.code().map(str::to_string);
        let status = match &err {
            SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
            _ => None,
        };
        let message = match err.message() {
            Some(msg) => msg.to_string(),
            None => DisplayErrorContext(&err).to_string(),
        };
        Self::Remote(RemoteError {
            code,
            status,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: &str, status: u16) -> StorageError {
        StorageError::Remote(RemoteError {
            code: Some(code.to_string()),
            status: Some(status),
            message: "details".to_string(),
        })
    }

    #[test]
    fn sync_abort_classification() {
        assert!(remote("AccessDenied", 403).is_access_or_missing_bucket());
        assert!(remote("NoSuchBucket", 404).is_access_or_missing_bucket());
        assert!(!remote("SlowDown", 503).is_access_or_missing_bucket());
        assert!(!StorageError::NoObjectFound.is_access_or_missing_bucket());
    }

    #[test]
    fn display_includes_code_and_status() {
        let rendered = remote("NoSuchKey", 404).to_string();
        assert!(rendered.contains("NoSuchKey"));
        assert!(rendered.contains("404"));
        assert!(rendered.contains("details"));
    }
}
