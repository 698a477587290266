//! Command error wrapping and the skip taxonomy.

use std::fmt;

use storage::StorageError;

/// Reasons the override decision refuses a write. These are expected skips:
/// logged at debug level, never counted as command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ObjectExists,
    ObjectSizesMatch,
    ObjectIsNewer,
    ObjectIsNewerAndSizesMatch,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectExists => "object already exists",
            Self::ObjectSizesMatch => "object size matches",
            Self::ObjectIsNewer => "object is newer or same age",
            Self::ObjectIsNewerAndSizesMatch => "object is newer or same age and size matches",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Url(#[from] object_url::ParseError),

    /// Validation failure before any work started; exits 1 immediately.
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_cancelled())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_not_found() || err.is_no_object_found())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(StorageError::Io(err))
    }
}

/// One task's failure, wrapped with the operation and its operands for
/// rendering.
#[derive(Debug)]
pub struct JobError {
    pub op: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub err: Error,
}

impl JobError {
    pub fn new(op: impl Into<String>, err: Error) -> Self {
        Self {
            op: op.into(),
            src: None,
            dst: None,
            err,
        }
    }

    pub fn with_src(mut self, src: impl ToString) -> Self {
        self.src = Some(src.to_string());
        self
    }

    pub fn with_dst(mut self, dst: impl ToString) -> Self {
        self.dst = Some(dst.to_string());
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.err.is_cancellation()
    }

    /// The task description, `op src dst` style.
    pub fn job(&self) -> String {
        let mut job = self.op.clone();
        if let Some(src) = &self.src {
            job.push(' ');
            job.push_str(src);
        }
        if let Some(dst) = &self.dst {
            job.push(' ');
            job.push_str(dst);
        }
        job
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\": {}", self.job(), one_line(&self.err.to_string()))
    }
}

/// Squashes newlines, tabs and double spaces so that a job error renders on
/// one line.
pub fn one_line(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for c in s.chars() {
        let c = match c {
            '\n' | '\r' | '\t' => ' ',
            c => c,
        };
        if c == ' ' {
            if last_space {
                continue;
            }
            last_space = true;
        } else {
            last_space = false;
        }
        out.push(c);
    }
    out
}

/// An EMFILE anywhere in the error chain means the worker count outran the
/// file-descriptor limit; the command exits with guidance.
pub fn is_fd_exhaustion(err: &JobError) -> bool {
    err.err
        .to_string()
        .to_lowercase()
        .contains("too many open files")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_squashes_whitespace() {
        assert_eq!(one_line("a\nb\tc"), "a b c");
        assert_eq!(one_line("a  \n  b"), "a b");
        assert_eq!(one_line("plain"), "plain");
    }

    #[test]
    fn job_error_renders_operands() {
        let err = JobError::new("cp", Error::Usage("boom".to_string()))
            .with_src("s3://b/a")
            .with_dst("s3://b/c");
        assert_eq!(err.to_string(), "\"cp s3://b/a s3://b/c\": boom");
    }

    #[test]
    fn fd_exhaustion_detection() {
        let err = JobError::new(
            "cp",
            Error::Storage(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Too many open files (os error 24)",
            ))),
        );
        assert!(is_fd_exhaustion(&err));
    }

    #[test]
    fn cancellation_classification() {
        let err = JobError::new("cp", Error::Storage(StorageError::Cancelled));
        assert!(err.is_cancellation());
        let err = JobError::new("cp", Error::Usage("x".to_string()));
        assert!(!err.is_cancellation());
    }
}
