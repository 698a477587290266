//! A unified address type for command operands.
//!
//! An [`ObjectUrl`] is either a remote object-store address (`s3://bucket/key`)
//! or a local filesystem path, with support for wildcard patterns (`*`, `?`),
//! version addressing (`?versionId=...`) and raw mode (wildcards treated
//! literally).
//!
//! URLs are immutable values. Matching a key against a wildcard URL returns the
//! captured relative component instead of mutating the URL; callers attach that
//! component to the objects they emit.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

const SCHEME_REMOTE: &str = "s3://";
const SCHEME_SEPARATOR: &str = "://";
const GLOB_CHARS: [char; 2] = ['*', '?'];
const VERSION_QUERY: &str = "?versionId=";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("remote url {0:?} requires a bucket name")]
    MissingBucket(String),
    #[error("bucket name {0:?} cannot contain wildcard characters")]
    WildcardBucket(String),
    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("invalid wildcard pattern: {0}")]
    BadPattern(#[from] regex::Error),
}

/// Options applied at parse time, typically carried over from command flags.
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// Treat `*` and `?` as literal key characters.
    pub raw: bool,
    /// Address a specific object version.
    pub version_id: Option<String>,
    /// Enumerate all versions instead of the latest.
    pub all_versions: bool,
}

/// A parsed operand address: local path or remote object/prefix/bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectUrl {
    remote: bool,
    bucket: String,
    path: String,
    prefix: String,
    filter: String,
    delimiter: String,
    raw: bool,
    version_id: Option<String>,
    all_versions: bool,
    #[serde(skip)]
    regex: Option<Regex>,
}

impl PartialEq for ObjectUrl {
    fn eq(&self, other: &Self) -> bool {
        self.remote == other.remote
            && self.bucket == other.bucket
            && self.path == other.path
            && self.raw == other.raw
            && self.version_id == other.version_id
            && self.all_versions == other.all_versions
    }
}
impl Eq for ObjectUrl {}

impl ObjectUrl {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        Self::parse_with(s, UrlOptions::default())
    }

    pub fn parse_with(s: &str, opts: UrlOptions) -> Result<Self, ParseError> {
        if let Some(rest) = s.strip_prefix(SCHEME_REMOTE) {
            return Self::parse_remote(rest, opts);
        }
        if let Some(sep) = s.find(SCHEME_SEPARATOR) {
            return Err(ParseError::UnsupportedScheme(s[..sep].to_string()));
        }
        let mut url = ObjectUrl {
            remote: false,
            bucket: String::new(),
            path: s.to_string(),
            prefix: String::new(),
            filter: String::new(),
            delimiter: String::new(),
            raw: opts.raw,
            version_id: None,
            all_versions: false,
            regex: None,
        };
        url.init_derived()?;
        Ok(url)
    }

    /// Address for a concrete remote key, as returned by a listing. Raw, so
    /// wildcard characters inside the key stay literal.
    pub fn remote_object(bucket: &str, key: &str) -> Self {
        let mut url = ObjectUrl {
            remote: true,
            bucket: bucket.to_string(),
            path: key.to_string(),
            prefix: String::new(),
            filter: String::new(),
            delimiter: String::new(),
            raw: true,
            version_id: None,
            all_versions: false,
            regex: None,
        };
        url.init_derived().expect("raw urls compile no pattern");
        url
    }

    /// Address for a concrete local path, raw.
    pub fn local_file(path: &str) -> Self {
        let mut url = ObjectUrl {
            remote: false,
            bucket: String::new(),
            path: path.to_string(),
            prefix: String::new(),
            filter: String::new(),
            delimiter: String::new(),
            raw: true,
            version_id: None,
            all_versions: false,
            regex: None,
        };
        url.init_derived().expect("raw urls compile no pattern");
        url
    }

    pub fn with_version(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    fn parse_remote(rest: &str, opts: UrlOptions) -> Result<Self, ParseError> {
        let (bucket, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(ParseError::MissingBucket(format!("{SCHEME_REMOTE}{rest}")));
        }
        if bucket.contains(GLOB_CHARS) {
            return Err(ParseError::WildcardBucket(bucket.to_string()));
        }

        // An explicit `?versionId=` query takes precedence over the flag.
        let (path, version_id) = match path.find(VERSION_QUERY) {
            Some(idx) => (
                &path[..idx],
                Some(path[idx + VERSION_QUERY.len()..].to_string()),
            ),
            None => (path, opts.version_id),
        };

        let mut url = ObjectUrl {
            remote: true,
            bucket: bucket.to_string(),
            path: path.to_string(),
            prefix: String::new(),
            filter: String::new(),
            delimiter: String::new(),
            raw: opts.raw,
            version_id,
            all_versions: opts.all_versions,
            regex: None,
        };
        url.init_derived()?;
        Ok(url)
    }

    /// Splits the path into the literal prefix and the wildcard filter, and
    /// compiles the filter into an anchored single-line regex. Raw URLs keep
    /// `prefix == path` and no regex.
    fn init_derived(&mut self) -> Result<(), ParseError> {
        if self.raw {
            self.prefix = self.path.clone();
            self.filter.clear();
            self.delimiter = "/".to_string();
            self.regex = None;
            return Ok(());
        }
        match self.path.find(GLOB_CHARS) {
            Some(loc) => {
                self.prefix = self.path[..loc].to_string();
                self.filter = self.path[loc..].to_string();
                self.delimiter = String::new();
                self.regex = Some(compile_filter(&self.prefix, &self.filter)?);
            }
            None => {
                self.prefix = self.path.clone();
                self.filter.clear();
                self.delimiter = "/".to_string();
                self.regex = None;
            }
        }
        Ok(())
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn is_local(&self) -> bool {
        !self.remote
    }

    /// A remote URL with an empty path addresses the bucket itself.
    pub fn is_bucket(&self) -> bool {
        self.remote && self.path.is_empty()
    }

    /// A remote URL with a trailing `/` is a prefix.
    pub fn is_prefix(&self) -> bool {
        self.remote && self.path.ends_with('/')
    }

    pub fn is_wildcard(&self) -> bool {
        !self.raw && self.path.contains(GLOB_CHARS)
    }

    pub fn is_versioned(&self) -> bool {
        self.all_versions || self.version_id.is_some()
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path up to the first wildcard character; the whole path when there is
    /// no wildcard or the URL is raw.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Listing delimiter: `/` for hierarchical listing, empty under a
    /// wildcard so the listing recurses.
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }

    pub fn all_versions(&self) -> bool {
        self.all_versions
    }

    /// The full address, scheme included for remote URLs.
    pub fn absolute(&self) -> String {
        if !self.remote {
            return self.path.clone();
        }
        let mut s = format!("{SCHEME_REMOTE}{}", self.bucket);
        if !self.path.is_empty() {
            s.push('/');
            s.push_str(&self.path);
        }
        if let Some(v) = &self.version_id {
            s.push_str(VERSION_QUERY);
            s.push_str(v);
        }
        s
    }

    /// Last path component, ignoring a trailing separator.
    pub fn base(&self) -> String {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => trimmed[idx + 1..].to_string(),
            None => trimmed.to_string(),
        }
    }

    /// Everything up to and including the last separator.
    pub fn dir(&self) -> String {
        match self.path.rfind('/') {
            Some(idx) => self.path[..=idx].to_string(),
            None => String::new(),
        }
    }

    /// Appends a component. Remote joins concatenate verbatim so that keys
    /// with leading slashes survive (`s3://b/p/` + `/k` is `s3://b/p//k`);
    /// local joins are lexically cleaned.
    pub fn join(&self, component: &str) -> Result<Self, ParseError> {
        let mut joined = self.clone();
        if self.remote {
            joined.path = format!("{}{}", self.path, component);
        } else if self.path.is_empty() {
            joined.path = clean_local(component);
        } else {
            joined.path = clean_local(&format!("{}/{}", self.path.trim_end_matches('/'), component));
        }
        joined.init_derived()?;
        Ok(joined)
    }

    /// Matches a concrete key against this URL and, on success, returns the
    /// relative component captured by the match.
    ///
    /// Wildcard URLs split the key at the last separator of the literal
    /// prefix; non-wildcard URLs strip the prefix and fall back to the base
    /// name for an exact hit.
    pub fn match_key(&self, key: &str) -> Option<String> {
        if self.raw {
            return (key == self.path).then(|| base_of(key));
        }
        match &self.regex {
            Some(re) => {
                if !re.is_match(key) {
                    return None;
                }
                let split = self.prefix.rfind('/').map(|idx| idx + 1).unwrap_or(0);
                Some(key[split..].to_string())
            }
            None => {
                if !key.starts_with(&self.prefix) {
                    return None;
                }
                let stripped = &key[self.prefix.len()..];
                if stripped.is_empty() {
                    Some(base_of(key))
                } else {
                    Some(stripped.to_string())
                }
            }
        }
    }

    /// Computes this URL's path relative to `base`. A wildcard base is
    /// truncated at its first wildcard character first, then the comparison
    /// runs against the directory of the truncated base.
    pub fn relative_to(&self, base: &ObjectUrl) -> String {
        let mut base_path = base.path.clone();
        if let Some(loc) = base_path.find(GLOB_CHARS) {
            base_path.truncate(loc);
        }
        let dir = match base_path.rfind('/') {
            Some(idx) => &base_path[..=idx],
            None => "",
        };
        match self.path.strip_prefix(dir) {
            Some(rel) if !rel.is_empty() => rel.to_string(),
            _ => self.path.clone(),
        }
    }

    /// Serialized form for spill files. The compiled regex is rebuilt on
    /// [`ObjectUrl::from_bytes`].
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("url serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut url: ObjectUrl = bincode::deserialize(bytes)
            .map_err(|_| ParseError::UnsupportedScheme("corrupt url bytes".to_string()))?;
        url.init_derived()?;
        Ok(url)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute())
    }
}

fn base_of(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// `?` matches exactly one non-separator character, `*` any run of
/// characters. Anchored at both ends; `(?s)` so that newlines inside keys
/// still match.
fn compile_filter(prefix: &str, filter: &str) -> Result<Regex, regex::Error> {
    let translated = regex::escape(filter)
        .replace("\\*", ".*")
        .replace("\\?", "[^/]");
    Regex::new(&format!("(?s)^{}{}$", regex::escape(prefix), translated))
}

/// Lexical path cleaning for local joins: collapses separators and resolves
/// `.` and `..` components without touching the filesystem.
fn clean_local(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let mut cleaned = if absolute { "/".to_string() } else { String::new() };
    cleaned.push_str(&parts.join("/"));
    if cleaned.is_empty() {
        cleaned.push('.');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ObjectUrl {
        ObjectUrl::parse(s).expect("valid url")
    }

    #[test]
    fn classifies_remote_urls() {
        let bucket = parse("s3://bucket");
        assert!(bucket.is_remote() && bucket.is_bucket());

        let prefix = parse("s3://bucket/abc/");
        assert!(prefix.is_prefix() && !prefix.is_bucket());

        let object = parse("s3://bucket/abc/def.txt");
        assert!(object.is_remote() && !object.is_prefix() && !object.is_wildcard());

        let wild = parse("s3://bucket/abc/*.txt");
        assert!(wild.is_wildcard());
        assert_eq!(wild.prefix(), "abc/");
        assert_eq!(wild.delimiter(), "");
    }

    #[test]
    fn rejects_invalid_urls() {
        assert!(matches!(
            ObjectUrl::parse("s3://"),
            Err(ParseError::MissingBucket(_))
        ));
        assert!(matches!(
            ObjectUrl::parse("s3://buck*t/key"),
            Err(ParseError::WildcardBucket(_))
        ));
        assert!(matches!(
            ObjectUrl::parse("gs://bucket/key"),
            Err(ParseError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn local_paths_pass_through() {
        let url = parse("some/dir/file.txt");
        assert!(url.is_local());
        assert_eq!(url.absolute(), "some/dir/file.txt");
    }

    #[test]
    fn parses_version_query() {
        let url = parse("s3://bucket/key.txt?versionId=abc123");
        assert_eq!(url.path(), "key.txt");
        assert_eq!(url.version_id(), Some("abc123"));
        assert!(url.is_versioned());
        assert_eq!(url.absolute(), "s3://bucket/key.txt?versionId=abc123");
    }

    #[test]
    fn raw_disables_wildcards() {
        let url = ObjectUrl::parse_with(
            "s3://bucket/key*chars?.txt",
            UrlOptions {
                raw: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!url.is_wildcard());
        assert_eq!(url.prefix(), url.path());
        assert!(url.match_key("key*chars?.txt").is_some());
        assert!(url.match_key("keyXcharsY.txt").is_none());
    }

    #[test]
    fn absolute_round_trips_remote_exactly() {
        for s in [
            "s3://bucket",
            "s3://bucket/key",
            "s3://bucket/prefix/",
            "s3://bucket/a/*.gz",
        ] {
            assert_eq!(parse(s).absolute(), s);
        }
    }

    #[test]
    fn wildcard_match_captures_relative_tail() {
        let url = parse("s3://bucket/logs/2023-*/*.gz");
        assert_eq!(
            url.match_key("logs/2023-05/app.gz").as_deref(),
            Some("2023-05/app.gz")
        );
        assert!(url.match_key("logs/2022-05/app.gz").is_none());
        assert!(url.match_key("other/2023-05/app.gz").is_none());
    }

    #[test]
    fn question_mark_excludes_separator() {
        let url = parse("s3://bucket/p/?.txt");
        assert!(url.match_key("p/a.txt").is_some());
        assert!(url.match_key("p//.txt").is_none());
    }

    #[test]
    fn single_line_mode_matches_newlines() {
        let url = parse("s3://bucket/p/*.txt");
        assert!(url.match_key("p/we\nird.txt").is_some());
    }

    #[test]
    fn non_wildcard_match_strips_prefix() {
        let url = parse("s3://bucket/abc/");
        assert_eq!(url.match_key("abc/x/y.txt").as_deref(), Some("x/y.txt"));
        assert_eq!(url.match_key("abc/sub/").as_deref(), Some("sub/"));
        assert!(url.match_key("other/x.txt").is_none());

        let object = parse("s3://bucket/abc/file.txt");
        assert_eq!(object.match_key("abc/file.txt").as_deref(), Some("file.txt"));
    }

    #[test]
    fn relative_to_truncates_wildcard_base() {
        let base = parse("s3://bucket/logs/2023-*/");
        let url = parse("s3://bucket/logs/2023-05/app.gz");
        assert_eq!(url.relative_to(&base), "2023-05/app.gz");

        let local_base = parse("dir/");
        let local = parse("dir/x/y/z.txt");
        assert_eq!(local.relative_to(&local_base), "x/y/z.txt");

        // A base without a trailing separator keeps its own name in the
        // relative path, matching directory-upload key derivation.
        let bare_base = parse("dir");
        assert_eq!(local.relative_to(&bare_base), "dir/x/y/z.txt");
    }

    #[test]
    fn remote_join_preserves_adjacent_slashes() {
        let url = parse("s3://bucket/p/");
        assert_eq!(url.join("/k").unwrap().path(), "p//k");
        assert_eq!(url.join("k").unwrap().path(), "p/k");
    }

    #[test]
    fn local_join_cleans() {
        let url = parse("dir/sub");
        assert_eq!(url.join("../other//x.txt").unwrap().path(), "dir/other/x.txt");
    }

    #[test]
    fn byte_round_trip() {
        let url = parse("s3://bucket/logs/2023-*/*.gz");
        let back = ObjectUrl::from_bytes(&url.to_bytes()).unwrap();
        assert_eq!(url, back);
        // The regex survives re-derivation.
        assert_eq!(
            back.match_key("logs/2023-05/app.gz").as_deref(),
            Some("2023-05/app.gz")
        );
    }
}
