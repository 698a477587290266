//! Source expansion: one or more operand URLs become a single channel of
//! objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use object_url::ObjectUrl;
use storage::{LocalFs, Object, ObjectKind, ObjectStream, S3Bucket, StorageError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Expands one source URL. Wildcards, prefixes, buckets and version
/// enumerations delegate to the backend listing; a concrete remote key
/// becomes a single synthetic object without a round trip.
pub fn expand_source(
    s3: &Arc<S3Bucket>,
    fs: &LocalFs,
    follow_symlinks: bool,
    src: &ObjectUrl,
    cancel: &CancellationToken,
) -> ObjectStream {
    if src.is_remote() {
        if src.is_wildcard() || src.is_bucket() || src.is_prefix() || src.all_versions() {
            return s3.list(src, cancel);
        }
        let (tx, rx) = mpsc::channel(1);
        let mut obj = Object::new(src.clone(), ObjectKind::File);
        obj.version_id = src.version_id().map(str::to_string);
        tokio::spawn(async move {
            let _ = tx.send(Ok(obj)).await;
        });
        return rx;
    }
    fs.list(src, follow_symlinks)
}

/// Fans several expansions into one channel.
pub fn expand_sources(
    s3: &Arc<S3Bucket>,
    fs: &LocalFs,
    follow_symlinks: bool,
    srcs: &[ObjectUrl],
    cancel: &CancellationToken,
) -> ObjectStream {
    let streams = srcs
        .iter()
        .map(|src| expand_source(s3, fs, follow_symlinks, src, cancel))
        .collect();
    merge_streams(streams)
}

/// Merges per-source streams, unordered. Each source's no-object-found
/// sentinel is swallowed here; the aggregate sentinel is emitted only when
/// every source came up empty.
pub fn merge_streams(streams: Vec<ObjectStream>) -> ObjectStream {
    let (tx, rx) = mpsc::channel(storage::LIST_CHANNEL_BUFFER);
    let found_any = Arc::new(AtomicBool::new(false));
    let mut forwarders = JoinSet::new();
    for mut stream in streams {
        let tx = tx.clone();
        let found_any = Arc::clone(&found_any);
        forwarders.spawn(async move {
            while let Some(result) = stream.recv().await {
                match result {
                    Ok(obj) => {
                        found_any.store(true, Ordering::SeqCst);
                        if tx.send(Ok(obj)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) if err.is_no_object_found() => {}
                    Err(err) => {
                        if tx.send(Err(err)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
    tokio::spawn(async move {
        while forwarders.join_next().await.is_some() {}
        if !found_any.load(Ordering::SeqCst) {
            let _ = tx.send(Err(StorageError::NoObjectFound)).await;
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    async fn collect(mut rx: ObjectStream) -> (Vec<Object>, Vec<StorageError>) {
        let mut objects = Vec::new();
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(obj) => objects.push(obj),
                Err(err) => errors.push(err),
            }
        }
        (objects, errors)
    }

    #[tokio::test]
    async fn sentinel_swallowed_when_any_source_matches() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(dir.path().join("hit.txt"), b"x").unwrap();
        let fs = LocalFs::new();

        let full = ObjectUrl::parse(&format!("{}/*.txt", dir.path())).unwrap();
        let empty = ObjectUrl::parse(&format!("{}/*.log", dir.path())).unwrap();
        let streams = vec![fs.list(&full, false), fs.list(&empty, false)];
        let (objects, errors) = collect(merge_streams(streams)).await;
        assert_eq!(objects.len(), 1);
        assert!(errors.is_empty(), "sentinel must not leak: {errors:?}");
    }

    #[tokio::test]
    async fn aggregate_sentinel_when_all_sources_empty() {
        let dir = Utf8TempDir::new().unwrap();
        let fs = LocalFs::new();
        let empty_a = ObjectUrl::parse(&format!("{}/*.log", dir.path())).unwrap();
        let empty_b = ObjectUrl::parse(&format!("{}/*.gz", dir.path())).unwrap();
        let streams = vec![fs.list(&empty_a, false), fs.list(&empty_b, false)];
        let (objects, errors) = collect(merge_streams(streams)).await;
        assert!(objects.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_no_object_found());
    }

    #[tokio::test]
    async fn real_errors_are_forwarded() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(dir.path().join("hit.txt"), b"x").unwrap();
        let fs = LocalFs::new();
        let full = ObjectUrl::parse(&format!("{}/*.txt", dir.path())).unwrap();
        let missing = ObjectUrl::parse(&format!("{}/nothere/sub.txt", dir.path())).unwrap();
        let streams = vec![fs.list(&full, false), fs.list(&missing, false)];
        let (objects, errors) = collect(merge_streams(streams)).await;
        assert_eq!(objects.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_not_found());
    }
}
