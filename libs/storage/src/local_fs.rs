//! Local filesystem side of transfers: stat, walks, glob expansion and the
//! file lifecycle helpers used by downloads.

use std::fs::FileType;
use std::time::SystemTime;

use camino::Utf8Path;
use camino_tempfile::NamedUtf8TempFile;
use object_url::ObjectUrl;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::{Object, ObjectKind, ObjectResult, ObjectStream, LIST_CHANNEL_BUFFER};

#[derive(Debug, Clone, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }

    pub fn stat(&self, url: &ObjectUrl) -> Result<Object, StorageError> {
        let meta = std::fs::metadata(url.path()).map_err(|err| not_found(err, url.path()))?;
        Ok(object_from_meta(url.clone(), &meta))
    }

    /// Enumerates a local source into a channel. Wildcards expand through the
    /// OS glob; matched directories and plain directory sources are walked.
    /// Ends with the no-object-found sentinel when nothing was emitted.
    pub fn list(&self, src: &ObjectUrl, follow_symlinks: bool) -> ObjectStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_BUFFER);
        let src = src.clone();
        tokio::task::spawn_blocking(move || {
            let mut emitted = false;
            walk_source(&src, follow_symlinks, &tx, &mut emitted);
            if !emitted {
                let _ = tx.blocking_send(Err(StorageError::NoObjectFound));
            }
        });
        rx
    }

    /// Opens a file for reading, refusing special files (devices, fifos,
    /// sockets).
    pub async fn open(&self, path: &str) -> Result<tokio::fs::File, StorageError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| not_found(err, path))?;
        if is_special(&meta.file_type()) {
            return Err(StorageError::Fatal(format!(
                "{path} is not a regular file"
            )));
        }
        Ok(tokio::fs::File::open(path).await?)
    }

    pub async fn create(&self, path: &str) -> Result<tokio::fs::File, StorageError> {
        Ok(tokio::fs::File::create(path).await?)
    }

    /// A temporary file in `dir`, so the final rename stays on one
    /// filesystem. Deleted on drop unless persisted.
    pub fn create_temp(&self, dir: &Utf8Path) -> Result<NamedUtf8TempFile, StorageError> {
        Ok(camino_tempfile::Builder::new()
            .prefix(".s3bulk-")
            .tempfile_in(dir)?)
    }

    pub async fn mkdir_all(&self, dir: &Utf8Path) -> Result<(), StorageError> {
        Ok(tokio::fs::create_dir_all(dir).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        Ok(tokio::fs::rename(from, to).await?)
    }

    pub async fn remove(&self, path: &str) -> Result<(), StorageError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| not_found(err, path))
    }

    /// Deletes every URL arriving on the channel, emitting one result per
    /// path.
    pub fn multi_delete(&self, mut urls: mpsc::Receiver<ObjectUrl>) -> ObjectStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_BUFFER);
        tokio::spawn(async move {
            while let Some(url) = urls.recv().await {
                let result = tokio::fs::remove_file(url.path())
                    .await
                    .map(|_| Object::new(url.clone(), ObjectKind::File))
                    .map_err(|err| not_found(err, url.path()));
                if tx.send(result).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

fn not_found(err: std::io::Error, path: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}

#[cfg(unix)]
fn is_special(file_type: &FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device()
        || file_type.is_char_device()
        || file_type.is_fifo()
        || file_type.is_socket()
}

#[cfg(not(unix))]
fn is_special(_file_type: &FileType) -> bool {
    false
}

fn object_from_meta(url: ObjectUrl, meta: &std::fs::Metadata) -> Object {
    let kind = if meta.file_type().is_symlink() {
        ObjectKind::Symlink
    } else if meta.is_dir() {
        ObjectKind::Dir
    } else {
        ObjectKind::File
    };
    let mut obj = Object::new(url, kind);
    obj.size = meta.len();
    obj.mod_time = meta.modified().ok();
    obj
}

fn walk_source(
    src: &ObjectUrl,
    follow_symlinks: bool,
    tx: &mpsc::Sender<ObjectResult>,
    emitted: &mut bool,
) {
    let start = SystemTime::now();
    if src.is_wildcard() {
        let paths = match glob::glob(src.path()) {
            Ok(paths) => paths,
            Err(err) => {
                let _ = tx.blocking_send(Err(StorageError::Fatal(err.to_string())));
                return;
            }
        };
        for entry in paths {
            match entry {
                Ok(path) => {
                    let Some(path) = path.to_str() else {
                        let _ = tx.blocking_send(Err(StorageError::Fatal(format!(
                            "non-utf8 path {:?}",
                            path
                        ))));
                        continue;
                    };
                    emit_path(src, path, follow_symlinks, start, tx, emitted);
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(StorageError::Io(err.into_error())));
                }
            }
        }
        return;
    }

    let meta = if follow_symlinks {
        std::fs::metadata(src.path())
    } else {
        std::fs::symlink_metadata(src.path())
    };
    match meta {
        // An unfollowed symlink source expands to nothing.
        Ok(meta) if meta.file_type().is_symlink() => {}
        Ok(meta) if meta.is_dir() => walk_dir(src, src.path(), follow_symlinks, start, tx, emitted),
        Ok(meta) => {
            let mut obj = object_from_meta(src.clone(), &meta);
            obj.relative = Some(src.relative_to(src));
            send(tx, obj, emitted);
        }
        Err(err) => {
            let _ = tx.blocking_send(Err(not_found(err, src.path())));
        }
    }
}

fn emit_path(
    src: &ObjectUrl,
    path: &str,
    follow_symlinks: bool,
    start: SystemTime,
    tx: &mpsc::Sender<ObjectResult>,
    emitted: &mut bool,
) {
    let meta = if follow_symlinks {
        std::fs::metadata(path)
    } else {
        std::fs::symlink_metadata(path)
    };
    match meta {
        Ok(meta) if meta.is_dir() => walk_dir(src, path, follow_symlinks, start, tx, emitted),
        Ok(meta) => {
            let url = ObjectUrl::local_file(path);
            let mut obj = object_from_meta(url, &meta);
            obj.relative = Some(obj.url.relative_to(src));
            send(tx, obj, emitted);
        }
        Err(err) => {
            let _ = tx.blocking_send(Err(not_found(err, path)));
        }
    }
}

fn walk_dir(
    src: &ObjectUrl,
    root: &str,
    follow_symlinks: bool,
    start: SystemTime,
    tx: &mpsc::Sender<ObjectResult>,
    emitted: &mut bool,
) {
    for entry in WalkDir::new(root).follow_links(follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.blocking_send(Err(StorageError::Fatal(err.to_string())));
                continue;
            }
        };
        let Some(path) = entry.path().to_str() else {
            let _ = tx.blocking_send(Err(StorageError::Fatal(format!(
                "non-utf8 path {:?}",
                entry.path()
            ))));
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };

        // An entry that appeared after the walk started is not part of this
        // enumeration.
        if let Ok(modified) = meta.modified() {
            if modified > start {
                continue;
            }
        }

        let kind = if entry.path_is_symlink() && !follow_symlinks {
            ObjectKind::Symlink
        } else if meta.is_dir() {
            ObjectKind::Dir
        } else {
            ObjectKind::File
        };
        let url = ObjectUrl::local_file(path);
        let mut obj = Object::new(url, kind);
        obj.size = meta.len();
        obj.mod_time = meta.modified().ok();
        obj.relative = Some(obj.url.relative_to(src));
        send(tx, obj, emitted);
    }
}

fn send(tx: &mpsc::Sender<ObjectResult>, obj: Object, emitted: &mut bool) {
    *emitted = true;
    let _ = tx.blocking_send(Ok(obj));
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn write_file(dir: &Utf8Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

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
    async fn walks_directory_sources() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"one");
        write_file(dir.path(), "sub/b.txt", b"two");

        let src = ObjectUrl::parse(&format!("{}/", dir.path())).unwrap();
        let (objects, errors) = collect(LocalFs::new().list(&src, false)).await;
        assert!(errors.is_empty());

        let mut files: Vec<String> = objects
            .iter()
            .filter(|o| o.kind == ObjectKind::File)
            .map(|o| o.relative.clone().unwrap())
            .collect();
        files.sort();
        assert_eq!(files, ["a.txt", "sub/b.txt"]);
    }

    #[tokio::test]
    async fn expands_wildcards() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(dir.path(), "x.log", b"1");
        write_file(dir.path(), "y.log", b"2");
        write_file(dir.path(), "z.txt", b"3");

        let src = ObjectUrl::parse(&format!("{}/*.log", dir.path())).unwrap();
        let (objects, errors) = collect(LocalFs::new().list(&src, false)).await;
        assert!(errors.is_empty());

        let mut names: Vec<String> = objects.iter().map(|o| o.url.base()).collect();
        names.sort();
        assert_eq!(names, ["x.log", "y.log"]);
    }

    #[tokio::test]
    async fn empty_match_emits_sentinel() {
        let dir = Utf8TempDir::new().unwrap();
        let src = ObjectUrl::parse(&format!("{}/*.nope", dir.path())).unwrap();
        let (objects, errors) = collect(LocalFs::new().list(&src, false)).await;
        assert!(objects.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_no_object_found());
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let err = LocalFs::new()
            .stat(&ObjectUrl::parse("definitely/not/here.txt").unwrap())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn single_file_source_emits_one_object() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(dir.path(), "only.txt", b"data");

        let src = ObjectUrl::parse(dir.path().join("only.txt").as_str()).unwrap();
        let (objects, errors) = collect(LocalFs::new().list(&src, false)).await;
        assert!(errors.is_empty());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].size, 4);
        assert_eq!(objects[0].relative.as_deref(), Some("only.txt"));
    }
}
