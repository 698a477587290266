//! `sync`: one-way synchronization built on sorted streams.
//!
//! Both sides are enumerated in parallel, externally sorted by their
//! relative key, then a single linear merge partitions the pairs into
//! source-only, destination-only and common. Source-only and changed common
//! entries become `cp` lines, destination-only entries become batched `rm`
//! lines under `--delete`, and the generated commands stream through a pipe
//! into the batch interpreter running on the same pool.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use object_url::ObjectUrl;
use serde::{Deserialize, Serialize};
use storage::{LocalFs, Object, ObjectStream, StorageError, MAX_KEYS_PER_DELETE};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::CopyArgs;
use crate::error::Error;
use crate::expand::expand_source;

use super::{parse_destination, parse_operand, App, Filters, Outcome};

pub struct SyncFlags {
    pub args: CopyArgs,
    pub delete: bool,
    pub size_only: bool,
    pub hash_only: bool,
    pub exit_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    SizeOnly,
    HashAndSize,
    SizeAndModification,
}

impl Strategy {
    fn from_flags(flags: &SyncFlags) -> Result<Self, Error> {
        match (flags.size_only, flags.hash_only) {
            (true, true) => Err(Error::Usage(
                "--size-only and --hash-only cannot be combined".to_string(),
            )),
            (true, false) => Ok(Self::SizeOnly),
            (false, true) => Ok(Self::HashAndSize),
            (false, false) => Ok(Self::SizeAndModification),
        }
    }
}

/// One sorted record: the relative key this side orders by, plus the object
/// it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncEntry {
    key: String,
    obj: Object,
}

pub async fn run(
    app: &Arc<App>,
    flags: SyncFlags,
    src: String,
    dst: String,
) -> Result<Outcome, Error> {
    let src_url = parse_operand(&src, &flags.args)?;
    let dst_url = parse_destination(&dst, &flags.args)?;
    if src_url.is_local() && dst_url.is_local() {
        return Err(Error::Usage(
            "local to local sync is not supported".to_string(),
        ));
    }
    if dst_url.is_wildcard() {
        return Err(Error::Usage(format!(
            "destination {dst_url} cannot contain wildcards"
        )));
    }
    let strategy = Strategy::from_flags(&flags)?;
    let filters = Arc::new(Filters::compile(&flags.args.exclude, &flags.args.include)?);
    let follow_symlinks = !flags.args.no_follow_symlinks;

    // Everything below this token dies together; the listing-error policy
    // and exit-on-error both cancel it.
    let sync_cancel = app.cancel.child_token();

    let src_client = match src_url.is_remote() {
        true => Some(
            app.client(
                flags.args.source_region.as_deref(),
                Some(src_url.bucket()),
                None,
            )
            .await?,
        ),
        false => None,
    };
    let dst_client = match dst_url.is_remote() {
        true => Some(
            app.client(
                flags.args.destination_region.as_deref(),
                Some(dst_url.bucket()),
                None,
            )
            .await?,
        ),
        false => None,
    };
    let any_client = src_client
        .clone()
        .or_else(|| dst_client.clone())
        .expect("one side is always remote");

    // Prefix sides enumerate recursively: appending a wildcard empties the
    // listing delimiter and captures the relative key on match.
    let src_list_url = recursive_url(&src_url)?;
    let dst_list_url = recursive_url(&dst_url)?;
    let normalized_dst = normalize_destination(&dst_url)?;

    let src_stream = expand_source(
        src_client.as_ref().unwrap_or(&any_client),
        &app.fs,
        follow_symlinks,
        &src_list_url,
        &sync_cancel,
    );
    let dst_stream = expand_source(
        dst_client.as_ref().unwrap_or(&any_client),
        &app.fs,
        follow_symlinks,
        &dst_list_url,
        &sync_cancel,
    );

    let policy = ListingPolicy {
        exit_on_error: flags.exit_on_error,
        cancel: sync_cancel.clone(),
    };
    let (src_sorted, src_pump) = sorted_side(
        src_stream,
        SideFilter {
            filters: Arc::clone(&filters),
            skip_cold: !flags.args.force_glacier_transfer,
        },
        policy.clone(),
    );
    let (dst_sorted, dst_pump) = sorted_side(
        dst_stream,
        SideFilter {
            filters: Arc::clone(&filters),
            skip_cold: false,
        },
        policy,
    );

    // Partition the two ordered streams.
    let (only_src_tx, only_src_rx) = mpsc::channel(128);
    let (both_tx, both_rx) = mpsc::channel(128);
    let (only_dst_tx, only_dst_rx) = mpsc::channel(128);
    let merge = tokio::spawn(merge_partition(
        src_sorted,
        dst_sorted,
        only_src_tx,
        both_tx,
        only_dst_tx,
    ));

    // Generate commands into one end of a pipe, interpret the other end.
    let (pipe_writer, pipe_reader) = tokio::io::duplex(64 * 1024);
    let generator = tokio::spawn(generate_commands(
        pipe_writer,
        only_src_rx,
        both_rx,
        only_dst_rx,
        GeneratorConfig {
            base_flags: transfer_flags(&flags.args),
            dst: normalized_dst,
            delete: flags.delete,
            strategy,
            fs: app.fs.clone(),
        },
    ));

    // The interpreter and every sub-command it dispatches observe the
    // sync-scoped token, so one failed task can stop the whole pipeline.
    let scoped_app = Arc::new(app.scoped(sync_cancel.clone()));
    let outcome = super::run::interpret(
        &scoped_app,
        BufReader::new(pipe_reader),
        flags.exit_on_error.then(|| sync_cancel.clone()),
    )
    .await?;

    let mut failed = outcome.failed;
    for pump in [src_pump, dst_pump] {
        match pump.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if !err.is_cancellation() {
                    tracing::error!("sync enumeration failed: {err}");
                    failed += 1;
                }
            }
            Err(join_err) => {
                tracing::error!("sync enumeration panicked: {join_err}");
                failed += 1;
            }
        }
    }
    let _ = merge.await;
    if let Ok(Err(err)) = generator.await {
        tracing::error!("sync command generation failed: {err}");
        failed += 1;
    }

    Ok(Outcome { failed })
}

/// `s3://b/p/` becomes `s3://b/p/*` so the enumeration recurses and captures
/// relative keys. Locals and concrete objects pass through.
fn recursive_url(url: &ObjectUrl) -> Result<ObjectUrl, Error> {
    if url.is_remote() && !url.is_wildcard() && (url.is_bucket() || url.is_prefix()) {
        let pattern = if url.is_bucket() {
            format!("{}/*", url.absolute())
        } else {
            format!("{}*", url.absolute())
        };
        return Ok(ObjectUrl::parse(&pattern)?);
    }
    Ok(url.clone())
}

/// The destination generated keys append to. Remote prefixes get their
/// trailing separator so joins are unambiguous.
fn normalize_destination(url: &ObjectUrl) -> Result<ObjectUrl, Error> {
    if url.is_remote() && !url.is_bucket() && !url.path().ends_with('/') {
        return Ok(url.join("/")?);
    }
    Ok(url.clone())
}

#[derive(Clone)]
struct ListingPolicy {
    exit_on_error: bool,
    cancel: CancellationToken,
}

struct SideFilter {
    filters: Arc<Filters>,
    skip_cold: bool,
}

type PumpHandle = tokio::task::JoinHandle<Result<(), Error>>;

/// Feeds one side's enumeration into an external sort keyed by the relative
/// path. Directories and (on the source side) cold objects are dropped;
/// listing errors follow the sync abort policy.
fn sorted_side(
    mut stream: ObjectStream,
    side: SideFilter,
    policy: ListingPolicy,
) -> (mpsc::Receiver<SyncEntry>, PumpHandle) {
    let (input_tx, input_rx) = mpsc::channel(1000);
    let codec = extsort::Codec::<SyncEntry> {
        encode: Arc::new(|entry: &SyncEntry| {
            bincode::serialize(entry).expect("sync entries serialize")
        }),
        decode: Arc::new(|bytes: &[u8]| {
            bincode::deserialize(bytes).map_err(|err| err.to_string())
        }),
    };
    let (sorted_rx, mut sort_errs) = extsort::sort(
        input_rx,
        codec,
        Arc::new(|a: &SyncEntry, b: &SyncEntry| a.key.cmp(&b.key)),
        extsort::SortConfig::default(),
    );
    tokio::spawn(async move {
        while let Some(err) = sort_errs.recv().await {
            tracing::error!("external sort: {err}");
        }
    });

    let pump = tokio::spawn(async move {
        while let Some(result) = stream.recv().await {
            match result {
                Ok(obj) => {
                    if obj.is_dir() {
                        continue;
                    }
                    if side.skip_cold && obj.is_cold() {
                        tracing::debug!("{} is on cold storage, skipped", obj.url);
                        continue;
                    }
                    if !side.filters.allows(obj.url.path()) {
                        continue;
                    }
                    let entry = SyncEntry {
                        key: obj.relative_or_base(),
                        obj,
                    };
                    if input_tx.send(entry).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) if err.is_no_object_found() => break,
                Err(err) => {
                    if err.is_access_or_missing_bucket() || policy.exit_on_error {
                        policy.cancel.cancel();
                        return Err(Error::Storage(err));
                    }
                    tracing::error!("listing error, object skipped: {err}");
                }
            }
        }
        Ok(())
    });
    (sorted_rx, pump)
}

/// Linear merge of two key-ordered streams into the three-way partition.
/// Equal keys pair up in `both`.
async fn merge_partition(
    mut a: mpsc::Receiver<SyncEntry>,
    mut b: mpsc::Receiver<SyncEntry>,
    only_a: mpsc::Sender<SyncEntry>,
    both: mpsc::Sender<(SyncEntry, SyncEntry)>,
    only_b: mpsc::Sender<SyncEntry>,
) {
    let mut next_a = a.recv().await;
    let mut next_b = b.recv().await;
    loop {
        match (next_a.take(), next_b.take()) {
            (Some(entry_a), Some(entry_b)) => match entry_a.key.cmp(&entry_b.key) {
                Ordering::Less => {
                    if only_a.send(entry_a).await.is_err() {
                        return;
                    }
                    next_a = a.recv().await;
                    next_b = Some(entry_b);
                }
                Ordering::Greater => {
                    if only_b.send(entry_b).await.is_err() {
                        return;
                    }
                    next_a = Some(entry_a);
                    next_b = b.recv().await;
                }
                Ordering::Equal => {
                    if both.send((entry_a, entry_b)).await.is_err() {
                        return;
                    }
                    next_a = a.recv().await;
                    next_b = b.recv().await;
                }
            },
            (Some(entry_a), None) => {
                if only_a.send(entry_a).await.is_err() {
                    return;
                }
                next_a = a.recv().await;
                next_b = None;
            }
            (None, Some(entry_b)) => {
                if only_b.send(entry_b).await.is_err() {
                    return;
                }
                next_a = None;
                next_b = b.recv().await;
            }
            (None, None) => return,
        }
    }
}

struct GeneratorConfig {
    base_flags: String,
    dst: ObjectUrl,
    delete: bool,
    strategy: Strategy,
    fs: LocalFs,
}

/// Writes the generated `cp`/`rm` lines into the pipe feeding the batch
/// interpreter. All three partitions are consumed concurrently so the merge
/// never blocks on a full channel.
async fn generate_commands(
    mut pipe: DuplexStream,
    mut only_src: mpsc::Receiver<SyncEntry>,
    mut both: mpsc::Receiver<(SyncEntry, SyncEntry)>,
    mut only_dst: mpsc::Receiver<SyncEntry>,
    config: GeneratorConfig,
) -> Result<(), Error> {
    let mut src_open = true;
    let mut both_open = true;
    let mut dst_open = true;
    let mut rm_batch: Vec<String> = Vec::with_capacity(MAX_KEYS_PER_DELETE);

    while src_open || both_open || dst_open {
        tokio::select! {
            entry = only_src.recv(), if src_open => match entry {
                Some(entry) => write_cp(&mut pipe, &config, &entry).await?,
                None => src_open = false,
            },
            pair = both.recv(), if both_open => match pair {
                Some((src, dst)) => {
                    if should_sync(config.strategy, &src.obj, &dst.obj, &config.fs).await {
                        write_cp(&mut pipe, &config, &src).await?;
                    } else {
                        tracing::debug!(
                            "{} and {} are in sync, skipped",
                            src.obj.url,
                            dst.obj.url
                        );
                    }
                }
                None => both_open = false,
            },
            entry = only_dst.recv(), if dst_open => match entry {
                Some(entry) if config.delete => {
                    rm_batch.push(entry.obj.url.absolute());
                    if rm_batch.len() == MAX_KEYS_PER_DELETE {
                        write_rm(&mut pipe, &rm_batch).await?;
                        rm_batch.clear();
                    }
                }
                Some(_) => {}
                None => dst_open = false,
            },
        }
    }
    if !rm_batch.is_empty() {
        write_rm(&mut pipe, &rm_batch).await?;
    }

    pipe.shutdown().await.map_err(StorageError::Io)?;
    Ok(())
}

async fn write_cp(
    pipe: &mut DuplexStream,
    config: &GeneratorConfig,
    entry: &SyncEntry,
) -> Result<(), Error> {
    let dest = config.dst.join(&entry.key).map_err(Error::Url)?;
    let line = format!(
        "cp {} {} {}\n",
        config.base_flags,
        quote(&entry.obj.url.absolute()),
        quote(&dest.absolute()),
    );
    pipe.write_all(line.as_bytes())
        .await
        .map_err(StorageError::Io)?;
    Ok(())
}

async fn write_rm(pipe: &mut DuplexStream, urls: &[String]) -> Result<(), Error> {
    let mut line = String::from("rm --raw");
    for url in urls {
        line.push(' ');
        line.push_str(&quote(url));
    }
    line.push('\n');
    pipe.write_all(line.as_bytes())
        .await
        .map_err(StorageError::Io)?;
    Ok(())
}

fn quote(s: &str) -> Cow<'_, str> {
    shlex::try_quote(s).unwrap_or(Cow::Borrowed(s))
}

/// Flags forwarded from the user's invocation onto every generated `cp`.
/// Keys are concrete at this point, so raw mode is always on.
fn transfer_flags(args: &CopyArgs) -> String {
    let mut flags = format!(
        "--raw --concurrency {} --part-size {}",
        args.concurrency, args.part_size
    );
    let mut push_opt = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            flags.push_str(&format!(" --{name} {}", quote(value)));
        }
    };
    push_opt("storage-class", &args.storage_class);
    push_opt("sse", &args.sse);
    push_opt("sse-kms-key-id", &args.sse_kms_key_id);
    push_opt("acl", &args.acl);
    push_opt("cache-control", &args.cache_control);
    push_opt("expires", &args.expires);
    push_opt("content-type", &args.content_type);
    push_opt("content-encoding", &args.content_encoding);
    push_opt("content-disposition", &args.content_disposition);
    push_opt("source-region", &args.source_region);
    push_opt("destination-region", &args.destination_region);
    for (key, value) in &args.metadata {
        flags.push_str(&format!(" --metadata {}", quote(&format!("{key}={value}"))));
    }
    if args.force_glacier_transfer {
        flags.push_str(" --force-glacier-transfer");
    }
    if args.ignore_glacier_warnings {
        flags.push_str(" --ignore-glacier-warnings");
    }
    flags
}

/// The per-pair comparison. `true` means the pair is out of sync and the
/// source should be copied over.
async fn should_sync(strategy: Strategy, src: &Object, dst: &Object, fs: &LocalFs) -> bool {
    match strategy {
        Strategy::SizeOnly => src.size != dst.size,
        Strategy::SizeAndModification => {
            let src_newer = match (src.mod_time, dst.mod_time) {
                (Some(s), Some(d)) => s > d,
                _ => true,
            };
            src_newer || src.size != dst.size
        }
        Strategy::HashAndSize => {
            if src.size != dst.size {
                return true;
            }
            match (object_hash(src, fs).await, object_hash(dst, fs).await) {
                (Some(a), Some(b)) => a != b,
                // Without both hashes the comparison cannot prove sameness.
                _ => true,
            }
        }
    }
}

/// Content hash for comparison: the remote ETag when it is a plain MD5, a
/// streamed MD5 for local files. Multipart ETags are not content hashes.
async fn object_hash(obj: &Object, fs: &LocalFs) -> Option<String> {
    if obj.url.is_remote() {
        let etag = obj.etag.as_ref()?;
        if etag.contains('-') {
            return None;
        }
        return Some(etag.to_lowercase());
    }
    let mut file = fs.open(obj.url.path()).await.ok()?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match tokio::io::AsyncReadExt::read(&mut file, &mut buf).await {
            Ok(0) => break,
            Ok(n) => context.consume(&buf[..n]),
            Err(_) => return None,
        }
    }
    Some(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::ObjectKind;

    fn entry(key: &str, size: u64) -> SyncEntry {
        let mut obj = Object::new(
            ObjectUrl::parse(&format!("s3://b/p/{key}")).unwrap(),
            ObjectKind::File,
        );
        obj.size = size;
        SyncEntry {
            key: key.to_string(),
            obj,
        }
    }

    async fn feed(entries: Vec<SyncEntry>) -> mpsc::Receiver<SyncEntry> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for entry in entries {
                tx.send(entry).await.unwrap();
            }
        });
        rx
    }

    async fn run_merge(
        a: Vec<SyncEntry>,
        b: Vec<SyncEntry>,
    ) -> (Vec<String>, Vec<(String, String)>, Vec<String>) {
        let (oa_tx, mut oa_rx) = mpsc::channel(64);
        let (both_tx, mut both_rx) = mpsc::channel(64);
        let (ob_tx, mut ob_rx) = mpsc::channel(64);
        let a = feed(a).await;
        let b = feed(b).await;
        let merge = tokio::spawn(merge_partition(a, b, oa_tx, both_tx, ob_tx));

        let mut only_a = Vec::new();
        let mut common = Vec::new();
        let mut only_b = Vec::new();
        loop {
            tokio::select! {
                entry = oa_rx.recv() => match entry {
                    Some(entry) => only_a.push(entry.key),
                    None => break,
                },
                pair = both_rx.recv() => if let Some((x, y)) = pair {
                    common.push((x.key, y.key));
                },
                entry = ob_rx.recv() => if let Some(entry) = entry {
                    only_b.push(entry.key);
                },
            }
        }
        while let Some(pair) = both_rx.recv().await {
            common.push((pair.0.key, pair.1.key));
        }
        while let Some(entry) = ob_rx.recv().await {
            only_b.push(entry.key);
        }
        merge.await.unwrap();
        (only_a, common, only_b)
    }

    #[tokio::test]
    async fn partitions_three_ways() {
        let a = vec![entry("a", 10), entry("b", 20)];
        let b = vec![entry("a", 10), entry("c", 30)];
        let (only_a, common, only_b) = run_merge(a, b).await;
        assert_eq!(only_a, ["b"]);
        assert_eq!(common, [("a".to_string(), "a".to_string())]);
        assert_eq!(only_b, ["c"]);
    }

    #[tokio::test]
    async fn empty_sides() {
        let (only_a, common, only_b) = run_merge(vec![entry("x", 1)], vec![]).await;
        assert_eq!(only_a, ["x"]);
        assert!(common.is_empty() && only_b.is_empty());

        let (only_a, common, only_b) = run_merge(vec![], vec![entry("y", 1)]).await;
        assert_eq!(only_b, ["y"]);
        assert!(common.is_empty() && only_a.is_empty());
    }

    #[tokio::test]
    async fn partition_is_a_multiset_split() {
        let a: Vec<_> = ["a", "b", "d", "e"].iter().map(|k| entry(k, 1)).collect();
        let b: Vec<_> = ["b", "c", "e", "f"].iter().map(|k| entry(k, 1)).collect();
        let (only_a, common, only_b) = run_merge(a, b).await;
        let mut union: Vec<String> = only_a.clone();
        union.extend(common.iter().map(|(k, _)| k.clone()));
        union.extend(common.iter().map(|(_, k)| k.clone()));
        union.extend(only_b.clone());
        union.sort();
        assert_eq!(union, ["a", "b", "b", "c", "d", "e", "e", "f"]);
        assert_eq!(only_a, ["a", "d"]);
        assert_eq!(only_b, ["c", "f"]);
    }

    #[tokio::test]
    async fn size_only_strategy() {
        let fs = LocalFs::new();
        let e10a = entry("k", 10);
        let e10b = entry("k", 10);
        let e20 = entry("k", 20);
        let same = should_sync(Strategy::SizeOnly, &e10a.obj, &e10b.obj, &fs);
        let diff = should_sync(Strategy::SizeOnly, &e10a.obj, &e20.obj, &fs);
        assert!(!same.await);
        assert!(diff.await);
    }

    #[tokio::test]
    async fn size_and_modification_strategy() {
        use std::time::{Duration, SystemTime};
        let fs = LocalFs::new();
        let mut src = entry("k", 10).obj;
        let mut dst = entry("k", 10).obj;
        src.mod_time = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100));
        dst.mod_time = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(200));
        // Destination newer, same size: in sync.
        assert!(!should_sync(Strategy::SizeAndModification, &src, &dst, &fs).await);
        // Source newer: sync regardless of size.
        src.mod_time = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(300));
        assert!(should_sync(Strategy::SizeAndModification, &src, &dst, &fs).await);
        // Destination newer but sizes differ: sync.
        src.mod_time = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100));
        src.size = 11;
        assert!(should_sync(Strategy::SizeAndModification, &src, &dst, &fs).await);
    }

    #[tokio::test]
    async fn hash_strategy_compares_etags() {
        let fs = LocalFs::new();
        let mut src = entry("k", 10).obj;
        let mut dst = entry("k", 10).obj;
        src.etag = Some("abc".to_string());
        dst.etag = Some("abc".to_string());
        assert!(!should_sync(Strategy::HashAndSize, &src, &dst, &fs).await);
        dst.etag = Some("def".to_string());
        assert!(should_sync(Strategy::HashAndSize, &src, &dst, &fs).await);
        // Multipart etags cannot prove sameness.
        dst.etag = Some("abc-3".to_string());
        assert!(should_sync(Strategy::HashAndSize, &src, &dst, &fs).await);
    }

    #[tokio::test]
    async fn generates_cp_and_rm_lines() {
        // Source has {a:10, b:20}, destination has {a:10, c:30}: size-only
        // comparison copies b, keeps a, and --delete removes c.
        let mut src_b = SyncEntry {
            key: "b".to_string(),
            obj: Object::new(ObjectUrl::parse("folder/b").unwrap(), ObjectKind::File),
        };
        src_b.obj.size = 20;

        let (pipe_writer, pipe_reader) = tokio::io::duplex(4096);
        let (src_tx, src_rx) = mpsc::channel(8);
        let (both_tx, both_rx) = mpsc::channel(8);
        let (dst_tx, dst_rx) = mpsc::channel(8);

        let generator = tokio::spawn(generate_commands(
            pipe_writer,
            src_rx,
            both_rx,
            dst_rx,
            GeneratorConfig {
                base_flags: "--raw".to_string(),
                dst: ObjectUrl::parse("s3://b/p/").unwrap(),
                delete: true,
                strategy: Strategy::SizeOnly,
                fs: LocalFs::new(),
            },
        ));

        src_tx.send(src_b).await.unwrap();
        both_tx.send((entry("a", 10), entry("a", 10))).await.unwrap();
        dst_tx
            .send(SyncEntry {
                key: "c".to_string(),
                obj: Object::new(ObjectUrl::parse("s3://b/p/c").unwrap(), ObjectKind::File),
            })
            .await
            .unwrap();
        drop(src_tx);
        drop(both_tx);
        drop(dst_tx);

        let mut lines = Vec::new();
        let mut reader = tokio::io::BufReader::new(pipe_reader);
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                .await
                .unwrap();
            if n == 0 {
                break;
            }
            lines.push(line.trim_end().to_string());
        }
        generator.await.unwrap().unwrap();

        lines.sort();
        assert_eq!(
            lines,
            ["cp --raw folder/b s3://b/p/b", "rm --raw s3://b/p/c"]
        );
    }

    #[test]
    fn rm_lines_batch_at_the_multi_delete_limit() {
        // 1501 destination-only keys turn into two rm lines.
        let (pipe_writer, pipe_reader) = tokio::io::duplex(1024 * 1024);
        let (src_tx, src_rx) = mpsc::channel(8);
        let (both_tx, both_rx) = mpsc::channel(8);
        let (dst_tx, dst_rx) = mpsc::channel(2048);
        drop(src_tx);
        drop(both_tx);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async move {
            for i in 0..1501 {
                dst_tx.send(entry(&format!("k{i:04}"), 1)).await.unwrap();
            }
            drop(dst_tx);
            let generator = tokio::spawn(generate_commands(
                pipe_writer,
                src_rx,
                both_rx,
                dst_rx,
                GeneratorConfig {
                    base_flags: "--raw".to_string(),
                    dst: ObjectUrl::parse("s3://b/p/").unwrap(),
                    delete: true,
                    strategy: Strategy::SizeOnly,
                    fs: LocalFs::new(),
                },
            ));

            let mut lines = Vec::new();
            let mut reader = tokio::io::BufReader::new(pipe_reader);
            let mut line = String::new();
            loop {
                line.clear();
                let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                    .await
                    .unwrap();
                if n == 0 {
                    break;
                }
                lines.push(line.trim_end().to_string());
            }
            generator.await.unwrap().unwrap();

            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0].matches(" s3://").count(), 1000);
            assert_eq!(lines[1].matches(" s3://").count(), 501);
        });
    }

    #[test]
    fn generated_flags_quote_values() {
        let args = CopyArgs {
            storage_class: Some("GLACIER".to_string()),
            cache_control: Some("max-age=3600, public".to_string()),
            ..Default::default()
        };
        let flags = transfer_flags(&args);
        assert!(flags.starts_with("--raw"));
        assert!(flags.contains("--storage-class GLACIER"));
        assert!(flags.contains("--cache-control 'max-age=3600, public'"));
    }

    #[test]
    fn recursive_and_normalized_urls() {
        let prefix = ObjectUrl::parse("s3://b/p/").unwrap();
        assert_eq!(recursive_url(&prefix).unwrap().path(), "p/*");
        let bucket = ObjectUrl::parse("s3://b").unwrap();
        assert_eq!(recursive_url(&bucket).unwrap().path(), "*");
        let local = ObjectUrl::parse("dir/").unwrap();
        assert_eq!(recursive_url(&local).unwrap().path(), "dir/");

        let bare = ObjectUrl::parse("s3://b/p").unwrap();
        assert_eq!(normalize_destination(&bare).unwrap().path(), "p/");
    }
}
