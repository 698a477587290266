//! Command implementations and the context they share.

pub mod bucket;
pub mod cp;
pub mod ls;
pub mod multipart;
pub mod pipe;
pub mod presign;
pub mod rm;
pub mod run;
pub mod select;
pub mod sync;

use std::sync::Arc;

use object_url::{ObjectUrl, UrlOptions};
use regex::Regex;
use storage::{LocalFs, Object, S3Bucket, S3Options};
use tokio_util::sync::CancellationToken;

use crate::cli::{Command, CopyArgs, GlobalArgs};
use crate::error::{Error, JobError, SkipReason};
use crate::exec::{Waiter, WorkerPool};
use crate::log::{ErrorMessage, Logger};

/// Everything a command execution needs: the process-wide pool, resolved
/// global options, the output sink and the command's cancellation root.
pub struct App {
    pub pool: WorkerPool,
    pub global: GlobalArgs,
    pub logger: Logger,
    pub fs: LocalFs,
    pub cancel: CancellationToken,
    default_client: tokio::sync::OnceCell<Arc<S3Bucket>>,
}

impl App {
    pub fn new(pool: WorkerPool, global: GlobalArgs, cancel: CancellationToken) -> Self {
        let logger = Logger::new(global.json);
        Self {
            pool,
            global,
            logger,
            fs: LocalFs::new(),
            cancel,
            default_client: tokio::sync::OnceCell::new(),
        }
    }

    fn s3_options(&self) -> S3Options {
        S3Options {
            endpoint_url: self.global.endpoint_url.clone(),
            region: None,
            profile: self.global.profile.clone(),
            credentials_file: self.global.credentials_file.clone(),
            no_sign_request: self.global.no_sign_request,
            no_verify_ssl: self.global.no_verify_ssl,
            addressing_style: self.global.addressing_style.to_storage(),
            retry_count: self.global.retry_count,
            use_list_objects_v1: self.global.use_list_objects_v1,
            request_payer: self.global.request_payer.clone(),
            no_such_upload_retry_count: 5,
            dry_run: self.global.dry_run,
        }
    }

    /// The remote client for this command. Clients are built once per
    /// command; the region-less default is shared across batch lines.
    pub async fn client(
        &self,
        region: Option<&str>,
        bucket_hint: Option<&str>,
        retry_tweak: Option<u32>,
    ) -> Result<Arc<S3Bucket>, Error> {
        if region.is_none() && retry_tweak.is_none() {
            let client = self
                .default_client
                .get_or_try_init(|| async {
                    let opts = self.s3_options();
                    S3Bucket::new(opts, bucket_hint).await.map(Arc::new)
                })
                .await
                .map_err(Error::Other)?;
            return Ok(Arc::clone(client));
        }
        let mut opts = self.s3_options();
        opts.region = region.map(str::to_string);
        if let Some(retries) = retry_tweak {
            opts.no_such_upload_retry_count = retries;
        }
        S3Bucket::new(opts, bucket_hint)
            .await
            .map(Arc::new)
            .map_err(Error::Other)
    }

    /// A view of this app whose commands observe `cancel` instead of the
    /// process-wide token. Used by pipelines that must be able to cancel the
    /// sub-commands they spawn.
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            pool: self.pool.clone(),
            global: self.global.clone(),
            logger: self.logger,
            fs: self.fs.clone(),
            cancel,
            default_client: tokio::sync::OnceCell::new(),
        }
    }

    /// Prints collected job errors and returns how many there were.
    pub fn report_errors(&self, waiter: &Waiter) -> usize {
        let errors = waiter.take_errors();
        for err in &errors {
            self.logger.error(&ErrorMessage {
                job: err.job(),
                error: crate::error::one_line(&err.err.to_string()),
            });
            if crate::error::is_fd_exhaustion(err) {
                tracing::error!(
                    "the process ran out of file descriptors; lower --numworkers \
                     or raise the limit with `ulimit -n`"
                );
            }
        }
        errors.len()
    }
}

/// What a finished command reports back to `main`.
pub struct Outcome {
    pub failed: usize,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { failed: 0 }
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

pub async fn dispatch(app: &Arc<App>, command: Command) -> Result<Outcome, Error> {
    match command {
        Command::Cp { args, src, dst } => cp::run(app, args, src, dst, false).await,
        Command::Mv { args, src, dst } => cp::run(app, args, src, dst, true).await,
        Command::Rm {
            raw,
            all_versions,
            version_id,
            exclude,
            include,
            urls,
        } => rm::run(app, raw, all_versions, version_id, exclude, include, urls).await,
        Command::Ls {
            show_etag,
            humanize,
            all_versions,
            url,
        } => ls::run_ls(app, show_etag, humanize, all_versions, url).await,
        Command::Du {
            humanize,
            group,
            url,
        } => ls::run_du(app, humanize, group, url).await,
        Command::Cat {
            concurrency,
            part_size,
            version_id,
            url,
        } => pipe::run_cat(app, concurrency, part_size, version_id, url).await,
        Command::Pipe { args, dst } => pipe::run_pipe(app, args, dst).await,
        Command::Run { file } => run::run(app, file).await,
        Command::Sync {
            args,
            delete,
            size_only,
            hash_only,
            exit_on_error,
            src,
            dst,
        } => {
            sync::run(
                app,
                sync::SyncFlags {
                    args,
                    delete,
                    size_only,
                    hash_only,
                    exit_on_error,
                },
                src,
                dst,
            )
            .await
        }
        Command::Mb { bucket } => bucket::run_mb(app, bucket).await,
        Command::Rb { bucket } => bucket::run_rb(app, bucket).await,
        Command::Select {
            query,
            exclude,
            include,
            url,
        } => select::run(app, query, exclude, include, url).await,
        Command::Presign {
            expire,
            version_id,
            url,
        } => presign::run_presign(app, expire.into(), version_id, url).await,
        Command::Head {
            version_id,
            raw,
            url,
        } => presign::run_head(app, version_id, raw, url).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(Outcome::ok())
        }
        Command::BucketVersion { set, bucket } => bucket::run_bucket_version(app, set, bucket).await,
        Command::Lsmp { url } => multipart::run_lsmp(app, url).await,
        Command::Parts { url, upload_id } => multipart::run_parts(app, url, upload_id).await,
        Command::Abortmp { url, upload_id } => multipart::run_abortmp(app, url, upload_id).await,
    }
}

/// Parses a source operand with the copy-flag options applied.
pub fn parse_operand(s: &str, args: &CopyArgs) -> Result<ObjectUrl, Error> {
    Ok(ObjectUrl::parse_with(
        s,
        UrlOptions {
            raw: args.raw,
            version_id: args.version_id.clone(),
            all_versions: false,
        },
    )?)
}

/// Parses a destination operand: raw mode applies, version addressing does
/// not.
pub fn parse_destination(s: &str, args: &CopyArgs) -> Result<ObjectUrl, Error> {
    Ok(ObjectUrl::parse_with(
        s,
        UrlOptions {
            raw: args.raw,
            ..Default::default()
        },
    )?)
}

pub fn put_metadata_from(args: &CopyArgs) -> storage::PutMetadata {
    storage::PutMetadata {
        storage_class: args.storage_class.clone(),
        sse: args.sse.clone(),
        sse_kms_key_id: args.sse_kms_key_id.clone(),
        acl: args.acl.clone(),
        cache_control: args.cache_control.clone(),
        expires: args.expires.clone(),
        content_type: args.content_type.clone(),
        content_encoding: args.content_encoding.clone(),
        content_disposition: args.content_disposition.clone(),
        user_defined: args.metadata.iter().cloned().collect(),
    }
}

pub fn part_size_bytes(mib: u64) -> u64 {
    mib.max(1) * 1024 * 1024
}

/// Exclude/include patterns, compiled with the operand wildcard syntax and
/// matched against the end of the object path.
pub struct Filters {
    exclude: Vec<Regex>,
    include: Vec<Regex>,
}

impl Filters {
    pub fn compile(exclude: &[String], include: &[String]) -> Result<Self, Error> {
        Ok(Self {
            exclude: compile_patterns(exclude)?,
            include: compile_patterns(include)?,
        })
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(path))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            let translated = regex::escape(pattern)
                .replace("\\*", ".*")
                .replace("\\?", "[^/]");
            Regex::new(&format!("(?s){translated}$"))
                .map_err(|err| Error::Usage(format!("invalid pattern {pattern:?}: {err}")))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverrideFlags {
    pub no_clobber: bool,
    pub if_size_differ: bool,
    pub if_source_newer: bool,
}

impl OverrideFlags {
    pub fn from_args(args: &CopyArgs) -> Self {
        Self {
            no_clobber: args.no_clobber,
            if_size_differ: args.if_size_differ,
            if_source_newer: args.if_source_newer,
        }
    }

    pub fn any(&self) -> bool {
        self.no_clobber || self.if_size_differ || self.if_source_newer
    }
}

/// The sticky-skip override decision. Each active flag overwrites the skip
/// value in turn; the final value wins.
pub fn should_skip(
    flags: &OverrideFlags,
    src: &Object,
    dst: &Object,
) -> Option<SkipReason> {
    let mut skip = None;
    if flags.no_clobber {
        skip = Some(SkipReason::ObjectExists);
    }
    if flags.if_size_differ {
        skip = if src.size == dst.size {
            Some(SkipReason::ObjectSizesMatch)
        } else {
            None
        };
    }
    if flags.if_source_newer {
        let src_newer = match (src.mod_time, dst.mod_time) {
            (Some(s), Some(d)) => s > d,
            // Without both timestamps the comparison cannot hold.
            _ => true,
        };
        skip = if src_newer {
            None
        } else if matches!(skip, Some(SkipReason::ObjectSizesMatch)) {
            Some(SkipReason::ObjectIsNewerAndSizesMatch)
        } else {
            Some(SkipReason::ObjectIsNewer)
        };
    }
    skip
}

/// Derives the destination URL for one enumerated source object.
///
/// When the destination is a bucket or prefix the object's captured relative
/// component (or just its base name under `flatten`) is appended; a concrete
/// destination key is used as-is.
pub fn derive_destination(
    obj: &Object,
    dst: &ObjectUrl,
    flatten: bool,
) -> Result<ObjectUrl, Error> {
    if dst.is_remote() {
        if dst.is_bucket() || dst.is_prefix() {
            let component = if flatten {
                obj.url.base()
            } else {
                obj.relative_or_base()
            };
            return Ok(dst.join(&component)?);
        }
        return Ok(dst.clone());
    }
    // Local destination: a trailing separator or empty path means directory.
    if dst.path().is_empty() || dst.path().ends_with('/') || dst.path() == "." {
        let component = if flatten {
            obj.url.base()
        } else {
            obj.relative_or_base()
        };
        let base = if dst.path() == "." || dst.path().is_empty() {
            ObjectUrl::local_file("")
        } else {
            dst.clone()
        };
        return Ok(base.join(&component)?);
    }
    Ok(dst.clone())
}

/// Cold objects are skipped unless forced; the skip surfaces a per-object
/// error unless warnings are suppressed.
pub fn guard_cold_object(
    obj: &Object,
    op: &str,
    force: bool,
    ignore_warnings: bool,
    waiter: &Waiter,
) -> bool {
    if force || !obj.is_cold() {
        return false;
    }
    if !ignore_warnings {
        waiter.record_error(
            JobError::new(
                op,
                Error::Usage(format!(
                    "object is on {} storage, transfer requires --force-glacier-transfer",
                    obj.storage_class
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_default()
                )),
            )
            .with_src(&obj.url),
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use storage::ObjectKind;

    fn obj(url: &str, size: u64, mtime_secs: u64) -> Object {
        let mut obj = Object::new(ObjectUrl::parse(url).unwrap(), ObjectKind::File);
        obj.size = size;
        obj.mod_time = Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs));
        obj
    }

    #[test]
    fn override_truth_table() {
        let src_newer = obj("a", 10, 200);
        let src_older = obj("a", 10, 50);
        let dst_same_size = obj("b", 10, 100);
        let dst_other_size = obj("b", 20, 100);

        let nc = OverrideFlags {
            no_clobber: true,
            ..Default::default()
        };
        let sd = OverrideFlags {
            if_size_differ: true,
            ..Default::default()
        };
        let sn = OverrideFlags {
            if_source_newer: true,
            ..Default::default()
        };
        let sd_sn = OverrideFlags {
            if_size_differ: true,
            if_source_newer: true,
            ..Default::default()
        };

        // no-clobber skips whenever the destination exists.
        assert_eq!(
            should_skip(&nc, &src_newer, &dst_same_size),
            Some(SkipReason::ObjectExists)
        );

        // if-size-differ skips only on equal sizes.
        assert_eq!(
            should_skip(&sd, &src_newer, &dst_same_size),
            Some(SkipReason::ObjectSizesMatch)
        );
        assert_eq!(should_skip(&sd, &src_newer, &dst_other_size), None);

        // if-source-newer skips unless the source is strictly newer.
        assert_eq!(
            should_skip(&sn, &src_older, &dst_same_size),
            Some(SkipReason::ObjectIsNewer)
        );
        assert_eq!(should_skip(&sn, &src_newer, &dst_same_size), None);

        // Later flags overwrite earlier skips: sizes differ clears
        // no-clobber's skip.
        let nc_sd = OverrideFlags {
            no_clobber: true,
            if_size_differ: true,
            ..Default::default()
        };
        assert_eq!(should_skip(&nc_sd, &src_newer, &dst_other_size), None);

        // Both comparisons hold: combined reason.
        assert_eq!(
            should_skip(&sd_sn, &src_older, &dst_same_size),
            Some(SkipReason::ObjectIsNewerAndSizesMatch)
        );
        // Sizes differ but source is older: plain is-newer skip.
        assert_eq!(
            should_skip(&sd_sn, &src_older, &dst_other_size),
            Some(SkipReason::ObjectIsNewer)
        );
        // Source newer: no skip regardless of sizes.
        assert_eq!(should_skip(&sd_sn, &src_newer, &dst_same_size), None);
    }

    #[test]
    fn destination_key_derivation() {
        let dst = ObjectUrl::parse("s3://bucket/p/").unwrap();

        let mut o = Object::new(ObjectUrl::parse("dir/x/y/z.txt").unwrap(), ObjectKind::File);
        o.relative = Some("x/y/z.txt".to_string());
        assert_eq!(
            derive_destination(&o, &dst, false).unwrap().path(),
            "p/x/y/z.txt"
        );
        assert_eq!(
            derive_destination(&o, &dst, true).unwrap().path(),
            "p/z.txt"
        );

        // Concrete destination key is used as-is.
        let concrete = ObjectUrl::parse("s3://bucket/exact.txt").unwrap();
        assert_eq!(
            derive_destination(&o, &concrete, false).unwrap().path(),
            "exact.txt"
        );

        // Bucket destination gets the relative component at the root.
        let bucket = ObjectUrl::parse("s3://bucket").unwrap();
        assert_eq!(
            derive_destination(&o, &bucket, false).unwrap().path(),
            "x/y/z.txt"
        );
    }

    #[test]
    fn local_destination_derivation() {
        let mut o = Object::new(
            ObjectUrl::parse("s3://bucket/p/x/y.txt").unwrap(),
            ObjectKind::File,
        );
        o.relative = Some("x/y.txt".to_string());

        let dir = ObjectUrl::parse("out/").unwrap();
        assert_eq!(
            derive_destination(&o, &dir, false).unwrap().path(),
            "out/x/y.txt"
        );
        let dot = ObjectUrl::parse(".").unwrap();
        assert_eq!(derive_destination(&o, &dot, false).unwrap().path(), "x/y.txt");
        let file = ObjectUrl::parse("out.txt").unwrap();
        assert_eq!(derive_destination(&o, &file, false).unwrap().path(), "out.txt");
    }

    #[tokio::test]
    async fn cold_objects_are_guarded() {
        let mut cold = obj("s3://b/frozen.bin", 10, 100);
        cold.storage_class = Some(storage::StorageClass::Glacier);
        let warm = obj("s3://b/hot.bin", 10, 100);

        // Cold without force: skipped with a surfaced error.
        let waiter = Waiter::new();
        assert!(guard_cold_object(&cold, "cp", false, false, &waiter));
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 1);

        // Cold with warnings suppressed: skipped silently.
        let waiter = Waiter::new();
        assert!(guard_cold_object(&cold, "cp", false, true, &waiter));
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 0);

        // Forced, or not cold at all: not skipped.
        let waiter = Waiter::new();
        assert!(!guard_cold_object(&cold, "cp", true, false, &waiter));
        assert!(!guard_cold_object(&warm, "cp", false, false, &waiter));
        assert_eq!(waiter.wait().await.failed, 0);
    }

    #[test]
    fn filters_exclude_then_include() {
        let filters = Filters::compile(
            &["*.log".to_string()],
            &["*.txt".to_string(), "*.csv".to_string()],
        )
        .unwrap();
        assert!(filters.allows("a/b.txt"));
        assert!(filters.allows("data.csv"));
        assert!(!filters.allows("a/b.log"));
        assert!(!filters.allows("image.png"));

        let exclude_only = Filters::compile(&["tmp/*".to_string()], &[]).unwrap();
        assert!(exclude_only.allows("a/b.txt"));
        assert!(!exclude_only.allows("tmp/x"));
    }
}
