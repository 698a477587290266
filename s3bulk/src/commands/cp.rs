//! `cp` and `mv`: upload, download and server-side copy.

use std::sync::Arc;

use camino::Utf8Path;
use object_url::ObjectUrl;
use storage::{Object, ObjectKind, OrderedWriter, PutMetadata, S3Bucket, StorageError};
use tokio_util::sync::CancellationToken;

use crate::cli::CopyArgs;
use crate::error::{Error, JobError};
use crate::exec::Waiter;
use crate::expand::expand_source;
use crate::log::InfoMessage;

use super::{
    derive_destination, guard_cold_object, parse_destination, parse_operand, part_size_bytes,
    put_metadata_from, should_skip, App, Filters, Outcome, OverrideFlags,
};

pub async fn run(
    app: &Arc<App>,
    args: CopyArgs,
    src: String,
    dst: String,
    delete_source: bool,
) -> Result<Outcome, Error> {
    let op: &'static str = if delete_source { "mv" } else { "cp" };
    let src_url = parse_operand(&src, &args)?;
    let dst_url = parse_destination(&dst, &args)?;

    if src_url.is_local() && dst_url.is_local() {
        return Err(Error::Usage(
            "local to local copies are not supported".to_string(),
        ));
    }
    if dst_url.is_wildcard() {
        return Err(Error::Usage(format!(
            "destination {dst_url} cannot contain wildcards"
        )));
    }
    if src_url == dst_url {
        return Err(Error::Usage(
            "source and destination are the same".to_string(),
        ));
    }
    let dst_url = resolve_destination_shape(app, &src_url, dst_url)?;

    let filters = Filters::compile(&args.exclude, &args.include)?;
    let retry_tweak = (args.no_such_upload_retry_count != 5).then_some(args.no_such_upload_retry_count);
    let src_client = match src_url.is_remote() {
        true => Some(
            app.client(
                args.source_region.as_deref(),
                Some(src_url.bucket()),
                retry_tweak,
            )
            .await?,
        ),
        false => None,
    };
    let dst_client = match dst_url.is_remote() {
        true => Some(
            app.client(
                args.destination_region.as_deref(),
                Some(dst_url.bucket()),
                retry_tweak,
            )
            .await?,
        ),
        false => None,
    };

    let job = Arc::new(TransferJob {
        app: Arc::clone(app),
        src_client: src_client.clone(),
        dst_client,
        op,
        delete_source,
        flags: OverrideFlags::from_args(&args),
        metadata: put_metadata_from(&args),
        concurrency: args.concurrency,
        part_bytes: part_size_bytes(args.part_size),
        cancel: app.cancel.clone(),
    });

    let follow_symlinks = !args.no_follow_symlinks;
    let expansion_client = src_client
        .or_else(|| job.dst_client.clone())
        .expect("one side is always remote");
    let mut stream = expand_source(
        &expansion_client,
        &app.fs,
        follow_symlinks,
        &src_url,
        &app.cancel,
    );

    let waiter = Waiter::new();
    while let Some(result) = stream.recv().await {
        let obj = match result {
            Ok(obj) => obj,
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                waiter.record_error(JobError::new(op, err.into()).with_src(&src_url));
                continue;
            }
        };
        if obj.is_dir() {
            continue;
        }
        if obj.kind == ObjectKind::Symlink && !follow_symlinks {
            continue;
        }
        if !filters.allows(obj.url.path()) {
            continue;
        }
        if src_url.is_remote()
            && guard_cold_object(
                &obj,
                op,
                args.force_glacier_transfer,
                args.ignore_glacier_warnings,
                &waiter,
            )
        {
            continue;
        }

        let dest = match derive_destination(&obj, &dst_url, args.flatten) {
            Ok(dest) => dest,
            Err(err) => {
                waiter.record_error(JobError::new(op, err).with_src(&obj.url));
                continue;
            }
        };

        let job = Arc::clone(&job);
        let src_display = obj.url.to_string();
        let dst_display = dest.to_string();
        app.pool.run(&waiter, async move {
            job.transfer(obj, dest).await.map_err(|err| {
                JobError::new(job.op, err)
                    .with_src(&src_display)
                    .with_dst(&dst_display)
            })
        });
    }

    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    if app.global.stat {
        tracing::info!(
            op,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "command finished"
        );
    }
    Ok(Outcome {
        failed: summary.failed,
    })
}

/// A destination without a trailing separator still acts as a directory
/// when the source expands to multiple objects, or when it already is a
/// local directory.
fn resolve_destination_shape(
    app: &Arc<App>,
    src: &ObjectUrl,
    dst: ObjectUrl,
) -> Result<ObjectUrl, Error> {
    if dst.is_bucket() || dst.path().ends_with('/') {
        return Ok(dst);
    }
    let multiple_sources = src.is_wildcard()
        || src.is_prefix()
        || src.is_bucket()
        || (src.is_local() && matches!(app.fs.stat(src), Ok(obj) if obj.is_dir()));
    let local_dir = dst.is_local() && matches!(app.fs.stat(&dst), Ok(obj) if obj.is_dir());
    if multiple_sources || local_dir {
        let dir_form = format!("{}/", dst.absolute());
        return Ok(ObjectUrl::parse_with(
            &dir_form,
            object_url::UrlOptions {
                raw: dst.is_raw(),
                ..Default::default()
            },
        )?);
    }
    Ok(dst)
}

struct TransferJob {
    app: Arc<App>,
    src_client: Option<Arc<S3Bucket>>,
    dst_client: Option<Arc<S3Bucket>>,
    op: &'static str,
    delete_source: bool,
    flags: OverrideFlags,
    metadata: PutMetadata,
    concurrency: usize,
    part_bytes: u64,
    cancel: CancellationToken,
}

impl TransferJob {
    async fn transfer(&self, obj: Object, dest: ObjectUrl) -> Result<(), Error> {
        if self.skip_for_override(&obj, &dest).await? {
            return Ok(());
        }
        if self.app.global.dry_run {
            self.log_done(&obj, &dest);
            return Ok(());
        }
        match (obj.url.is_remote(), dest.is_remote()) {
            (false, true) => self.upload(&obj, &dest).await?,
            (true, false) => self.download(&obj, &dest).await?,
            (true, true) => self.server_copy(&obj, &dest).await?,
            (false, false) => {
                return Err(Error::Usage(
                    "local to local copies are not supported".to_string(),
                ))
            }
        }
        self.log_done(&obj, &dest);
        Ok(())
    }

    fn log_done(&self, obj: &Object, dest: &ObjectUrl) {
        self.app.logger.info(&InfoMessage::new(
            self.op,
            Some(obj.url.to_string()),
            Some(dest.to_string()),
        ));
    }

    /// Evaluates the sticky-skip decision against a stat of both sides.
    /// Returns true when the write should be skipped.
    async fn skip_for_override(&self, obj: &Object, dest: &ObjectUrl) -> Result<bool, Error> {
        if !self.flags.any() {
            return Ok(false);
        }
        let dst_obj = match self.stat_side(dest, self.dst_client.as_ref()).await {
            Ok(dst_obj) => dst_obj,
            Err(Error::Storage(err)) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        let src_obj = if obj.mod_time.is_some() {
            obj.clone()
        } else {
            self.stat_side(&obj.url, self.src_client.as_ref()).await?
        };
        if let Some(reason) = should_skip(&self.flags, &src_obj, &dst_obj) {
            tracing::debug!(src = %obj.url, dst = %dest, "skipped: {reason}");
            return Ok(true);
        }
        Ok(false)
    }

    async fn stat_side(
        &self,
        url: &ObjectUrl,
        client: Option<&Arc<S3Bucket>>,
    ) -> Result<Object, Error> {
        if url.is_remote() {
            let client = client.ok_or_else(|| {
                Error::Other(anyhow::anyhow!("missing remote client for {url}"))
            })?;
            Ok(client.stat(url).await?)
        } else {
            Ok(self.app.fs.stat(url)?)
        }
    }

    async fn upload(&self, obj: &Object, dest: &ObjectUrl) -> Result<(), Error> {
        let client = self.dst_client.as_ref().expect("upload has a remote side");
        let file = self.app.fs.open(obj.url.path()).await?;
        client
            .put(
                file,
                dest,
                &self.metadata,
                self.concurrency,
                self.part_bytes,
                &self.cancel,
            )
            .await?;
        if self.delete_source {
            self.app.fs.remove(obj.url.path()).await?;
        }
        Ok(())
    }

    async fn download(&self, obj: &Object, dest: &ObjectUrl) -> Result<(), Error> {
        let client = self.src_client.as_ref().expect("download has a remote side");
        let dest_path = Utf8Path::new(dest.path());
        let parent = match dest_path.parent() {
            Some(parent) if !parent.as_str().is_empty() => {
                self.app.fs.mkdir_all(parent).await?;
                parent.to_path_buf()
            }
            _ => camino::Utf8PathBuf::from("."),
        };

        // Write into a temporary file next to the target and rename into
        // place, so an interrupted download never leaves a partial object.
        // Dropping the temp file on the error path removes it.
        let temp = self.app.fs.create_temp(&parent)?;
        let file = tokio::fs::File::from_std(
            temp.as_file()
                .try_clone()
                .map_err(StorageError::Io)?,
        );
        let writer = OrderedWriter::new(file);
        client
            .get(&obj.url, writer, self.concurrency, self.part_bytes, &self.cancel)
            .await?;
        temp.persist(dest_path)
            .map_err(|err| StorageError::Io(err.error))?;

        if self.delete_source {
            client.delete(&obj.url, &self.cancel).await?;
        }
        Ok(())
    }

    async fn server_copy(&self, obj: &Object, dest: &ObjectUrl) -> Result<(), Error> {
        let client = self.dst_client.as_ref().expect("copy has a remote side");
        let src_url = obj
            .url
            .clone()
            .with_version(obj.version_id.clone().or_else(|| {
                obj.url.version_id().map(str::to_string)
            }));
        client
            .copy(&src_url, dest, &self.metadata, &self.cancel)
            .await?;
        if self.delete_source {
            let src_client = self.src_client.as_ref().expect("copy has a remote source");
            src_client.delete(&src_url, &self.cancel).await?;
        }
        Ok(())
    }
}
