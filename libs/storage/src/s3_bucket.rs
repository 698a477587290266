//! S3-compatible remote store built on the AWS SDK.
//!
//! One [`S3Bucket`] is constructed per command and is safe for concurrent
//! use. Enumerations stream into channels; transfers run ranged multipart
//! downloads and chunked multipart uploads; every mutating call short-circuits
//! to success under dry-run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CompletedMultipartUpload, CompletedPart,
    CompressionType, CreateBucketConfiguration, Delete, ExpressionType, InputSerialization,
    JsonInput, JsonOutput, JsonType, MetadataDirective, ObjectCannedAcl, ObjectIdentifier,
    OutputSerialization, RequestPayer, SelectObjectContentEventStream, ServerSideEncryption,
    VersioningConfiguration,
};
use aws_sdk_s3::Client;
use camino::Utf8PathBuf;
use object_url::ObjectUrl;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::ordered_writer::OrderedWriter;
use crate::{
    Object, ObjectKind, ObjectResult, ObjectStream, PutMetadata, StorageClass,
    LIST_CHANNEL_BUFFER, MAX_KEYS_PER_DELETE, MULTI_DELETE_CONCURRENCY,
};

/// Some providers race upload completion with part visibility; the
/// completion call is retried on `NoSuchUpload` after this pause.
const NO_SUCH_UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Applies the user-supplied headers to a put-like request builder. The
/// PutObject, CreateMultipartUpload and CopyObject builders are distinct
/// types with identical setters, hence the macro.
macro_rules! apply_put_metadata {
    ($builder:expr, $meta:expr, $content_type:expr) => {{
        let mut b = $builder.content_type($content_type);
        if let Some(v) = &$meta.storage_class {
            b = b.storage_class(aws_sdk_s3::types::StorageClass::from(v.as_str()));
        }
        if let Some(v) = &$meta.sse {
            b = b.server_side_encryption(ServerSideEncryption::from(v.as_str()));
        }
        if let Some(v) = &$meta.sse_kms_key_id {
            b = b.ssekms_key_id(v);
        }
        if let Some(v) = &$meta.acl {
            b = b.acl(ObjectCannedAcl::from(v.as_str()));
        }
        if let Some(v) = &$meta.cache_control {
            b = b.cache_control(v);
        }
        if let Some(v) = &$meta.expires {
            if let Ok(t) = humantime::parse_rfc3339(v) {
                b = b.expires(aws_smithy_types::DateTime::from(t));
            }
        }
        if let Some(v) = &$meta.content_encoding {
            b = b.content_encoding(v);
        }
        if let Some(v) = &$meta.content_disposition {
            b = b.content_disposition(v);
        }
        if !$meta.user_defined.is_empty() {
            b = b.set_metadata(Some($meta.user_defined.clone()));
        }
        b
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingStyle {
    /// Path style for custom endpoints, virtual-host otherwise.
    #[default]
    Auto,
    Path,
    Virtual,
}

/// Client construction knobs, resolved from flags and environment by the
/// caller.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub credentials_file: Option<Utf8PathBuf>,
    pub no_sign_request: bool,
    pub no_verify_ssl: bool,
    pub addressing_style: AddressingStyle,
    pub retry_count: u32,
    pub use_list_objects_v1: bool,
    pub request_payer: Option<String>,
    pub no_such_upload_retry_count: u32,
    pub dry_run: bool,
}

pub struct S3Bucket {
    client: Client,
    opts: S3Options,
    request_payer: Option<RequestPayer>,
}

impl S3Bucket {
    /// Builds the client: shared config (credentials chain, profile files,
    /// retry policy with jittered exponential backoff), endpoint and
    /// addressing style, then a region auto-detection probe when the bucket
    /// is known and no region was given.
    pub async fn new(opts: S3Options, bucket_hint: Option<&str>) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::v2024_03_28())
            .retry_config(RetryConfig::standard().with_max_attempts(opts.retry_count.max(1)));
        if let Some(region) = &opts.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &opts.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(file) = &opts.credentials_file {
            let files = aws_config::profile::profile_file::ProfileFiles::builder()
                .with_file(
                    aws_config::profile::profile_file::ProfileFileKind::Credentials,
                    file.as_std_path(),
                )
                .build();
            loader = loader.profile_files(files);
        }
        if opts.no_sign_request {
            loader = loader.no_credentials();
        }
        let sdk_config = loader.load().await;

        let mut client = build_client(&sdk_config, &opts, None);
        if opts.region.is_none() && sdk_config.region().is_none() {
            // Without any region the SDK cannot sign; probe the bucket's
            // region through a head-bucket call against the default
            // partition, falling back to us-east-1.
            let probe = build_client(&sdk_config, &opts, Some("us-east-1".to_string()));
            let region = match bucket_hint {
                Some(bucket) => detect_region(&probe, bucket)
                    .await
                    .unwrap_or_else(|| "us-east-1".to_string()),
                None => "us-east-1".to_string(),
            };
            tracing::debug!(%region, "resolved bucket region");
            client = build_client(&sdk_config, &opts, Some(region));
        }

        let request_payer = opts
            .request_payer
            .as_deref()
            .map(|payer| RequestPayer::from(payer));
        Ok(Self {
            client,
            opts,
            request_payer,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.opts.dry_run
    }

    pub async fn stat(&self, url: &ObjectUrl) -> Result<Object, StorageError> {
        let request = self
            .client
            .head_object()
            .bucket(url.bucket())
            .key(url.path())
            .set_version_id(url.version_id().map(str::to_string))
            .set_request_payer(self.request_payer.clone());
        match request.send().await {
            Ok(out) => {
                let mut obj = Object::new(url.clone(), ObjectKind::File);
                obj.size = out.content_length().unwrap_or(0).max(0) as u64;
                obj.mod_time = out
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok());
                obj.etag = out.e_tag().map(clean_etag);
                obj.storage_class = out
                    .storage_class()
                    .map(|sc| StorageClass::from_api(sc.as_str()));
                obj.version_id = out.version_id().map(str::to_string);
                Ok(obj)
            }
            Err(err) => {
                if let SdkError::ServiceError(ctx) = &err {
                    if matches!(ctx.err(), HeadObjectError::NotFound(_)) {
                        return Err(StorageError::NotFound {
                            path: url.absolute(),
                        });
                    }
                }
                Err(StorageError::from_sdk(err))
            }
        }
    }

    /// Paginated enumeration of a remote URL into a channel. Objects that
    /// appeared after the listing started are suppressed; a run that matched
    /// nothing ends with the no-object-found sentinel.
    pub fn list(self: &Arc<Self>, url: &ObjectUrl, cancel: &CancellationToken) -> ObjectStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_BUFFER);
        let this = Arc::clone(self);
        let url = url.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut emitted = false;
            let result = if url.all_versions() {
                this.list_versions(&url, &tx, &cancel, &mut emitted).await
            } else if this.opts.use_list_objects_v1 {
                this.list_v1(&url, &tx, &cancel, &mut emitted).await
            } else {
                this.list_v2(&url, &tx, &cancel, &mut emitted).await
            };
            match result {
                Ok(()) if !emitted => {
                    let _ = tx.send(Err(StorageError::NoObjectFound)).await;
                }
                Ok(()) => {}
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });
        rx
    }

    async fn list_v2(
        &self,
        url: &ObjectUrl,
        tx: &mpsc::Sender<ObjectResult>,
        cancel: &CancellationToken,
        emitted: &mut bool,
    ) -> Result<(), StorageError> {
        let start = SystemTime::now();
        let delimiter = non_empty(url.delimiter());
        let mut continuation: Option<String> = None;
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(url.bucket())
                .prefix(url.prefix())
                .set_delimiter(delimiter.clone())
                .set_continuation_token(continuation.clone())
                .set_request_payer(self.request_payer.clone());
            let response = tokio::select! {
                response = request.send() => response.map_err(StorageError::from_sdk)?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };

            for prefix in response.common_prefixes() {
                let Some(p) = prefix.prefix() else { continue };
                self.emit_dir(url, p, tx, emitted).await;
            }
            for content in response.contents() {
                let Some(key) = content.key() else { continue };
                let mod_time = content
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok());
                if observed_after(mod_time, start) {
                    continue;
                }
                let Some(rel) = url.match_key(key) else { continue };
                let mut obj = Object::new(
                    ObjectUrl::remote_object(url.bucket(), key),
                    ObjectKind::File,
                );
                obj.size = content.size().unwrap_or(0).max(0) as u64;
                obj.mod_time = mod_time;
                obj.etag = content.e_tag().map(clean_etag);
                obj.storage_class = content
                    .storage_class()
                    .map(|sc| StorageClass::from_api(sc.as_str()));
                obj.relative = Some(rel);
                if tx.send(Ok(obj)).await.is_err() {
                    return Ok(());
                }
                *emitted = true;
            }

            continuation = match response.next_continuation_token() {
                Some(token) => Some(token.to_string()),
                None => break,
            };
        }
        Ok(())
    }

    /// Legacy list dialect for services without ListObjectsV2.
    async fn list_v1(
        &self,
        url: &ObjectUrl,
        tx: &mpsc::Sender<ObjectResult>,
        cancel: &CancellationToken,
        emitted: &mut bool,
    ) -> Result<(), StorageError> {
        let start = SystemTime::now();
        let delimiter = non_empty(url.delimiter());
        let mut marker: Option<String> = None;
        loop {
            let request = self
                .client
                .list_objects()
                .bucket(url.bucket())
                .prefix(url.prefix())
                .set_delimiter(delimiter.clone())
                .set_marker(marker.clone())
                .set_request_payer(self.request_payer.clone());
            let response = tokio::select! {
                response = request.send() => response.map_err(StorageError::from_sdk)?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };

            for prefix in response.common_prefixes() {
                let Some(p) = prefix.prefix() else { continue };
                self.emit_dir(url, p, tx, emitted).await;
            }
            let mut last_key = None;
            for content in response.contents() {
                let Some(key) = content.key() else { continue };
                last_key = Some(key.to_string());
                let mod_time = content
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok());
                if observed_after(mod_time, start) {
                    continue;
                }
                let Some(rel) = url.match_key(key) else { continue };
                let mut obj = Object::new(
                    ObjectUrl::remote_object(url.bucket(), key),
                    ObjectKind::File,
                );
                obj.size = content.size().unwrap_or(0).max(0) as u64;
                obj.mod_time = mod_time;
                obj.etag = content.e_tag().map(clean_etag);
                obj.storage_class = content
                    .storage_class()
                    .map(|sc| StorageClass::from_api(sc.as_str()));
                obj.relative = Some(rel);
                if tx.send(Ok(obj)).await.is_err() {
                    return Ok(());
                }
                *emitted = true;
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            marker = response
                .next_marker()
                .map(str::to_string)
                .or(last_key);
            if marker.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn list_versions(
        &self,
        url: &ObjectUrl,
        tx: &mpsc::Sender<ObjectResult>,
        cancel: &CancellationToken,
        emitted: &mut bool,
    ) -> Result<(), StorageError> {
        let start = SystemTime::now();
        let delimiter = non_empty(url.delimiter());
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let request = self
                .client
                .list_object_versions()
                .bucket(url.bucket())
                .prefix(url.prefix())
                .set_delimiter(delimiter.clone())
                .set_key_marker(key_marker.clone())
                .set_version_id_marker(version_marker.clone())
                .set_request_payer(self.request_payer.clone());
            let response = tokio::select! {
                response = request.send() => response.map_err(StorageError::from_sdk)?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };

            for prefix in response.common_prefixes() {
                let Some(p) = prefix.prefix() else { continue };
                self.emit_dir(url, p, tx, emitted).await;
            }
            for version in response.versions() {
                let Some(key) = version.key() else { continue };
                let mod_time = version
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok());
                if observed_after(mod_time, start) {
                    continue;
                }
                let Some(rel) = url.match_key(key) else { continue };
                let mut obj = Object::new(
                    ObjectUrl::remote_object(url.bucket(), key),
                    ObjectKind::File,
                );
                obj.size = version.size().unwrap_or(0).max(0) as u64;
                obj.mod_time = mod_time;
                obj.etag = version.e_tag().map(clean_etag);
                obj.version_id = version.version_id().map(str::to_string);
                obj.relative = Some(rel);
                if tx.send(Ok(obj)).await.is_err() {
                    return Ok(());
                }
                *emitted = true;
            }
            for marker in response.delete_markers() {
                let Some(key) = marker.key() else { continue };
                let Some(rel) = url.match_key(key) else { continue };
                let mut obj = Object::new(
                    ObjectUrl::remote_object(url.bucket(), key),
                    ObjectKind::File,
                );
                obj.mod_time = marker
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok());
                obj.version_id = marker.version_id().map(str::to_string);
                obj.relative = Some(rel);
                if tx.send(Ok(obj)).await.is_err() {
                    return Ok(());
                }
                *emitted = true;
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = response.next_key_marker().map(str::to_string);
            version_marker = response.next_version_id_marker().map(str::to_string);
            if key_marker.is_none() && version_marker.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn emit_dir(
        &self,
        url: &ObjectUrl,
        prefix: &str,
        tx: &mpsc::Sender<ObjectResult>,
        emitted: &mut bool,
    ) {
        let Some(rel) = url.match_key(prefix) else {
            return;
        };
        let mut obj = Object::new(ObjectUrl::remote_object(url.bucket(), prefix), ObjectKind::Dir);
        obj.relative = Some(rel);
        if tx.send(Ok(obj)).await.is_ok() {
            *emitted = true;
        }
    }

    /// Ranged multipart download. `concurrency` parts of `part_size` bytes
    /// are fetched in parallel and written through the ordered writer, which
    /// forwards them downstream in offset order. The first part failure
    /// cancels the remaining fetches.
    pub async fn get<W>(
        &self,
        url: &ObjectUrl,
        writer: OrderedWriter<W>,
        concurrency: usize,
        part_size: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError>
    where
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let total = self.stat(url).await?.size;
        let writer = Arc::new(writer);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let child = cancel.child_token();
        let mut tasks: JoinSet<Result<(), StorageError>> = JoinSet::new();

        for (offset, len) in part_ranges(total, part_size.max(1)) {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("download semaphore never closes")
                }
                _ = child.cancelled() => break,
            };
            let client = self.client.clone();
            let bucket = url.bucket().to_string();
            let key = url.path().to_string();
            let version_id = url.version_id().map(str::to_string);
            let payer = self.request_payer.clone();
            let writer = Arc::clone(&writer);
            let child = child.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = fetch_part(
                    client, bucket, key, version_id, payer, offset, len, writer, &child,
                )
                .await;
                if result.is_err() {
                    child.cancel();
                }
                result
            });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    child.cancel();
                    first_err.get_or_insert(err);
                }
                Err(join_err) => {
                    child.cancel();
                    first_err.get_or_insert(StorageError::Fatal(format!(
                        "download worker panicked: {join_err}"
                    )));
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let writer = Arc::try_unwrap(writer)
            .map_err(|_| StorageError::Fatal("download writer still shared".to_string()))?;
        writer.finish(total).await?;
        Ok(total)
    }

    /// Uploads a reader. Inputs smaller than one part go through a single
    /// PutObject; anything else takes the multipart path with buffered parts,
    /// which also covers pipes of unknown length.
    pub async fn put<R>(
        &self,
        mut reader: R,
        url: &ObjectUrl,
        metadata: &PutMetadata,
        concurrency: usize,
        part_size: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.opts.dry_run {
            return Ok(());
        }
        let part_size = part_size.max(1) as usize;
        let first = read_chunk(&mut reader, part_size).await?;
        if first.len() < part_size {
            return self.put_single(first, url, metadata, cancel).await;
        }

        let content_type = metadata.guess_content_type(url.path());
        let create = apply_put_metadata!(
            self.client.create_multipart_upload(),
            metadata,
            content_type
        )
        .bucket(url.bucket())
        .key(url.path())
        .set_request_payer(self.request_payer.clone());
        let created = tokio::select! {
            created = create.send() => created.map_err(StorageError::from_sdk)?,
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Fatal("create-multipart returned no upload id".into()))?
            .to_string();

        match self
            .put_parts(reader, first, url, &upload_id, concurrency, part_size, cancel)
            .await
        {
            Ok(parts) => self.complete_upload(url, &upload_id, parts, cancel).await,
            Err(err) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(url.bucket())
                    .key(url.path())
                    .upload_id(&upload_id)
                    .set_request_payer(self.request_payer.clone());
                if let Err(abort_err) = abort.send().await {
                    tracing::debug!("abort of upload {upload_id} failed: {abort_err}");
                }
                Err(err)
            }
        }
    }

    async fn put_single(
        &self,
        body: Vec<u8>,
        url: &ObjectUrl,
        metadata: &PutMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let content_type = metadata.guess_content_type(url.path());
        let request = apply_put_metadata!(self.client.put_object(), metadata, content_type)
            .bucket(url.bucket())
            .key(url.path())
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .set_request_payer(self.request_payer.clone());
        tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk).map(|_| ()),
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
        }
    }

    async fn put_parts<R>(
        &self,
        mut reader: R,
        first: Vec<u8>,
        url: &ObjectUrl,
        upload_id: &str,
        concurrency: usize,
        part_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let child = cancel.child_token();
        let mut tasks: JoinSet<Result<CompletedPart, StorageError>> = JoinSet::new();
        let mut chunk = first;
        let mut part_number = 0i32;

        loop {
            if chunk.is_empty() {
                break;
            }
            let is_last = chunk.len() < part_size;
            part_number += 1;
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("upload semaphore never closes")
                }
                _ = child.cancelled() => return Err(StorageError::Cancelled),
            };
            let client = self.client.clone();
            let bucket = url.bucket().to_string();
            let key = url.path().to_string();
            let upload_id = upload_id.to_string();
            let payer = self.request_payer.clone();
            let body = std::mem::take(&mut chunk);
            let task_cancel = child.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = upload_part(
                    client, bucket, key, upload_id, part_number, body, payer, &task_cancel,
                )
                .await;
                if result.is_err() {
                    task_cancel.cancel();
                }
                result
            });
            if is_last {
                break;
            }
            chunk = read_chunk(&mut reader, part_size).await?;
        }

        let mut parts = Vec::with_capacity(part_number as usize);
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(err)) => {
                    child.cancel();
                    first_err.get_or_insert(err);
                }
                Err(join_err) => {
                    child.cancel();
                    first_err.get_or_insert(StorageError::Fatal(format!(
                        "upload worker panicked: {join_err}"
                    )));
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        parts.sort_by_key(|part| part.part_number());
        Ok(parts)
    }

    async fn complete_upload(
        &self,
        url: &ObjectUrl,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let mut attempts = 0u32;
        loop {
            let request = self
                .client
                .complete_multipart_upload()
                .bucket(url.bucket())
                .key(url.path())
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts.clone()))
                        .build(),
                )
                .set_request_payer(self.request_payer.clone());
            let result = tokio::select! {
                result = request.send() => result,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };
            match result {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if err.code() == Some("NoSuchUpload")
                        && attempts < self.opts.no_such_upload_retry_count
                    {
                        attempts += 1;
                        tracing::debug!(
                            upload_id,
                            attempts,
                            "completion raced part visibility, retrying"
                        );
                        tokio::time::sleep(NO_SUCH_UPLOAD_RETRY_DELAY).await;
                        continue;
                    }
                    return Err(StorageError::from_sdk(err));
                }
            }
        }
    }

    /// Server-side copy. The copy source quotes each path segment so keys
    /// with reserved characters survive, and addresses a version when the
    /// source URL has one.
    pub async fn copy(
        &self,
        src: &ObjectUrl,
        dst: &ObjectUrl,
        metadata: &PutMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        let mut request = self
            .client
            .copy_object()
            .bucket(dst.bucket())
            .key(dst.path())
            .copy_source(copy_source(src))
            .set_request_payer(self.request_payer.clone());
        if metadata.has_overrides() {
            let content_type = metadata.guess_content_type(dst.path());
            request = apply_put_metadata!(request, metadata, content_type)
                .metadata_directive(MetadataDirective::Replace);
        }
        tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk).map(|_| ()),
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
        }
    }

    pub async fn delete(
        &self,
        url: &ObjectUrl,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        let request = self
            .client
            .delete_object()
            .bucket(url.bucket())
            .key(url.path())
            .set_version_id(url.version_id().map(str::to_string))
            .set_request_payer(self.request_payer.clone());
        tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk).map(|_| ()),
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
        }
    }

    /// Batches incoming URLs into DeleteObjects chunks of at most 1000 keys
    /// per bucket, runs up to ten chunk requests in flight and emits one
    /// result per key, in no particular order.
    pub fn multi_delete(
        self: &Arc<Self>,
        mut urls: mpsc::Receiver<ObjectUrl>,
        cancel: &CancellationToken,
    ) -> ObjectStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_BUFFER);
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(MULTI_DELETE_CONCURRENCY));
            let mut tasks = JoinSet::new();
            let mut batcher = ChunkBatcher::new(MAX_KEYS_PER_DELETE);
            loop {
                let next = tokio::select! {
                    next = urls.recv() => next,
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(StorageError::Cancelled)).await;
                        return;
                    }
                };
                match next {
                    Some(url) => {
                        if let Some(chunk) = batcher.push(url) {
                            this.spawn_delete_chunk(&mut tasks, &semaphore, &tx, &cancel, chunk)
                                .await;
                        }
                    }
                    None => break,
                }
            }
            for chunk in batcher.flush() {
                this.spawn_delete_chunk(&mut tasks, &semaphore, &tx, &cancel, chunk)
                    .await;
            }
            while tasks.join_next().await.is_some() {}
        });
        rx
    }

    async fn spawn_delete_chunk(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<ObjectResult>,
        cancel: &CancellationToken,
        chunk: DeleteChunk,
    ) {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let this = Arc::clone(self);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            this.delete_chunk(chunk, &tx, &cancel).await;
        });
    }

    async fn delete_chunk(
        &self,
        chunk: DeleteChunk,
        tx: &mpsc::Sender<ObjectResult>,
        cancel: &CancellationToken,
    ) {
        if self.opts.dry_run {
            for url in chunk.urls {
                let _ = tx.send(Ok(Object::new(url, ObjectKind::File))).await;
            }
            return;
        }

        let mut by_key: HashMap<String, ObjectUrl> = HashMap::with_capacity(chunk.urls.len());
        let mut identifiers = Vec::with_capacity(chunk.urls.len());
        for url in chunk.urls {
            let identifier = ObjectIdentifier::builder()
                .key(url.path())
                .set_version_id(url.version_id().map(str::to_string))
                .build();
            match identifier {
                Ok(identifier) => {
                    by_key.insert(url.path().to_string(), url);
                    identifiers.push(identifier);
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(StorageError::Fatal(format!(
                            "building delete entry for {url}: {err}"
                        ))))
                        .await;
                }
            }
        }
        if identifiers.is_empty() {
            return;
        }

        let delete = match Delete::builder().set_objects(Some(identifiers)).build() {
            Ok(delete) => delete,
            Err(err) => {
                let _ = tx
                    .send(Err(StorageError::Fatal(format!(
                        "building delete request: {err}"
                    ))))
                    .await;
                return;
            }
        };
        let request = self
            .client
            .delete_objects()
            .bucket(&chunk.bucket)
            .delete(delete)
            .set_request_payer(self.request_payer.clone());
        let response = tokio::select! {
            response = request.send() => response,
            _ = cancel.cancelled() => {
                let _ = tx.send(Err(StorageError::Cancelled)).await;
                return;
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let _ = tx.send(Err(StorageError::from_sdk(err))).await;
                return;
            }
        };

        for deleted in response.deleted() {
            let Some(key) = deleted.key() else { continue };
            if let Some(url) = by_key.remove(key) {
                let _ = tx.send(Ok(Object::new(url, ObjectKind::File))).await;
            }
        }
        for err in response.errors() {
            let _ = tx
                .send(Err(StorageError::Remote(crate::error::RemoteError {
                    code: err.code().map(str::to_string),
                    status: None,
                    message: format!(
                        "delete {}: {}",
                        err.key().unwrap_or(""),
                        err.message().unwrap_or("unknown error")
                    ),
                })))
                .await;
        }
    }

    /// Time-limited GET URL for the object (and version) the URL addresses.
    pub async fn presign(
        &self,
        url: &ObjectUrl,
        expire: Duration,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(expire)
            .map_err(|err| StorageError::Fatal(err.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(url.bucket())
            .key(url.path())
            .set_version_id(url.version_id().map(str::to_string))
            .set_request_payer(self.request_payer.clone())
            .presigned(config)
            .await
            .map_err(StorageError::from_sdk)?;
        Ok(presigned.uri().to_string())
    }

    /// Server-side SELECT over one object. Record payload events are
    /// concatenated and decoded as JSON lines, one record per channel send.
    pub fn select(
        self: &Arc<Self>,
        url: &ObjectUrl,
        query: &str,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<Result<serde_json::Value, StorageError>> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_BUFFER);
        let this = Arc::clone(self);
        let url = url.clone();
        let query = query.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_select(&url, &query, &tx, &cancel).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    async fn run_select(
        &self,
        url: &ObjectUrl,
        query: &str,
        tx: &mpsc::Sender<Result<serde_json::Value, StorageError>>,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let request = self
            .client
            .select_object_content()
            .bucket(url.bucket())
            .key(url.path())
            .expression(query)
            .expression_type(ExpressionType::Sql)
            .input_serialization(
                InputSerialization::builder()
                    .json(JsonInput::builder().r#type(JsonType::Lines).build())
                    .compression_type(CompressionType::None)
                    .build(),
            )
            .output_serialization(
                OutputSerialization::builder()
                    .json(JsonOutput::builder().record_delimiter("\n").build())
                    .build(),
            );
        let response = tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk)?,
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };

        let mut payload = response.payload;
        let mut buffer = Vec::new();
        loop {
            let event = tokio::select! {
                event = payload.recv() => event,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };
            match event {
                Ok(Some(SelectObjectContentEventStream::Records(records))) => {
                    if let Some(blob) = records.payload() {
                        buffer.extend_from_slice(blob.as_ref());
                        drain_select_records(&mut buffer, tx).await?;
                    }
                }
                Ok(Some(SelectObjectContentEventStream::End(_))) | Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(err) => {
                    return Err(StorageError::Fatal(format!("select stream: {err}")));
                }
            }
        }
        // The stream may end without a trailing newline.
        if !buffer.is_empty() {
            drain_final_record(&mut buffer, tx).await?;
        }
        Ok(())
    }

    pub async fn list_multipart_uploads(
        &self,
        url: &ObjectUrl,
        cancel: &CancellationToken,
    ) -> Result<Vec<MultipartUploadInfo>, StorageError> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let request = self
                .client
                .list_multipart_uploads()
                .bucket(url.bucket())
                .prefix(url.prefix())
                .set_key_marker(key_marker.clone())
                .set_upload_id_marker(upload_id_marker.clone())
                .set_request_payer(self.request_payer.clone());
            let response = tokio::select! {
                response = request.send() => response.map_err(StorageError::from_sdk)?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };
            for upload in response.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                uploads.push(MultipartUploadInfo {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    initiated: upload
                        .initiated()
                        .and_then(|t| SystemTime::try_from(*t).ok()),
                });
            }
            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = response.next_key_marker().map(str::to_string);
            upload_id_marker = response.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }
        Ok(uploads)
    }

    pub async fn list_parts(
        &self,
        url: &ObjectUrl,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PartInfo>, StorageError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let request = self
                .client
                .list_parts()
                .bucket(url.bucket())
                .key(url.path())
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .set_request_payer(self.request_payer.clone());
            let response = tokio::select! {
                response = request.send() => response.map_err(StorageError::from_sdk)?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };
            for part in response.parts() {
                parts.push(PartInfo {
                    part_number: part.part_number().unwrap_or(0),
                    size: part.size().unwrap_or(0).max(0) as u64,
                    etag: part.e_tag().map(clean_etag),
                    last_modified: part
                        .last_modified()
                        .and_then(|t| SystemTime::try_from(*t).ok()),
                });
            }
            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            marker = response.next_part_number_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(parts)
    }

    pub async fn abort_upload(
        &self,
        url: &ObjectUrl,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(url.bucket())
            .key(url.path())
            .upload_id(upload_id)
            .set_request_payer(self.request_payer.clone());
        tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk).map(|_| ()),
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
        }
    }

    pub async fn list_buckets(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<BucketInfo>, StorageError> {
        let request = self.client.list_buckets();
        let response = tokio::select! {
            response = request.send() => response.map_err(StorageError::from_sdk)?,
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };
        Ok(response
            .buckets()
            .iter()
            .filter_map(|bucket| {
                Some(BucketInfo {
                    name: bucket.name()?.to_string(),
                    created: bucket
                        .creation_date()
                        .and_then(|t| SystemTime::try_from(*t).ok()),
                })
            })
            .collect())
    }

    /// Existence and access probe for a bucket.
    pub async fn head_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                if let SdkError::ServiceError(ctx) = &err {
                    if ctx.raw().status().as_u16() == 404 {
                        return Err(StorageError::NotFound {
                            path: format!("s3://{bucket}"),
                        });
                    }
                }
                Err(StorageError::from_sdk(err))
            }
        }
    }

    pub async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        let mut request = self.client.create_bucket().bucket(bucket);
        if let Some(region) = self.client.config().region().map(|r| r.to_string()) {
            if region != "us-east-1" {
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(region.as_str()))
                        .build(),
                );
            }
        }
        request
            .send()
            .await
            .map_err(StorageError::from_sdk)
            .map(|_| ())
    }

    pub async fn remove_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(StorageError::from_sdk)
            .map(|_| ())
    }

    /// Versioning status of the bucket: `Enabled`, `Suspended`, or unset
    /// when versioning has never been configured.
    pub async fn bucket_versioning(&self, bucket: &str) -> Result<Option<String>, StorageError> {
        let response = self
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(StorageError::from_sdk)?;
        Ok(response.status().map(|status| status.as_str().to_string()))
    }

    pub async fn set_bucket_versioning(
        &self,
        bucket: &str,
        enabled: bool,
    ) -> Result<(), StorageError> {
        if self.opts.dry_run {
            return Ok(());
        }
        let status = if enabled {
            BucketVersioningStatus::Enabled
        } else {
            BucketVersioningStatus::Suspended
        };
        self.client
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(VersioningConfiguration::builder().status(status).build())
            .send()
            .await
            .map_err(StorageError::from_sdk)
            .map(|_| ())
    }
}

/// One in-progress multipart upload, as reported by the store.
#[derive(Debug, Clone)]
pub struct MultipartUploadInfo {
    pub key: String,
    pub upload_id: String,
    pub initiated: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct PartInfo {
    pub part_number: i32,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct BucketInfo {
    pub name: String,
    pub created: Option<SystemTime>,
}

fn build_client(
    sdk_config: &aws_config::SdkConfig,
    opts: &S3Options,
    region_override: Option<String>,
) -> Client {
    let mut builder = S3ConfigBuilder::from(sdk_config);
    if let Some(endpoint) = &opts.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    let force_path_style = match opts.addressing_style {
        AddressingStyle::Path => true,
        AddressingStyle::Virtual => false,
        AddressingStyle::Auto => opts.endpoint_url.is_some(),
    };
    builder = builder.force_path_style(force_path_style);
    if let Some(region) = region_override {
        builder = builder.region(Region::new(region));
    }
    if opts.no_verify_ssl {
        builder = builder.http_client(crate::tls::insecure_http_client());
    }
    Client::from_conf(builder.build())
}

/// HeadBucket reports the bucket's region even on redirect responses, via
/// the `x-amz-bucket-region` header.
async fn detect_region(client: &Client, bucket: &str) -> Option<String> {
    match client.head_bucket().bucket(bucket).send().await {
        Ok(out) => out.bucket_region().map(str::to_string),
        Err(err) => match &err {
            SdkError::ServiceError(ctx) => ctx
                .raw()
                .headers()
                .get("x-amz-bucket-region")
                .map(str::to_string),
            _ => None,
        },
    }
}

fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn observed_after(mod_time: Option<SystemTime>, start: SystemTime) -> bool {
    mod_time.map(|t| t > start).unwrap_or(false)
}

/// Byte ranges of a multipart download: `part_size` slices covering
/// `[0, total)`.
fn part_ranges(total: u64, part_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < total {
        let len = part_size.min(total - offset);
        ranges.push((offset, len));
        offset += len;
    }
    ranges
}

/// URL-quotes each path segment of `bucket/key` and appends the version
/// query when the source addresses one.
fn copy_source(src: &ObjectUrl) -> String {
    let mut quoted = urlencoding::encode(src.bucket()).into_owned();
    for segment in src.path().split('/') {
        quoted.push('/');
        quoted.push_str(&urlencoding::encode(segment));
    }
    if let Some(version) = src.version_id() {
        quoted.push_str("?versionId=");
        quoted.push_str(version);
    }
    quoted
}

#[allow(clippy::too_many_arguments)]
async fn fetch_part<W>(
    client: Client,
    bucket: String,
    key: String,
    version_id: Option<String>,
    payer: Option<RequestPayer>,
    offset: u64,
    len: u64,
    writer: Arc<OrderedWriter<W>>,
    cancel: &CancellationToken,
) -> Result<(), StorageError>
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    let range = format!("bytes={}-{}", offset, offset + len - 1);
    let request = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .range(range)
        .set_version_id(version_id)
        .set_request_payer(payer);
    let response = tokio::select! {
        response = request.send() => response.map_err(StorageError::from_sdk)?,
        _ = cancel.cancelled() => return Err(StorageError::Cancelled),
    };
    let body = tokio::select! {
        body = response.body.collect() => {
            body.map_err(|err| StorageError::Fatal(format!("reading part body: {err}")))?
        }
        _ = cancel.cancelled() => return Err(StorageError::Cancelled),
    };
    writer.write_at(offset, body.into_bytes()).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_part(
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    body: Vec<u8>,
    payer: Option<RequestPayer>,
    cancel: &CancellationToken,
) -> Result<CompletedPart, StorageError> {
    let request = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .part_number(part_number)
        .content_length(body.len() as i64)
        .body(ByteStream::from(body))
        .set_request_payer(payer);
    let response = tokio::select! {
        response = request.send() => response.map_err(StorageError::from_sdk)?,
        _ = cancel.cancelled() => return Err(StorageError::Cancelled),
    };
    Ok(CompletedPart::builder()
        .part_number(part_number)
        .set_e_tag(response.e_tag().map(str::to_string))
        .build())
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    size: usize,
) -> Result<Vec<u8>, StorageError> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn drain_select_records(
    buffer: &mut Vec<u8>,
    tx: &mpsc::Sender<Result<serde_json::Value, StorageError>>,
) -> Result<(), StorageError> {
    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline).collect();
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_slice(line)
            .map_err(|err| StorageError::Fatal(format!("decoding select record: {err}")))?;
        if tx.send(Ok(record)).await.is_err() {
            return Err(StorageError::Cancelled);
        }
    }
    Ok(())
}

async fn drain_final_record(
    buffer: &mut Vec<u8>,
    tx: &mpsc::Sender<Result<serde_json::Value, StorageError>>,
) -> Result<(), StorageError> {
    let record = serde_json::from_slice(buffer)
        .map_err(|err| StorageError::Fatal(format!("decoding select record: {err}")))?;
    buffer.clear();
    if tx.send(Ok(record)).await.is_err() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

struct DeleteChunk {
    bucket: String,
    urls: Vec<ObjectUrl>,
}

/// Groups URLs into per-bucket chunks capped at the multi-delete key limit.
struct ChunkBatcher {
    limit: usize,
    pending: HashMap<String, Vec<ObjectUrl>>,
}

impl ChunkBatcher {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: HashMap::new(),
        }
    }

    fn push(&mut self, url: ObjectUrl) -> Option<DeleteChunk> {
        let bucket = url.bucket().to_string();
        let urls = self.pending.entry(bucket.clone()).or_default();
        urls.push(url);
        if urls.len() >= self.limit {
            let urls = std::mem::take(urls);
            Some(DeleteChunk { bucket, urls })
        } else {
            None
        }
    }

    fn flush(&mut self) -> Vec<DeleteChunk> {
        self.pending
            .drain()
            .filter(|(_, urls)| !urls.is_empty())
            .map(|(bucket, urls)| DeleteChunk { bucket, urls })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_ranges_cover_exactly() {
        assert_eq!(part_ranges(0, 16), vec![]);
        assert_eq!(part_ranges(10, 16), vec![(0, 10)]);
        assert_eq!(part_ranges(16, 16), vec![(0, 16)]);
        assert_eq!(part_ranges(40, 16), vec![(0, 16), (16, 16), (32, 8)]);
    }

    #[test]
    fn copy_source_quotes_segments() {
        let src = ObjectUrl::parse("s3://my-bucket/dir with space/a+b.txt").unwrap();
        assert_eq!(
            copy_source(&src),
            "my-bucket/dir%20with%20space/a%2Bb.txt"
        );
    }

    #[test]
    fn copy_source_appends_version() {
        let src = ObjectUrl::parse("s3://b/key.txt?versionId=v1").unwrap();
        assert_eq!(copy_source(&src), "b/key.txt?versionId=v1");
    }

    #[test]
    fn chunk_batcher_boundaries() {
        let mut batcher = ChunkBatcher::new(1000);
        let mut chunks = Vec::new();
        for i in 0..1000 {
            if let Some(chunk) = batcher.push(ObjectUrl::remote_object("b", &format!("k{i}"))) {
                chunks.push(chunk);
            }
        }
        chunks.extend(batcher.flush());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].urls.len(), 1000);

        let mut batcher = ChunkBatcher::new(1000);
        let mut chunks = Vec::new();
        for i in 0..1001 {
            if let Some(chunk) = batcher.push(ObjectUrl::remote_object("b", &format!("k{i}"))) {
                chunks.push(chunk);
            }
        }
        chunks.extend(batcher.flush());
        assert_eq!(chunks.len(), 2);
        let mut sizes: Vec<usize> = chunks.iter().map(|c| c.urls.len()).collect();
        sizes.sort();
        assert_eq!(sizes, [1, 1000]);
    }

    #[test]
    fn chunk_batcher_splits_per_bucket() {
        let mut batcher = ChunkBatcher::new(2);
        assert!(batcher.push(ObjectUrl::remote_object("a", "k1")).is_none());
        assert!(batcher.push(ObjectUrl::remote_object("b", "k1")).is_none());
        let chunk = batcher.push(ObjectUrl::remote_object("a", "k2")).unwrap();
        assert_eq!(chunk.bucket, "a");
        assert_eq!(chunk.urls.len(), 2);
        let rest = batcher.flush();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].bucket, "b");
    }

    #[test]
    fn etag_quotes_are_trimmed() {
        assert_eq!(clean_etag("\"abc123\""), "abc123");
        assert_eq!(clean_etag("abc123"), "abc123");
    }
}
