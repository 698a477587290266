//! `cat` and `pipe`: stream one object to stdout, or stdin to one object.

use std::sync::Arc;

use object_url::{ObjectUrl, UrlOptions};
use storage::OrderedWriter;

use crate::cli::CopyArgs;
use crate::error::Error;
use crate::log::InfoMessage;

use super::{parse_destination, part_size_bytes, put_metadata_from, App, Outcome};

pub async fn run_cat(
    app: &Arc<App>,
    concurrency: usize,
    part_size: u64,
    version_id: Option<String>,
    url: String,
) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse_with(
        &url,
        UrlOptions {
            raw: false,
            version_id,
            all_versions: false,
        },
    )?;
    if url.is_local() {
        return Err(Error::Usage("cat works on remote objects".to_string()));
    }
    if url.is_wildcard() || url.is_bucket() || url.is_prefix() {
        return Err(Error::Usage(
            "cat expects a single remote object".to_string(),
        ));
    }

    let client = app.client(None, Some(url.bucket()), None).await?;
    // Stdout is not seekable, so parts funnel through the ordered writer
    // and leave in offset order.
    let writer = OrderedWriter::new(tokio::io::stdout());
    client
        .get(
            &url,
            writer,
            concurrency,
            part_size_bytes(part_size),
            &app.cancel,
        )
        .await?;
    Ok(Outcome::ok())
}

pub async fn run_pipe(app: &Arc<App>, args: CopyArgs, dst: String) -> Result<Outcome, Error> {
    let dst_url = parse_destination(&dst, &args)?;
    if dst_url.is_local() {
        return Err(Error::Usage("pipe writes to a remote object".to_string()));
    }
    if dst_url.is_wildcard() || dst_url.is_bucket() || dst_url.is_prefix() {
        return Err(Error::Usage(
            "pipe expects a concrete remote object key".to_string(),
        ));
    }

    let retry_tweak =
        (args.no_such_upload_retry_count != 5).then_some(args.no_such_upload_retry_count);
    let client = app
        .client(
            args.destination_region.as_deref(),
            Some(dst_url.bucket()),
            retry_tweak,
        )
        .await?;
    let metadata = put_metadata_from(&args);
    if app.global.dry_run {
        app.logger
            .info(&InfoMessage::new("pipe", None, Some(dst_url.to_string())));
        return Ok(Outcome::ok());
    }
    client
        .put(
            tokio::io::stdin(),
            &dst_url,
            &metadata,
            args.concurrency,
            part_size_bytes(args.part_size),
            &app.cancel,
        )
        .await?;
    app.logger
        .info(&InfoMessage::new("pipe", None, Some(dst_url.to_string())));
    Ok(Outcome::ok())
}
