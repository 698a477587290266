//! `ls` and `du`.

use std::collections::BTreeMap;
use std::sync::Arc;

use object_url::{ObjectUrl, UrlOptions};

use crate::error::{Error, JobError};
use crate::exec::Waiter;
use crate::log::{format_time, ListMessage, SizeMessage};

use super::{App, Outcome};

pub async fn run_ls(
    app: &Arc<App>,
    show_etag: bool,
    humanize: bool,
    all_versions: bool,
    url: Option<String>,
) -> Result<Outcome, Error> {
    let Some(url) = url else {
        return list_buckets(app).await;
    };
    let url = ObjectUrl::parse_with(
        &url,
        UrlOptions {
            raw: false,
            version_id: None,
            all_versions,
        },
    )?;
    if url.is_local() {
        return Err(Error::Usage("ls works on remote urls".to_string()));
    }

    let client = app.client(None, Some(url.bucket()), None).await?;
    let waiter = Waiter::new();
    let mut stream = client.list(&url, &app.cancel);
    while let Some(result) = stream.recv().await {
        match result {
            Ok(obj) => {
                app.logger.info(&ListMessage {
                    mod_time: format_time(obj.mod_time),
                    is_dir: obj.is_dir(),
                    size: obj.size,
                    etag: obj.etag.clone(),
                    version_id: obj.version_id.clone(),
                    name: obj.relative_or_base(),
                    humanize,
                    show_etag,
                });
            }
            Err(err) if err.is_cancelled() => break,
            Err(err) => waiter.record_error(JobError::new("ls", err.into()).with_src(&url)),
        }
    }
    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    Ok(Outcome {
        failed: summary.failed,
    })
}

async fn list_buckets(app: &Arc<App>) -> Result<Outcome, Error> {
    let client = app.client(None, None, None).await?;
    let buckets = client.list_buckets(&app.cancel).await?;
    for bucket in buckets {
        app.logger.info(&ListMessage {
            mod_time: format_time(bucket.created),
            is_dir: false,
            size: 0,
            etag: None,
            version_id: None,
            name: format!("s3://{}", bucket.name),
            humanize: true,
            show_etag: false,
        });
    }
    Ok(Outcome::ok())
}

pub async fn run_du(
    app: &Arc<App>,
    humanize: bool,
    group: bool,
    url: String,
) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse(&url)?;
    if url.is_local() {
        return Err(Error::Usage("du works on remote urls".to_string()));
    }

    let client = app.client(None, Some(url.bucket()), None).await?;
    let waiter = Waiter::new();
    let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut stream = client.list(&url, &app.cancel);
    while let Some(result) = stream.recv().await {
        match result {
            Ok(obj) if obj.is_dir() => {}
            Ok(obj) => {
                let class = if group {
                    obj.storage_class
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "STANDARD".to_string())
                } else {
                    String::new()
                };
                let entry = totals.entry(class).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += obj.size;
            }
            Err(err) if err.is_cancelled() => break,
            Err(err) => waiter.record_error(JobError::new("du", err.into()).with_src(&url)),
        }
    }

    for (class, (count, size)) in &totals {
        app.logger.info(&SizeMessage {
            source: url.to_string(),
            count: *count,
            size: *size,
            storage_class: (!class.is_empty()).then(|| class.clone()),
            humanize,
        });
    }

    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    Ok(Outcome {
        failed: summary.failed,
    })
}
