//! `rm`: delete objects, batching remote deletions into multi-delete calls.

use std::sync::Arc;

use object_url::{ObjectUrl, UrlOptions};
use tokio::sync::mpsc;

use crate::error::{Error, JobError};
use crate::exec::Waiter;
use crate::expand::expand_sources;
use crate::log::InfoMessage;

use super::{App, Filters, Outcome};

pub async fn run(
    app: &Arc<App>,
    raw: bool,
    all_versions: bool,
    version_id: Option<String>,
    exclude: Vec<String>,
    include: Vec<String>,
    urls: Vec<String>,
) -> Result<Outcome, Error> {
    let opts = UrlOptions {
        raw,
        version_id,
        all_versions,
    };
    let sources: Vec<ObjectUrl> = urls
        .iter()
        .map(|s| ObjectUrl::parse_with(s, opts.clone()))
        .collect::<Result<_, _>>()?;

    if sources.is_empty() {
        return Err(Error::Usage("rm requires at least one url".to_string()));
    }
    let remote = sources[0].is_remote();
    if sources.iter().any(|url| url.is_remote() != remote) {
        return Err(Error::Usage(
            "arguments cannot mix local and remote sources".to_string(),
        ));
    }
    if sources.iter().any(|url| url.is_bucket()) {
        return Err(Error::Usage(
            "rm does not remove buckets, use rb".to_string(),
        ));
    }
    let filters = Filters::compile(&exclude, &include)?;

    let client = app
        .client(
            None,
            sources.first().filter(|u| u.is_remote()).map(|u| u.bucket()),
            None,
        )
        .await?;

    let waiter = Waiter::new();
    let mut expansion = expand_sources(&client, &app.fs, false, &sources, &app.cancel);

    // Deletions stream through the multi-delete batcher while the expansion
    // is still running.
    let (urls_tx, urls_rx) = mpsc::channel::<ObjectUrl>(storage::LIST_CHANNEL_BUFFER);
    let mut results = if remote {
        client.multi_delete(urls_rx, &app.cancel)
    } else {
        app.fs.multi_delete(urls_rx)
    };

    let forward_waiter = waiter.clone();
    let dry_run = app.global.dry_run;
    let logger = app.logger;
    let forwarder = tokio::spawn(async move {
        while let Some(result) = expansion.recv().await {
            match result {
                Ok(obj) => {
                    if obj.is_dir() || !filters.allows(obj.url.path()) {
                        continue;
                    }
                    let url = obj.url.clone().with_version(
                        obj.version_id
                            .clone()
                            .or_else(|| obj.url.version_id().map(str::to_string)),
                    );
                    if dry_run && !remote {
                        logger.info(&InfoMessage::new("rm", Some(url.to_string()), None));
                        continue;
                    }
                    if urls_tx.send(url).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    forward_waiter.record_error(JobError::new("rm", err.into()));
                }
            }
        }
    });

    while let Some(result) = results.recv().await {
        match result {
            Ok(obj) => {
                app.logger
                    .info(&InfoMessage::new("rm", Some(obj.url.to_string()), None));
            }
            Err(err) if err.is_cancelled() => break,
            Err(err) => waiter.record_error(JobError::new("rm", err.into())),
        }
    }
    let _ = forwarder.await;

    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    Ok(Outcome {
        failed: summary.failed,
    })
}
