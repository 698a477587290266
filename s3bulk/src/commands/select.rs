//! `select`: server-side SQL over matching objects, JSON records to stdout.

use std::sync::Arc;

use object_url::ObjectUrl;
use storage::S3Bucket;

use crate::error::{Error, JobError};
use crate::exec::Waiter;
use crate::expand::expand_source;

use super::{App, Filters, Outcome};

pub async fn run(
    app: &Arc<App>,
    query: String,
    exclude: Vec<String>,
    include: Vec<String>,
    url: String,
) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse(&url)?;
    if !url.is_remote() {
        return Err(Error::Usage("select works on remote objects".to_string()));
    }
    let filters = Filters::compile(&exclude, &include)?;
    let client = app.client(None, Some(url.bucket()), None).await?;

    let waiter = Waiter::new();
    let mut stream = expand_source(&client, &app.fs, false, &url, &app.cancel);
    while let Some(result) = stream.recv().await {
        let obj = match result {
            Ok(obj) => obj,
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                waiter.record_error(JobError::new("select", err.into()).with_src(&url));
                continue;
            }
        };
        if obj.is_dir() || !filters.allows(obj.url.path()) {
            continue;
        }
        let client = Arc::clone(&client);
        let query = query.clone();
        let cancel = app.cancel.clone();
        let src_display = obj.url.to_string();
        app.pool.run(&waiter, async move {
            select_object(&client, &obj.url, &query, &cancel)
                .await
                .map_err(|err| JobError::new("select", err).with_src(&src_display))
        });
    }

    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    Ok(Outcome {
        failed: summary.failed,
    })
}

async fn select_object(
    client: &Arc<S3Bucket>,
    url: &ObjectUrl,
    query: &str,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    let mut records = client.select(url, query, cancel);
    while let Some(record) = records.recv().await {
        let record = record?;
        println!("{record}");
    }
    Ok(())
}
