//! Bucket lifecycle: `mb`, `rb`, `bucket-version`.

use std::sync::Arc;

use object_url::ObjectUrl;

use crate::cli::VersioningState;
use crate::error::Error;
use crate::log::InfoMessage;

use super::{App, Outcome};

fn bucket_name(operand: &str) -> Result<String, Error> {
    let url = ObjectUrl::parse(operand)?;
    if !url.is_bucket() {
        return Err(Error::Usage(format!(
            "{operand:?} is not a bucket url (expected s3://name)"
        )));
    }
    Ok(url.bucket().to_string())
}

pub async fn run_mb(app: &Arc<App>, bucket: String) -> Result<Outcome, Error> {
    let name = bucket_name(&bucket)?;
    let client = app.client(None, Some(&name), None).await?;
    client.make_bucket(&name).await?;
    app.logger
        .info(&InfoMessage::new("mb", Some(format!("s3://{name}")), None));
    Ok(Outcome::ok())
}

pub async fn run_rb(app: &Arc<App>, bucket: String) -> Result<Outcome, Error> {
    let name = bucket_name(&bucket)?;
    let client = app.client(None, Some(&name), None).await?;
    client.remove_bucket(&name).await?;
    app.logger
        .info(&InfoMessage::new("rb", Some(format!("s3://{name}")), None));
    Ok(Outcome::ok())
}

pub async fn run_bucket_version(
    app: &Arc<App>,
    set: Option<VersioningState>,
    bucket: String,
) -> Result<Outcome, Error> {
    let name = bucket_name(&bucket)?;
    let client = app.client(None, Some(&name), None).await?;
    match set {
        Some(state) => {
            client
                .set_bucket_versioning(&name, state == VersioningState::Enabled)
                .await?;
            let verb = match state {
                VersioningState::Enabled => "enabled",
                VersioningState::Suspended => "suspended",
            };
            app.logger.info(&InfoMessage::new(
                "bucket-version",
                Some(format!("s3://{name}")),
                Some(verb.to_string()),
            ));
        }
        None => {
            let status = client.bucket_versioning(&name).await?;
            app.logger.info(&InfoMessage::new(
                "bucket-version",
                Some(format!("s3://{name}")),
                Some(status.unwrap_or_else(|| "Never".to_string())),
            ));
        }
    }
    Ok(Outcome::ok())
}
