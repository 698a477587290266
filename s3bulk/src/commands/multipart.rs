//! Multipart upload introspection: `lsmp`, `parts`, `abortmp`.

use std::sync::Arc;

use object_url::ObjectUrl;

use crate::error::Error;
use crate::log::{format_time, humanize_bytes, InfoMessage};

use super::{App, Outcome};

pub async fn run_lsmp(app: &Arc<App>, url: String) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse(&url)?;
    if !url.is_remote() {
        return Err(Error::Usage("lsmp works on remote urls".to_string()));
    }
    let client = app.client(None, Some(url.bucket()), None).await?;
    let uploads = client.list_multipart_uploads(&url, &app.cancel).await?;
    for upload in uploads {
        let initiated = format_time(upload.initiated).unwrap_or_default();
        println!(
            "{initiated:>30}  s3://{}/{}  {}",
            url.bucket(),
            upload.key,
            upload.upload_id
        );
    }
    Ok(Outcome::ok())
}

pub async fn run_parts(app: &Arc<App>, url: String, upload_id: String) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse(&url)?;
    if !url.is_remote() || url.is_bucket() {
        return Err(Error::Usage("parts expects a remote object url".to_string()));
    }
    let client = app.client(None, Some(url.bucket()), None).await?;
    let parts = client.list_parts(&url, &upload_id, &app.cancel).await?;
    for part in parts {
        let modified = format_time(part.last_modified).unwrap_or_default();
        println!(
            "{:>6} {modified:>30} {:>12}  {}",
            part.part_number,
            humanize_bytes(part.size),
            part.etag.unwrap_or_default()
        );
    }
    Ok(Outcome::ok())
}

pub async fn run_abortmp(app: &Arc<App>, url: String, upload_id: String) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse(&url)?;
    if !url.is_remote() || url.is_bucket() {
        return Err(Error::Usage(
            "abortmp expects a remote object url".to_string(),
        ));
    }
    let client = app.client(None, Some(url.bucket()), None).await?;
    client.abort_upload(&url, &upload_id, &app.cancel).await?;
    app.logger
        .info(&InfoMessage::new("abortmp", Some(url.to_string()), None));
    Ok(Outcome::ok())
}
