//! `presign` and `head`.

use std::sync::Arc;
use std::time::Duration;

use object_url::{ObjectUrl, UrlOptions};

use crate::error::Error;
use crate::log::{format_time, ListMessage};

use super::{App, Outcome};

pub async fn run_presign(
    app: &Arc<App>,
    expire: Duration,
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
    if !url.is_remote() || url.is_bucket() || url.is_wildcard() {
        return Err(Error::Usage(
            "presign expects a single remote object".to_string(),
        ));
    }
    let client = app.client(None, Some(url.bucket()), None).await?;
    let signed = client.presign(&url, expire).await?;
    println!("{signed}");
    Ok(Outcome::ok())
}

pub async fn run_head(
    app: &Arc<App>,
    version_id: Option<String>,
    raw: bool,
    url: String,
) -> Result<Outcome, Error> {
    let url = ObjectUrl::parse_with(
        &url,
        UrlOptions {
            raw,
            version_id,
            all_versions: false,
        },
    )?;
    if !url.is_remote() {
        return Err(Error::Usage("head works on remote urls".to_string()));
    }
    let client = app.client(None, Some(url.bucket()), None).await?;

    if url.is_bucket() {
        client.head_bucket(url.bucket()).await?;
        println!("s3://{}", url.bucket());
        return Ok(Outcome::ok());
    }

    let obj = client.stat(&url).await?;
    if app.global.json {
        app.logger.info(&ListMessage {
            mod_time: format_time(obj.mod_time),
            is_dir: false,
            size: obj.size,
            etag: obj.etag.clone(),
            version_id: obj.version_id.clone(),
            name: obj.url.to_string(),
            humanize: false,
            show_etag: true,
        });
    } else {
        println!("{}", obj.url);
        println!("size: {}", obj.size);
        if let Some(mod_time) = format_time(obj.mod_time) {
            println!("modified: {mod_time}");
        }
        if let Some(etag) = &obj.etag {
            println!("etag: {etag}");
        }
        if let Some(class) = &obj.storage_class {
            println!("storage class: {class}");
        }
        if let Some(version) = &obj.version_id {
            println!("version id: {version}");
        }
    }
    Ok(Outcome::ok())
}
