//! Command output records and the diagnostic subscriber.
//!
//! Two channels: structured *output* records (operation confirmations, `ls`
//! rows, `du` totals) go to stdout through [`Logger`] with a text or JSON
//! rendering; *diagnostics* flow through `tracing` to stderr, where the
//! subscriber installed by [`init_logging`] applies the same text/JSON
//! choice.

use std::time::SystemTime;

use clap::ValueEnum;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// Installs the tracing subscriber: env-filter honoring `RUST_LOG`, fmt or
/// JSON layer on stderr.
pub fn init_logging(level: LogLevel, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// Output record sink. Info-level records go to stdout, errors to stderr.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    json: bool,
}

impl Logger {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn info<M: Message>(&self, msg: &M) {
        if self.json {
            match serde_json::to_string(msg) {
                Ok(rendered) => println!("{rendered}"),
                Err(err) => tracing::error!("rendering output record: {err}"),
            }
        } else {
            println!("{msg}");
        }
    }

    pub fn error<M: Message>(&self, msg: &M) {
        if self.json {
            match serde_json::to_string(msg) {
                Ok(rendered) => eprintln!("{rendered}"),
                Err(err) => tracing::error!("rendering output record: {err}"),
            }
        } else {
            eprintln!("ERROR {msg}");
        }
    }
}

pub trait Message: std::fmt::Display + Serialize {}

/// Confirmation of one completed operation: `cp src dst`.
#[derive(Debug, Serialize)]
pub struct InfoMessage {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub success: bool,
}

impl InfoMessage {
    pub fn new(operation: &str, source: Option<String>, destination: Option<String>) -> Self {
        Self {
            operation: operation.to_string(),
            source,
            destination,
            success: true,
        }
    }
}

impl std::fmt::Display for InfoMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(source) = &self.source {
            write!(f, " {source}")?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " {destination}")?;
        }
        Ok(())
    }
}

impl Message for InfoMessage {}

/// A failed job, rendered single-line.
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    pub job: String,
    pub error: String,
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\": {}", self.job, self.error)
    }
}

impl Message for ErrorMessage {}

/// One `ls` row.
#[derive(Debug, Serialize)]
pub struct ListMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub name: String,
    #[serde(skip)]
    pub humanize: bool,
    #[serde(skip)]
    pub show_etag: bool,
}

impl std::fmt::Display for ListMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dir {
            write!(f, "{:>30} {:>12}  {}", "", "DIR", self.name)?;
            return Ok(());
        }
        let mod_time = self.mod_time.as_deref().unwrap_or("");
        let size = if self.humanize {
            humanize_bytes(self.size)
        } else {
            self.size.to_string()
        };
        if self.show_etag {
            let etag = self.etag.as_deref().unwrap_or("");
            write!(f, "{mod_time:>30} {etag:>34} {size:>12}  {}", self.name)?;
        } else {
            write!(f, "{mod_time:>30} {size:>12}  {}", self.name)?;
        }
        if let Some(version) = &self.version_id {
            write!(f, " {version}")?;
        }
        Ok(())
    }
}

impl Message for ListMessage {}

/// Aggregate reported by `du`.
#[derive(Debug, Serialize)]
pub struct SizeMessage {
    pub source: String,
    pub count: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip)]
    pub humanize: bool,
}

impl std::fmt::Display for SizeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = if self.humanize {
            humanize_bytes(self.size)
        } else {
            self.size.to_string()
        };
        match &self.storage_class {
            Some(class) => write!(
                f,
                "{size} bytes in {} objects: {} [{class}]",
                self.count, self.source
            ),
            None => write!(f, "{size} bytes in {} objects: {}", self.count, self.source),
        }
    }
}

impl Message for SizeMessage {}

pub fn format_time(time: Option<SystemTime>) -> Option<String> {
    time.map(|t| {
        chrono::DateTime::<chrono::Utc>::from(t)
            .format("%Y/%m/%d %H:%M:%S")
            .to_string()
    })
}

pub fn humanize_bytes(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_rounds_to_units() {
        assert_eq!(humanize_bytes(512), "512B");
        assert_eq!(humanize_bytes(2048), "2.0K");
        assert_eq!(humanize_bytes(5 * 1024 * 1024), "5.0M");
    }

    #[test]
    fn info_message_text_rendering() {
        let msg = InfoMessage::new(
            "cp",
            Some("s3://b/a.txt".to_string()),
            Some("s3://b2/a.txt".to_string()),
        );
        assert_eq!(msg.to_string(), "cp s3://b/a.txt s3://b2/a.txt");
    }

    #[test]
    fn info_message_json_rendering() {
        let msg = InfoMessage::new("rm", Some("s3://b/a.txt".to_string()), None);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["operation"], "rm");
        assert_eq!(json["source"], "s3://b/a.txt");
        assert_eq!(json["success"], true);
        assert!(json.get("destination").is_none());
    }
}
