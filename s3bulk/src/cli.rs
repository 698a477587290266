//! Command-line surface.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::log::LogLevel;

#[derive(Debug, Parser)]
#[command(name = "s3bulk", version, about = "Parallel bulk operations on S3-compatible object stores", arg_required_else_help(true))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Addressing {
    #[default]
    Auto,
    Path,
    Virtual,
}

impl Addressing {
    pub fn to_storage(self) -> storage::AddressingStyle {
        match self {
            Self::Auto => storage::AddressingStyle::Auto,
            Self::Path => storage::AddressingStyle::Path,
            Self::Virtual => storage::AddressingStyle::Virtual,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Render output records as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Worker count of the process-wide task pool
    #[arg(long, global = true, default_value_t = crate::exec::DEFAULT_WORKER_COUNT)]
    pub numworkers: usize,

    /// Max request attempts of the remote client
    #[arg(long, global = true, default_value_t = 10)]
    pub retry_count: u32,

    /// Override the remote endpoint
    #[arg(long, global = true, env = "S3_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    pub no_verify_ssl: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log: LogLevel,

    /// Report what would be done without performing remote mutations
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print a task summary when the command finishes
    #[arg(long, global = true)]
    pub stat: bool,

    /// Send requests without credentials
    #[arg(long, global = true)]
    pub no_sign_request: bool,

    /// Use the legacy ListObjects dialect
    #[arg(long, global = true)]
    pub use_list_objects_v1: bool,

    /// Confirm that the requester pays transfer costs
    #[arg(long, global = true)]
    pub request_payer: Option<String>,

    /// Named profile from the AWS credentials file
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Credentials file to read profiles from
    #[arg(long, global = true)]
    pub credentials_file: Option<Utf8PathBuf>,

    #[arg(long, global = true, value_enum, env = "S3_ADDRESSING_STYLE", default_value_t = Addressing::Auto)]
    pub addressing_style: Addressing,
}

/// Flags shared by the copying commands (`cp`, `mv`, `pipe`, `sync`).
#[derive(Debug, Clone, Default, Args)]
pub struct CopyArgs {
    /// Do not overwrite an existing destination
    #[arg(short = 'n', long)]
    pub no_clobber: bool,

    /// Only overwrite when sizes differ
    #[arg(short = 's', long)]
    pub if_size_differ: bool,

    /// Only overwrite when the source is newer
    #[arg(short = 'u', long)]
    pub if_source_newer: bool,

    /// Write every object directly under the destination, dropping
    /// intermediate directories
    #[arg(short = 'f', long)]
    pub flatten: bool,

    /// Do not traverse symbolic links
    #[arg(long)]
    pub no_follow_symlinks: bool,

    #[arg(long)]
    pub storage_class: Option<String>,

    /// Parallel parts per transfer
    #[arg(short = 'c', long, default_value_t = 5)]
    pub concurrency: usize,

    /// Part size in MiB
    #[arg(short = 'p', long = "part-size", default_value_t = 50)]
    pub part_size: u64,

    /// Server-side encryption algorithm
    #[arg(long)]
    pub sse: Option<String>,

    #[arg(long)]
    pub sse_kms_key_id: Option<String>,

    #[arg(long)]
    pub acl: Option<String>,

    #[arg(long)]
    pub cache_control: Option<String>,

    /// Expiry timestamp, RFC3339
    #[arg(long)]
    pub expires: Option<String>,

    #[arg(long)]
    pub content_type: Option<String>,

    #[arg(long)]
    pub content_encoding: Option<String>,

    #[arg(long)]
    pub content_disposition: Option<String>,

    /// User-defined metadata, KEY=VALUE, repeatable
    #[arg(long = "metadata", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Transfer cold objects instead of skipping them
    #[arg(long)]
    pub force_glacier_transfer: bool,

    /// Skip cold objects silently
    #[arg(long)]
    pub ignore_glacier_warnings: bool,

    /// Treat wildcard characters in operands literally
    #[arg(long)]
    pub raw: bool,

    /// Address a specific object version
    #[arg(long)]
    pub version_id: Option<String>,

    /// Skip objects matching the pattern, repeatable
    #[arg(long = "exclude")]
    pub exclude: Vec<String>,

    /// Only transfer objects matching a pattern, repeatable
    #[arg(long = "include")]
    pub include: Vec<String>,

    #[arg(long)]
    pub source_region: Option<String>,

    #[arg(long)]
    pub destination_region: Option<String>,

    /// Completion retries when the store races part visibility
    #[arg(long, default_value_t = 5)]
    pub no_such_upload_retry_count: u32,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VersioningState {
    Enabled,
    Suspended,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Copy objects
    Cp {
        #[command(flatten)]
        args: CopyArgs,
        src: String,
        dst: String,
    },

    /// Move objects
    Mv {
        #[command(flatten)]
        args: CopyArgs,
        src: String,
        dst: String,
    },

    /// Remove objects
    Rm {
        #[arg(long)]
        raw: bool,
        /// Remove every version of the matched objects
        #[arg(long)]
        all_versions: bool,
        #[arg(long)]
        version_id: Option<String>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long = "include")]
        include: Vec<String>,
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// List buckets or objects
    Ls {
        /// Show ETags next to objects
        #[arg(short = 'e', long)]
        show_etag: bool,
        /// Human-readable sizes
        #[arg(short = 'H', long)]
        humanize: bool,
        /// List all versions instead of the latest
        #[arg(long)]
        all_versions: bool,
        url: Option<String>,
    },

    /// Total size of matching objects
    Du {
        #[arg(short = 'H', long)]
        humanize: bool,
        /// Group totals by storage class
        #[arg(short = 'g', long)]
        group: bool,
        url: String,
    },

    /// Write a remote object to stdout
    Cat {
        #[arg(short = 'c', long, default_value_t = 5)]
        concurrency: usize,
        /// Part size in MiB
        #[arg(short = 'p', long = "part-size", default_value_t = 50)]
        part_size: u64,
        #[arg(long)]
        version_id: Option<String>,
        url: String,
    },

    /// Upload stdin to a remote object
    Pipe {
        #[command(flatten)]
        args: CopyArgs,
        dst: String,
    },

    /// Run commands read from a file or stdin
    Run { file: Option<Utf8PathBuf> },

    /// Synchronize a source to a destination
    Sync {
        #[command(flatten)]
        args: CopyArgs,
        /// Delete destination objects absent from the source
        #[arg(long)]
        delete: bool,
        /// Compare sizes only
        #[arg(long)]
        size_only: bool,
        /// Compare sizes and content hashes
        #[arg(long)]
        hash_only: bool,
        /// Cancel the whole pipeline on the first failed task
        #[arg(long)]
        exit_on_error: bool,
        src: String,
        dst: String,
    },

    /// Make a bucket
    Mb { bucket: String },

    /// Remove a bucket
    Rb { bucket: String },

    /// Run a server-side SELECT query over matching objects
    Select {
        #[arg(short = 'e', long = "query", default_value = "SELECT * FROM S3Object s")]
        query: String,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long = "include")]
        include: Vec<String>,
        url: String,
    },

    /// Print a pre-signed GET URL
    Presign {
        /// Lifetime of the generated URL
        #[arg(long, default_value = "168h")]
        expire: humantime::Duration,
        #[arg(long)]
        version_id: Option<String>,
        url: String,
    },

    /// Show metadata of an object or probe a bucket
    Head {
        #[arg(long)]
        version_id: Option<String>,
        #[arg(long)]
        raw: bool,
        url: String,
    },

    /// Print the version
    Version,

    /// Show or set bucket versioning
    BucketVersion {
        #[arg(long, value_enum)]
        set: Option<VersioningState>,
        bucket: String,
    },

    /// List in-progress multipart uploads
    Lsmp { url: String },

    /// List parts of a multipart upload
    Parts { url: String, upload_id: String },

    /// Abort a multipart upload
    Abortmp { url: String, upload_id: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cp { .. } => "cp",
            Self::Mv { .. } => "mv",
            Self::Rm { .. } => "rm",
            Self::Ls { .. } => "ls",
            Self::Du { .. } => "du",
            Self::Cat { .. } => "cat",
            Self::Pipe { .. } => "pipe",
            Self::Run { .. } => "run",
            Self::Sync { .. } => "sync",
            Self::Mb { .. } => "mb",
            Self::Rb { .. } => "rb",
            Self::Select { .. } => "select",
            Self::Presign { .. } => "presign",
            Self::Head { .. } => "head",
            Self::Version => "version",
            Self::BucketVersion { .. } => "bucket-version",
            Self::Lsmp { .. } => "lsmp",
            Self::Parts { .. } => "parts",
            Self::Abortmp { .. } => "abortmp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).expect("valid command line")
    }

    #[test]
    fn parses_cp_with_flags() {
        let cli = parse(&[
            "s3bulk",
            "cp",
            "-n",
            "-s",
            "--concurrency",
            "8",
            "--part-size",
            "16",
            "--metadata",
            "team=infra",
            "src/",
            "s3://bucket/dst/",
        ]);
        let Command::Cp { args, src, dst } = cli.command else {
            panic!("expected cp");
        };
        assert!(args.no_clobber && args.if_size_differ);
        assert_eq!(args.concurrency, 8);
        assert_eq!(args.part_size, 16);
        assert_eq!(args.metadata, vec![("team".to_string(), "infra".to_string())]);
        assert_eq!(src, "src/");
        assert_eq!(dst, "s3://bucket/dst/");
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&["s3bulk", "ls", "--json", "s3://bucket"]);
        assert!(cli.global.json);
    }

    #[test]
    fn rm_requires_urls() {
        assert!(Cli::try_parse_from(["s3bulk", "rm"]).is_err());
        let cli = parse(&["s3bulk", "rm", "s3://b/a", "s3://b/c"]);
        let Command::Rm { urls, .. } = cli.command else {
            panic!("expected rm");
        };
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn metadata_rejects_missing_separator() {
        assert!(Cli::try_parse_from(["s3bulk", "cp", "--metadata", "nokv", "a", "b"]).is_err());
    }

    #[test]
    fn sync_flags() {
        let cli = parse(&[
            "s3bulk", "sync", "--delete", "--size-only", "folder/", "s3://b/p/",
        ]);
        let Command::Sync {
            delete, size_only, ..
        } = cli.command
        else {
            panic!("expected sync");
        };
        assert!(delete && size_only);
    }
}
