use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use s3bulk::cli::Cli;
use s3bulk::commands::{dispatch, App};
use s3bulk::error::Error;
use s3bulk::exec::WorkerPool;
use s3bulk::log::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.log, cli.global.json);

    let pool = WorkerPool::new(cli.global.numworkers);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the command context; in-flight tasks stop at their next
    // suspension point and temp files clean up on drop.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });

    let app = Arc::new(App::new(pool, cli.global, cancel));
    match dispatch(&app, cli.command).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code() as u8),
        Err(err) => {
            match &err {
                Error::Usage(msg) => tracing::error!("{msg}"),
                other => tracing::error!("{}", s3bulk::error::one_line(&other.to_string())),
            }
            ExitCode::FAILURE
        }
    }
}
