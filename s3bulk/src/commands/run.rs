//! `run`: a batch interpreter dispatching command lines through the shared
//! pool.

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::error::{Error, JobError};
use crate::exec::Waiter;

use super::{App, Outcome};

pub async fn run(app: &Arc<App>, file: Option<Utf8PathBuf>) -> Result<Outcome, Error> {
    match file {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            interpret(app, BufReader::new(file), None).await
        }
        None => interpret(app, BufReader::new(tokio::io::stdin()), None).await,
    }
}

/// Boxed dispatch breaks the `dispatch -> interpret -> dispatch` type cycle
/// of recursive batch execution.
fn dispatch_boxed(
    app: Arc<App>,
    command: crate::cli::Command,
) -> BoxFuture<'static, Result<Outcome, Error>> {
    Box::pin(async move { super::dispatch(&app, command).await })
}

/// Reads command lines and dispatches each as an independent sub-command.
/// Line reading is cancellable: a reader task forwards lines over a channel
/// and stops between lines when the command's context is cancelled.
pub async fn interpret<R>(
    app: &Arc<App>,
    reader: R,
    cancel_on_error: Option<CancellationToken>,
) -> Result<Outcome, Error>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let waiter = Waiter::new();
    if let Some(token) = cancel_on_error {
        waiter.cancel_on_error(token);
    }

    let (line_tx, mut line_rx) = mpsc::channel::<(usize, String)>(16);
    let cancel = app.cancel.clone();
    let reader_task = tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut number = 0usize;
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = cancel.cancelled() => return Err(storage::StorageError::Cancelled),
            };
            match next {
                Ok(Some(line)) => {
                    number += 1;
                    if line_tx.send((number, line)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => return Err(storage::StorageError::Io(err)),
            }
        }
    });

    while let Some((number, line)) = line_rx.recv().await {
        let fields = match parse_line(&line) {
            ParsedLine::Empty => continue,
            ParsedLine::Invalid(reason) => {
                waiter.record_error(JobError::new(
                    "run",
                    Error::Usage(format!("line {number}: {reason}")),
                ));
                continue;
            }
            ParsedLine::Fields(fields) => fields,
        };
        if fields[0] == "run" {
            waiter.record_error(JobError::new(
                "run",
                Error::Usage(format!("line {number}: run commands cannot be nested")),
            ));
            continue;
        }

        let mut argv = Vec::with_capacity(fields.len() + 1);
        argv.push("s3bulk".to_string());
        argv.extend(fields);
        // Sub-commands run with the parent's global options; only the
        // sub-command part of the parsed line is taken.
        let command = match Cli::try_parse_from(&argv) {
            Ok(cli) => cli.command,
            Err(err) => {
                waiter.record_error(JobError::new(
                    "run",
                    Error::Usage(format!("line {number}: {err}")),
                ));
                continue;
            }
        };

        let name = command.name();
        let app = Arc::clone(app);
        app.pool.clone().run_composite(&waiter, async move {
            match dispatch_boxed(app, command).await {
                Ok(outcome) if outcome.failed > 0 => Err(JobError::new(
                    name,
                    Error::Usage(format!(
                        "line {number}: {} task(s) failed",
                        outcome.failed
                    )),
                )),
                Ok(_) => Ok(()),
                Err(err) => Err(JobError::new(name, err)),
            }
        });
    }

    match reader_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(err)) => waiter.record_error(JobError::new("run", err.into())),
        Err(join_err) => {
            waiter.record_error(JobError::new("run", Error::Other(join_err.into())))
        }
    }

    let summary = waiter.wait().await;
    app.report_errors(&waiter);
    Ok(Outcome {
        failed: summary.failed,
    })
}

enum ParsedLine {
    Empty,
    Invalid(String),
    Fields(Vec<String>),
}

/// Strips inline comments (a ` #` sequence), trims, skips blanks and comment
/// lines, and shell-splits the rest respecting quoting.
fn parse_line(line: &str) -> ParsedLine {
    let line = match line.find(" #") {
        Some(idx) => &line[..idx],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return ParsedLine::Empty;
    }
    match shlex::split(line) {
        Some(fields) if fields.is_empty() => ParsedLine::Empty,
        Some(fields) => ParsedLine::Fields(fields),
        None => ParsedLine::Invalid("unbalanced quotes".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(line: &str) -> Vec<String> {
        match parse_line(line) {
            ParsedLine::Fields(fields) => fields,
            other => panic!(
                "expected fields for {line:?}, got {}",
                match other {
                    ParsedLine::Empty => "empty",
                    ParsedLine::Invalid(_) => "invalid",
                    ParsedLine::Fields(_) => unreachable!(),
                }
            ),
        }
    }

    #[test]
    fn splits_respecting_quotes() {
        assert_eq!(fields("cp a b"), ["cp", "a", "b"]);
        assert_eq!(
            fields("cp \"my file.txt\" s3://b/k"),
            ["cp", "my file.txt", "s3://b/k"]
        );
    }

    #[test]
    fn strips_inline_comments() {
        assert_eq!(fields("rm s3://b/k # trailing note"), ["rm", "s3://b/k"]);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(matches!(parse_line(""), ParsedLine::Empty));
        assert!(matches!(parse_line("   "), ParsedLine::Empty));
        assert!(matches!(parse_line("# a comment"), ParsedLine::Empty));
    }

    #[test]
    fn reports_unbalanced_quotes() {
        assert!(matches!(
            parse_line("cp \"unterminated"),
            ParsedLine::Invalid(_)
        ));
    }

    #[test]
    fn hash_inside_token_is_not_a_comment() {
        assert_eq!(fields("cp a#b c"), ["cp", "a#b", "c"]);
    }

    #[tokio::test]
    async fn interpreter_collects_per_line_errors() {
        use crate::cli::{Cli, GlobalArgs};
        use crate::exec::WorkerPool;
        use clap::Parser;

        // Borrow the global args from a parsed dummy invocation.
        let global: GlobalArgs = Cli::try_parse_from(["s3bulk", "version"]).unwrap().global;
        let app = Arc::new(App::new(
            WorkerPool::new(4),
            global,
            CancellationToken::new(),
        ));

        // A local-to-local copy (refused), a comment, a nested run (refused
        // per line), an unparsable line, and an unknown command.
        let script = b"cp a b\n# a comment\nrun inner.txt\ncp \"oops\nfrobnicate x\n".to_vec();
        let outcome = interpret(&app, BufReader::new(std::io::Cursor::new(script)), None)
            .await
            .unwrap();
        assert_eq!(outcome.failed, 4);
    }
}
