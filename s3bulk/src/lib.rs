//! Parallel bulk operations for S3-compatible object stores.
//!
//! The binary wires a [`exec::WorkerPool`] and the parsed [`cli::Cli`] into
//! [`commands::App`] and dispatches; everything else lives in the library so
//! the batch interpreter can re-enter command execution.

pub mod cli;
pub mod commands;
pub mod error;
pub mod exec;
pub mod expand;
pub mod log;
