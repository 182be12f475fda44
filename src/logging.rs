//! # Structured Logging Module
//!
//! Environment-aware structured logging for the scheduler process and the
//! worker processes it spawns. The scheduler logs to console and a shared
//! engine log file; each worker process initializes its own subscriber
//! writing `task-<slug>.log`, because a forked-off worker must never share
//! log handles with its parent.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging for the scheduler process.
///
/// Console output plus a JSON file under `log_dir`, named with environment
/// and PID so restarts do not clobber prior logs.
pub fn init_structured_logging(log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        if !log_dir.exists() {
            // a missing log directory is not fatal; fall back to console only
            if fs::create_dir_all(log_dir).is_err() {
                init_console_only(&log_level);
                return;
            }
        }

        let pid = process::id();
        let log_filename = format!("engine.{environment}.{pid}.log");
        let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        tracing::info!(pid, environment = %environment, "structured logging initialized");

        // keep the non-blocking writer alive for the process lifetime
        std::mem::forget(guard);
    });
}

/// Initialize logging inside a worker process.
///
/// Workers get a dedicated `task-<slug>.log` file; multi-process logging
/// through the parent's handles is not supported, matching the process
/// isolation rules for store connections.
pub fn init_worker_logging(slug: &str, log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        if !log_dir.exists() && fs::create_dir_all(log_dir).is_err() {
            init_console_only(&log_level);
            return;
        }

        let file_appender =
            tracing_appender::rolling::never(log_dir, format!("task-{slug}.log"));
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_filter(EnvFilter::new(log_level)),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        std::mem::forget(guard);
    });
}

fn init_console_only(log_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_filter(EnvFilter::new(log_level.to_string())),
        )
        .try_init();
}

/// Current environment from environment variables.
fn get_environment() -> String {
    std::env::var("PIPELINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Log level based on environment.
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Default log directory relative to a base path.
pub fn default_log_dir(base_path: &Path) -> PathBuf {
    base_path.join("log")
}
