pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod handle;
pub mod models;
pub mod notes;
pub mod notify;
pub mod pomodoro;
pub mod storage;
pub mod tasks;
pub mod timer;

use crate::cli::commands::Cli;
use crate::cli::handlers::{self, CommandContext};
use crate::clock::SystemClock;
use crate::config::Settings;
use crate::handle::StoreHandle;
use crate::notify::{MemoryNotifier, Notifier, Severity, TracingNotifier};
use anyhow::Context;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Runs one CLI command against the configured data directory.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.data_dir.clone()).context("loading settings")?;
    settings.ensure_data_dir().context("creating data directory")?;
    if let Err(error) = init_tracing(&settings) {
        eprintln!("warning: file logging disabled: {error}");
    }

    let notifier = Arc::new(MemoryNotifier::new());
    let handle = StoreHandle::open(&settings, Arc::new(SystemClock), notifier.clone())
        .context("opening notes store")?;
    let ctx = CommandContext {
        handle: &handle,
        notifier: notifier.as_ref(),
        json: cli.json,
        tick: settings.tick_interval(),
    };

    // Long commands such as `pomodoro` keep running timers checkpointed.
    handle.spawn_sweep();
    let result = handlers::dispatch(cli.command, &ctx).await;
    // Timers outlive the process in storage; only the tickers and the sweep stop here.
    handle.detach();

    for notice in notifier.drain() {
        if cli.json {
            // Stdout carries only the JSON payload.
            TracingNotifier.notify(notice);
            continue;
        }
        match notice.severity {
            Severity::Success => println!("{}", notice.message),
            Severity::Error => eprintln!("{}", notice.message),
        }
    }
    result
}

pub fn init_tracing(settings: &Settings) -> Result<(), String> {
    let log_dir = settings.log_dir();
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "deepnote.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let fallback = settings.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
