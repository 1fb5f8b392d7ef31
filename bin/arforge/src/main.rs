//! `arforge`: import, check and convert 3D assets for AR viewers.
//!
//! Logs go to stderr (and optionally a rolling file) so that stdout carries
//! only the JSON each subcommand prints. Commands that touch assets open the
//! SQLite database and the object store under `ARFORGE_STORAGE_DIR`.

mod commands;
mod config;
mod db;

use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::commands::Cli;
use crate::config::{Config, DEFAULT_LOG_FILTER};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Command line + configuration ────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Held until exit so buffered file output is flushed.
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "arforge starting");

    // ── 3. Subcommand ──────────────────────────────────────────────────────────
    commands::run(cli.command, &cfg).await
}

fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    let env_filter = log_filter(cfg);

    let console = if cfg.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "arforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();
    guard
}

/// `RUST_LOG` first, then `ARFORGE_LOG`. A bad `ARFORGE_LOG` is reported on
/// stderr because tracing is not up yet.
fn log_filter(cfg: &Config) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    cfg.log_level.parse().unwrap_or_else(|e| {
        eprintln!(
            "arforge: ignoring ARFORGE_LOG={:?} ({e}); using {DEFAULT_LOG_FILTER:?}",
            cfg.log_level
        );
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
