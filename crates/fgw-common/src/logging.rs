//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.0.0-prealpha"
//! fgw_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "FGW_LOG";

/// Writer guards must outlive the process or buffered lines are lost.
static WRITER_GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Available log formats for the driver processes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directive for a verbosity level: 0 warn, 1 info, 2 debug, 3 and above trace.
pub fn verbosity_directive(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// `FGW_LOG` wins, then `RUST_LOG`, then the verbosity level.
fn build_filter(override_directive: Option<String>, level: u8) -> EnvFilter {
    let fallback = verbosity_directive(level);
    if let Some(directive) = override_directive {
        return EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring {LOG_ENV}={directive} ({err}); using {fallback}");
            EnvFilter::new(fallback)
        });
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber: console output in the configured format plus
/// a daily rolling JSON file under `config.directory`.
///
/// `verbosity` comes from the command line and takes precedence over
/// `config.level`. Calling this twice keeps the first subscriber.
pub fn init_tracing(
    service_name: &str,
    config: &LoggingConfig,
    verbosity: Option<u8>,
) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("failed to create log directory {}", config.directory.display())
    })?;
    let file_name = match &config.file_prefix {
        Some(prefix) => format!("{prefix}.log"),
        None => format!("{service_name}.log"),
    };
    let (file_writer, file_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(&config.directory, file_name),
    );
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = WRITER_GUARDS.set((file_guard, console_guard));

    let level = verbosity.unwrap_or(config.level);
    let filter = build_filter(std::env::var(LOG_ENV).ok(), level);

    let console = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    let console = match config.format {
        LogFormat::StructuredJson => console
            .json()
            .with_target(false)
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => console.with_writer(console_writer).boxed(),
    };
    let file = fmt::layer()
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_current_span(false)
        .with_writer(file_writer);

    if tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_err()
    {
        return Ok(());
    }

    info!(
        service = service_name,
        directory = %config.directory.display(),
        format = ?config.format,
        level,
        "tracing initialised"
    );
    Ok(())
}
