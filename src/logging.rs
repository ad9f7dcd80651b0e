//! Log output for the gateway process.
//!
//! `serve` logs every tenant's session activity as JSON lines to a daily file
//! under the configured logs directory and mirrors it on stderr
//! ([`init_production`]). `check` only needs stderr ([`init_cli`]).
//!
//! The filter comes from `RUST_LOG` when set, then from `[logging] level`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rolling log; the date is appended per day.
pub const LOG_FILE_PREFIX: &str = "switchboard.log";

/// Level used when neither `RUST_LOG` nor the configured level parses.
const FALLBACK_LEVEL: &str = "info";

/// Keeps the background log writer running. Drop it last in `main`.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Install the `serve` subscriber: JSON to `{logs_dir}/switchboard.log.<date>`
/// plus plain text on stderr.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_production(logs_dir: &Path, level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Install a stderr-only subscriber for `check`.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(FALLBACK_LEVEL))
        .with_writer(std::io::stderr)
        .init();
}

fn build_filter(level: &str) -> EnvFilter {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    EnvFilter::new(filter_directives(env.as_deref(), level))
}

/// Pick the filter directives: a usable `RUST_LOG`, else the configured
/// level, else `info`.
pub fn filter_directives(env: Option<&str>, level: &str) -> String {
    [env.unwrap_or_default(), level]
        .into_iter()
        .map(str::trim)
        .find(|d| !d.is_empty() && EnvFilter::try_new(d).is_ok())
        .unwrap_or(FALLBACK_LEVEL)
        .to_owned()
}
