//! Stderr logging for the CLI.
//!
//! `--log-level` applies to the ethmsg crates; everything else stays at
//! `warn` or quieter. `ETHMSG_LOG` takes per-target directives such as
//! `ethmsg_core::endpoint=trace,ethmsg=info` and replaces that default.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::{ParseError, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding target directives.
pub const LOG_ENV: &str = "ETHMSG_LOG";

/// Target prefix shared by every ethmsg crate.
const ETHMSG_TARGET: &str = "ethmsg";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `level` for ethmsg targets, at most `warn` for dependencies.
fn default_filter(level: LogLevel) -> Targets {
    let level = level.as_filter();
    Targets::new()
        .with_target(ETHMSG_TARGET, level)
        .with_default(level.min(LevelFilter::WARN))
}

/// Directives win when they parse; otherwise the level-derived filter is
/// used and the parse error handed back for reporting.
fn resolve_filter(level: LogLevel, directives: Option<&str>) -> (Targets, Option<ParseError>) {
    match directives.map(str::parse::<Targets>) {
        Some(Ok(targets)) => (targets, None),
        Some(Err(err)) => (default_filter(level), Some(err)),
        None => (default_filter(level), None),
    }
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let directives = std::env::var(LOG_ENV).ok();
    let (filter, rejected) = resolve_filter(level, directives.as_deref());

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = match format {
        LogFormat::Text => registry.with(layer).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };

    if let Some(err) = rejected {
        tracing::warn!(env = LOG_ENV, error = %err, "ignoring malformed log directives");
    }
}
