//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::coordinator::{RunKind, RunResult, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("RACEALPHA_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("RACEALPHA_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("RACEALPHA_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(binary: &str, config: &LoggingConfig) {
    info!(
        component = "app",
        event = "app.start",
        binary,
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_run_start(kind: RunKind, run_id: &str, resumed: bool) {
    info!(
        component = "coordinator",
        event = "run.start",
        run_kind = kind.as_str(),
        run_id,
        resumed
    );
}

pub fn log_run_finish(result: &RunResult) {
    match (&result.error_class, &result.error_message) {
        (Some(class), Some(message)) => info!(
            component = "coordinator",
            event = "run.finish",
            run_kind = result.kind.as_str(),
            run_id = %result.run_id,
            status = result.status.as_str(),
            error_class = class.as_str(),
            error_message = %message,
            record_count = result.record_count,
            duration_ms = result.duration_ms
        ),
        _ if result.status == RunStatus::Succeeded => info!(
            component = "coordinator",
            event = "run.finish",
            run_kind = result.kind.as_str(),
            run_id = %result.run_id,
            status = result.status.as_str(),
            record_count = result.record_count,
            duration_ms = result.duration_ms
        ),
        _ => info!(
            component = "coordinator",
            event = "run.finish",
            run_kind = result.kind.as_str(),
            run_id = %result.run_id,
            status = result.status.as_str(),
            final_state = ?result.final_state,
            record_count = result.record_count,
            duration_ms = result.duration_ms
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
