//! Shared logging configuration and initialization.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env_value;
use crate::pipeline::StageSummary;

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
    logging_config_from_lookup(env_value)
}

/// Unknown format or target spellings keep the defaults rather than failing
/// a batch run over a logging knob.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: lookup("AQH_LOG_LEVEL").unwrap_or(defaults.level),
        format: lookup("AQH_LOG_FORMAT")
            .as_deref()
            .and_then(parse_log_format)
            .unwrap_or(defaults.format),
        include_target: lookup("AQH_LOG_TARGET")
            .as_deref()
            .and_then(parse_bool)
            .unwrap_or(defaults.include_target),
    }
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

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "dashboard_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/dashboard"
    );
}

/// Emits the end-of-stage summary: one event for the stage plus one warning
/// per skipped entity so operators can see why a city has no table.
pub fn log_run_summary(summary: &StageSummary) {
    info!(
        component = "pipeline",
        event = "pipeline.stage.summary",
        stage = summary.stage.as_str(),
        produced = summary.produced.len(),
        skipped = summary.skipped.len()
    );
    for skipped in &summary.skipped {
        warn!(
            component = "pipeline",
            event = "pipeline.stage.summary.skipped",
            stage = summary.stage.as_str(),
            entity = %skipped.entity,
            reason = %skipped.reason
        );
    }
}

pub fn log_source_selected(source: &str, reason: Option<&str>) {
    match reason {
        Some(reason) => info!(
            component = "dashboard_server",
            event = "source.selected",
            source,
            reason
        ),
        None => info!(
            component = "dashboard_server",
            event = "source.selected",
            source
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

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pairs = &'static [(&'static str, &'static str)];

    fn lookup_from(pairs: Pairs) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(
            logging_config_from_lookup(|_| None),
            LoggingConfig::default()
        );
    }

    #[test]
    fn pipeline_runs_can_switch_to_json_without_targets() {
        let cfg = logging_config_from_lookup(lookup_from(&[
            ("AQH_LOG_LEVEL", "aqh=debug,info"),
            ("AQH_LOG_FORMAT", "JSON"),
            ("AQH_LOG_TARGET", "off"),
        ]));

        assert_eq!(cfg.level, "aqh=debug,info");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unknown_spellings_keep_defaults() {
        let cfg = logging_config_from_lookup(lookup_from(&[
            ("AQH_LOG_FORMAT", "yaml"),
            ("AQH_LOG_TARGET", "maybe"),
        ]));

        assert_eq!(cfg, LoggingConfig::default());
    }
}
