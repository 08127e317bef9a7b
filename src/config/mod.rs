//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "aquasync";
const ENV_PREFIX: &str = "AQUASYNC";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_TIME_MS: u64 = 30_000;
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 0;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_OPERATIONAL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CHART_INTERVAL_MS: u64 = 30_000;

/// Command-line arguments for the aquasync binary.
#[derive(Debug, Parser)]
#[command(name = "aquasync", version, about = "Lab portal data sync client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "AQUASYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Mount the homepage water and sewer views and log every change.
    Watch(WatchArgs),
    /// Print the status of a license application.
    Track(TrackArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub overrides: WatchOverrides,

    /// Skip the realtime subscription and rely on polling alone.
    #[arg(long = "no-realtime", action = clap::ArgAction::SetTrue)]
    pub no_realtime: bool,
}

#[derive(Debug, Args, Clone)]
pub struct TrackArgs {
    #[command(flatten)]
    pub overrides: StoreOverrides,

    /// Tracking number printed on the application receipt.
    #[arg(value_name = "NUMBER")]
    pub number: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the data store base URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,

    /// Override the public API key.
    #[arg(long = "store-api-key", value_name = "KEY")]
    pub store_api_key: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "store-request-timeout-seconds", value_name = "SECONDS")]
    pub store_request_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the freshness window.
    #[arg(long = "sync-stale-time-ms", value_name = "MILLIS")]
    pub sync_stale_time_ms: Option<u64>,

    /// Override the number of fetch retries.
    #[arg(long = "sync-retry", value_name = "COUNT")]
    pub sync_retry: Option<u32>,

    /// Override the garbage-collection sweep cadence.
    #[arg(long = "sync-gc-interval-ms", value_name = "MILLIS")]
    pub sync_gc_interval_ms: Option<u64>,

    /// Override the operational poll cadence.
    #[arg(long = "polling-operational-interval-ms", value_name = "MILLIS")]
    pub polling_operational_interval_ms: Option<u64>,

    /// Override the chart poll cadence.
    #[arg(long = "polling-chart-interval-ms", value_name = "MILLIS")]
    pub polling_chart_interval_ms: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub sync: SyncSettings,
    pub polling: PollingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub stale_time: Duration,
    pub retry: u32,
    pub retry_delay: Duration,
    pub gc_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub operational_interval: Duration,
    pub chart_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Watch(args)) => raw.apply_watch_overrides(&args.overrides),
        Some(Command::Track(args)) => raw.apply_store_overrides(&args.overrides),
        None => raw.apply_watch_overrides(&WatchOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    sync: RawSyncSettings,
    polling: RawPollingSettings,
}

impl RawSettings {
    fn apply_watch_overrides(&mut self, overrides: &WatchOverrides) {
        self.apply_store_overrides(&overrides.store);
        if let Some(millis) = overrides.sync_stale_time_ms {
            self.sync.stale_time_ms = Some(millis);
        }
        if let Some(retry) = overrides.sync_retry {
            self.sync.retry = Some(retry);
        }
        if let Some(millis) = overrides.sync_gc_interval_ms {
            self.sync.gc_interval_ms = Some(millis);
        }
        if let Some(millis) = overrides.polling_operational_interval_ms {
            self.polling.operational_interval_ms = Some(millis);
        }
        if let Some(millis) = overrides.polling_chart_interval_ms {
            self.polling.chart_interval_ms = Some(millis);
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(key) = overrides.store_api_key.as_ref() {
            self.store.api_key = Some(key.clone());
        }
        if let Some(seconds) = overrides.store_request_timeout_seconds {
            self.store.request_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            store: build_store_settings(raw.store)?,
            sync: build_sync_settings(raw.sync)?,
            polling: build_polling_settings(raw.polling)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    api_key: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    stale_time_ms: Option<u64>,
    retry: Option<u32>,
    retry_delay_ms: Option<u64>,
    gc_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPollingSettings {
    operational_interval_ms: Option<u64>,
    chart_interval_ms: Option<u64>,
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = non_blank(store.url);
    if let Some(url) = url.as_deref() {
        let parsed = Url::parse(url)
            .map_err(|err| LoadError::invalid("store.url", format!("failed to parse: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoadError::invalid(
                "store.url",
                "scheme must be http or https",
            ));
        }
    }

    let timeout_secs = store
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    let request_timeout = non_zero_duration(
        Duration::from_secs(timeout_secs),
        "store.request_timeout_seconds",
    )?;

    Ok(StoreSettings {
        url,
        api_key: non_blank(store.api_key),
        request_timeout,
    })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let gc_interval = non_zero_duration(
        Duration::from_millis(sync.gc_interval_ms.unwrap_or(DEFAULT_GC_INTERVAL_MS)),
        "sync.gc_interval_ms",
    )?;

    Ok(SyncSettings {
        stale_time: Duration::from_millis(sync.stale_time_ms.unwrap_or(DEFAULT_STALE_TIME_MS)),
        retry: sync.retry.unwrap_or(DEFAULT_RETRY),
        retry_delay: Duration::from_millis(
            sync.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        ),
        gc_interval,
    })
}

fn build_polling_settings(polling: RawPollingSettings) -> Result<PollingSettings, LoadError> {
    let operational_interval = non_zero_duration(
        Duration::from_millis(
            polling
                .operational_interval_ms
                .unwrap_or(DEFAULT_OPERATIONAL_INTERVAL_MS),
        ),
        "polling.operational_interval_ms",
    )?;
    let chart_interval = non_zero_duration(
        Duration::from_millis(polling.chart_interval_ms.unwrap_or(DEFAULT_CHART_INTERVAL_MS)),
        "polling.chart_interval_ms",
    )?;

    Ok(PollingSettings {
        operational_interval,
        chart_interval,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_duration(value: Duration, key: &'static str) -> Result<Duration, LoadError> {
    if value.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert!(settings.store.url.is_none());
        assert_eq!(settings.store.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.sync.stale_time, Duration::from_secs(30));
        assert_eq!(settings.sync.retry, 3);
        assert_eq!(settings.sync.retry_delay, Duration::ZERO);
        assert_eq!(settings.sync.gc_interval, Duration::from_secs(60));
        assert_eq!(settings.polling.operational_interval, Duration::from_secs(10));
        assert_eq!(settings.polling.chart_interval, Duration::from_secs(30));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.polling.operational_interval_ms = Some(5_000);
        raw.store.url = Some("https://file.example.org".to_string());

        let overrides = WatchOverrides {
            store: StoreOverrides {
                store_url: Some("https://cli.example.org".to_string()),
                ..Default::default()
            },
            polling_operational_interval_ms: Some(2_000),
            ..Default::default()
        };
        raw.apply_watch_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.store.url.as_deref(), Some("https://cli.example.org"));
        assert_eq!(settings.polling.operational_interval, Duration::from_secs(2));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut raw = RawSettings::default();
        raw.polling.chart_interval_ms = Some(0);

        let err = Settings::from_raw(raw).expect_err("zero interval");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "polling.chart_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn store_url_must_be_http() {
        let mut raw = RawSettings::default();
        raw.store.url = Some("ftp://lab.example.org".to_string());

        let err = Settings::from_raw(raw).expect_err("bad scheme");
        assert!(matches!(err, LoadError::Invalid { key: "store.url", .. }));
    }

    #[test]
    fn blank_api_key_is_treated_as_missing() {
        let mut raw = RawSettings::default();
        raw.store.api_key = Some("   ".to_string());

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.store.api_key.is_none());
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = StoreOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_store_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn invalid_log_level_is_reported() {
        let mut raw = RawSettings::default();
        raw.logging.level = Some("loud".to_string());

        let err = Settings::from_raw(raw).expect_err("bad level");
        assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
    }

    #[test]
    fn config_file_is_layered_under_cli() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "[store]\nurl = \"https://lab.example.org\"\napi_key = \"anon\"\n\n[sync]\nretry = 1\n\n[polling]\nchart_interval_ms = 45000"
        )
        .expect("write config");

        let path = file.path().to_string_lossy().into_owned();
        let args = CliArgs::parse_from([
            "aquasync",
            "--config-file",
            path.as_str(),
            "watch",
            "--sync-retry",
            "5",
        ]);
        let settings = load(&args).expect("load settings");

        assert_eq!(settings.store.url.as_deref(), Some("https://lab.example.org"));
        assert_eq!(settings.store.api_key.as_deref(), Some("anon"));
        assert_eq!(settings.sync.retry, 5);
        assert_eq!(settings.polling.chart_interval, Duration::from_secs(45));
    }

    #[test]
    fn default_to_watch_command() {
        let args = CliArgs::parse_from(["aquasync"]);
        let command = args
            .command
            .unwrap_or(Command::Watch(WatchArgs::default()));
        assert!(matches!(command, Command::Watch(_)));
    }

    #[test]
    fn parse_track_arguments() {
        let args = CliArgs::parse_from([
            "aquasync",
            "track",
            "--store-url",
            "https://lab.example.org",
            "WL-2024-0042",
        ]);

        match args.command.expect("track command") {
            Command::Track(track) => {
                assert_eq!(track.number, "WL-2024-0042");
                assert_eq!(
                    track.overrides.store_url.as_deref(),
                    Some("https://lab.example.org")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_watch_overrides() {
        let args = CliArgs::parse_from([
            "aquasync",
            "watch",
            "--no-realtime",
            "--polling-chart-interval-ms",
            "60000",
            "--log-json",
            "true",
        ]);

        match args.command.expect("watch command") {
            Command::Watch(watch) => {
                assert!(watch.no_realtime);
                assert_eq!(watch.overrides.polling_chart_interval_ms, Some(60_000));
                assert_eq!(watch.overrides.store.log_json, Some(true));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
