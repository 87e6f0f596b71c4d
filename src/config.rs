//! Poller options and the on-disk feed settings they are built from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::error::FeedError;
use crate::parser::{FeedDecoder, ProtobufDecoder};
use crate::schedule::ScheduleProvider;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Package every usable schema must declare.
const SCHEMA_PACKAGE: &str = "transit_realtime";

/// Runtime settings of a [`FeedPoller`](crate::poller::FeedPoller).
#[derive(Clone)]
pub struct PollerOptions {
    /// Feed source, including any key parameters.
    pub source_url: String,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    /// Retries after a failure before idling until the next regular poll.
    pub max_retries: u32,
    pub decoder: Option<Arc<dyn FeedDecoder>>,
    /// Used to interpolate predictions the feed leaves out.
    pub schedule: Option<Arc<dyn ScheduleProvider>>,
}

impl PollerOptions {
    /// Options with the default retry policy and the protobuf decoder.
    pub fn new(source_url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            source_url: source_url.into(),
            poll_interval,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            decoder: Some(Arc::new(ProtobufDecoder)),
            schedule: None,
        }
    }

    pub fn with_retry(mut self, retry_interval: Duration, max_retries: u32) -> Self {
        self.retry_interval = retry_interval;
        self.max_retries = max_retries;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn FeedDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_schedule(mut self, schedule: Arc<dyn ScheduleProvider>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.source_url.trim().is_empty() {
            return Err(FeedError::Config("a source URL is required".to_string()));
        }
        if self.decoder.is_none() {
            return Err(FeedError::Config("a feed decoder is required".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(FeedError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(FeedError::Config(
                "retry interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PollerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerOptions")
            .field("source_url", &self.source_url)
            .field("poll_interval", &self.poll_interval)
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("decoder", &self.decoder.is_some())
            .field("schedule", &self.schedule.is_some())
            .finish()
    }
}

/// How a feed expects its API key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ApiKeySettings {
    /// Sent as an HTTP header, e.g. `x-api-key`.
    Header { name: String, key: String },
    /// Appended as a URL query parameter.
    Query { name: String, key: String },
}

/// Feed settings as stored in a JSON file:
///
/// ```json
/// {
///   "source_url": "https://example.org/gtfs-rt/tripupdates",
///   "poll_interval_seconds": 30,
///   "agency_timezone": "America/New_York",
///   "api_key": { "type": "header", "name": "x-api-key", "key": "secret" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedSettings {
    pub source_url: String,
    pub poll_interval_seconds: f64,
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Schema the feed was encoded with. The decoder is compiled in, so this
    /// is only checked for being a `transit_realtime` schema.
    #[serde(default)]
    pub decoder_schema_path: Option<PathBuf>,
    #[serde(default)]
    pub agency_timezone: Option<String>,
    #[serde(default)]
    pub api_key: Option<ApiKeySettings>,
}

fn default_retry_interval_seconds() -> f64 {
    DEFAULT_RETRY_INTERVAL.as_secs_f64()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl FeedSettings {
    /// Loads settings from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: FeedSettings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Settings for `source_url` with every optional field at its default.
    pub fn for_url(source_url: impl Into<String>, poll_interval_seconds: f64) -> Self {
        Self {
            source_url: source_url.into(),
            poll_interval_seconds,
            retry_interval_seconds: default_retry_interval_seconds(),
            max_retries: DEFAULT_MAX_RETRIES,
            decoder_schema_path: None,
            agency_timezone: None,
            api_key: None,
        }
    }

    /// Checks the settings and turns them into poller options.
    pub fn to_options(&self) -> Result<PollerOptions, FeedError> {
        if let Some(path) = &self.decoder_schema_path {
            check_schema(path)?;
        }

        let options = PollerOptions::new(
            self.source_url.clone(),
            seconds("poll_interval_seconds", self.poll_interval_seconds)?,
        )
        .with_retry(
            seconds("retry_interval_seconds", self.retry_interval_seconds)?,
            self.max_retries,
        );

        options.validate()?;
        Ok(options)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, FeedError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|duration| !duration.is_zero())
        .ok_or_else(|| {
            FeedError::Config(format!(
                "{field} must be a positive number of seconds, got {value}"
            ))
        })
}

fn check_schema(path: &Path) -> Result<(), FeedError> {
    let schema = std::fs::read_to_string(path).map_err(|e| {
        FeedError::Config(format!("cannot read decoder schema {}: {e}", path.display()))
    })?;

    let declares_package = schema.lines().any(|line| {
        line.trim()
            .strip_prefix("package")
            .map(|rest| rest.trim().trim_end_matches(';').trim() == SCHEMA_PACKAGE)
            .unwrap_or(false)
    });

    if declares_package {
        Ok(())
    } else {
        Err(FeedError::Config(format!(
            "decoder schema {} does not declare package {SCHEMA_PACKAGE}",
            path.display()
        )))
    }
}
