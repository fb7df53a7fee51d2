//! Configuration for the stresstest.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `BST__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `BST__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `BST__NODES=[localhost:8070]` replaces the broker nodes
//! - `BST__SUBSCRIBER__STREAM_TIMEOUT=30s` shortens subscriptions
//! - `BST__AUTH__PASSWORD=secret` sets the password
//!
//! # YAML Configuration File
//!
//! ```yaml
//! nodes: [localhost:8070, localhost:8080]
//! auth:
//!   username: admin
//!   password: password
//!
//! scenarios:
//!   subscriber:
//!     exec: subscriber
//!     executor:
//!       type: per-vu-iterations
//!       vus: 10
//!       iterations: 1
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;
use crate::executor::Executor;
use crate::publisher::ThinkTime;
use crate::remote::{Credentials, DEFAULT_CONNECT_TIMEOUT};
use crate::subscriber::{Cursor, DEFAULT_STREAM_TIMEOUT};
use crate::values::{Endpoint, Topic};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BST__";

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::error::Error for FormatParseError {}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Settings shared by all publisher scenarios.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Length of every published body.
    ///
    /// # Default
    ///
    /// `20 B`
    pub body_size: ByteSize,

    /// Optional pause between publishing and releasing the connection.
    pub think_time: Option<ThinkTime>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            body_size: ByteSize::b(20),
            think_time: None,
        }
    }
}

/// Settings shared by all subscriber scenarios.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// How long each subscription stays open, at most.
    ///
    /// # Default
    ///
    /// `200s`
    #[serde(with = "humantime_serde")]
    pub stream_timeout: Duration,

    /// Where subscriptions start reading.
    ///
    /// # Default
    ///
    /// `tail`
    pub cursor: Cursor,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            cursor: Cursor::Tail,
        }
    }
}

/// The workload a scenario runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Exec {
    /// Publish one message per iteration.
    Publisher,
    /// Hold one verified subscription per iteration.
    Subscriber,
}

/// A named scenario.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScenarioConfig {
    /// The workload.
    pub exec: Exec,
    /// The population policy.
    pub executor: Executor,
}

/// Stresstest configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Broker nodes, as `host:port`.
    ///
    /// # Default
    ///
    /// `localhost:8070`, `localhost:8080`, `localhost:8090`
    pub nodes: Vec<Endpoint>,

    /// Topics to publish to and subscribe to.
    ///
    /// # Default
    ///
    /// `Weather`, `Sports`, `Politics`, `Technology`, `Science`
    pub topics: Vec<Topic>,

    /// Basic authorization sent on every call.
    pub auth: Option<Credentials>,

    /// Time allowed to establish a connection.
    ///
    /// # Default
    ///
    /// `1s`
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Logging configuration.
    pub logging: Logging,

    /// Publisher settings.
    pub publisher: PublisherConfig,

    /// Subscriber settings.
    pub subscriber: SubscriberConfig,

    /// Aggregates printed for trend metrics in the summary.
    ///
    /// # Default
    ///
    /// `avg`, `min`, `med`, `max`, `p(90)`, `p(95)`, `p(99)`, `count`
    pub summary_trend_stats: Vec<String>,

    /// Conditions per metric selector, e.g. `grpc_req_duration{scenario:publisher}: [p(95)<500]`.
    pub thresholds: BTreeMap<String, Vec<String>>,

    /// Scenarios by name.
    pub scenarios: BTreeMap<String, ScenarioConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![
                Endpoint::new("localhost", 8070),
                Endpoint::new("localhost", 8080),
                Endpoint::new("localhost", 8090),
            ],
            topics: ["Weather", "Sports", "Politics", "Technology", "Science"]
                .into_iter()
                .map(Topic::from)
                .collect(),
            auth: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            logging: Logging::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            summary_trend_stats: ["avg", "min", "med", "max", "p(90)", "p(95)", "p(99)", "count"]
                .into_iter()
                .map(String::from)
                .collect(),
            thresholds: BTreeMap::new(),
            scenarios: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}
