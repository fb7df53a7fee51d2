//! Error types for the stresstest.
//!
//! Only [`ConfigError`] is fatal to a run. [`RemoteError`] is produced per call and turned into a
//! failed check by the workers; it never aborts the executor or sibling workers.

use thiserror::Error;

use crate::metrics::ExpressionError;

/// Fatal errors detected while building a test plan, before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file or environment could not be loaded.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The set of broker nodes is empty.
    #[error("no broker nodes configured")]
    NoNodes,

    /// The set of candidate topics is empty.
    #[error("no topics configured")]
    NoTopics,

    /// There is nothing to run.
    #[error("no scenarios configured")]
    NoScenarios,

    /// A scenario was selected on the command line that does not exist in the configuration.
    #[error("unknown scenario `{0}`")]
    UnknownScenario(String),

    /// A scenario has executor parameters that cannot be scheduled.
    #[error("invalid scenario `{scenario}`: {reason}")]
    InvalidScenario {
        /// The name of the scenario.
        scenario: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Publish bodies must never be empty.
    #[error("publisher body size must be greater than zero")]
    EmptyBody,

    /// A threshold selector or condition failed to parse.
    #[error("invalid threshold `{expression}`: {source}")]
    InvalidThreshold {
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        #[source]
        source: ExpressionError,
    },

    /// An entry of `summary_trend_stats` is not a known aggregate.
    #[error("invalid trend stat `{stat}`: {source}")]
    InvalidTrendStat {
        /// The offending entry.
        stat: String,
        /// Why it was rejected.
        #[source]
        source: ExpressionError,
    },

    /// The credentials cannot be encoded as a metadata header.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(#[from] tonic::metadata::errors::InvalidMetadataValue),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Load(Box::new(error))
    }
}

/// Errors from a single interaction with a broker node.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The endpoint does not form a valid URI.
    #[error("invalid endpoint `{endpoint}`")]
    InvalidEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// The underlying parse error.
        #[source]
        source: tonic::transport::Error,
    },

    /// The connection could not be established.
    #[error("failed to connect to `{endpoint}`")]
    Connect {
        /// The endpoint that was dialed.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: tonic::transport::Error,
    },

    /// The call completed with a non-OK status.
    #[error("call failed: {0}")]
    Status(#[from] tonic::Status),
}

/// Result type for calls against a broker node.
pub type RemoteResult<T> = Result<T, RemoteError>;
