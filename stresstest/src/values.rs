//! Workload value generators: broker endpoints, topics and publish bodies.
//!
//! Workers never pick values themselves. They ask a [`ValueSource`], which is
//! [`RandomValues`] in a real run and [`FixedValues`] wherever a test needs a deterministic
//! sequence.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

/// A broker node given as `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The plaintext URI used to dial this endpoint.
    pub fn uri(&self) -> String {
        format!("http://{self}")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The endpoint is not of the form `host:port`.
#[derive(Clone, Debug, Error)]
#[error("invalid endpoint `{0}`, expected `host:port`")]
pub struct ParseEndpointError(String);

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_owned()))?;
        if host.is_empty() {
            return Err(ParseEndpointError(s.to_owned()));
        }
        let port = port.parse().map_err(|_| ParseEndpointError(s.to_owned()))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ParseEndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// An opaque topic label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Produces the values a worker needs for one iteration.
pub trait ValueSource: fmt::Debug + Send + Sync {
    /// Picks the broker node to connect to.
    fn endpoint(&self) -> Endpoint;

    /// Picks the topic to publish to or subscribe to.
    fn topic(&self) -> Topic;

    /// Returns a fresh, non-empty body of `len` bytes.
    fn body(&self, len: usize) -> Bytes;
}

/// Uniformly random picks from the configured endpoints and topics.
#[derive(Clone, Debug)]
pub struct RandomValues {
    endpoints: Vec<Endpoint>,
    topics: Vec<Topic>,
}

impl RandomValues {
    /// Creates a generator over the given sets, which must both be non-empty.
    pub fn new(endpoints: Vec<Endpoint>, topics: Vec<Topic>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }

        Ok(Self { endpoints, topics })
    }
}

impl ValueSource for RandomValues {
    fn endpoint(&self) -> Endpoint {
        let index = rand::rng().random_range(0..self.endpoints.len());
        self.endpoints[index].clone()
    }

    fn topic(&self) -> Topic {
        let index = rand::rng().random_range(0..self.topics.len());
        self.topics[index].clone()
    }

    fn body(&self, len: usize) -> Bytes {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(len.max(1))
            .collect::<Vec<u8>>()
            .into()
    }
}

/// Deterministic values that cycle through fixed sequences.
///
/// Bodies are derived from a running counter unless explicit bodies are given, so every call
/// still yields a distinct body.
#[derive(Debug)]
pub struct FixedValues {
    endpoints: Vec<Endpoint>,
    topics: Vec<Topic>,
    bodies: Vec<Bytes>,
    next_endpoint: AtomicUsize,
    next_topic: AtomicUsize,
    next_body: AtomicUsize,
}

impl FixedValues {
    /// Creates a source cycling through `endpoints` and `topics`.
    ///
    /// # Panics
    ///
    /// Panics if either sequence is empty.
    pub fn new(endpoints: Vec<Endpoint>, topics: Vec<Topic>) -> Self {
        assert!(!endpoints.is_empty(), "at least one endpoint is required");
        assert!(!topics.is_empty(), "at least one topic is required");

        Self {
            endpoints,
            topics,
            bodies: Vec::new(),
            next_endpoint: AtomicUsize::new(0),
            next_topic: AtomicUsize::new(0),
            next_body: AtomicUsize::new(0),
        }
    }

    /// Cycles through the given bodies instead of counter-derived ones.
    pub fn with_bodies(mut self, bodies: Vec<Bytes>) -> Self {
        self.bodies = bodies;
        self
    }
}

fn cycle<T: Clone>(items: &[T], cursor: &AtomicUsize) -> T {
    let index = cursor.fetch_add(1, Ordering::Relaxed) % items.len();
    items[index].clone()
}

impl ValueSource for FixedValues {
    fn endpoint(&self) -> Endpoint {
        cycle(&self.endpoints, &self.next_endpoint)
    }

    fn topic(&self) -> Topic {
        cycle(&self.topics, &self.next_topic)
    }

    fn body(&self, len: usize) -> Bytes {
        if !self.bodies.is_empty() {
            return cycle(&self.bodies, &self.next_body);
        }

        let counter = self.next_body.fetch_add(1, Ordering::Relaxed);
        let pattern = format!("{counter:x}-");
        pattern.bytes().cycle().take(len.max(1)).collect::<Vec<u8>>().into()
    }
}
