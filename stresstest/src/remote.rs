//! Contains a remote implementation using gRPC to interact with broker nodes.
//!
//! Every worker iteration opens its own [`Connection`] and drops it when done. The remote counts
//! connections that are currently open, which lets tests assert that nothing leaks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::prelude::*;
use broker_api::broker::broker_client::BrokerClient;
use broker_api::broker::{MessageResponse, PublishRequest, PublishResponse, SubscribeRequest};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tonic::Request;
use tonic::Streaming;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;

use crate::error::{ConfigError, RemoteError, RemoteResult};
use crate::values::{Endpoint, Topic};

/// Default time allowed to establish a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Username and password sent as basic authorization on every call.
#[derive(Clone, Deserialize, Serialize)]
pub struct Credentials {
    /// The username.
    pub username: String,
    /// The password.
    pub password: String,
}

impl Credentials {
    /// Encodes the credentials as an `authorization` header value.
    pub fn header_value(&self) -> Result<AsciiMetadataValue, ConfigError> {
        let token = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
        Ok(format!("basic {token}").parse()?)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Dials broker nodes over plaintext gRPC.
#[derive(Debug)]
pub struct GrpcRemote {
    authorization: Option<AsciiMetadataValue>,
    connect_timeout: Duration,
    open: Arc<AtomicUsize>,
}

impl Default for GrpcRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcRemote {
    /// Creates a remote without credentials and the default connect timeout.
    pub fn new() -> Self {
        Self {
            authorization: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attaches basic authorization to every call.
    pub fn with_credentials(mut self, credentials: &Credentials) -> Result<Self, ConfigError> {
        self.authorization = Some(credentials.header_value()?);
        Ok(self)
    }

    /// Sets the time allowed to establish a connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the number of connections that have not been dropped yet.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Establishes a new connection to the endpoint.
    pub async fn connect(&self, endpoint: &Endpoint) -> RemoteResult<Connection> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.uri())
            .map_err(|source| RemoteError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                source,
            })?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|source| RemoteError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        self.open.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(%endpoint, "connected");

        Ok(Connection {
            client: BrokerClient::new(channel),
            authorization: self.authorization.clone(),
            endpoint: endpoint.clone(),
            _lease: Lease(Arc::clone(&self.open)),
        })
    }
}

/// Decrements the open connection count when dropped.
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An established connection to a single broker node.
///
/// The underlying channel is closed when the connection is dropped.
#[derive(Debug)]
pub struct Connection {
    client: BrokerClient<Channel>,
    authorization: Option<AsciiMetadataValue>,
    endpoint: Endpoint,
    _lease: Lease,
}

impl Connection {
    /// The endpoint this connection was established to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(ref authorization) = self.authorization {
            request
                .metadata_mut()
                .insert("authorization", authorization.clone());
        }
        request
    }

    /// Publishes a message and returns the broker's acknowledgement.
    pub async fn publish(&mut self, topic: &Topic, body: Bytes) -> RemoteResult<PublishResponse> {
        let request = self.request(PublishRequest {
            body,
            topic: topic.to_string(),
        });

        Ok(self.client.publish(request).await?.into_inner())
    }

    /// Opens a subscription stream.
    ///
    /// `cursors` maps each topic to the earliest timestamp, in microseconds, the broker should
    /// deliver. Returns once the broker has accepted the subscription.
    pub async fn subscribe(
        &mut self,
        cursors: HashMap<String, i64>,
    ) -> RemoteResult<Streaming<MessageResponse>> {
        let request = self.request(SubscribeRequest { topics: cursors });

        Ok(self.client.subscribe(request).await?.into_inner())
    }
}
