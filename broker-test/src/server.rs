//! Exposes an in-process broker for use in integration tests.
//!
//! ```
//! use broker_test::server::TestBroker;
//!
//! #[tokio::main]
//! async fn main() {
//!    let broker = TestBroker::new().await;
//!    let node = broker.node();
//!    // point the stresstest at the node...
//! }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use broker_api::broker::broker_server::{Broker, BrokerServer};
use broker_api::broker::{MessageResponse, PublishRequest, PublishResponse, SubscribeRequest};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Capacity of the live fan-out channel shared by all subscriptions.
const LIVE_CAPACITY: usize = 4096;

/// Builder for a [`TestBroker`] with non-default behavior.
#[derive(Debug, Default)]
pub struct TestBrokerBuilder {
    credentials: Option<(String, String)>,
    end_streams_after: Option<usize>,
}

impl TestBrokerBuilder {
    /// Requires `authorization: basic <base64(username:password)>` on every call.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    /// Closes every subscription stream normally once it delivered `count` messages.
    ///
    /// By default, streams stay open until the client goes away.
    pub fn end_streams_after(mut self, count: usize) -> Self {
        self.end_streams_after = Some(count);
        self
    }

    /// Binds a random localhost port and starts serving.
    pub async fn start(self) -> TestBroker {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let state = Arc::new(State::new());
        let service = BrokerService {
            state: Arc::clone(&state),
            end_streams_after: self.end_streams_after,
        };

        let expected_token = self
            .credentials
            .map(|(username, password)| BASE64_STANDARD.encode(format!("{username}:{password}")));
        let service = BrokerServer::with_interceptor(service, move |request: Request<()>| {
            authenticate(expected_token.as_deref(), request)
        });

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        TestBroker {
            handle,
            socket,
            state,
        }
    }
}

/// An in-process broker for use in integration tests.
///
/// Messages are kept in memory for the lifetime of the broker. Every published message is assigned
/// a fresh id and a strictly increasing microsecond timestamp, and fanned out to all subscriptions
/// whose cursor for that topic is at or before the timestamp. The broker listens on a random
/// available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct TestBroker {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<State>,
}

impl TestBroker {
    /// Starts a broker without authentication whose streams never end on their own.
    pub async fn new() -> Self {
        Self::builder().start().await
    }

    /// Returns a builder to customize the broker's behavior.
    pub fn builder() -> TestBrokerBuilder {
        TestBrokerBuilder::default()
    }

    /// Returns the `host:port` address of this broker.
    pub fn node(&self) -> String {
        format!("127.0.0.1:{}", self.socket.port())
    }

    /// Returns the number of currently open subscription streams.
    pub fn subscribers(&self) -> usize {
        self.state.subscribers.load(Ordering::Acquire)
    }

    /// Waits until exactly `count` subscription streams are open.
    pub async fn wait_for_subscribers(&self, count: usize) {
        loop {
            let changed = self.state.changed.notified();
            if self.subscribers() == count {
                return;
            }
            changed.await;
        }
    }

    /// Returns all messages published so far, in publish order.
    pub fn published(&self) -> Vec<MessageResponse> {
        self.state.log().messages.clone()
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn authenticate(expected: Option<&str>, request: Request<()>) -> Result<Request<()>, Status> {
    let Some(expected) = expected else {
        return Ok(request);
    };

    let token = request
        .metadata()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
        .map(|(_, token)| token);

    match token {
        Some(token) if token == expected => Ok(request),
        Some(_) => Err(Status::unauthenticated("invalid auth token")),
        None => Err(Status::unauthenticated("missing basic auth token")),
    }
}

#[derive(Debug, Default)]
struct Log {
    messages: Vec<MessageResponse>,
    last_timestamp: i64,
}

#[derive(Debug)]
struct State {
    log: Mutex<Log>,
    live: broadcast::Sender<MessageResponse>,
    subscribers: AtomicUsize,
    changed: Notify,
}

impl State {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            log: Mutex::default(),
            live,
            subscribers: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: String, body: bytes::Bytes) -> MessageResponse {
        let mut log = self.log();
        let timestamp = now_micros().max(log.last_timestamp + 1);
        log.last_timestamp = timestamp;

        let message = MessageResponse {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp,
            topic,
            body,
        };
        log.messages.push(message.clone());
        // Sending under the log lock keeps backlog snapshots and live delivery gap-free.
        self.live.send(message.clone()).ok();

        message
    }

    fn attach(
        &self,
        cursors: &HashMap<String, i64>,
    ) -> (Vec<MessageResponse>, broadcast::Receiver<MessageResponse>) {
        let log = self.log();
        let backlog = log
            .messages
            .iter()
            .filter(|message| is_requested(cursors, message))
            .cloned()
            .collect();

        (backlog, self.live.subscribe())
    }
}

/// Tracks an open subscription for [`TestBroker::subscribers`].
struct SubscriberGuard(Arc<State>);

impl SubscriberGuard {
    fn new(state: Arc<State>) -> Self {
        state.subscribers.fetch_add(1, Ordering::AcqRel);
        state.changed.notify_waiters();
        Self(state)
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.subscribers.fetch_sub(1, Ordering::AcqRel);
        self.0.changed.notify_waiters();
    }
}

#[derive(Debug)]
struct BrokerService {
    state: Arc<State>,
    end_streams_after: Option<usize>,
}

#[tonic::async_trait]
impl Broker for BrokerService {
    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> Result<Response<PublishResponse>, Status> {
        let PublishRequest { body, topic } = request.into_inner();
        if topic.is_empty() {
            return Err(Status::invalid_argument("topic is required"));
        }

        let message = self.state.append(topic, body);
        tracing::debug!(id = %message.id, topic = %message.topic, "published");

        Ok(Response::new(PublishResponse { id: message.id }))
    }

    type SubscribeStream = ReceiverStream<Result<MessageResponse, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let cursors = request.into_inner().topics;
        if cursors.is_empty() {
            return Err(Status::invalid_argument("at least one topic is required"));
        }

        let (backlog, mut live) = self.state.attach(&cursors);
        let guard = SubscriberGuard::new(Arc::clone(&self.state));
        let limit = self.end_streams_after.unwrap_or(usize::MAX);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let _guard = guard;
            let mut sent = 0;

            let mut backlog = backlog.into_iter();
            while sent < limit {
                let message = match backlog.next() {
                    Some(message) => message,
                    None => tokio::select! {
                        _ = tx.closed() => return,
                        received = live.recv() => match received {
                            Ok(message) if is_requested(&cursors, &message) => message,
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "subscriber lagged behind");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    },
                };

                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
                sent += 1;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn is_requested(cursors: &HashMap<String, i64>, message: &MessageResponse) -> bool {
    cursors
        .get(&message.topic)
        .is_some_and(|cursor| message.timestamp >= *cursor)
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or_default()
}
