//! The subscribing worker and the per-stream delivery verifier.
//!
//! Each iteration opens one stream for a single topic and reads it until the broker ends it, the
//! broker fails it, or the worker's own deadline runs out. Every received message is checked for a
//! non-empty body, the requested topic, and a timestamp no lower than the last accepted one.
//!
//! Ending the stream at the deadline is the normal way an iteration finishes and is not counted as
//! an error. Any status the broker sends, including `CANCELLED`, is.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use broker_api::broker::MessageResponse;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tonic::Status;

use crate::metrics::{
    GRPC_REQ_DURATION, GRPC_STREAM_DURATION, GRPC_STREAMS, GRPC_STREAMS_MSGS_RECEIVED, Metrics,
    TAG_TOPIC, Tags,
};
use crate::remote::GrpcRemote;
use crate::values::{Topic, ValueSource};
use crate::worker::{IterationContext, Worker};

/// Check that a received body is not empty.
pub const MESSAGE_NOT_EMPTY: &str = "message is not empty";
/// Check that a received message carries the subscribed topic.
pub const MESSAGE_TOPIC_MATCHES: &str = "message has the right topic";
/// Check that timestamps never go backwards within a stream.
pub const MESSAGE_ORDERED: &str = "message has correct ordering";
/// Check that a stream terminated without an unexpected error.
pub const STREAM_WITHOUT_ERROR: &str = "error is null";

/// Default time a subscriber keeps its stream open.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(200);

/// A message as delivered on a subscription stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Broker-assigned identifier.
    pub id: String,
    /// The published body.
    pub body: Bytes,
    /// The topic it was published to.
    pub topic: Topic,
    /// Broker-assigned timestamp in microseconds.
    pub timestamp: i64,
}

impl From<MessageResponse> for Message {
    fn from(response: MessageResponse) -> Self {
        Self {
            id: response.id,
            body: response.body,
            topic: Topic::new(response.topic),
            timestamp: response.timestamp,
        }
    }
}

/// Where a new subscription starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cursor {
    /// Only messages published from the moment of subscribing.
    #[default]
    Tail,
    /// Everything the broker still retains.
    Beginning,
}

impl Cursor {
    /// The cursor as a microsecond timestamp.
    pub fn timestamp(self) -> i64 {
        match self {
            Self::Tail => now_micros(),
            Self::Beginning => 0,
        }
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or_default()
}

/// The outcome of the three per-message checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// The body has at least one byte.
    pub non_empty: bool,
    /// The topic is the subscribed one.
    pub topic_matches: bool,
    /// The timestamp is not lower than the last accepted one.
    pub ordered: bool,
}

impl Verdict {
    /// All checks held.
    pub fn passed(&self) -> bool {
        self.non_empty && self.topic_matches && self.ordered
    }
}

/// Verifies the messages of one subscription stream.
#[derive(Debug)]
pub struct MessageVerifier {
    topic: Topic,
    last_timestamp: i64,
}

impl MessageVerifier {
    /// Starts verifying a stream for `topic` opened with the given cursor.
    pub fn new(topic: Topic, cursor: i64) -> Self {
        Self {
            topic,
            last_timestamp: cursor,
        }
    }

    /// The lowest timestamp the next message may carry.
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    /// Checks a message and advances the ordering watermark if it is in order.
    pub fn verify(&mut self, message: &Message) -> Verdict {
        let verdict = Verdict {
            non_empty: !message.body.is_empty(),
            topic_matches: message.topic == self.topic,
            ordered: message.timestamp >= self.last_timestamp,
        };

        if verdict.ordered {
            self.last_timestamp = message.timestamp;
        } else {
            tracing::warn!(
                id = %message.id,
                timestamp = message.timestamp,
                expected_at_least = self.last_timestamp,
                "message out of order"
            );
        }
        if !verdict.topic_matches {
            tracing::warn!(
                id = %message.id,
                expected = %self.topic,
                actual = %message.topic,
                "message on wrong topic"
            );
        }
        if !verdict.non_empty {
            tracing::warn!(id = %message.id, "message with empty body");
        }

        verdict
    }
}

/// How a subscription stream ended.
#[derive(Debug)]
pub enum Termination {
    /// The broker closed the stream normally.
    Ended,
    /// The worker's deadline elapsed and it stopped reading.
    Cancelled,
    /// The broker failed the stream.
    Errored(Status),
}

impl Termination {
    /// Whether this is an expected way for a stream to end.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Errored(_))
    }
}

/// Reads `stream` until it ends, fails, or `deadline` passes, verifying every message.
///
/// The stream is dropped before returning, which cancels it on the broker.
pub async fn receive<S>(
    stream: S,
    deadline: Instant,
    verifier: &mut MessageVerifier,
    metrics: &Metrics,
    tags: &Tags,
) -> Termination
where
    S: Stream<Item = Result<MessageResponse, Status>>,
{
    let mut stream = pin!(stream);

    loop {
        let Ok(next) = tokio::time::timeout_at(deadline, stream.next()).await else {
            return Termination::Cancelled;
        };

        let message = match next {
            Some(Ok(message)) => Message::from(message),
            Some(Err(status)) => return Termination::Errored(status),
            None => return Termination::Ended,
        };

        metrics.add(GRPC_STREAMS_MSGS_RECEIVED, tags, 1);
        let verdict = verifier.verify(&message);
        metrics.check(tags, MESSAGE_NOT_EMPTY, verdict.non_empty);
        metrics.check(tags, MESSAGE_TOPIC_MATCHES, verdict.topic_matches);
        metrics.check(tags, MESSAGE_ORDERED, verdict.ordered);
    }
}

/// Subscribes to one random topic per iteration and verifies everything it receives.
#[derive(Debug)]
pub struct Subscriber {
    remote: Arc<GrpcRemote>,
    values: Arc<dyn ValueSource>,
    stream_timeout: Duration,
    cursor: Cursor,
}

impl Subscriber {
    /// Creates a subscriber that keeps each stream open for at most `stream_timeout`.
    pub fn new(
        remote: Arc<GrpcRemote>,
        values: Arc<dyn ValueSource>,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            values,
            stream_timeout,
            cursor: Cursor::default(),
        }
    }

    /// Sets where new subscriptions start reading.
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = cursor;
        self
    }
}

#[async_trait]
impl Worker for Subscriber {
    async fn iterate(&self, ctx: &IterationContext) {
        let endpoint = self.values.endpoint();
        let topic = self.values.topic();
        let tags = ctx.tags().with(TAG_TOPIC, topic.as_str());
        let deadline = ctx.deadline_within(self.stream_timeout);

        let mut connection = match self.remote.connect(&endpoint).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    %endpoint,
                    "subscriber failed to connect"
                );
                ctx.metrics.check(&tags, STREAM_WITHOUT_ERROR, false);
                return;
            }
        };

        let cursor = self.cursor.timestamp();
        let cursors = HashMap::from([(topic.to_string(), cursor)]);

        let start = Instant::now();
        let stream = match tokio::time::timeout_at(deadline, connection.subscribe(cursors)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                let elapsed = start.elapsed();
                ctx.metrics.record_duration(GRPC_REQ_DURATION, &tags, elapsed);
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    %topic,
                    %endpoint,
                    "subscribe failed"
                );
                ctx.metrics.check(&tags, STREAM_WITHOUT_ERROR, false);
                return;
            }
            Err(_) => {
                tracing::debug!(%topic, %endpoint, "deadline passed before the stream opened");
                ctx.metrics.check(&tags, STREAM_WITHOUT_ERROR, true);
                return;
            }
        };
        let elapsed = start.elapsed();
        ctx.metrics.record_duration(GRPC_REQ_DURATION, &tags, elapsed);
        ctx.metrics.add(GRPC_STREAMS, &tags, 1);
        tracing::debug!(%topic, %endpoint, cursor, "subscribed");

        let mut verifier = MessageVerifier::new(topic.clone(), cursor);
        let termination = receive(stream, deadline, &mut verifier, &ctx.metrics, &tags).await;
        let elapsed = start.elapsed();
        ctx.metrics.record_duration(GRPC_STREAM_DURATION, &tags, elapsed);

        match &termination {
            Termination::Errored(status) => {
                tracing::warn!(
                    error = status as &dyn std::error::Error,
                    %topic,
                    %endpoint,
                    "stream failed"
                );
            }
            termination => tracing::debug!(?termination, %topic, %endpoint, "stream finished"),
        }
        let passed = termination.is_expected();
        ctx.metrics.check(&tags, STREAM_WITHOUT_ERROR, passed);
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tonic::Code;

    use super::*;
    use crate::metrics::{Selector, Stat};

    fn message(id: &str, topic: &str, timestamp: i64, body: &'static [u8]) -> Message {
        Message {
            id: id.into(),
            body: Bytes::from_static(body),
            topic: Topic::from(topic),
            timestamp,
        }
    }

    fn response(topic: &str, timestamp: i64) -> Result<MessageResponse, Status> {
        Ok(MessageResponse {
            id: format!("m{timestamp}"),
            timestamp,
            topic: topic.into(),
            body: Bytes::from_static(b"hello"),
        })
    }

    fn rate(metrics: &Metrics, selector: &str) -> Option<f64> {
        let selector: Selector = selector.parse().unwrap();
        metrics.aggregate(&selector).value(Stat::Rate)
    }

    #[test]
    fn accepts_ordered_messages() {
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 100);

        assert!(verifier.verify(&message("a", "Alerts", 100, b"x")).passed());
        assert!(verifier.verify(&message("b", "Alerts", 150, b"x")).passed());
        // equal timestamps are in order
        assert!(verifier.verify(&message("c", "Alerts", 150, b"x")).passed());
        assert_eq!(verifier.last_timestamp(), 150);
    }

    #[test]
    fn out_of_order_message_does_not_move_watermark() {
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        verifier.verify(&message("a", "Alerts", 200, b"x"));
        let verdict = verifier.verify(&message("b", "Alerts", 100, b"x"));
        assert!(!verdict.ordered);
        assert!(verdict.non_empty && verdict.topic_matches);
        assert_eq!(verifier.last_timestamp(), 200);

        assert!(verifier.verify(&message("c", "Alerts", 201, b"x")).ordered);
    }

    #[test]
    fn message_before_cursor_is_out_of_order() {
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 1_000);
        assert!(!verifier.verify(&message("a", "Alerts", 999, b"x")).ordered);
    }

    #[test]
    fn flags_wrong_topic_and_empty_body() {
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        let verdict = verifier.verify(&message("a", "Sports", 1, b""));
        assert_eq!(
            verdict,
            Verdict {
                non_empty: false,
                topic_matches: false,
                ordered: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_is_expected() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("subscriber").with(TAG_TOPIC, "Alerts");
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        let messages = stream::iter([
            response("Alerts", 1),
            response("Alerts", 2),
            response("Alerts", 3),
        ]);
        let deadline = Instant::now() + Duration::from_secs(10);
        let termination = receive(messages, deadline, &mut verifier, &metrics, &tags).await;

        assert!(matches!(termination, Termination::Ended));
        assert!(termination.is_expected());

        let received: Selector = "grpc_streams_msgs_received{topic:Alerts}".parse().unwrap();
        assert_eq!(metrics.aggregate(&received).value(Stat::Count), Some(3.0));
        assert_eq!(rate(&metrics, "checks{check:message has correct ordering}"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_idle_stream() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("subscriber");
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        let messages = stream::iter([response("Alerts", 1)]).chain(stream::pending());
        let start = Instant::now();
        let deadline = start + Duration::from_secs(1);
        let termination = receive(messages, deadline, &mut verifier, &metrics, &tags).await;

        assert!(matches!(termination, Termination::Cancelled));
        assert!(termination.is_expected());
        assert_eq!(Instant::now() - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_errors_are_unexpected() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("subscriber");
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        let messages = stream::iter([
            response("Alerts", 5),
            Err(Status::cancelled("broker shutting down")),
            response("Alerts", 6),
        ]);
        let deadline = Instant::now() + Duration::from_secs(10);
        let termination = receive(messages, deadline, &mut verifier, &metrics, &tags).await;

        let Termination::Errored(status) = &termination else {
            panic!("expected an error, got {termination:?}");
        };
        assert_eq!(status.code(), Code::Cancelled);
        assert!(!termination.is_expected());
        assert_eq!(verifier.last_timestamp(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn records_failed_checks() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("subscriber");
        let mut verifier = MessageVerifier::new(Topic::from("Alerts"), 0);

        let messages = stream::iter([
            response("Alerts", 10),
            response("Alerts", 5),
            response("Sports", 11),
        ]);
        let deadline = Instant::now() + Duration::from_secs(10);
        receive(messages, deadline, &mut verifier, &metrics, &tags).await;

        let checks = metrics.checks();
        let failures: Vec<_> = checks
            .iter()
            .filter(|check| check.fails > 0)
            .map(|check| (check.name.as_str(), check.fails))
            .collect();
        assert_eq!(
            failures,
            [(MESSAGE_ORDERED, 1), (MESSAGE_TOPIC_MATCHES, 1)]
        );
    }

    #[test]
    fn cursor_timestamps() {
        assert_eq!(Cursor::Beginning.timestamp(), 0);
        assert!(Cursor::Tail.timestamp() > 0);
    }
}
