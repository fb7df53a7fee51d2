//! The publishing worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::metrics::{GRPC_REQ_DURATION, TAG_TOPIC};
use crate::remote::GrpcRemote;
use crate::values::ValueSource;
use crate::worker::{IterationContext, Worker};

/// Check recorded for every publish attempt.
pub const PUBLISH_SUCCEEDED: &str = "publish is successful";

/// A pause between publishing and closing the connection, drawn uniformly from `min..=max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ThinkTime {
    /// Shortest pause.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Longest pause.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl ThinkTime {
    fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

/// Publishes one message to a random topic on a random node per iteration.
///
/// Failures of any kind are recorded as a failed [`PUBLISH_SUCCEEDED`] check. There are no
/// retries.
#[derive(Debug)]
pub struct Publisher {
    remote: Arc<GrpcRemote>,
    values: Arc<dyn ValueSource>,
    body_size: usize,
    think_time: Option<ThinkTime>,
}

impl Publisher {
    /// Creates a publisher sending bodies of `body_size` bytes.
    pub fn new(remote: Arc<GrpcRemote>, values: Arc<dyn ValueSource>, body_size: usize) -> Self {
        Self {
            remote,
            values,
            body_size,
            think_time: None,
        }
    }

    /// Pauses after each publish before releasing the connection.
    pub fn with_think_time(mut self, think_time: Option<ThinkTime>) -> Self {
        self.think_time = think_time;
        self
    }
}

#[async_trait]
impl Worker for Publisher {
    async fn iterate(&self, ctx: &IterationContext) {
        let endpoint = self.values.endpoint();
        let topic = self.values.topic();
        let body = self.values.body(self.body_size);
        let tags = ctx.tags().with(TAG_TOPIC, topic.as_str());

        let mut connection = match self.remote.connect(&endpoint).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    %endpoint,
                    "publisher failed to connect"
                );
                ctx.metrics.check(&tags, PUBLISH_SUCCEEDED, false);
                return;
            }
        };

        let start = Instant::now();
        let result = connection.publish(&topic, body).await;
        let elapsed = start.elapsed();
        ctx.metrics.record_duration(GRPC_REQ_DURATION, &tags, elapsed);

        match &result {
            Ok(response) => {
                tracing::debug!(id = %response.id, %topic, %endpoint, "published");
            }
            Err(error) => {
                tracing::warn!(
                    error = error as &dyn std::error::Error,
                    %topic,
                    %endpoint,
                    "publish failed"
                );
            }
        }
        ctx.metrics.check(&tags, PUBLISH_SUCCEEDED, result.is_ok());

        if let Some(think_time) = self.think_time {
            tokio::time::sleep(think_time.sample()).await;
        }
    }
}
