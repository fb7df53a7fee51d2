//! A load generator and delivery verifier for a clustered publish/subscribe broker.
//!
//! The stresstest runs named [`Scenario`]s concurrently. Each scenario pairs a workload, which is
//! either a [`Publisher`] or a [`Subscriber`], with an [`Executor`] that decides how many
//! iterations run, when, and with how many virtual users.
//!
//! Publishers send one message with a random body to a random topic on a random broker node per
//! iteration. Subscribers hold one stream per iteration and verify every delivered message: the
//! body must not be empty, the topic must be the subscribed one, and timestamps must never go
//! backwards within the stream.
//!
//! Every outcome is recorded as a check or a sample in a shared [`Metrics`] registry. After the
//! run, [`Thresholds`] are evaluated against it and a [`RunSummary`] is returned, which passes only
//! if no check and no threshold failed.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod observability;
pub mod publisher;
pub mod remote;
pub mod report;
pub mod schedule;
pub mod stresstest;
pub mod subscriber;
pub mod thresholds;
pub mod values;
pub mod worker;

pub use crate::executor::{Executor, Scenario};
pub use crate::metrics::Metrics;
pub use crate::publisher::Publisher;
pub use crate::report::RunSummary;
pub use crate::stresstest::{TestPlan, run};
pub use crate::subscriber::Subscriber;
pub use crate::thresholds::Thresholds;
