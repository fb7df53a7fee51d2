//! Test utilities for the broker stresstest.
//!
//! This crate provides an in-process broker that speaks the `broker.Broker` gRPC protocol, so
//! that workers and whole stresstest runs can be exercised without a real cluster. See the
//! modules for all available utilities.

pub mod server;
pub mod tracing;
