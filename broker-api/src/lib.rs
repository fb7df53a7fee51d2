//! This crate just abstracts the automated `protobuf` codegen.
//!
//! It essentially just encapsulates the build steps, and exports generated types for the
//! `broker.Broker` service, both the client used by the stresstest and the server used by tests.

pub mod broker {
    tonic::include_proto!("broker");
}
