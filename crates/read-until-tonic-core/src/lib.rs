#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can access the domain model via
// `read_until_tonic_core::read_until`
pub use read_until;

/// Generated protobuf messages and the `DataService` client.
pub mod proto {
    tonic::include_proto!("read_until");
}
