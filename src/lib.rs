//! Ring Cluster Library
//!
//! Cluster membership, failure detection and leader election over UDP.
//! The binary (`main.rs`) runs a single node and exposes its view over HTTP.
//!
//! ## Architecture Modules
//! - **`membership`**: the protocol itself. `MembershipService` is the entry point:
//!   create it, register listeners, `start()` it and `join()` the cluster.

pub mod membership;
