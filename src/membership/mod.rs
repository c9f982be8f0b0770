//! Membership & Leader Election Module
//!
//! Keeps an ordered, ring-shaped list of voting members in agreement across a
//! cluster and elects exactly one leader: the member at position 0.
//!
//! ## Core Mechanisms
//! - **Admission**: joiners broadcast ADD_REQ; the leader inserts them and pushes the new list.
//! - **Ring Heartbeat**: each member pings its successor and watches its predecessor;
//!   silent members are removed and the removal is broadcast.
//! - **Leadership Quorum**: a member that finds itself first asks every other member to defer.
//! - **Split-Brain Merge**: rival leaders compare size and id; the loser hands its members over.
//! - **Fragmentation**: messages larger than one datagram travel as numbered windows.
//! - **Clients**: non-voting observers register with the leader and mirror its list.

pub mod codec;
pub mod config;
pub mod election;
pub mod engine;
pub mod events;
pub mod heartbeat;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;
pub mod window;
