//! Cluster Group Communication Library
//!
//! Building blocks for a group of processes that discover each other, exchange messages
//! and share a replicated map. The binary (`main.rs`) wires them into a node that serves
//! the map over HTTP.
//!
//! ## Architecture Modules
//! - **`membership`**: heartbeat-based discovery and failure detection over UDP.
//! - **`transport`**: length-prefixed TCP frames, a pooled sender with retries and
//!   acknowledgements, and a receiver with a bounded dispatch pool.
//! - **`channel`**: the group channel. Messages flow through a stack of interceptors
//!   (ordering, compression, asynchronous dispatch) selected by per-message option flags.
//!   Also hosts request/response RPC on top of the channel.
//! - **`map`**: a key-value map where each entry has one primary owner and backup copies
//!   on other members, failing over when a member disappears.
//! - **`http`**: JSON handlers exposing a map.

pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod map;
pub mod membership;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
