//! Membership & Discovery Module
//!
//! Tracks which nodes are alive. Every member periodically announces itself with a heartbeat
//! over UDP (multicast group or a static peer list); members that stay silent past the
//! expiry window are evicted.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: fire-and-forget datagrams carrying the full member descriptor.
//! - **Failure Detection**: a sweep evicts members whose last heartbeat is older than `expiry`.
//!   Under a partition this produces false positives, which is accepted.
//! - **Restart Detection**: a newer `alive_since` for the same id or endpoint replaces the stale entry.
//! - **Snapshots**: readers get an immutable copy-on-write view, never the live table.

pub mod service;
pub mod types;
pub mod view;

#[cfg(test)]
mod tests;
