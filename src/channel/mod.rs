//! Channel Module
//!
//! The application-facing side of the cluster: a [`group::GroupChannel`] sends byte payloads
//! to chosen members through a configurable stack of interceptors and delivers inbound
//! payloads to registered listeners.
//!
//! ## Responsibilities
//! - **Option Flags**: a fixed set of bits selecting per-message behaviour.
//! - **Interceptor Stack**: stages that act only on messages carrying their option bits.
//! - **Built-in Stages**: asynchronous dispatch, per-sender ordering, gzip compression,
//!   AES-GCM encryption.
//! - **RPC**: request/response with first/majority/all reply modes on the same channel.

pub mod dispatch;
pub mod encrypt;
pub mod group;
pub mod gzip;
pub mod interceptor;
pub mod message;
pub mod options;
pub mod order;
pub mod rpc;
