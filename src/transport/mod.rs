//! Transport Module
//!
//! Point-to-point delivery of framed messages over TCP.
//!
//! ## Responsibilities
//! - **Framing**: `[length][flags][payload]` on every connection, acks in the reverse direction.
//! - **Sending**: one pooled connection per destination, bounded retries, an overall deadline.
//! - **Receiving**: an accept loop feeding a bounded pool of dispatch workers.

pub mod frame;
pub mod receiver;
pub mod sender;
