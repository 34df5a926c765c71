//! Error taxonomy shared by every layer of the cluster stack.
//!
//! - **Configuration**: fatal at assembly/start time (bad option string, interceptor flag conflict).
//! - **Transport**: per-destination failures; multi-destination sends report exactly which
//!   members failed so callers can carry on with the rest.
//! - **Timeout**: an RPC or acknowledgement wait ran past its bound.
//! - **Membership**: a malformed heartbeat. Logged and dropped by the receive loop.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::membership::types::Member;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("interceptor option flag conflict: {}", ConflictList(.0))]
    OptionConflict(Vec<OptionConflict>),

    #[error("send failed for {} member(s): {}", .failed.len(), FaultyList(.failed))]
    Send { failed: Vec<FaultyMember> },

    #[error("transport error to {addr}: {reason}")]
    Transport { addr: SocketAddr, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("membership error: {0}")]
    Membership(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("channel is not running")]
    NotRunning,

    #[error("no destination members given")]
    NoDestination,

    #[error("operation cancelled: component stopped")]
    Stopped,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Members that could not be reached, if this error carries any.
    pub fn faulty_members(&self) -> &[FaultyMember] {
        match self {
            ClusterError::Send { failed } => failed,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }
}

/// One destination that a send gave up on.
#[derive(Debug, Clone)]
pub struct FaultyMember {
    pub member: Member,
    pub reason: String,
}

/// Two interceptors claiming overlapping option bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionConflict {
    pub first: String,
    pub first_flag: u32,
    pub second: String,
    pub second_flag: u32,
}

impl OptionConflict {
    pub fn overlap(&self) -> u32 {
        self.first_flag & self.second_flag
    }
}

impl fmt::Display for OptionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{:#06x} == {}:{:#06x} (overlap {:#06x})]",
            self.first,
            self.first_flag,
            self.second,
            self.second_flag,
            self.overlap()
        )
    }
}

struct ConflictList<'a>(&'a [OptionConflict]);

impl fmt::Display for ConflictList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, conflict) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", conflict)?;
        }
        Ok(())
    }
}

struct FaultyList<'a>(&'a [FaultyMember]);

impl fmt::Display for FaultyList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, faulty) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} ({})", faulty.member.name(), faulty.reason)?;
        }
        Ok(())
    }
}
