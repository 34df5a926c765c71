use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ClusterError, Result};

/// Opaque 16-byte identity of one member incarnation.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub [u8; 16]);

impl MemberId {
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self)
    }
}

/// Represents a single node of the cluster.
///
/// `port` is the data (TCP) port other members connect to. `seq` counts heartbeats sent by
/// this member and `alive_since_ms` is the wall-clock time its service started; a restarted
/// process announces a newer `alive_since_ms` which lets peers discard the stale entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct Member {
    pub host: IpAddr,
    pub port: u16,
    pub unique_id: MemberId,
    pub payload: Vec<u8>,
    pub seq: u64,
    pub alive_since_ms: u64,
    /// Cluster the member belongs to. Empty for the default domain.
    pub domain: Vec<u8>,
}

impl Member {
    pub fn new(addr: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            unique_id: MemberId::new(),
            payload,
            seq: 0,
            alive_since_ms: now_ms(),
            domain: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<Vec<u8>>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn name(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn same_endpoint(&self, other: &Member) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id && self.same_endpoint(other)
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name())
            .field("id", &self.unique_id)
            .field("seq", &self.seq)
            .field("alive_since_ms", &self.alive_since_ms)
            .field("domain", &String::from_utf8_lossy(&self.domain))
            .finish()
    }
}

/// What a heartbeat announces about its sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HeartbeatCommand {
    Alive,
    /// The sender is shutting down; drop it without waiting for expiry.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub member: Member,
    pub command: HeartbeatCommand,
}

/// Leading byte of every datagram on the membership socket.
pub const DATAGRAM_HEARTBEAT: u8 = 0x48;
/// Datagram carrying a framed channel message sent with the multicast option.
pub const DATAGRAM_MESSAGE: u8 = 0x4d;

const HEARTBEAT_MAGIC: &[u8; 4] = b"CLHB";

/// Largest datagram the membership socket reads or writes.
pub const MAX_DATAGRAM: usize = 65_507;

/// Datagrams received on the membership socket.
#[derive(Debug, Clone)]
pub enum Datagram {
    Heartbeat(Heartbeat),
    Message(Vec<u8>),
}

impl Heartbeat {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(1 + HEARTBEAT_MAGIC.len() + body.len());
        out.push(DATAGRAM_HEARTBEAT);
        out.extend_from_slice(HEARTBEAT_MAGIC);
        out.extend_from_slice(&body);
        if out.len() > MAX_DATAGRAM {
            return Err(ClusterError::Membership(format!(
                "heartbeat of {} bytes exceeds datagram limit",
                out.len()
            )));
        }
        Ok(out)
    }
}

impl Datagram {
    pub fn message(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(frame.len() + 1);
        out.push(DATAGRAM_MESSAGE);
        out.extend_from_slice(frame);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.split_first() {
            Some((&DATAGRAM_HEARTBEAT, rest)) => {
                let body = rest.strip_prefix(HEARTBEAT_MAGIC.as_slice()).ok_or_else(|| {
                    ClusterError::Membership("heartbeat magic missing".to_string())
                })?;
                let heartbeat: Heartbeat = bincode::deserialize(body)
                    .map_err(|e| ClusterError::Membership(format!("bad heartbeat body: {}", e)))?;
                Ok(Datagram::Heartbeat(heartbeat))
            }
            Some((&DATAGRAM_MESSAGE, rest)) => Ok(Datagram::Message(rest.to_vec())),
            Some((kind, _)) => Err(ClusterError::Membership(format!(
                "unknown datagram kind {:#04x}",
                kind
            ))),
            None => Err(ClusterError::Membership("empty datagram".to_string())),
        }
    }
}

/// Receives membership changes. Called from the membership tasks, so implementations
/// must return quickly and move slow work onto their own tasks.
pub trait MembershipListener: Send + Sync {
    fn member_added(&self, member: &Member);
    fn member_disappeared(&self, member: &Member);
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
