//! Cluster Configuration
//!
//! One serde-deserializable tree per component. Every field has a default, so a TOML file
//! only needs to mention what it overrides. Durations are plain millisecond integers.
//!
//! ```toml
//! [membership]
//! bind = "0.0.0.0:45564"
//! frequency_ms = 500
//! expiry_ms = 3000
//! discovery = { mode = "static", peers = ["10.0.0.2:45564", "10.0.0.3:45564"] }
//!
//! [sender]
//! max_retry_attempts = 1
//! timeout_ms = 3000
//!
//! [map]
//! backup_count = 1
//! send_options = "use_ack"
//! ```

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::channel::options::SendOptions;
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub membership: MembershipConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub channel: ChannelConfig,
    pub map: MapConfig,
}

impl ClusterConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ClusterError::Configuration(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Rejects values that would stall a timer or a queue at runtime.
    pub fn validate(&self) -> Result<()> {
        let m = &self.membership;
        non_zero("membership.frequency_ms", m.frequency_ms)?;
        non_zero("membership.expiry_ms", m.expiry_ms)?;
        non_zero("membership.sweep_interval_ms", m.sweep_interval_ms)?;
        if m.expiry_ms <= m.frequency_ms {
            return Err(ClusterError::Configuration(format!(
                "membership.expiry_ms ({}) must exceed membership.frequency_ms ({})",
                m.expiry_ms, m.frequency_ms
            )));
        }

        non_zero("sender.timeout_ms", self.sender.timeout_ms)?;
        if self.sender.keep_alive_count == Some(0) {
            return Err(ClusterError::Configuration(
                "sender.keep_alive_count must be at least 1".to_string(),
            ));
        }

        non_zero("receiver.max_workers", self.receiver.max_workers as u64)?;
        non_zero("receiver.max_frame_len", self.receiver.max_frame_len as u64)?;
        non_zero("channel.dispatch_queue_len", self.channel.dispatch_queue_len as u64)?;
        non_zero("channel.order_expire_ms", self.channel.order_expire_ms)?;
        non_zero("channel.order_max_queue", self.channel.order_max_queue as u64)?;
        non_zero("map.rpc_timeout_ms", self.map.rpc_timeout_ms)?;
        Ok(())
    }
}

fn non_zero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        Err(ClusterError::Configuration(format!("{} must be greater than 0", field)))
    } else {
        Ok(())
    }
}

/// How heartbeats find the other members.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Discovery {
    /// Send every heartbeat to a multicast group; every member joins the group.
    Multicast { group: Ipv4Addr, port: u16 },
    /// Send every heartbeat to each listed peer. More peers can be added at runtime.
    Static {
        #[serde(default)]
        peers: Vec<SocketAddr>,
    },
}

impl Default for Discovery {
    fn default() -> Self {
        Discovery::Static { peers: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// UDP address the heartbeat socket binds to.
    pub bind: SocketAddr,
    pub discovery: Discovery,
    /// Heartbeat broadcast period.
    pub frequency_ms: u64,
    /// A member is evicted once it has been silent this long.
    pub expiry_ms: u64,
    /// Eviction sweep period.
    pub sweep_interval_ms: u64,
    /// Opaque bytes advertised with the local member.
    pub payload: Vec<u8>,
    /// Cluster name. Heartbeats from other domains are ignored, so several clusters can
    /// share one multicast group.
    pub domain: String,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 45564)),
            discovery: Discovery::default(),
            frequency_ms: 500,
            expiry_ms: 3000,
            sweep_interval_ms: 500,
            payload: Vec::new(),
            domain: String::new(),
        }
    }
}

impl MembershipConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Extra attempts after the first one fails. `0` means fail on the first error.
    pub max_retry_attempts: u32,
    /// Overall deadline for one destination, retries included.
    pub timeout_ms: u64,
    /// Messages per connection before it is recycled. `None` = unlimited.
    pub keep_alive_count: Option<u64>,
    /// Idle time before a connection is closed. `None` = never.
    pub keep_alive_time_ms: Option<u64>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 1,
            timeout_ms: 3000,
            keep_alive_count: None,
            keep_alive_time_ms: None,
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive_time(&self) -> Option<Duration> {
        self.keep_alive_time_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// TCP address the data listener binds to. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Host other members use to reach this node. Defaults to the bind host, or the
    /// loopback address when binding the wildcard.
    pub advertise: Option<IpAddr>,
    /// Size of the dispatch pool.
    pub max_workers: usize,
    pub max_frame_len: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4000)),
            advertise: None,
            max_workers: 16,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Reject interceptor stacks whose option flags overlap.
    pub option_check: bool,
    /// Bounded queue of the asynchronous dispatch stage.
    pub dispatch_queue_len: usize,
    /// How long the order stage waits for a missing sequence number.
    pub order_expire_ms: u64,
    /// Buffered messages per sender before the order stage flushes anyway.
    pub order_max_queue: usize,
    /// Hex-encoded AES key (16 or 32 bytes) enabling the `secure` option.
    pub encryption_key: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            option_check: true,
            dispatch_queue_len: 1024,
            order_expire_ms: 3000,
            order_max_queue: 256,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Bound on every map RPC (get, state transfer, start handshake).
    pub rpc_timeout_ms: u64,
    /// Number of backup copies kept for each entry.
    pub backup_count: usize,
    /// Options used for backup replication messages.
    pub send_options: SendOptions,
    /// Pull a state copy from an existing member on start.
    pub state_transfer: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5000,
            backup_count: 1,
            send_options: SendOptions::DEFAULT,
            state_transfer: true,
        }
    }
}

impl MapConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
