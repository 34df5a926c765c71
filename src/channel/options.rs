//! Send option flags.
//!
//! A fixed enumeration of bits selecting optional send/receive semantics. The same bits are
//! carried on the wire in every frame header, and an interceptor declares the bits it
//! implements so the channel can detect stacks where two stages claim the same behaviour.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use crate::error::ClusterError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SendOptions(u32);

impl SendOptions {
    pub const NONE: SendOptions = SendOptions(0);
    /// Payload is raw bytes, not a serialized object.
    pub const BYTE_MESSAGE: SendOptions = SendOptions(0x0001);
    /// Wait for the receiver to acknowledge receipt.
    pub const USE_ACK: SendOptions = SendOptions(0x0002);
    /// Acknowledge only after the receiver has dispatched the message.
    pub const SYNCHRONIZED_ACK: SendOptions = SendOptions(0x0004);
    /// Hand the message to a background queue and return immediately.
    pub const ASYNCHRONOUS: SendOptions = SendOptions(0x0008);
    pub const SECURE: SendOptions = SendOptions(0x0010);
    pub const UDP: SendOptions = SendOptions(0x0020);
    /// Fan out over the membership broadcast socket instead of per-member connections.
    pub const MULTICAST: SendOptions = SendOptions(0x0040);
    /// Deliver messages from one sender in send order.
    pub const ORDERED: SendOptions = SendOptions(0x0080);
    pub const COMPRESSED: SendOptions = SendOptions(0x0100);

    pub const DEFAULT: SendOptions = SendOptions::USE_ACK;

    const NAMES: [(&'static str, SendOptions); 9] = [
        ("byte_message", SendOptions::BYTE_MESSAGE),
        ("use_ack", SendOptions::USE_ACK),
        ("synchronized_ack", SendOptions::SYNCHRONIZED_ACK),
        ("asynchronous", SendOptions::ASYNCHRONOUS),
        ("secure", SendOptions::SECURE),
        ("udp", SendOptions::UDP),
        ("multicast", SendOptions::MULTICAST),
        ("ordered", SendOptions::ORDERED),
        ("compressed", SendOptions::COMPRESSED),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        SendOptions(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: SendOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SendOptions) -> bool {
        self.0 & other.0 != 0
    }

    /// Resolve a single option name or alias.
    pub fn from_name(name: &str) -> Option<SendOptions> {
        let name = name.trim().to_ascii_lowercase();
        let flag = match name.as_str() {
            "byte" | "byte_message" => SendOptions::BYTE_MESSAGE,
            "ack" | "use_ack" => SendOptions::USE_ACK,
            "sync" | "synchronized_ack" => SendOptions::SYNCHRONIZED_ACK,
            "async" | "asynchronous" => SendOptions::ASYNCHRONOUS,
            "secure" => SendOptions::SECURE,
            "udp" => SendOptions::UDP,
            "multicast" => SendOptions::MULTICAST,
            "order" | "ordered" => SendOptions::ORDERED,
            "gzip" | "compressed" => SendOptions::COMPRESSED,
            _ => return None,
        };
        Some(flag)
    }

    /// Canonical names of the bits that are set, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl FromStr for SendOptions {
    type Err = ClusterError;

    /// Parses `"async, multicast"` style lists. Plain integers are accepted as raw bits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = SendOptions::NONE;

        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(flag) = SendOptions::from_name(token) {
                options |= flag;
                continue;
            }

            let bits = match token.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => token.parse::<u32>(),
            };

            match bits {
                Ok(bits) => options |= SendOptions(bits),
                Err(_) => {
                    return Err(ClusterError::Configuration(format!(
                        "unknown send option '{}'",
                        token
                    )));
                }
            }
        }

        Ok(options)
    }
}

impl TryFrom<String> for SendOptions {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SendOptions> for String {
    fn from(options: SendOptions) -> Self {
        options.to_string()
    }
}

impl fmt::Display for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = self.names();
        let unknown = self.0 & !Self::NAMES.iter().fold(0, |acc, (_, flag)| acc | flag.0);

        let mut parts: Vec<String> = known.into_iter().map(str::to_string).collect();
        if unknown != 0 {
            parts.push(format!("{:#x}", unknown));
        }
        f.write_str(&parts.join(", "))
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendOptions({:#06x}: {})", self.0, self)
    }
}

impl BitOr for SendOptions {
    type Output = SendOptions;

    fn bitor(self, rhs: SendOptions) -> SendOptions {
        SendOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendOptions {
    fn bitor_assign(&mut self, rhs: SendOptions) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SendOptions {
    type Output = SendOptions;

    fn bitand(self, rhs: SendOptions) -> SendOptions {
        SendOptions(self.0 & rhs.0)
    }
}

impl Not for SendOptions {
    type Output = SendOptions;

    fn not(self) -> SendOptions {
        SendOptions(!self.0)
    }
}
