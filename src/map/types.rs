use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::membership::types::{Member, MemberId};

/// Last-writer-wins stamp. Compared field by field: wall clock, then the writer's counter,
/// then the writer id as a tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp_ms: u64,
    pub counter: u64,
    pub writer: MemberId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryRole {
    /// This node owns the entry.
    Primary,
    /// This node holds a replica of the value.
    Backup,
    /// This node only knows where the entry lives.
    Proxy,
}

/// Local view of one key.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub key: Vec<u8>,
    /// Present on primaries and backups.
    pub value: Option<Vec<u8>>,
    pub role: EntryRole,
    pub primary: Option<Member>,
    pub backups: Vec<Member>,
    pub version: Version,
}

/// An entry as it travels between members. The receiver derives its own role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub primary: Option<Member>,
    pub backups: Vec<Member>,
    pub version: Version,
}

impl MapEntry {
    pub fn to_wire(&self, with_value: bool) -> WireEntry {
        WireEntry {
            key: self.key.clone(),
            value: if with_value { self.value.clone() } else { None },
            primary: self.primary.clone(),
            backups: self.backups.clone(),
            version: self.version,
        }
    }

    pub fn is_primary_on(&self, id: &MemberId) -> bool {
        self.primary.as_ref().is_some_and(|p| &p.unique_id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MapMessage {
    /// A member brings its copy of the map online.
    Start,
    Started,
    /// A member takes its copy offline.
    Stop,
    Backup(WireEntry),
    Proxy(WireEntry),
    Remove { key: Vec<u8>, version: Version },
    Retrieve { key: Vec<u8> },
    Value(Option<WireEntry>),
    StateRequest,
    State(Vec<WireEntry>),
}

impl MapMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Picks up to `count` backups out of `members` (sorted, local member excluded).
///
/// Members in `keep` that are still present are kept first; the rest is filled walking the
/// member ring from `hash(key) % n`, so the same key lands on the same members.
pub fn choose_backups(key: &[u8], members: &[Member], count: usize, keep: &[Member]) -> Vec<Member> {
    let count = count.min(members.len());
    let mut chosen: Vec<Member> = keep
        .iter()
        .filter(|k| members.iter().any(|m| m.unique_id == k.unique_id))
        .take(count)
        .cloned()
        .collect();

    if members.is_empty() {
        return chosen;
    }

    let start = (key_hash(key) % members.len() as u64) as usize;
    for offset in 0..members.len() {
        if chosen.len() >= count {
            break;
        }
        let candidate = &members[(start + offset) % members.len()];
        if !chosen.iter().any(|c| c.unique_id == candidate.unique_id) {
            chosen.push(candidate.clone());
        }
    }
    chosen
}

/// Role this node plays for `wire`, judged from the ownership it carries.
pub fn role_for(local: &MemberId, wire: &WireEntry) -> EntryRole {
    if wire.primary.as_ref().is_some_and(|p| &p.unique_id == local) {
        EntryRole::Primary
    } else if wire.backups.iter().any(|b| &b.unique_id == local) {
        EntryRole::Backup
    } else {
        EntryRole::Proxy
    }
}

/// Merges an incoming entry into the local one. Returns the entry to store, or `None` if
/// the incoming copy is stale.
///
/// A newer version always wins. An equal version is accepted as an ownership update
/// (failover, new backup assignment) and keeps the local value if the update carries none.
pub fn merge(existing: Option<&MapEntry>, incoming: WireEntry, local: &MemberId) -> Option<MapEntry> {
    if existing.is_some_and(|e| incoming.version < e.version) {
        return None;
    }

    let mut role = role_for(local, &incoming);
    let mut value = incoming.value;

    if role != EntryRole::Proxy && value.is_none() {
        value = existing
            .filter(|e| e.version == incoming.version)
            .and_then(|e| e.value.clone());
        if value.is_none() {
            role = EntryRole::Proxy;
        }
    }
    if role == EntryRole::Proxy {
        value = None;
    }

    Some(MapEntry {
        key: incoming.key,
        value,
        role,
        primary: incoming.primary,
        backups: incoming.backups,
        version: incoming.version,
    })
}
