use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use super::types::{
    EntryRole, MapEntry, MapMessage, Version, WireEntry, choose_backups, merge,
};
use crate::channel::group::GroupChannel;
use crate::channel::options::SendOptions;
use crate::channel::rpc::{ResponseMode, RpcCallback, RpcChannel, RpcResponse};
use crate::config::MapConfig;
use crate::error::{ClusterError, Result};
use crate::membership::types::{Member, MemberId, MembershipListener, now_ms};

/// Untyped core shared by the handle and the channel callbacks.
struct MapInner {
    name: String,
    config: MapConfig,
    channel: Arc<GroupChannel>,
    rpc: RpcChannel,
    callback: Arc<MapCallback>,
    local: Member,
    entries: DashMap<Vec<u8>, MapEntry>,
    /// Members running this map, sorted by id. The local member is not included.
    members: RwLock<BTreeMap<MemberId, Member>>,
    counter: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl MapInner {
    fn local_id(&self) -> MemberId {
        self.local.unique_id
    }

    fn map_members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    fn is_member(&self, id: &MemberId) -> bool {
        id == &self.local.unique_id || self.members.read().contains_key(id)
    }

    fn add_member(&self, member: &Member) -> bool {
        if member.unique_id == self.local.unique_id {
            return false;
        }
        let added = self
            .members
            .write()
            .insert(member.unique_id, member.clone())
            .is_none();
        if added {
            tracing::info!("Map {}: member {} joined", self.name, member.name());
        }
        added
    }

    fn next_version(&self, floor: Option<Version>) -> Version {
        let mut timestamp_ms = now_ms();
        if let Some(floor) = floor {
            timestamp_ms = timestamp_ms.max(floor.timestamp_ms + 1);
        }
        Version {
            timestamp_ms,
            counter: self.counter.fetch_add(1, Ordering::Relaxed) + 1,
            writer: self.local.unique_id,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) && self.channel.is_running() {
            Ok(())
        } else {
            Err(ClusterError::NotRunning)
        }
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClusterError::Stopped);
        }
        if !self.channel.is_running() {
            return Err(ClusterError::NotRunning);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.channel.add_membership_listener(self.callback.clone());

        let peers = self.channel.members();
        if !peers.is_empty() {
            match self.call(&peers, &MapMessage::Start, ResponseMode::All).await {
                Ok(responses) => {
                    for response in responses {
                        self.add_member(&response.source);
                    }
                }
                Err(e) => tracing::info!("Map {}: no peers answered start ({})", self.name, e),
            }
        }

        if self.config.state_transfer {
            self.transfer_state().await;
        }

        tracing::info!(
            "Map {} started with {} peer(s), {} entr(ies)",
            self.name,
            self.members.read().len(),
            self.entries.len()
        );
        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let listener: Arc<dyn MembershipListener> = self.callback.clone();
        self.channel.remove_membership_listener(&listener);

        let peers = self.map_members();
        if was_running && !peers.is_empty() && self.channel.is_running() {
            if let Err(e) = self.notify(&peers, &MapMessage::Stop, SendOptions::USE_ACK).await {
                tracing::warn!("Map {}: stop notice incomplete: {}", self.name, e);
            }
        }
        self.rpc.close();
        tracing::info!("Map {} stopped", self.name);
    }

    /// Pulls a copy of the entries from the first member that answers.
    async fn transfer_state(self: &Arc<Self>) {
        for member in self.map_members() {
            let responses = match self
                .call(std::slice::from_ref(&member), &MapMessage::StateRequest, ResponseMode::FirstReply)
                .await
            {
                Ok(responses) => responses,
                Err(e) => {
                    tracing::warn!("Map {}: state request to {} failed: {}", self.name, member.name(), e);
                    continue;
                }
            };

            let Some(MapMessage::State(entries)) = responses
                .first()
                .and_then(|r| MapMessage::decode(&r.payload).ok())
            else {
                continue;
            };

            let count = entries.len();
            let adopted = self.integrate_state(entries);
            tracing::info!(
                "Map {}: received {} entr(ies) from {}, adopted {}",
                self.name,
                count,
                member.name(),
                adopted.len()
            );
            for key in adopted {
                self.rebalance(&key).await;
            }
            return;
        }
    }

    /// Stores transferred entries. Entries whose primary is gone are adopted; their keys are
    /// returned for re-replication.
    fn integrate_state(&self, entries: Vec<WireEntry>) -> Vec<Vec<u8>> {
        let alive: Vec<MemberId> = self
            .channel
            .members()
            .iter()
            .map(|m| m.unique_id)
            .collect();
        let mut adopted = Vec::new();

        for mut wire in entries {
            let primary_alive = wire.primary.as_ref().is_some_and(|p| {
                p.unique_id == self.local.unique_id || alive.contains(&p.unique_id)
            });

            if !primary_alive {
                if wire.value.is_none() {
                    continue;
                }
                wire.primary = Some(self.local.clone());
                wire.backups.clear();
                adopted.push(wire.key.clone());
            }
            self.integrate(wire);
        }
        adopted
    }

    /// Merges an incoming copy while holding the key's shard, so a concurrent newer copy
    /// cannot be overwritten by an older one.
    fn integrate(&self, wire: WireEntry) -> bool {
        let key_len = wire.key.len();
        let local = self.local.unique_id;
        let merged = match self.entries.entry(wire.key.clone()) {
            Entry::Occupied(mut slot) => match merge(Some(slot.get()), wire, &local) {
                Some(entry) => {
                    let role = entry.role;
                    slot.insert(entry);
                    Some(role)
                }
                None => None,
            },
            Entry::Vacant(slot) => match merge(None, wire, &local) {
                Some(entry) => {
                    let role = entry.role;
                    slot.insert(entry);
                    Some(role)
                }
                None => None,
            },
        };
        match merged {
            Some(role) => {
                tracing::trace!("Map {}: {:?} for key of {} bytes", self.name, role, key_len);
                true
            }
            None => false,
        }
    }

    fn apply_remove(&self, key: &[u8], version: Version) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.version <= version)
            .is_some();
        if removed {
            tracing::trace!("Map {}: removed key of {} bytes", self.name, key.len());
        }
    }

    fn local_copy(&self, key: &[u8]) -> Option<WireEntry> {
        self.entries
            .get(key)
            .filter(|e| e.role != EntryRole::Proxy && e.value.is_some())
            .map(|e| e.to_wire(true))
    }

    fn export(&self) -> Vec<WireEntry> {
        self.entries
            .iter()
            .map(|e| e.to_wire(e.role != EntryRole::Proxy))
            .collect()
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.ensure_running()?;

        let floor = self.entries.get(&key).map(|e| e.version);
        let members = self.map_members();
        let entry = MapEntry {
            backups: choose_backups(&key, &members, self.config.backup_count, &[]),
            key: key.clone(),
            value: Some(value),
            role: EntryRole::Primary,
            primary: Some(self.local.clone()),
            version: self.next_version(floor),
        };

        self.entries.insert(key, entry.clone());
        self.replicate(entry, &members).await;
        Ok(())
    }

    async fn remove(&self, key: Vec<u8>) -> Result<()> {
        self.ensure_running()?;

        let floor = self.entries.remove(&key).map(|(_, e)| e.version);
        let version = self.next_version(floor);
        let members = self.map_members();
        if members.is_empty() {
            return Ok(());
        }

        let message = MapMessage::Remove { key, version };
        if let Err(e) = self.notify(&members, &message, self.config.send_options).await {
            tracing::warn!("Map {}: remove not delivered everywhere: {}", self.name, e);
        }
        Ok(())
    }

    /// Sends the value to the entry's backups and the ownership to everybody else. Backups
    /// that cannot be reached are dropped from the entry.
    async fn replicate(&self, entry: MapEntry, members: &[Member]) {
        if !entry.backups.is_empty() {
            let message = MapMessage::Backup(entry.to_wire(true));
            if let Err(e) = self.notify(&entry.backups, &message, self.config.send_options).await {
                tracing::warn!("Map {}: backup replication incomplete: {}", self.name, e);
                let failed: Vec<MemberId> = e
                    .faulty_members()
                    .iter()
                    .map(|f| f.member.unique_id)
                    .collect();
                if !failed.is_empty()
                    && let Some(mut local) = self.entries.get_mut(&entry.key)
                    && local.version == entry.version
                {
                    local.backups.retain(|b| !failed.contains(&b.unique_id));
                }
            }
        }

        let proxies: Vec<Member> = members
            .iter()
            .filter(|m| !entry.backups.iter().any(|b| b.unique_id == m.unique_id))
            .cloned()
            .collect();
        if !proxies.is_empty() {
            let message = MapMessage::Proxy(entry.to_wire(false));
            if let Err(e) = self.notify(&proxies, &message, SendOptions::NONE).await {
                tracing::debug!("Map {}: proxy update incomplete: {}", self.name, e);
            }
        }
    }

    /// Reselects backups for a primary entry, keeping the surviving ones, and re-replicates.
    async fn rebalance(&self, key: &[u8]) {
        let members = self.map_members();
        let entry = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return;
            };
            if entry.role != EntryRole::Primary {
                return;
            }
            let keep = entry.backups.clone();
            entry.backups = choose_backups(key, &members, self.config.backup_count, &keep);
            entry.clone()
        };
        self.replicate(entry, &members).await;
    }

    /// Gives primaries that are short of backups a chance to use a newly joined member.
    async fn top_up(&self) {
        let wanted = self.config.backup_count.min(self.members.read().len());
        let short: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|e| e.role == EntryRole::Primary && e.backups.len() < wanted)
            .map(|e| e.key().clone())
            .collect();

        if !short.is_empty() {
            tracing::info!("Map {}: topping up backups for {} entr(ies)", self.name, short.len());
        }
        for key in short {
            self.rebalance(&key).await;
        }
    }

    /// Whether the owner of an entry is gone: it is the member that just left, or it is
    /// neither a map member nor alive on the channel any more.
    fn owner_gone(&self, owner: &Member, departed: &Member, alive: &[MemberId]) -> bool {
        owner.unique_id == departed.unique_id
            || (!self.is_member(&owner.unique_id) && !alive.contains(&owner.unique_id))
    }

    /// Takes over entries owned by a member that left. Every entry whose primary is gone is
    /// checked, not only the departed member's, so a backup that dies together with its
    /// primary hands the entry on to the next backup.
    async fn member_gone(&self, departed: &Member) {
        if self.members.write().remove(&departed.unique_id).is_none() {
            return;
        }
        tracing::info!("Map {}: member {} left", self.name, departed.name());
        let alive: Vec<MemberId> = self
            .channel
            .members()
            .iter()
            .map(|m| m.unique_id)
            .collect();

        let mut promoted = Vec::new();
        let mut repair = Vec::new();
        let mut lost = Vec::new();

        let keys: Vec<Vec<u8>> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let before = entry.backups.len();
            entry.backups.retain(|b| b.unique_id != departed.unique_id);
            let lost_backup = entry.backups.len() != before;
            let primary_gone = entry
                .primary
                .as_ref()
                .is_some_and(|p| self.owner_gone(p, departed, &alive));

            if primary_gone {
                let heir = entry
                    .backups
                    .iter()
                    .find(|b| self.is_member(&b.unique_id))
                    .map(|b| b.unique_id);
                match heir {
                    Some(heir) if heir == self.local.unique_id && entry.value.is_some() => {
                        entry.role = EntryRole::Primary;
                        entry.primary = Some(self.local.clone());
                        entry.backups.retain(|b| b.unique_id != self.local.unique_id);
                        promoted.push(key);
                    }
                    Some(_) => {}
                    None => lost.push(key),
                }
            } else if lost_backup && entry.role == EntryRole::Primary {
                repair.push(key);
            }
        }

        for key in &lost {
            self.entries.remove(key);
        }
        if !lost.is_empty() {
            tracing::warn!(
                "Map {}: {} entr(ies) lost with {}, no backup survived",
                self.name,
                lost.len(),
                departed.name()
            );
        }
        if !promoted.is_empty() {
            tracing::info!(
                "Map {}: promoted to primary for {} entr(ies) of {}",
                self.name,
                promoted.len(),
                departed.name()
            );
        }

        for key in promoted.iter().chain(repair.iter()) {
            self.rebalance(key).await;
        }
    }

    /// Every step of the lookup shares one `rpc_timeout` budget.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_running()?;
        let deadline = Instant::now() + self.config.rpc_timeout();

        let known = self.entries.get(key).map(|e| e.clone());
        if let Some(entry) = &known {
            if entry.role != EntryRole::Proxy && entry.value.is_some() {
                return Ok(entry.value.clone());
            }

            let backups: Vec<Member> = entry
                .backups
                .iter()
                .filter(|b| b.unique_id != self.local.unique_id && self.is_member(&b.unique_id))
                .cloned()
                .collect();
            if let Some(value) = self.retrieve_from(&backups, key, deadline).await {
                return Ok(Some(value));
            }

            let primary: Vec<Member> = entry
                .primary
                .iter()
                .filter(|p| p.unique_id != self.local.unique_id && self.is_member(&p.unique_id))
                .cloned()
                .collect();
            if let Some(value) = self.retrieve_from(&primary, key, deadline).await {
                return Ok(Some(value));
            }
        }

        let members = self.map_members();
        if members.is_empty() {
            return Ok(None);
        }
        let Some(budget) = remaining(deadline) else {
            return Err(ClusterError::Timeout {
                operation: "map get",
                after: self.config.rpc_timeout(),
            });
        };
        let message = MapMessage::Retrieve { key: key.to_vec() };
        let responses = self
            .call_within(&members, &message, ResponseMode::All, budget)
            .await?;
        Ok(newest_value(&responses).map(|(_, value)| value))
    }

    async fn retrieve_from(&self, members: &[Member], key: &[u8], deadline: Instant) -> Option<Vec<u8>> {
        if members.is_empty() {
            return None;
        }
        let budget = remaining(deadline)?;
        let message = MapMessage::Retrieve { key: key.to_vec() };
        match self
            .call_within(members, &message, ResponseMode::FirstReply, budget)
            .await
        {
            Ok(responses) => newest_value(&responses).map(|(_, value)| value),
            Err(e) => {
                tracing::debug!("Map {}: retrieve failed: {}", self.name, e);
                None
            }
        }
    }

    async fn call(&self, members: &[Member], message: &MapMessage, mode: ResponseMode) -> Result<Vec<RpcResponse>> {
        self.call_within(members, message, mode, self.config.rpc_timeout())
            .await
    }

    async fn call_within(
        &self,
        members: &[Member],
        message: &MapMessage,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Result<Vec<RpcResponse>> {
        self.rpc
            .send(members, message.encode()?, mode, SendOptions::USE_ACK, timeout)
            .await
    }

    /// Brings a member that (re)appeared on the channel back into the map if it runs it.
    async fn readmit(&self, member: &Member) {
        if !self.running.load(Ordering::Acquire) || self.is_member(&member.unique_id) {
            return;
        }
        match self
            .call(std::slice::from_ref(member), &MapMessage::Start, ResponseMode::FirstReply)
            .await
        {
            Ok(responses) if !responses.is_empty() => {
                if self.add_member(member) {
                    self.top_up().await;
                }
            }
            Ok(_) => tracing::debug!("Map {}: {} does not run this map", self.name, member.name()),
            Err(e) => tracing::debug!("Map {}: could not reach {}: {}", self.name, member.name(), e),
        }
    }

    async fn notify(&self, members: &[Member], message: &MapMessage, options: SendOptions) -> Result<()> {
        self.rpc
            .send(
                members,
                message.encode()?,
                ResponseMode::NoReply,
                options,
                self.config.rpc_timeout(),
            )
            .await
            .map(|_| ())
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn newest_value(responses: &[RpcResponse]) -> Option<(Version, Vec<u8>)> {
    responses
        .iter()
        .filter_map(|r| match MapMessage::decode(&r.payload) {
            Ok(MapMessage::Value(Some(wire))) => wire.value.map(|v| (wire.version, v)),
            _ => None,
        })
        .max_by(|a, b| a.0.cmp(&b.0))
}

/// Channel and membership hooks of one map. Holds the map weakly so dropping every handle
/// releases it.
struct MapCallback {
    map: Weak<MapInner>,
}

#[async_trait]
impl RpcCallback for MapCallback {
    async fn reply_request(&self, request: Bytes, sender: &Member) -> Option<Vec<u8>> {
        let map = self.map.upgrade()?;
        if map.stopped.load(Ordering::Acquire) {
            return None;
        }

        let message = match MapMessage::decode(&request) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Map {}: undecodable message from {}: {}", map.name, sender.name(), e);
                return None;
            }
        };

        let reply = match message {
            MapMessage::Start => {
                if map.add_member(sender) {
                    tokio::spawn(async move { map.top_up().await });
                }
                Some(MapMessage::Started)
            }
            MapMessage::Stop => {
                let departed = sender.clone();
                tokio::spawn(async move { map.member_gone(&departed).await });
                None
            }
            MapMessage::Backup(wire) | MapMessage::Proxy(wire) => {
                map.add_member(sender);
                map.integrate(wire);
                None
            }
            MapMessage::Remove { key, version } => {
                map.apply_remove(&key, version);
                None
            }
            MapMessage::Retrieve { key } => Some(MapMessage::Value(map.local_copy(&key))),
            MapMessage::StateRequest => Some(MapMessage::State(map.export())),
            MapMessage::Started | MapMessage::Value(_) | MapMessage::State(_) => None,
        }?;

        match reply.encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                tracing::error!("Failed to encode map reply: {}", e);
                None
            }
        }
    }

    fn leftover_message(&self, _reply: Bytes, sender: &Member) {
        tracing::trace!("Late map reply from {}", sender.name());
    }
}

impl MembershipListener for MapCallback {
    fn member_added(&self, member: &Member) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let joined = member.clone();
        tokio::spawn(async move { map.readmit(&joined).await });
    }

    fn member_disappeared(&self, member: &Member) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let departed = member.clone();
        tokio::spawn(async move { map.member_gone(&departed).await });
    }
}

/// A key/value map replicated across the members of a [`GroupChannel`].
///
/// Each key has one primary (the member that wrote it last) and up to `backup_count`
/// backups holding a copy of the value; every other member keeps a proxy entry that only
/// records where the value lives. When a primary leaves, its first surviving backup takes
/// over. Keys and values are bincode-encoded, so any serde type works.
pub struct ReplicatedMap<K, V> {
    inner: Arc<MapInner>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for ReplicatedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Registers the map on `channel`. Members answer map traffic right away but the map
    /// only joins the others on `start`.
    pub fn new(name: impl Into<String>, channel: Arc<GroupChannel>, config: MapConfig) -> Self {
        let name = name.into();
        let local = channel.local_member();
        let inner = Arc::new_cyclic(|weak: &Weak<MapInner>| {
            let callback = Arc::new(MapCallback { map: weak.clone() });
            let rpc_id = format!("map:{}", name).into_bytes();
            let rpc = RpcChannel::new(rpc_id, channel.clone(), callback.clone());
            MapInner {
                name,
                config,
                channel,
                rpc,
                callback,
                local,
                entries: DashMap::new(),
                members: RwLock::new(BTreeMap::new()),
                counter: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }
        });

        Self {
            inner,
            _types: PhantomData,
        }
    }

    /// Announces the map to the other members and pulls their state.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Tells the other members this copy is going away. They fail over its entries.
    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<()> {
        let key = bincode::serialize(key)?;
        let value = bincode::serialize(value)?;
        self.inner.put(key, value).await
    }

    /// Local value if this member holds one, otherwise asks the members that do.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let key = bincode::serialize(key)?;
        match self.inner.get(&key).await? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &K) -> Result<()> {
        let key = bincode::serialize(key)?;
        self.inner.remove(key).await
    }

    /// Whether this member knows the key in any role.
    pub fn contains_key(&self, key: &K) -> bool {
        bincode::serialize(key)
            .map(|k| self.inner.entries.contains_key(&k))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner
            .entries
            .iter()
            .filter_map(|e| bincode::deserialize(e.key()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn entry_role(&self, key: &K) -> Option<EntryRole> {
        self.entry(key).map(|e| e.role)
    }

    /// Local copy of the entry for `key`, including ownership.
    pub fn entry(&self, key: &K) -> Option<MapEntry> {
        let key = bincode::serialize(key).ok()?;
        self.inner.entries.get(&key).map(|e| e.clone())
    }

    /// Other members running this map.
    pub fn map_members(&self) -> Vec<Member> {
        self.inner.map_members()
    }

    pub fn local_member(&self) -> &Member {
        &self.inner.local
    }

    /// Feeds a replicated copy in as if it came from another member.
    #[cfg(test)]
    pub(crate) fn integrate_copy(&self, wire: WireEntry) -> bool {
        self.inner.integrate(wire)
    }

    /// Counts of local entries per role: (primary, backup, proxy).
    pub fn role_counts(&self) -> (usize, usize, usize) {
        self.inner
            .entries
            .iter()
            .fold((0, 0, 0), |(p, b, x), e| match e.role {
                EntryRole::Primary => (p + 1, b, x),
                EntryRole::Backup => (p, b + 1, x),
                EntryRole::Proxy => (p, b, x + 1),
            })
    }
}
