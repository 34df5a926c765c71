//! Membership View
//!
//! The local table of known members and when each was last heard from. All mutation goes
//! through `&mut self`; the service wraps the view in a mutex. Readers never iterate the
//! live table: every structural change publishes a fresh `Arc<MembershipSnapshot>`, and
//! handing out a snapshot is a reference-count bump.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::{Member, MemberId};

struct ViewEntry {
    member: Member,
    last_heard: Instant,
}

/// Result of feeding one heartbeat into the view.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    /// First heartbeat from this member.
    Added(Member),
    /// Known member, timestamp refreshed.
    Refreshed,
    /// The member restarted: `old` is gone, `new` takes its place.
    Replaced { old: Member, new: Member },
    /// Heartbeat from ourselves or from an older incarnation.
    Ignored,
}

/// Immutable point-in-time copy of the alive members, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    members: Vec<Member>,
}

impl MembershipSnapshot {
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Member> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.unique_id == id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.get(id).is_some()
    }
}

pub struct MembershipView {
    local: MemberId,
    entries: HashMap<MemberId, ViewEntry>,
    snapshot: Arc<MembershipSnapshot>,
}

impl MembershipView {
    pub fn new(local: MemberId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            snapshot: Arc::new(MembershipSnapshot::default()),
        }
    }

    /// Record a heartbeat received at `now`.
    pub fn member_alive(&mut self, member: Member, now: Instant) -> HeartbeatOutcome {
        if member.unique_id == self.local {
            return HeartbeatOutcome::Ignored;
        }

        if let Some(entry) = self.entries.get_mut(&member.unique_id) {
            if member.alive_since_ms > entry.member.alive_since_ms {
                let old = std::mem::replace(&mut entry.member, member.clone());
                entry.last_heard = now;
                self.publish();
                return HeartbeatOutcome::Replaced { old, new: member };
            }
            if member.alive_since_ms < entry.member.alive_since_ms {
                return HeartbeatOutcome::Ignored;
            }
            entry.member.seq = entry.member.seq.max(member.seq);
            entry.member.payload = member.payload;
            entry.last_heard = now;
            return HeartbeatOutcome::Refreshed;
        }

        // Same endpoint under a new id: the process restarted with a fresh identity.
        let stale = self
            .entries
            .values()
            .find(|e| e.member.same_endpoint(&member))
            .map(|e| e.member.clone());

        if let Some(old) = stale {
            if member.alive_since_ms <= old.alive_since_ms {
                return HeartbeatOutcome::Ignored;
            }
            self.entries.remove(&old.unique_id);
            self.insert(member.clone(), now);
            return HeartbeatOutcome::Replaced { old, new: member };
        }

        self.insert(member.clone(), now);
        HeartbeatOutcome::Added(member)
    }

    pub fn remove(&mut self, id: &MemberId) -> Option<Member> {
        let removed = self.entries.remove(id).map(|e| e.member);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Evict every member silent for `expiry` or longer and return them.
    pub fn expire(&mut self, expiry: Duration, now: Instant) -> Vec<Member> {
        let expired: Vec<MemberId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heard) >= expiry)
            .map(|(id, _)| *id)
            .collect();

        let evicted: Vec<Member> = expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|e| e.member)
            .collect();

        if !evicted.is_empty() {
            self.publish();
        }
        evicted
    }

    pub fn is_alive(&self, id: &MemberId, expiry: Duration, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| now.saturating_duration_since(e.last_heard) < expiry)
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.entries.get(id).map(|e| e.member.clone())
    }

    pub fn last_heard(&self, id: &MemberId) -> Option<Instant> {
        self.entries.get(id).map(|e| e.last_heard)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.clone()
    }

    fn insert(&mut self, member: Member, now: Instant) {
        self.entries.insert(
            member.unique_id,
            ViewEntry {
                member,
                last_heard: now,
            },
        );
        self.publish();
    }

    fn publish(&mut self) {
        let mut members: Vec<Member> = self.entries.values().map(|e| e.member.clone()).collect();
        members.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        self.snapshot = Arc::new(MembershipSnapshot { members });
    }
}
