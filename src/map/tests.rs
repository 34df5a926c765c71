//! Replicated Map Module Tests
//!
//! ## Test Scopes
//! - **Placement**: backup selection is stable and bounded.
//! - **Merging**: last-writer-wins and ownership-only updates.
//! - **Cluster Behaviour**: replication, reads through proxies, failover, removal and
//!   state transfer for late joiners.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use crate::channel::group::GroupChannel;
    use crate::channel::interceptor::{Interceptor, Next};
    use crate::channel::message::ChannelMessage;
    use crate::config::MapConfig;
    use crate::error::ClusterError;
    use crate::map::replicated::ReplicatedMap;
    use crate::map::types::{
        EntryRole, MapEntry, Version, WireEntry, choose_backups, merge, role_for,
    };
    use crate::membership::types::{Member, MemberId};
    use crate::testing::{join_cluster, local_config, start_cluster, wait_until};

    // ============================================================
    // HELPERS
    // ============================================================

    fn members(count: usize) -> Vec<Member> {
        let mut members: Vec<Member> = (0..count)
            .map(|i| Member::new(format!("127.0.0.1:{}", 5000 + i).parse().unwrap(), Vec::new()))
            .collect();
        members.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        members
    }

    fn version(timestamp_ms: u64, counter: u64) -> Version {
        Version {
            timestamp_ms,
            counter,
            writer: MemberId([0; 16]),
        }
    }

    fn wire(primary: &Member, backups: &[Member], value: Option<&[u8]>, version: Version) -> WireEntry {
        WireEntry {
            key: b"key".to_vec(),
            value: value.map(|v| v.to_vec()),
            primary: Some(primary.clone()),
            backups: backups.to_vec(),
            version,
        }
    }

    type StringMap = ReplicatedMap<String, String>;

    async fn start_maps(nodes: &[Arc<GroupChannel>]) -> Vec<StringMap> {
        start_maps_with(nodes, local_config().map).await
    }

    async fn start_maps_with(nodes: &[Arc<GroupChannel>], config: MapConfig) -> Vec<StringMap> {
        let maps: Vec<StringMap> = nodes
            .iter()
            .map(|n| ReplicatedMap::new("test", n.clone(), config.clone()))
            .collect();
        for map in &maps {
            map.start().await.unwrap();
        }
        let peers = nodes.len() - 1;
        assert!(
            wait_until(Duration::from_secs(3), || maps
                .iter()
                .all(|m| m.map_members().len() == peers))
            .await
        );
        maps
    }

    async fn shutdown(maps: &[StringMap], nodes: &[Arc<GroupChannel>]) {
        for map in maps {
            map.stop().await;
        }
        for node in nodes {
            node.stop().await;
        }
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    fn index_of(maps: &[StringMap], member: &Member) -> usize {
        maps.iter()
            .position(|m| m.local_member().unique_id == member.unique_id)
            .unwrap()
    }

    /// Holds every inbound message for a while once switched on.
    struct Stall {
        on: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Interceptor for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        async fn receive(&self, message: ChannelMessage, next: Next) -> crate::error::Result<()> {
            if self.on.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            next.receive(message).await
        }
    }

    // ============================================================
    // PLACEMENT TESTS
    // ============================================================

    #[test]
    fn test_backup_choice_is_stable() {
        let members = members(5);
        let first = choose_backups(b"alpha", &members, 2, &[]);
        let second = choose_backups(b"alpha", &members, 2, &[]);

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_ne!(first[0].unique_id, first[1].unique_id);
    }

    #[test]
    fn test_backup_count_bounded_by_members() {
        let members = members(2);
        assert_eq!(choose_backups(b"k", &members, 5, &[]).len(), 2);
        assert!(choose_backups(b"k", &[], 1, &[]).is_empty());
    }

    #[test]
    fn test_surviving_backups_are_kept() {
        let members = members(4);
        let keep = vec![members[3].clone()];
        let chosen = choose_backups(b"k", &members, 2, &keep);

        assert_eq!(chosen.len(), 2);
        assert_eq!(chosen[0].unique_id, members[3].unique_id);

        // A departed backup is not kept.
        let gone = Member::new("127.0.0.1:9".parse().unwrap(), Vec::new());
        let chosen = choose_backups(b"k", &members, 1, &[gone.clone()]);
        assert_ne!(chosen[0].unique_id, gone.unique_id);
    }

    // ============================================================
    // MERGE TESTS
    // ============================================================

    #[test]
    fn test_version_order() {
        assert!(version(10, 1) < version(11, 0));
        assert!(version(10, 1) < version(10, 2));
    }

    #[test]
    fn test_role_follows_ownership() {
        let nodes = members(3);
        let entry = wire(&nodes[0], &[nodes[1].clone()], Some(b"v"), version(1, 1));

        assert_eq!(role_for(&nodes[0].unique_id, &entry), EntryRole::Primary);
        assert_eq!(role_for(&nodes[1].unique_id, &entry), EntryRole::Backup);
        assert_eq!(role_for(&nodes[2].unique_id, &entry), EntryRole::Proxy);
    }

    #[test]
    fn test_newer_wins_older_rejected() {
        let nodes = members(2);
        let local = nodes[1].unique_id;
        let current = merge(None, wire(&nodes[0], &[nodes[1].clone()], Some(b"new"), version(20, 1)), &local).unwrap();
        assert_eq!(current.role, EntryRole::Backup);

        let stale = wire(&nodes[0], &[nodes[1].clone()], Some(b"old"), version(10, 1));
        assert!(merge(Some(&current), stale, &local).is_none());

        let newer = wire(&nodes[0], &[nodes[1].clone()], Some(b"newer"), version(30, 1));
        let merged = merge(Some(&current), newer, &local).unwrap();
        assert_eq!(merged.value.as_deref(), Some(&b"newer"[..]));
    }

    #[test]
    fn test_ownership_update_keeps_value() {
        let nodes = members(3);
        let local = nodes[2].unique_id;
        let current: MapEntry = merge(
            None,
            wire(&nodes[0], &[nodes[2].clone()], Some(b"v"), version(5, 1)),
            &local,
        )
        .unwrap();

        // New primary, same version, value omitted: still a backup with the value.
        let moved = wire(&nodes[1], &[nodes[2].clone()], None, version(5, 1));
        let merged = merge(Some(&current), moved, &local).unwrap();
        assert_eq!(merged.role, EntryRole::Backup);
        assert_eq!(merged.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(merged.primary.unwrap().unique_id, nodes[1].unique_id);
    }

    #[test]
    fn test_proxy_drops_value() {
        let nodes = members(3);
        let local = nodes[2].unique_id;
        let merged = merge(None, wire(&nodes[0], &[nodes[1].clone()], Some(b"v"), version(1, 1)), &local).unwrap();
        assert_eq!(merged.role, EntryRole::Proxy);
        assert!(merged.value.is_none());
    }

    // ============================================================
    // CLUSTER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_operations_require_start() {
        let nodes = start_cluster(1, |b| b).await;
        let map: StringMap = ReplicatedMap::new("idle", nodes[0].clone(), nodes[0].config().map.clone());

        let err = map.put(&key("k"), &key("v")).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotRunning));

        map.start().await.unwrap();
        map.put(&key("k"), &key("v")).await.unwrap();
        assert_eq!(map.get(&key("k")).await.unwrap(), Some(key("v")));
        assert_eq!(map.get(&key("missing")).await.unwrap(), None);

        shutdown(&[map], &nodes).await;
    }

    #[tokio::test]
    async fn test_put_replicates_to_backup() {
        let nodes = start_cluster(2, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("alpha"), &key("one")).await.unwrap();

        assert_eq!(maps[0].entry_role(&key("alpha")), Some(EntryRole::Primary));
        assert!(wait_until(Duration::from_secs(2), || maps[1].entry_role(&key("alpha")) == Some(EntryRole::Backup)).await);
        assert_eq!(maps[1].get(&key("alpha")).await.unwrap(), Some(key("one")));
        assert_eq!(maps[1].keys(), vec![key("alpha")]);
        assert!(maps[1].contains_key(&key("alpha")));

        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_proxy_reads_through_owner() {
        let nodes = start_cluster(3, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("beta"), &key("two")).await.unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || maps[1..]
                .iter()
                .all(|m| m.entry_role(&key("beta")).is_some()))
            .await
        );
        let proxy = maps[1..]
            .iter()
            .find(|m| m.entry_role(&key("beta")) == Some(EntryRole::Proxy))
            .expect("one member should only proxy the key");
        assert!(proxy.entry(&key("beta")).unwrap().value.is_none());
        assert_eq!(proxy.get(&key("beta")).await.unwrap(), Some(key("two")));

        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_backup_takes_over_when_primary_leaves() {
        let nodes = start_cluster(3, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("gamma"), &key("three")).await.unwrap();
        let backup_id = maps[0].entry(&key("gamma")).unwrap().backups[0].unique_id;
        let backup = if maps[1].local_member().unique_id == backup_id { 1 } else { 2 };
        let proxy = 3 - backup;

        assert!(wait_until(Duration::from_secs(2), || maps[proxy].entry_role(&key("gamma")) == Some(EntryRole::Proxy)).await);

        nodes[0].stop().await;

        assert!(wait_until(Duration::from_secs(3), || maps[backup].entry_role(&key("gamma")) == Some(EntryRole::Primary)).await);
        assert_eq!(maps[proxy].get(&key("gamma")).await.unwrap(), Some(key("three")));
        // The promoted primary picks the remaining member as its new backup.
        assert!(wait_until(Duration::from_secs(3), || maps[proxy].entry_role(&key("gamma")) == Some(EntryRole::Backup)).await);

        shutdown(&maps[1..], &nodes[1..]).await;
    }

    #[tokio::test]
    async fn test_remove_reaches_every_member() {
        let nodes = start_cluster(2, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("delta"), &key("four")).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || maps[1].contains_key(&key("delta"))).await);

        maps[1].remove(&key("delta")).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || !maps[0].contains_key(&key("delta"))).await);
        assert_eq!(maps[0].get(&key("delta")).await.unwrap(), None);
        assert!(maps[0].is_empty());

        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let nodes = start_cluster(2, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("epsilon"), &key("first")).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || maps[1].contains_key(&key("epsilon"))).await);
        maps[1].put(&key("epsilon"), &key("second")).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || maps[0].entry_role(&key("epsilon")) == Some(EntryRole::Backup)).await);
        assert_eq!(maps[0].get(&key("epsilon")).await.unwrap(), Some(key("second")));
        assert_eq!(maps[1].entry_role(&key("epsilon")), Some(EntryRole::Primary));

        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_late_joiner_receives_state_and_backups() {
        let mut nodes = start_cluster(1, |b| b).await;
        let first: StringMap = ReplicatedMap::new("test", nodes[0].clone(), local_config().map);
        first.start().await.unwrap();
        first.put(&key("zeta"), &key("six")).await.unwrap();
        assert!(first.entry(&key("zeta")).unwrap().backups.is_empty());

        let joined = join_cluster(&nodes).await;
        nodes.push(joined.clone());
        let second: StringMap = ReplicatedMap::new("test", joined, local_config().map);
        second.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(3), || second.entry_role(&key("zeta")) == Some(EntryRole::Backup)).await);
        assert_eq!(second.get(&key("zeta")).await.unwrap(), Some(key("six")));
        assert_eq!(first.entry(&key("zeta")).unwrap().backups.len(), 1);

        shutdown(&[first, second], &nodes).await;
    }

    #[tokio::test]
    async fn test_backup_takes_over_when_primary_crashes() {
        let nodes = start_cluster(3, |b| b).await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("eta"), &key("seven")).await.unwrap();
        let backup = index_of(&maps, &maps[0].entry(&key("eta")).unwrap().backups[0]);
        let proxy = 3 - backup;
        assert!(wait_until(Duration::from_secs(2), || maps[proxy].entry_role(&key("eta")) == Some(EntryRole::Proxy)).await);

        // No shutdown notice: the others only learn through heartbeat expiry.
        nodes[0].crash().await;

        assert!(wait_until(Duration::from_secs(5), || maps[backup].entry_role(&key("eta")) == Some(EntryRole::Primary)).await);
        assert_eq!(maps[proxy].get(&key("eta")).await.unwrap(), Some(key("seven")));
        assert!(wait_until(Duration::from_secs(3), || maps[proxy].entry_role(&key("eta")) == Some(EntryRole::Backup)).await);

        shutdown(&maps[1..], &nodes[1..]).await;
    }

    #[tokio::test]
    async fn test_second_backup_takes_over_when_primary_and_first_backup_crash() {
        let nodes = start_cluster(4, |b| b).await;
        let config = MapConfig {
            backup_count: 2,
            ..local_config().map
        };
        let maps = start_maps_with(&nodes, config).await;

        maps[0].put(&key("theta"), &key("eight")).await.unwrap();
        let backups = maps[0].entry(&key("theta")).unwrap().backups;
        assert_eq!(backups.len(), 2);
        let first = index_of(&maps, &backups[0]);
        let second = index_of(&maps, &backups[1]);
        let proxy = (1..4).find(|i| *i != first && *i != second).unwrap();
        assert!(wait_until(Duration::from_secs(2), || maps[second].entry_role(&key("theta")) == Some(EntryRole::Backup)
            && maps[proxy].entry_role(&key("theta")) == Some(EntryRole::Proxy))
        .await);

        tokio::join!(nodes[0].crash(), nodes[first].crash());

        assert!(wait_until(Duration::from_secs(5), || maps[second].entry_role(&key("theta")) == Some(EntryRole::Primary)).await);
        assert!(maps[second].entry(&key("theta")).unwrap().value.is_some());
        assert_eq!(maps[proxy].get(&key("theta")).await.unwrap(), Some(key("eight")));

        for i in [second, proxy] {
            maps[i].stop().await;
        }
        for i in [second, proxy] {
            nodes[i].stop().await;
        }
    }

    #[tokio::test]
    async fn test_member_evicted_by_mistake_is_readmitted() {
        let nodes = start_cluster(2, |b| b).await;
        let maps = start_maps(&nodes).await;

        // Pretend the peer went silent; its next heartbeat brings it back.
        let evicted = nodes[0]
            .membership()
            .check_expired(Instant::now() + Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(wait_until(Duration::from_secs(3), || maps[0].map_members().len() == 1).await);

        maps[0].put(&key("iota"), &key("nine")).await.unwrap();
        assert_eq!(maps[0].entry(&key("iota")).unwrap().backups.len(), 1);
        assert!(wait_until(Duration::from_secs(2), || maps[1].entry_role(&key("iota")) == Some(EntryRole::Backup)).await);

        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_get_shares_one_timeout_across_attempts() {
        let switches: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::default();
        let nodes = start_cluster(3, |b| {
            let on = Arc::new(AtomicBool::new(false));
            switches.lock().push(on.clone());
            b.interceptor(Stall { on })
        })
        .await;
        let maps = start_maps(&nodes).await;

        maps[0].put(&key("kappa"), &key("ten")).await.unwrap();
        let backup = index_of(&maps, &maps[0].entry(&key("kappa")).unwrap().backups[0]);
        let proxy = 3 - backup;
        assert!(wait_until(Duration::from_secs(2), || maps[proxy].entry_role(&key("kappa")) == Some(EntryRole::Proxy)).await);

        let switches = switches.lock().clone();
        switches[0].store(true, Ordering::Release);
        switches[backup].store(true, Ordering::Release);

        let started = Instant::now();
        let err = maps[proxy].get(&key("kappa")).await.unwrap_err();
        let took = started.elapsed();
        assert!(err.is_timeout());
        // rpc_timeout is one second; backups, owner and the broadcast must fit in it.
        assert!(took < Duration::from_millis(1600), "get took {:?}", took);

        for on in &switches {
            on.store(false, Ordering::Release);
        }
        shutdown(&maps, &nodes).await;
    }

    #[tokio::test]
    async fn test_start_does_not_wait_for_members_without_the_map() {
        let nodes = start_cluster(2, |b| b).await;
        let map: StringMap = ReplicatedMap::new("alone", nodes[0].clone(), local_config().map);

        let started = Instant::now();
        map.start().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(map.map_members().is_empty());

        map.put(&key("lambda"), &key("eleven")).await.unwrap();
        assert!(map.entry(&key("lambda")).unwrap().backups.is_empty());

        shutdown(&[map], &nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_copies_keep_the_newest() {
        let nodes = start_cluster(1, |b| b).await;
        let map = Arc::new(StringMap::new("race", nodes[0].clone(), local_config().map));
        let owner = members(1).remove(0);
        let local = map.local_member().clone();
        let raw_key = bincode::serialize(&key("mu")).unwrap();

        let mut tasks = Vec::new();
        for counter in 1..=64u64 {
            let map = map.clone();
            let mut copy = wire(&owner, std::slice::from_ref(&local), Some(b"v"), version(1000, counter));
            copy.key = raw_key.clone();
            copy.value = Some(bincode::serialize(&format!("v{}", counter)).unwrap());
            tasks.push(tokio::spawn(async move { map.integrate_copy(copy) }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let entry = map.entry(&key("mu")).unwrap();
        assert_eq!(entry.version.counter, 64);
        assert_eq!(entry.role, EntryRole::Backup);

        nodes[0].stop().await;
    }
}
