//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: identity of members and the datagram wire format.
//! - **View Logic**: arrival, refresh, expiry at the exact boundary and restart replacement.
//! - **Service Logic**: discovery between live services, shutdown notices, listener events and
//!   broadcast datagrams.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::error::ClusterError;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{
        Datagram, Heartbeat, HeartbeatCommand, Member, MemberId, MembershipListener,
    };
    use crate::membership::view::{HeartbeatOutcome, MembershipView};
    use crate::testing::{local_config, wait_until};
    use crate::transport::frame::Frame;
    use crate::transport::receiver::FrameHandler;

    fn member(port: u16) -> Member {
        Member::new(SocketAddr::from(([127, 0, 0, 1], port)), Vec::new())
    }

    #[derive(Default)]
    struct Events {
        log: Mutex<Vec<String>>,
    }

    impl MembershipListener for Events {
        fn member_added(&self, member: &Member) {
            self.log.lock().push(format!("added:{}", member.port));
        }

        fn member_disappeared(&self, member: &Member) {
            self.log.lock().push(format!("gone:{}", member.port));
        }
    }

    // ============================================================
    // MEMBER TESTS
    // ============================================================

    #[test]
    fn test_member_id_is_unique() {
        let id1 = MemberId::new();
        let id2 = MemberId::new();

        assert_ne!(id1, id2, "Each MemberId should be unique");
        assert_eq!(id1.to_string().len(), 36);
    }

    #[test]
    fn test_member_identity_includes_endpoint() {
        let a = member(4000);
        let mut same = a.clone();
        same.seq = 99;
        same.payload = vec![1];
        let mut moved = a.clone();
        moved.port = 4001;

        assert_eq!(a, same, "seq and payload are not part of identity");
        assert_ne!(a, moved);

        let set: HashSet<Member> = [a.clone(), same, moved].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.name(), "tcp://127.0.0.1:4000");
    }

    // ============================================================
    // DATAGRAM TESTS
    // ============================================================

    #[test]
    fn test_heartbeat_datagram_decodes() {
        let heartbeat = Heartbeat {
            member: member(4000),
            command: HeartbeatCommand::Shutdown,
        };
        let encoded = heartbeat.encode().unwrap();

        match Datagram::decode(&encoded).unwrap() {
            Datagram::Heartbeat(decoded) => {
                assert_eq!(decoded.member, heartbeat.member);
                assert_eq!(decoded.command, HeartbeatCommand::Shutdown);
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_datagrams_are_membership_errors() {
        for data in [&b""[..], &b"\x01junk"[..], &b"HXXXX"[..], &b"HCLHB\xff"[..]] {
            let err = Datagram::decode(data).unwrap_err();
            assert!(matches!(err, ClusterError::Membership(_)), "{:?}", data);
        }
    }

    // ============================================================
    // VIEW TESTS
    // ============================================================

    #[test]
    fn test_view_add_then_refresh() {
        let local = member(1);
        let mut view = MembershipView::new(local.unique_id);
        let now = Instant::now();
        let remote = member(2);

        assert_eq!(
            view.member_alive(remote.clone(), now),
            HeartbeatOutcome::Added(remote.clone())
        );
        assert_eq!(
            view.member_alive(remote.clone(), now + Duration::from_millis(10)),
            HeartbeatOutcome::Refreshed
        );
        assert_eq!(view.member_alive(local, now), HeartbeatOutcome::Ignored);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_expiry_boundary() {
        let mut view = MembershipView::new(MemberId::new());
        let start = Instant::now();
        let remote = member(2);
        let expiry = Duration::from_millis(3000);
        view.member_alive(remote.clone(), start);

        let just_before = start + Duration::from_millis(2999);
        assert!(view.is_alive(&remote.unique_id, expiry, just_before));
        assert!(view.expire(expiry, just_before).is_empty());

        let at_expiry = start + expiry;
        assert!(!view.is_alive(&remote.unique_id, expiry, at_expiry));
        assert_eq!(view.expire(expiry, at_expiry), vec![remote]);
        assert!(view.is_empty());
    }

    #[test]
    fn test_restart_with_same_id_replaces_entry() {
        let mut view = MembershipView::new(MemberId::new());
        let now = Instant::now();
        let old = member(2);
        view.member_alive(old.clone(), now);

        let mut restarted = old.clone();
        restarted.alive_since_ms += 1000;
        assert_eq!(
            view.member_alive(restarted.clone(), now),
            HeartbeatOutcome::Replaced {
                old: old.clone(),
                new: restarted.clone()
            }
        );

        // A late heartbeat from the previous incarnation changes nothing.
        assert_eq!(view.member_alive(old, now), HeartbeatOutcome::Ignored);
        assert_eq!(view.get(&restarted.unique_id).unwrap().alive_since_ms, restarted.alive_since_ms);
    }

    #[test]
    fn test_restart_with_new_id_at_same_endpoint() {
        let mut view = MembershipView::new(MemberId::new());
        let now = Instant::now();
        let old = member(2);
        view.member_alive(old.clone(), now);

        let mut fresh = member(2);
        fresh.alive_since_ms = old.alive_since_ms + 1;
        let outcome = view.member_alive(fresh.clone(), now);

        assert!(matches!(outcome, HeartbeatOutcome::Replaced { .. }));
        assert_eq!(view.len(), 1);
        assert!(view.get(&old.unique_id).is_none());
        assert!(view.get(&fresh.unique_id).is_some());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let mut view = MembershipView::new(MemberId::new());
        let now = Instant::now();
        let a = member(2);
        view.member_alive(a.clone(), now);

        let snapshot = view.snapshot();
        view.member_alive(member(3), now);
        view.remove(&a.unique_id);

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&a.unique_id));
        assert_eq!(view.snapshot().len(), 1);
        assert!(!view.snapshot().contains(&a.unique_id));
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    async fn service(port: u16) -> Arc<MembershipService> {
        MembershipService::new(local_config().membership, SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap()
    }

    async fn linked_pair() -> (Arc<MembershipService>, Arc<MembershipService>) {
        let a = service(7001).await;
        let b = service(7002).await;
        a.add_peer(b.heartbeat_addr().unwrap());
        b.add_peer(a.heartbeat_addr().unwrap());
        (a, b)
    }

    #[tokio::test]
    async fn test_services_discover_each_other() {
        let (a, b) = linked_pair().await;
        let events = Arc::new(Events::default());
        a.add_listener(events.clone());

        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || a.has_members() && b.has_members()).await);
        assert_eq!(a.alive_members()[0].unique_id, b.local_id());
        assert_eq!(a.get_member(&b.local_id()).unwrap().port, 7002);
        assert_eq!(*events.log.lock(), vec!["added:7002"]);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_notice_removes_member_immediately() {
        let (a, b) = linked_pair().await;
        let events = Arc::new(Events::default());
        a.add_listener(events.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || a.has_members()).await);

        let stopped_at = Instant::now();
        b.stop().await;

        assert!(wait_until(Duration::from_secs(2), || !a.has_members()).await);
        assert!(
            stopped_at.elapsed() < a.expiry(),
            "member should go before its heartbeat expires"
        );
        assert_eq!(*events.log.lock(), vec!["added:7002", "gone:7002"]);

        a.stop().await;
    }

    #[tokio::test]
    async fn test_silent_member_expires() {
        let a = service(7003).await;
        let events = Arc::new(Events::default());
        a.add_listener(events.clone());

        let remote = member(7004);
        let heard = Instant::now();
        a.handle_heartbeat(
            Heartbeat {
                member: remote.clone(),
                command: HeartbeatCommand::Alive,
            },
            heard,
        );
        assert!(a.has_members());

        assert!(a.check_expired(heard + a.expiry() - Duration::from_millis(1)).is_empty());
        assert_eq!(a.check_expired(heard + a.expiry()), vec![remote]);
        assert_eq!(*events.log.lock(), vec!["added:7004", "gone:7004"]);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_silent_member() {
        let a = service(7009).await;
        let events = Arc::new(Events::default());
        a.add_listener(events.clone());
        a.start().await.unwrap();

        a.handle_heartbeat(
            Heartbeat {
                member: member(7010),
                command: HeartbeatCommand::Alive,
            },
            Instant::now(),
        );
        assert!(a.has_members());

        assert!(wait_until(Duration::from_secs(2), || !a.has_members()).await);
        assert_eq!(*events.log.lock(), vec!["added:7010", "gone:7010"]);

        a.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let a = service(7005).await;
        a.start().await.unwrap();
        assert!(a.is_running());

        a.stop().await;
        a.stop().await;

        assert!(!a.is_running());
        assert!(matches!(a.start().await, Err(ClusterError::Stopped)));
    }

    async fn service_in(domain: &str, port: u16) -> Arc<MembershipService> {
        let mut config = local_config().membership;
        config.domain = domain.to_string();
        MembershipService::new(config, SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_from_other_domain_is_ignored() {
        let a = service_in("farm-a", 7006).await;
        let events = Arc::new(Events::default());
        a.add_listener(events.clone());

        let stranger = member(7007).with_domain("farm-b");
        a.handle_heartbeat(
            Heartbeat {
                member: stranger,
                command: HeartbeatCommand::Alive,
            },
            Instant::now(),
        );
        assert!(!a.has_members());

        let neighbour = member(7008).with_domain("farm-a");
        a.handle_heartbeat(
            Heartbeat {
                member: neighbour,
                command: HeartbeatCommand::Alive,
            },
            Instant::now(),
        );
        assert!(a.has_members());
        assert_eq!(*events.log.lock(), vec!["added:7008"]);
        assert_eq!(a.domain(), b"farm-a");
    }

    #[tokio::test]
    async fn test_domains_sharing_targets_stay_apart() {
        let a = service_in("farm-a", 7011).await;
        let b = service_in("farm-b", 7012).await;
        let c = service_in("farm-a", 7013).await;
        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            x.add_peer(y.heartbeat_addr().unwrap());
            y.add_peer(x.heartbeat_addr().unwrap());
        }
        a.start().await.unwrap();
        b.start().await.unwrap();
        c.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || a.has_members() && c.has_members()).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.alive_members().len(), 1);
        assert_eq!(a.alive_members()[0].unique_id, c.local_id());
        assert_eq!(c.alive_members().len(), 1);
        assert!(!b.has_members());

        a.stop().await;
        b.stop().await;
        c.stop().await;
    }

    struct Inbox {
        frames: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameHandler for Inbox {
        async fn handle(&self, frame: Frame, _peer: SocketAddr) -> crate::error::Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broadcast_datagram_reaches_message_handler() {
        let (a, b) = linked_pair().await;
        let inbox = Arc::new(Inbox {
            frames: Mutex::new(Vec::new()),
        });
        b.set_message_handler(inbox.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        let frame = Frame::new(0x0040, bytes::Bytes::from_static(b"to everybody"));
        a.broadcast_datagram(&Datagram::message(&frame.to_bytes()))
            .await
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !inbox.frames.lock().is_empty()).await);
        assert_eq!(inbox.frames.lock()[0], frame);

        a.stop().await;
        b.stop().await;
    }
}
