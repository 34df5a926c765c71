use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::types::{
    Datagram, Heartbeat, HeartbeatCommand, MAX_DATAGRAM, Member, MemberId, MembershipListener,
};
use super::view::{HeartbeatOutcome, MembershipSnapshot, MembershipView};
use crate::config::{Discovery, MembershipConfig};
use crate::error::{ClusterError, Result};
use crate::transport::frame::Frame;
use crate::transport::receiver::FrameHandler;

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Heartbeat-based membership.
///
/// Three background tasks share the service: the heartbeat loop announces the local member
/// every `frequency`, the receive loop feeds incoming heartbeats into the view, and the sweep
/// loop evicts members that stayed silent for `expiry`. Listeners hear about every change.
pub struct MembershipService {
    local_member: Member,
    config: MembershipConfig,
    view: Mutex<MembershipView>,
    socket: Arc<UdpSocket>,
    peers: RwLock<Vec<SocketAddr>>,
    multicast_target: Option<SocketAddr>,
    seq: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    message_handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum Change {
    Added(Member),
    Disappeared(Member),
    Replaced { old: Member, new: Member },
}

impl MembershipService {
    /// Binds the heartbeat socket. `data_addr` is the address other members use to open
    /// data connections to this node and is what the local member advertises.
    pub async fn new(config: MembershipConfig, data_addr: SocketAddr) -> Result<Arc<Self>> {
        let local_member = Member::new(data_addr, config.payload.clone())
            .with_domain(config.domain.clone().into_bytes());

        let (socket, multicast_target) = match &config.discovery {
            Discovery::Multicast { group, port } => {
                let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, *port))).await?;
                let interface = match config.bind.ip() {
                    std::net::IpAddr::V4(ip) => ip,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                socket.join_multicast_v4(*group, interface)?;
                socket.set_multicast_loop_v4(true)?;
                info!("Joined multicast group {}:{}", group, port);
                (socket, Some(SocketAddr::from((*group, *port))))
            }
            Discovery::Static { .. } => (UdpSocket::bind(config.bind).await?, None),
        };

        let peers = match &config.discovery {
            Discovery::Static { peers } => peers.clone(),
            Discovery::Multicast { .. } => Vec::new(),
        };

        info!(
            "Membership bound on {} for member {} ({})",
            socket.local_addr()?,
            local_member.name(),
            local_member.unique_id
        );

        Ok(Arc::new(Self {
            view: Mutex::new(MembershipView::new(local_member.unique_id)),
            local_member,
            config,
            socket: Arc::new(socket),
            peers: RwLock::new(peers),
            multicast_target,
            seq: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            message_handler: RwLock::new(None),
            state: AtomicU8::new(STATE_NEW),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_member(&self) -> Member {
        let mut member = self.local_member.clone();
        member.seq = self.seq.load(Ordering::Relaxed);
        member
    }

    pub fn local_id(&self) -> MemberId {
        self.local_member.unique_id
    }

    pub fn domain(&self) -> &[u8] {
        &self.local_member.domain
    }

    /// Address of the heartbeat socket, useful when bound to port 0.
    pub fn heartbeat_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn expiry(&self) -> Duration {
        self.config.expiry()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Adds a unicast heartbeat target (static discovery).
    pub fn add_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.write();
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MembershipListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Installs the sink for channel messages that arrive as broadcast datagrams.
    pub fn set_message_handler(&self, handler: Arc<dyn FrameHandler>) {
        *self.message_handler.write() = Some(handler);
    }

    /// Immutable copy of the current view. Safe to iterate while the tasks keep mutating.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.view.lock().snapshot()
    }

    pub fn alive_members(&self) -> Vec<Member> {
        self.snapshot().members().to_vec()
    }

    pub fn get_member(&self, id: &MemberId) -> Option<Member> {
        if id == &self.local_member.unique_id {
            return Some(self.local_member());
        }
        self.view.lock().get(id)
    }

    pub fn has_members(&self) -> bool {
        !self.view.lock().is_empty()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(ClusterError::Stopped),
        }

        tracing::info!("Starting membership service...");

        // Make sure at least one heartbeat is out before anybody waits on the view.
        self.broadcast_heartbeat().await;

        let mut tasks = self.tasks.lock();

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.heartbeat_loop().await;
        }));

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.receive_loop().await;
        }));

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.sweep_loop().await;
        }));

        tracing::info!("All membership tasks started");
        Ok(())
    }

    /// Announces shutdown to the peers and stops every task. Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown(true).await;
    }

    /// Stops every task. Without `announce` nobody is told, as with a crashed process.
    pub(crate) async fn shutdown(&self, announce: bool) {
        let previous = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if previous != STATE_RUNNING {
            return;
        }

        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::error!("Membership task ended abnormally: {}", e);
            }
        }

        // Sent after the heartbeat task is gone so no alive heartbeat can follow it.
        if announce {
            self.send_heartbeat(HeartbeatCommand::Shutdown).await;
        }

        tracing::info!("Membership service stopped");
    }

    /// Sends one heartbeat right now, outside the periodic schedule.
    pub async fn broadcast_heartbeat(&self) {
        self.send_heartbeat(HeartbeatCommand::Alive).await;
    }

    /// Sends raw bytes to every heartbeat target. Fire-and-forget.
    pub async fn broadcast_datagram(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATAGRAM {
            return Err(ClusterError::Frame(format!(
                "datagram of {} bytes exceeds {}",
                data.len(),
                MAX_DATAGRAM
            )));
        }

        for target in self.targets() {
            if let Err(e) = self.socket.send_to(data, target).await {
                tracing::warn!("Failed to broadcast to {}: {}", target, e);
            }
        }
        Ok(())
    }

    fn targets(&self) -> Vec<SocketAddr> {
        match self.multicast_target {
            Some(group) => vec![group],
            None => self.peers.read().clone(),
        }
    }

    async fn send_heartbeat(&self, command: HeartbeatCommand) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut member = self.local_member.clone();
        member.seq = seq;

        let heartbeat = Heartbeat { member, command };
        match heartbeat.encode() {
            Ok(encoded) => {
                for target in self.targets() {
                    if let Err(e) = self.socket.send_to(&encoded, target).await {
                        tracing::warn!("Failed to send heartbeat to {}: {}", target, e);
                    } else {
                        tracing::trace!("Sent heartbeat #{} to {}", seq, target);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to encode heartbeat: {}", e);
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.frequency());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.broadcast_heartbeat().await,
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => {
                    if let Err(e) = self.handle_datagram(&buf[..len], src, Instant::now()) {
                        tracing::warn!("Dropping datagram from {}: {}", src, e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.check_expired(Instant::now());
                }
            }
        }
    }

    /// Evicts members silent for longer than `expiry` as of `now`.
    pub fn check_expired(&self, now: Instant) -> Vec<Member> {
        let expired = self.view.lock().expire(self.config.expiry(), now);
        for member in &expired {
            tracing::warn!(
                "Member {} ({}) expired, no heartbeat for {:?}",
                member.name(),
                member.unique_id,
                self.config.expiry()
            );
            self.notify(Change::Disappeared(member.clone()));
        }
        expired
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr, now: Instant) -> Result<()> {
        match Datagram::decode(data)? {
            Datagram::Heartbeat(heartbeat) => {
                self.handle_heartbeat(heartbeat, now);
                Ok(())
            }
            Datagram::Message(bytes) => {
                let frame = Frame::from_bytes(&bytes)?;
                let handler = self.message_handler.read().clone();
                match handler {
                    Some(handler) => {
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(frame, src).await {
                                tracing::warn!("Broadcast message from {} failed: {}", src, e);
                            }
                        });
                    }
                    None => tracing::debug!("No handler for broadcast message from {}", src),
                }
                Ok(())
            }
        }
    }

    /// Feeds one heartbeat into the view and notifies listeners of the resulting change.
    pub fn handle_heartbeat(&self, heartbeat: Heartbeat, now: Instant) {
        let id = heartbeat.member.unique_id;
        if id == self.local_member.unique_id {
            return;
        }
        if heartbeat.member.domain != self.local_member.domain {
            tracing::trace!(
                "Ignoring heartbeat from {} in domain {:?}",
                heartbeat.member.name(),
                String::from_utf8_lossy(&heartbeat.member.domain)
            );
            return;
        }

        let change = {
            let mut view = self.view.lock();
            match heartbeat.command {
                HeartbeatCommand::Shutdown => view.remove(&id).map(Change::Disappeared),
                HeartbeatCommand::Alive => match view.member_alive(heartbeat.member, now) {
                    HeartbeatOutcome::Added(member) => Some(Change::Added(member)),
                    HeartbeatOutcome::Replaced { old, new } => Some(Change::Replaced { old, new }),
                    HeartbeatOutcome::Refreshed | HeartbeatOutcome::Ignored => None,
                },
            }
        };

        if let Some(change) = change {
            self.notify(change);
        }
    }

    fn notify(&self, change: Change) {
        let listeners: Vec<Arc<dyn MembershipListener>> = self.listeners.read().clone();

        match change {
            Change::Added(member) => {
                tracing::info!("Member added: {} ({})", member.name(), member.unique_id);
                for listener in &listeners {
                    listener.member_added(&member);
                }
            }
            Change::Disappeared(member) => {
                tracing::info!("Member disappeared: {} ({})", member.name(), member.unique_id);
                for listener in &listeners {
                    listener.member_disappeared(&member);
                }
            }
            Change::Replaced { old, new } => {
                tracing::info!(
                    "Member {} restarted ({} -> {})",
                    new.name(),
                    old.unique_id,
                    new.unique_id
                );
                for listener in &listeners {
                    listener.member_disappeared(&old);
                    listener.member_added(&new);
                }
            }
        }
    }
}
