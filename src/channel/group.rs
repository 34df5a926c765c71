use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatch::MessageDispatchInterceptor;
use super::encrypt::EncryptInterceptor;
use super::gzip::GzipInterceptor;
use super::interceptor::{InboundSink, Interceptor, OutboundSink, Pipeline};
use super::message::{ChannelMessage, MessageId};
use super::options::SendOptions;
use super::order::OrderInterceptor;
use super::rpc::absence_reply;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::membership::service::MembershipService;
use crate::membership::types::{Datagram, Member, MemberId, MembershipListener};
use crate::transport::frame::Frame;
use crate::transport::receiver::{FrameHandler, Receiver};
use crate::transport::sender::{PooledSender, SenderState};

const STATE_NEW: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Receives application messages that made it through the interceptor stack.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Whether this listener wants the message. Every accepting listener gets a copy.
    fn accept(&self, _payload: &[u8], _source: &Member) -> bool {
        true
    }

    async fn message_received(&self, payload: Bytes, source: &Member);

    /// The channel stopped; no more messages will arrive.
    fn channel_stopped(&self) {}
}

struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    local: Member,
    /// Used to answer RPC requests nobody accepted. Set once the pipeline exists.
    pipeline: RwLock<Weak<Pipeline>>,
}

impl ListenerRegistry {
    fn new(local: Member) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            local,
            pipeline: RwLock::new(Weak::new()),
        }
    }

    async fn reply_absent(&self, message: &ChannelMessage) {
        let Some(reply) = absence_reply(&message.payload) else {
            return;
        };
        let Some(pipeline) = self.pipeline.read().upgrade() else {
            return;
        };
        tracing::debug!(
            "No rpc endpoint for request {} from {}",
            message.id,
            message.source.name()
        );
        let answer = ChannelMessage::new(self.local.clone(), reply, SendOptions::USE_ACK);
        if let Err(e) = pipeline.send(answer, vec![message.source.clone()]).await {
            tracing::warn!("Failed to answer {}: {}", message.source.name(), e);
        }
    }
}

#[async_trait]
impl InboundSink for ListenerRegistry {
    async fn deliver(&self, message: ChannelMessage) -> Result<()> {
        let listeners: Vec<Arc<dyn ChannelListener>> = self.listeners.read().clone();
        let mut accepted = false;
        for listener in listeners {
            if listener.accept(&message.payload, &message.source) {
                accepted = true;
                listener
                    .message_received(message.payload.clone(), &message.source)
                    .await;
            }
        }
        if !accepted {
            tracing::debug!(
                "No listener accepted message {} from {}",
                message.id,
                message.source.name()
            );
            self.reply_absent(&message).await;
        }
        Ok(())
    }
}

/// Bottom of the stack: hands frames to the transport.
struct Coordinator {
    sender: Arc<PooledSender>,
    membership: Arc<MembershipService>,
}

#[async_trait]
impl OutboundSink for Coordinator {
    async fn send(&self, message: ChannelMessage, destinations: Vec<Member>) -> Result<()> {
        let frame = message.to_frame()?;
        if message.options.contains(SendOptions::MULTICAST) {
            let datagram = Datagram::message(&frame.to_bytes());
            return self.membership.broadcast_datagram(&datagram).await;
        }
        self.sender.send_all(&destinations, &frame).await
    }
}

/// Top of the transport: decodes frames and feeds them into the stack.
struct InboundHandler {
    pipeline: Weak<Pipeline>,
    local_id: MemberId,
    domain: Vec<u8>,
}

#[async_trait]
impl FrameHandler for InboundHandler {
    async fn handle(&self, frame: Frame, peer: SocketAddr) -> Result<()> {
        let message = ChannelMessage::from_frame(&frame)?;
        if message.source.unique_id == self.local_id {
            return Ok(());
        }
        if message.source.domain != self.domain {
            tracing::debug!(
                "Ignoring message {} from {} outside our domain",
                message.id,
                message.source.name()
            );
            return Ok(());
        }
        tracing::trace!("Received message {} via {}", message.id, peer);
        match self.pipeline.upgrade() {
            Some(pipeline) => pipeline.receive(message).await,
            None => Err(ClusterError::NotRunning),
        }
    }
}

struct MembershipAdapter {
    pipeline: Weak<Pipeline>,
}

impl MembershipListener for MembershipAdapter {
    fn member_added(&self, member: &Member) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.member_added(member);
        }
    }

    fn member_disappeared(&self, member: &Member) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.member_disappeared(member);
        }
    }
}

/// Assembles a [`GroupChannel`] from a configuration and an interceptor stack.
pub struct GroupChannelBuilder {
    config: ClusterConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    error: Option<ClusterError>,
}

impl GroupChannelBuilder {
    /// Appends a stage below the ones already added.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Asynchronous dispatch, ordering and compression, configured from `[channel]`, plus
    /// encryption when an `encryption_key` is set.
    pub fn standard_interceptors(self) -> Self {
        let dispatch = MessageDispatchInterceptor::new(self.config.channel.dispatch_queue_len);
        let order = OrderInterceptor::from_config(&self.config.channel);
        let key = self.config.channel.encryption_key.clone();
        let mut builder = self
            .interceptor(dispatch)
            .interceptor(order)
            .interceptor(GzipInterceptor::new());

        if let Some(key) = key {
            match EncryptInterceptor::from_hex(&key) {
                Ok(encrypt) => builder = builder.interceptor(encrypt),
                Err(e) => builder.error = Some(e),
            }
        }
        builder
    }

    /// Binds the data listener and the heartbeat socket. Nothing runs until `start`.
    pub async fn build(self) -> Result<Arc<GroupChannel>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let config = self.config;
        config.validate()?;

        let receiver = Receiver::bind(config.receiver.clone()).await?;
        let bound = receiver.local_addr();
        let host = match config.receiver.advertise {
            Some(host) => host,
            None if bound.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => bound.ip(),
        };
        let data_addr = SocketAddr::new(host, bound.port());

        let membership = MembershipService::new(config.membership.clone(), data_addr).await?;
        let sender = Arc::new(PooledSender::new(
            config.sender.clone(),
            config.receiver.max_frame_len,
        ));
        let listeners = Arc::new(ListenerRegistry::new(membership.local_member()));
        let coordinator = Arc::new(Coordinator {
            sender: sender.clone(),
            membership: membership.clone(),
        });
        let pipeline = Pipeline::new(self.interceptors, coordinator, listeners.clone());
        *listeners.pipeline.write() = Arc::downgrade(&pipeline);

        Ok(Arc::new(GroupChannel {
            config,
            membership,
            receiver,
            sender,
            pipeline,
            listeners,
            state: AtomicU8::new(STATE_NEW),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }))
    }
}

/// A member's handle on the group: membership, an interceptor stack and the transport.
pub struct GroupChannel {
    config: ClusterConfig,
    membership: Arc<MembershipService>,
    receiver: Receiver,
    sender: Arc<PooledSender>,
    pipeline: Arc<Pipeline>,
    listeners: Arc<ListenerRegistry>,
    state: AtomicU8,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GroupChannel {
    pub fn builder(config: ClusterConfig) -> GroupChannelBuilder {
        GroupChannelBuilder {
            config,
            interceptors: Vec::new(),
            error: None,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_STARTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_STARTING) | Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(ClusterError::Stopped),
        }

        if let Err(e) = self.start_components().await {
            tracing::error!("Channel failed to start: {}", e);
            self.state.store(STATE_RUNNING, Ordering::Release);
            self.stop().await;
            return Err(e);
        }

        if self
            .state
            .compare_exchange(STATE_STARTING, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Stopped while starting.
            self.state.store(STATE_RUNNING, Ordering::Release);
            self.stop().await;
            return Err(ClusterError::Stopped);
        }
        tracing::info!(
            "Channel started as {} ({})",
            self.membership.local_member().name(),
            self.membership.local_id()
        );
        Ok(())
    }

    async fn start_components(self: &Arc<Self>) -> Result<()> {
        self.pipeline.start(self.config.channel.option_check).await?;

        let handler = Arc::new(InboundHandler {
            pipeline: Arc::downgrade(&self.pipeline),
            local_id: self.membership.local_id(),
            domain: self.membership.domain().to_vec(),
        });
        self.receiver.start(handler.clone())?;
        self.membership.set_message_handler(handler);
        self.membership.add_listener(Arc::new(MembershipAdapter {
            pipeline: Arc::downgrade(&self.pipeline),
        }));
        self.membership.start().await?;

        if let Some(keep_alive) = self.config.sender.keep_alive_time() {
            let sender = self.sender.clone();
            let cancel = self.cancel.clone();
            let period = (keep_alive / 2).max(Duration::from_millis(10));
            *self.sweeper.lock() = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let closed = sender.close_idle();
                            if closed > 0 {
                                tracing::debug!("Keep-alive sweep closed {} connection(s)", closed);
                            }
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    /// Stops the stack, membership and transport. Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown(true).await;
    }

    /// Drops off the network without a shutdown notice or listener callbacks, so peers only
    /// notice through heartbeat expiry.
    #[cfg(test)]
    pub(crate) async fn crash(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, announce: bool) {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) != STATE_RUNNING {
            return;
        }

        tracing::info!("Stopping channel...");
        self.cancel.cancel();
        self.pipeline.stop().await;
        self.membership.shutdown(announce).await;
        self.receiver.stop().await;
        self.sender.close_all().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        if announce {
            let listeners: Vec<Arc<dyn ChannelListener>> = self.listeners.listeners.read().clone();
            for listener in listeners {
                listener.channel_stopped();
            }
        }
        tracing::info!("Channel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Sends `payload` to `destinations` through the interceptor stack.
    ///
    /// A send to several members succeeds for the reachable ones even when others fail; the
    /// error then lists exactly the failed members.
    pub async fn send(
        &self,
        destinations: &[Member],
        payload: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<MessageId> {
        if !self.is_running() {
            return Err(ClusterError::NotRunning);
        }
        if destinations.is_empty() {
            return Err(ClusterError::NoDestination);
        }
        if options.contains(SendOptions::SECURE) && !self.pipeline.handles(SendOptions::SECURE) {
            return Err(ClusterError::Configuration(
                "no interceptor handles the secure option".to_string(),
            ));
        }

        let message = ChannelMessage::new(self.membership.local_member(), payload, options);
        let id = message.id;
        self.pipeline.send(message, destinations.to_vec()).await?;
        Ok(id)
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.listeners.write().push(listener);
    }

    pub fn remove_channel_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.listeners
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.membership.add_listener(listener);
    }

    pub fn remove_membership_listener(&self, listener: &Arc<dyn MembershipListener>) {
        self.membership.remove_listener(listener);
    }

    /// Alive members other than the local one.
    pub fn members(&self) -> Vec<Member> {
        self.membership.alive_members()
    }

    pub fn local_member(&self) -> Member {
        self.membership.local_member()
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Adds a heartbeat target for static discovery.
    pub fn add_peer(&self, heartbeat_addr: SocketAddr) {
        self.membership.add_peer(heartbeat_addr);
    }

    pub fn heartbeat_addr(&self) -> Result<SocketAddr> {
        self.membership.heartbeat_addr()
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.membership.local_member().addr()
    }

    pub fn sender_state(&self, member: &Member) -> Option<SenderState> {
        self.sender.state(&member.addr())
    }
}
