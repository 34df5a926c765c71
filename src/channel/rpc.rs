//! Request/response on top of a [`GroupChannel`].
//!
//! Requests and replies share the channel with other traffic; an `RpcChannel` only accepts
//! payloads tagged with its own id. A call fans the request out, then collects replies until
//! the response mode is satisfied or the timeout runs out.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use super::group::{ChannelListener, GroupChannel};
use super::message::MessageId;
use super::options::SendOptions;
use crate::error::{ClusterError, Result};
use crate::membership::types::{Member, MemberId};

const RPC_MAGIC: &[u8; 4] = b"RPC1";

/// How many replies a call waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    FirstReply,
    Majority,
    All,
    /// Fire and forget.
    NoReply,
}

impl ResponseMode {
    fn expected(self, destinations: usize) -> usize {
        match self {
            ResponseMode::FirstReply => destinations.min(1),
            ResponseMode::Majority if destinations == 0 => 0,
            ResponseMode::Majority => destinations / 2 + 1,
            ResponseMode::All => destinations,
            ResponseMode::NoReply => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub source: Member,
    pub payload: Bytes,
}

/// Answers requests arriving on an [`RpcChannel`].
#[async_trait]
pub trait RpcCallback: Send + Sync {
    /// Returns the reply, or `None` to stay silent.
    async fn reply_request(&self, request: Bytes, sender: &Member) -> Option<Vec<u8>>;

    /// A reply arrived after its call had already completed.
    fn leftover_message(&self, _reply: Bytes, _sender: &Member) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EnvelopeKind {
    Request,
    /// A request nobody waits on.
    OneWay,
    Reply,
    /// The receiver has no endpoint with this id.
    Absent,
}

#[derive(Serialize, Deserialize)]
struct RpcEnvelope {
    rpc_id: Vec<u8>,
    request_id: MessageId,
    kind: EnvelopeKind,
    payload: Vec<u8>,
}

impl RpcEnvelope {
    fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(RPC_MAGIC.len() + body.len());
        out.extend_from_slice(RPC_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        let body = payload.strip_prefix(RPC_MAGIC.as_slice())?;
        bincode::deserialize(body).ok()
    }
}

/// Reply for a request that no endpoint on this member accepted, so the caller stops
/// waiting for us. `None` for anything that is not such a request.
pub(crate) fn absence_reply(payload: &[u8]) -> Option<Vec<u8>> {
    let request = RpcEnvelope::decode(payload)?;
    if request.kind != EnvelopeKind::Request {
        return None;
    }
    RpcEnvelope {
        rpc_id: request.rpc_id,
        request_id: request.request_id,
        kind: EnvelopeKind::Absent,
        payload: Vec::new(),
    }
    .encode()
    .ok()
}

enum Incoming {
    Reply(RpcResponse),
    Absent(MemberId),
}

struct Shared {
    rpc_id: Vec<u8>,
    callback: Arc<dyn RpcCallback>,
    pending: DashMap<MessageId, mpsc::UnboundedSender<Incoming>>,
    reply_options: SendOptions,
    closed: AtomicBool,
}

impl Shared {
    fn fail_pending(&self) {
        // Dropping the senders wakes every waiting call with `Stopped`.
        self.pending.clear();
    }
}

struct RpcListener {
    shared: Arc<Shared>,
    channel: Weak<GroupChannel>,
}

#[async_trait]
impl ChannelListener for RpcListener {
    fn accept(&self, payload: &[u8], _source: &Member) -> bool {
        RpcEnvelope::decode(payload).is_some_and(|e| e.rpc_id == self.shared.rpc_id)
    }

    async fn message_received(&self, payload: Bytes, source: &Member) {
        let Some(envelope) = RpcEnvelope::decode(&payload) else {
            return;
        };

        match envelope.kind {
            EnvelopeKind::Reply => {
                let response = RpcResponse {
                    source: source.clone(),
                    payload: Bytes::from(envelope.payload),
                };
                match self.shared.pending.get(&envelope.request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(Incoming::Reply(response));
                    }
                    None => self
                        .shared
                        .callback
                        .leftover_message(response.payload, source),
                }
                return;
            }
            EnvelopeKind::Absent => {
                if let Some(waiter) = self.shared.pending.get(&envelope.request_id) {
                    let _ = waiter.send(Incoming::Absent(source.unique_id));
                }
                return;
            }
            EnvelopeKind::Request | EnvelopeKind::OneWay => {}
        }

        let request = Bytes::from(envelope.payload);
        let Some(reply) = self.shared.callback.reply_request(request, source).await else {
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let reply = RpcEnvelope {
            rpc_id: self.shared.rpc_id.clone(),
            request_id: envelope.request_id,
            kind: EnvelopeKind::Reply,
            payload: reply,
        };
        let encoded = match reply.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode rpc reply: {}", e);
                return;
            }
        };
        if let Err(e) = channel
            .send(std::slice::from_ref(source), encoded, self.shared.reply_options)
            .await
        {
            tracing::warn!("Failed to reply to {}: {}", source.name(), e);
        }
    }

    fn channel_stopped(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.fail_pending();
    }
}

pub struct RpcChannel {
    channel: Arc<GroupChannel>,
    shared: Arc<Shared>,
    listener: Arc<dyn ChannelListener>,
}

impl RpcChannel {
    /// Registers a new RPC endpoint on `channel`. Both sides of a call must use the same id.
    pub fn new(
        rpc_id: impl Into<Vec<u8>>,
        channel: Arc<GroupChannel>,
        callback: Arc<dyn RpcCallback>,
    ) -> Self {
        let shared = Arc::new(Shared {
            rpc_id: rpc_id.into(),
            callback,
            pending: DashMap::new(),
            reply_options: SendOptions::USE_ACK,
            closed: AtomicBool::new(false),
        });
        let listener: Arc<dyn ChannelListener> = Arc::new(RpcListener {
            shared: shared.clone(),
            channel: Arc::downgrade(&channel),
        });
        channel.add_channel_listener(listener.clone());

        Self {
            channel,
            shared,
            listener,
        }
    }

    pub fn channel(&self) -> &Arc<GroupChannel> {
        &self.channel
    }

    /// Sends `payload` to `destinations` and collects replies as `mode` asks.
    ///
    /// Everything, the send included, fits in `timeout`. Members without this endpoint and
    /// members the send could not reach are not waited for. Returns whatever arrived in time;
    /// `Timeout` if a reply was expected and none came, `Stopped` if the channel stopped
    /// while waiting.
    pub async fn send(
        &self,
        destinations: &[Member],
        payload: impl Into<Bytes>,
        mode: ResponseMode,
        options: SendOptions,
        timeout: Duration,
    ) -> Result<Vec<RpcResponse>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Stopped);
        }

        let request_id = MessageId::new();
        let one_way = mode == ResponseMode::NoReply;
        let envelope = RpcEnvelope {
            rpc_id: self.shared.rpc_id.clone(),
            request_id,
            kind: if one_way {
                EnvelopeKind::OneWay
            } else {
                EnvelopeKind::Request
            },
            payload: payload.into().to_vec(),
        };
        let encoded = envelope.encode()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || ClusterError::Timeout {
            operation: "rpc",
            after: timeout,
        };

        if one_way {
            tokio::time::timeout_at(deadline, self.channel.send(destinations, encoded, options))
                .await
                .map_err(|_| timed_out())??;
            return Ok(Vec::new());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared.pending.insert(request_id, tx);

        let sent = tokio::time::timeout_at(deadline, self.channel.send(destinations, encoded, options))
            .await
            .unwrap_or_else(|_| Err(timed_out()));
        let mut reachable = destinations.len();
        if let Err(e) = sent {
            let unreachable = e.faulty_members().len();
            if unreachable == 0 || unreachable >= destinations.len() {
                self.shared.pending.remove(&request_id);
                return Err(e);
            }
            tracing::debug!("Rpc request reached {} of {} members", destinations.len() - unreachable, destinations.len());
            reachable -= unreachable;
        }

        let mut responses: Vec<RpcResponse> = Vec::new();
        let mut seen: Vec<MemberId> = Vec::new();
        let mut absent = 0usize;
        let mut stopped = false;
        let mut expired = false;

        while responses.len() < mode.expected(reachable.saturating_sub(absent)) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Incoming::Reply(response))) => {
                    if seen.contains(&response.source.unique_id) {
                        continue;
                    }
                    seen.push(response.source.unique_id);
                    responses.push(response);
                }
                Ok(Some(Incoming::Absent(member))) => {
                    if !seen.contains(&member) {
                        seen.push(member);
                        absent += 1;
                    }
                }
                Ok(None) => {
                    stopped = true;
                    break;
                }
                Err(_) => {
                    expired = true;
                    break;
                }
            }
        }
        self.shared.pending.remove(&request_id);

        if stopped && responses.is_empty() {
            return Err(ClusterError::Stopped);
        }
        if expired && responses.is_empty() {
            return Err(timed_out());
        }
        Ok(responses)
    }

    /// Unregisters the endpoint and fails every pending call.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.channel.remove_channel_listener(&self.listener);
        self.shared.fail_pending();
    }

    /// Number of calls still waiting for replies.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}
