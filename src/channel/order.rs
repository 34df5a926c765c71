use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::interceptor::{Interceptor, Next};
use super::message::ChannelMessage;
use super::options::SendOptions;
use crate::config::ChannelConfig;
use crate::error::{ClusterError, FaultyMember, Result};
use crate::membership::types::{Member, MemberId};

const SEQ_LEN: usize = 8;

struct Inbox {
    expected: u64,
    pending: BTreeMap<u64, (ChannelMessage, Instant)>,
}

impl Inbox {
    fn new() -> Self {
        Self {
            expected: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Messages that can go up now, in sequence order.
    fn take_ready(&mut self, expire: Duration, max_queue: usize, now: Instant) -> Vec<ChannelMessage> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.expected {
                break;
            }
            ready.push(entry.remove().0);
            self.expected += 1;
        }

        let oldest_expired = self
            .pending
            .values()
            .any(|(_, arrived)| now.saturating_duration_since(*arrived) >= expire);

        if oldest_expired || self.pending.len() > max_queue {
            let flushed = std::mem::take(&mut self.pending);
            if let Some(last) = flushed.keys().next_back() {
                tracing::warn!(
                    "Giving up on sequence {}..{}, flushing {} buffered message(s)",
                    self.expected,
                    last,
                    flushed.len()
                );
                self.expected = last + 1;
            }
            ready.extend(flushed.into_values().map(|(message, _)| message));
        }

        ready
    }
}

struct OrderState {
    expire: Duration,
    max_queue: usize,
    outgoing: SyncMutex<HashMap<MemberId, u64>>,
    incoming: DashMap<MemberId, Arc<Mutex<Inbox>>>,
}

impl OrderState {
    fn next_seq(&self, member: &MemberId) -> u64 {
        let mut outgoing = self.outgoing.lock();
        let counter = outgoing.entry(*member).or_insert(0);
        *counter += 1;
        *counter
    }

    fn inbox(&self, source: &MemberId) -> Arc<Mutex<Inbox>> {
        self.incoming
            .entry(*source)
            .or_insert_with(|| Arc::new(Mutex::new(Inbox::new())))
            .clone()
    }

    async fn deliver(next: &Next, ready: Vec<ChannelMessage>) -> Result<()> {
        let mut first_error = None;
        for message in ready {
            if let Err(e) = next.receive(message).await {
                tracing::warn!("Ordered delivery failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes every inbox whose oldest held message has expired.
    async fn flush_expired(&self, next: &Next) {
        let inboxes: Vec<Arc<Mutex<Inbox>>> =
            self.incoming.iter().map(|entry| entry.value().clone()).collect();

        for inbox in inboxes {
            let mut inbox = inbox.lock().await;
            if inbox.pending.is_empty() {
                continue;
            }
            let ready = inbox.take_ready(self.expire, self.max_queue, Instant::now());
            let _ = Self::deliver(next, ready).await;
        }
    }
}

/// Delivers messages sent with [`SendOptions::ORDERED`] in the order each sender sent them.
///
/// Every destination gets its own counter; the sequence number is appended to the payload
/// and stripped again on the receiving side. Out-of-order arrivals are held back until the
/// gap closes, until the oldest held message is older than `expire`, or until more than
/// `max_queue` messages are held, whichever comes first.
pub struct OrderInterceptor {
    state: Arc<OrderState>,
    cancel: CancellationToken,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl OrderInterceptor {
    pub fn new(expire: Duration, max_queue: usize) -> Self {
        Self {
            state: Arc::new(OrderState {
                expire,
                max_queue: max_queue.max(1),
                outgoing: SyncMutex::new(HashMap::new()),
                incoming: DashMap::new(),
            }),
            cancel: CancellationToken::new(),
            task: SyncMutex::new(None),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(
            Duration::from_millis(config.order_expire_ms),
            config.order_max_queue,
        )
    }
}

fn split_seq(payload: &Bytes) -> Option<(Bytes, u64)> {
    let body_len = payload.len().checked_sub(SEQ_LEN)?;
    let mut raw = [0u8; SEQ_LEN];
    raw.copy_from_slice(&payload[body_len..]);
    Some((payload.slice(..body_len), u64::from_be_bytes(raw)))
}

#[async_trait]
impl Interceptor for OrderInterceptor {
    fn name(&self) -> &str {
        "order"
    }

    fn option_flag(&self) -> u32 {
        SendOptions::ORDERED.bits()
    }

    async fn send(
        &self,
        message: ChannelMessage,
        destinations: Vec<Member>,
        next: Next,
    ) -> Result<()> {
        let sends = destinations.into_iter().map(|member| {
            let seq = self.state.next_seq(&member.unique_id);
            let mut payload = BytesMut::with_capacity(message.payload.len() + SEQ_LEN);
            payload.put_slice(&message.payload);
            payload.put_u64(seq);
            let sequenced = message.clone().with_payload(payload.freeze());
            let next = next.clone();
            async move {
                let result = next.send(sequenced, vec![member.clone()]).await;
                (member, result)
            }
        });

        let mut failed = Vec::new();
        for (member, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => {}
                Err(ClusterError::Send { failed: faulty }) => failed.extend(faulty),
                Err(e) => failed.push(FaultyMember {
                    member,
                    reason: e.to_string(),
                }),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Send { failed })
        }
    }

    async fn receive(&self, message: ChannelMessage, next: Next) -> Result<()> {
        let Some((body, seq)) = split_seq(&message.payload) else {
            return Err(ClusterError::Frame(
                "ordered message too short for a sequence number".to_string(),
            ));
        };

        let inbox = self.state.inbox(&message.source.unique_id);
        let mut inbox = inbox.lock().await;

        if seq < inbox.expected {
            tracing::warn!(
                "Dropping late message #{} from {} (expecting #{})",
                seq,
                message.source.name(),
                inbox.expected
            );
            return Ok(());
        }

        inbox
            .pending
            .insert(seq, (message.with_payload(body), Instant::now()));
        let ready = inbox.take_ready(self.state.expire, self.state.max_queue, Instant::now());
        OrderState::deliver(&next, ready).await
    }

    fn member_disappeared(&self, member: &Member) {
        self.state.outgoing.lock().remove(&member.unique_id);
        self.state.incoming.remove(&member.unique_id);
    }

    async fn start(&self, next: Next) -> Result<()> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let period = (state.expire / 2).max(Duration::from_millis(10));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => state.flush_expired(&next).await,
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}
