//! Pooled per-destination sender.
//!
//! Each destination owns at most one TCP connection, guarded by an async mutex so writes to
//! one member are serialized while different members are written to concurrently. A
//! connection is reused until it exceeds `keep_alive_count` messages or sits idle for
//! `keep_alive_time`. Failed attempts are retried on a fresh connection, up to
//! `max_retry_attempts`, and everything for one destination fits inside `timeout`.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use super::frame::{Frame, FrameCodec};
use crate::channel::options::SendOptions;
use crate::config::SenderConfig;
use crate::error::{ClusterError, FaultyMember, Result};
use crate::membership::types::Member;

/// Health of one destination as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Ready,
    /// The last attempt failed.
    Suspect,
    /// Repeated failures since the last success.
    Failing,
}

struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    last_used: Instant,
    sent: u64,
}

impl Connection {
    async fn open(addr: SocketAddr, max_frame_len: usize) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new(max_frame_len)),
            last_used: Instant::now(),
            sent: 0,
        })
    }

    fn worn_out(&self, config: &SenderConfig, now: Instant) -> bool {
        let count_exceeded = config
            .keep_alive_count
            .is_some_and(|limit| self.sent >= limit);
        let idle_exceeded = config
            .keep_alive_time()
            .is_some_and(|limit| now.saturating_duration_since(self.last_used) >= limit);
        count_exceeded || idle_exceeded
    }
}

struct Destination {
    conn: Mutex<Option<Connection>>,
    state: parking_lot::Mutex<SenderState>,
    connects: std::sync::atomic::AtomicU64,
}

impl Destination {
    fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            state: parking_lot::Mutex::new(SenderState::Ready),
            connects: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn mark_ready(&self) {
        *self.state.lock() = SenderState::Ready;
    }

    fn mark_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            SenderState::Ready => SenderState::Suspect,
            SenderState::Suspect | SenderState::Failing => SenderState::Failing,
        };
    }
}

enum AttemptError {
    /// Connection-level failure; a fresh connection may succeed.
    Retryable(String),
    /// The receiver got the message and reported that processing failed.
    Remote,
}

pub struct PooledSender {
    config: SenderConfig,
    max_frame_len: usize,
    destinations: DashMap<SocketAddr, Arc<Destination>>,
}

impl PooledSender {
    pub fn new(config: SenderConfig, max_frame_len: usize) -> Self {
        Self {
            config,
            max_frame_len,
            destinations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Sends one frame to every member concurrently. Failures are reported per member and
    /// never stop delivery to the others.
    pub async fn send_all(&self, members: &[Member], frame: &Frame) -> Result<()> {
        let results = futures::future::join_all(
            members
                .iter()
                .map(|member| async move { (member, self.send(member, frame).await) }),
        )
        .await;

        let failed: Vec<FaultyMember> = results
            .into_iter()
            .filter_map(|(member, result)| {
                result.err().map(|e| FaultyMember {
                    member: member.clone(),
                    reason: e.to_string(),
                })
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Send { failed })
        }
    }

    /// Sends one frame to one member, retrying on a fresh connection when allowed.
    pub async fn send(&self, member: &Member, frame: &Frame) -> Result<()> {
        let addr = member.addr();
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let options = SendOptions::from_bits(frame.flags);
        let wait_for_ack =
            options.intersects(SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK);

        let destination = self.destination(addr);
        let mut conn = tokio::time::timeout_at(deadline, destination.conn.lock())
            .await
            .map_err(|_| ClusterError::Timeout {
                operation: "send",
                after: timeout,
            })?;

        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(50);

        loop {
            let outcome = tokio::time::timeout_at(
                deadline,
                self.attempt(&mut conn, &destination, addr, frame, wait_for_ack),
            )
            .await
            .unwrap_or_else(|_| Err(AttemptError::Retryable(format!("timed out after {:?}", timeout))));

            match outcome {
                Ok(()) => {
                    destination.mark_ready();
                    tracing::trace!("Sent {} bytes to {}", frame.payload.len(), addr);
                    return Ok(());
                }
                Err(AttemptError::Remote) => {
                    destination.mark_ready();
                    return Err(ClusterError::Transport {
                        addr,
                        reason: "receiver failed to process message".to_string(),
                    });
                }
                Err(AttemptError::Retryable(reason)) => {
                    *conn = None;
                    destination.mark_failure();

                    if attempt >= self.config.max_retry_attempts || Instant::now() >= deadline {
                        tracing::warn!(
                            "Send to {} failed after {} attempt(s): {}",
                            addr,
                            attempt + 1,
                            reason
                        );
                        return Err(ClusterError::Transport { addr, reason });
                    }

                    attempt += 1;
                    tracing::warn!(
                        "Send to {} failed ({}), retrying {}/{}",
                        addr,
                        reason,
                        attempt,
                        self.config.max_retry_attempts
                    );

                    let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                    let wake = (Instant::now() + backoff + jitter).min(deadline);
                    tokio::time::sleep_until(wake).await;
                    backoff = (backoff * 2).min(Duration::from_millis(1000));
                }
            }
        }
    }

    async fn attempt(
        &self,
        conn: &mut Option<Connection>,
        destination: &Destination,
        addr: SocketAddr,
        frame: &Frame,
        wait_for_ack: bool,
    ) -> std::result::Result<(), AttemptError> {
        let now = Instant::now();
        if conn.as_ref().is_some_and(|c| c.worn_out(&self.config, now)) {
            tracing::debug!("Recycling connection to {}", addr);
            *conn = None;
        }

        if conn.is_none() {
            let opened = Connection::open(addr, self.max_frame_len)
                .await
                .map_err(|e| AttemptError::Retryable(format!("connect: {}", e)))?;
            destination
                .connects
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!("Opened connection to {}", addr);
            *conn = Some(opened);
        }

        let Some(connection) = conn.as_mut() else {
            return Err(AttemptError::Retryable("no connection".to_string()));
        };

        connection
            .framed
            .send(frame.clone())
            .await
            .map_err(|e| AttemptError::Retryable(format!("write: {}", e)))?;
        connection.sent += 1;
        connection.last_used = Instant::now();

        if !wait_for_ack {
            return Ok(());
        }

        match connection.framed.next().await {
            Some(Ok(reply)) if reply.is_ack() => {
                if reply.ack_ok() {
                    Ok(())
                } else {
                    Err(AttemptError::Remote)
                }
            }
            Some(Ok(_)) => Err(AttemptError::Retryable(
                "unexpected non-ack frame".to_string(),
            )),
            Some(Err(e)) => Err(AttemptError::Retryable(format!("read ack: {}", e))),
            None => Err(AttemptError::Retryable(
                "connection closed before ack".to_string(),
            )),
        }
    }

    fn destination(&self, addr: SocketAddr) -> Arc<Destination> {
        self.destinations
            .entry(addr)
            .or_insert_with(|| Arc::new(Destination::new()))
            .clone()
    }

    pub fn state(&self, addr: &SocketAddr) -> Option<SenderState> {
        self.destinations.get(addr).map(|d| *d.state.lock())
    }

    /// Number of connections ever opened to `addr`.
    pub fn connect_count(&self, addr: &SocketAddr) -> u64 {
        self.destinations
            .get(addr)
            .map(|d| d.connects.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Closes connections past their keep-alive limits. Busy destinations are skipped.
    pub fn close_idle(&self) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        for entry in self.destinations.iter() {
            if let Ok(mut conn) = entry.value().conn.try_lock()
                && conn.as_ref().is_some_and(|c| c.worn_out(&self.config, now))
            {
                *conn = None;
                closed += 1;
                tracing::debug!("Closed idle connection to {}", entry.key());
            }
        }
        closed
    }

    /// Drops the connection to `addr`, waiting for an in-flight send to finish.
    pub async fn disconnect(&self, addr: &SocketAddr) {
        let destination = self.destinations.remove(addr).map(|(_, d)| d);
        if let Some(destination) = destination {
            *destination.conn.lock().await = None;
        }
    }

    pub async fn close_all(&self) {
        let addrs: Vec<SocketAddr> = self.destinations.iter().map(|e| *e.key()).collect();
        for addr in addrs {
            self.disconnect(&addr).await;
        }
    }
}
