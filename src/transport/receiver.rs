use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::frame::{Frame, FrameCodec};
use crate::channel::options::SendOptions;
use crate::config::ReceiverConfig;
use crate::error::{ClusterError, Result};

/// Consumes frames read off the wire. An `Err` is reported back to the sender as a failed
/// ack when the frame asked for a synchronized ack.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: Frame, peer: SocketAddr) -> Result<()>;
}

/// Accepts data connections and feeds their frames to a handler.
///
/// Frames of one connection are dispatched one after another, so a sender that reuses its
/// connection observes in-order processing. Across connections at most `max_workers`
/// frames are processed at the same time.
pub struct Receiver {
    config: ReceiverConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub async fn bind(config: ReceiverConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Receiver listening on {}", local_addr);

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop. Only the first call has an effect.
    pub fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClusterError::Stopped);
        }
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };

        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let cancel = self.cancel.clone();
        let max_frame_len = self.config.max_frame_len;

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted data connection from {}", peer);
                        let connection = Connection {
                            peer,
                            handler: handler.clone(),
                            workers: workers.clone(),
                            cancel: cancel.child_token(),
                        };
                        tokio::spawn(connection.serve(stream, max_frame_len));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
            tracing::debug!("Accept loop stopped");
        });

        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stops accepting and closes every open connection. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::error!("Receiver task ended abnormally: {}", e);
        }
        self.listener.lock().take();
    }
}

struct Connection {
    peer: SocketAddr,
    handler: Arc<dyn FrameHandler>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream, max_frame_len: usize) {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, FrameCodec::new(max_frame_len));

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = framed.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!("Closing connection from {}: {}", self.peer, e);
                    break;
                }
                None => break,
            };

            if frame.is_ack() {
                tracing::debug!("Ignoring stray ack from {}", self.peer);
                continue;
            }

            let options = SendOptions::from_bits(frame.flags);
            let sync_ack = options.contains(SendOptions::SYNCHRONIZED_ACK);
            let early_ack = options.contains(SendOptions::USE_ACK) && !sync_ack;

            if early_ack && let Err(e) = framed.send(Frame::ack(true)).await {
                tracing::warn!("Failed to ack {}: {}", self.peer, e);
                break;
            }

            let processed = self.dispatch(frame).await;

            if sync_ack && let Err(e) = framed.send(Frame::ack(processed)).await {
                tracing::warn!("Failed to ack {}: {}", self.peer, e);
                break;
            }
        }

        tracing::debug!("Data connection from {} closed", self.peer);
    }

    async fn dispatch(&self, frame: Frame) -> bool {
        let permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let handler = self.handler.clone();
        let peer = self.peer;
        let job = tokio::spawn(async move {
            let _permit = permit;
            handler.handle(frame, peer).await
        });

        match job.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Message from {} failed: {}", peer, e);
                false
            }
            Err(e) => {
                tracing::error!("Worker for message from {} panicked: {}", peer, e);
                false
            }
        }
    }
}
