use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::interceptor::{Interceptor, Next};
use super::message::ChannelMessage;
use super::options::SendOptions;
use crate::error::{ClusterError, FaultyMember, Result};
use crate::membership::types::Member;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Job {
    message: ChannelMessage,
    destinations: Vec<Member>,
    next: Next,
}

/// Hands messages sent with [`SendOptions::ASYNCHRONOUS`] to a background task and returns
/// immediately. The queue is bounded; a full queue fails the send for every destination.
/// Failures of the background send are logged. On stop the queue is drained for up to
/// five seconds, then abandoned.
pub struct MessageDispatchInterceptor {
    capacity: usize,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatchInterceptor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    async fn run(mut jobs: mpsc::Receiver<Job>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => job,
            };
            let Some(job) = job else {
                break;
            };

            let id = job.message.id;
            if let Err(e) = job.next.send(job.message, job.destinations).await {
                tracing::warn!("Asynchronous send of {} failed: {}", id, e);
            }
        }
        tracing::debug!("Dispatch queue closed");
    }
}

#[async_trait]
impl Interceptor for MessageDispatchInterceptor {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn option_flag(&self) -> u32 {
        SendOptions::ASYNCHRONOUS.bits()
    }

    async fn send(
        &self,
        message: ChannelMessage,
        destinations: Vec<Member>,
        next: Next,
    ) -> Result<()> {
        let queue = self.queue.lock().clone();
        let Some(queue) = queue else {
            // Not started or already stopped: deliver inline.
            return next.send(message, destinations).await;
        };

        let job = Job {
            message,
            destinations,
            next,
        };
        queue.try_send(job).map_err(|e| {
            let (job, reason) = match e {
                mpsc::error::TrySendError::Full(job) => (job, "dispatch queue full"),
                mpsc::error::TrySendError::Closed(job) => (job, "dispatch queue closed"),
            };
            ClusterError::Send {
                failed: job
                    .destinations
                    .into_iter()
                    .map(|member| FaultyMember {
                        member,
                        reason: reason.to_string(),
                    })
                    .collect(),
            }
        })
    }

    async fn start(&self, _next: Next) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.queue.lock() = Some(tx);
        let task = tokio::spawn(Self::run(rx, self.cancel.clone()));
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Dropping the sender lets the task drain what is queued and exit.
        self.queue.lock().take();
        let task = self.task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err()
        {
            tracing::warn!("Dispatch queue not drained within {:?}, abandoning", DRAIN_TIMEOUT);
            self.cancel.cancel();
            let _ = task.await;
        }
        Ok(())
    }
}
