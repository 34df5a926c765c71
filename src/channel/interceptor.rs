//! Interceptor stack
//!
//! Stages are ordered from the application (index 0) down to the transport. Outbound
//! messages walk the stages top-down and end in the [`OutboundSink`]; inbound messages walk
//! them bottom-up and end in the [`InboundSink`]. Each stage gets an owned [`Next`] handle
//! pointing at its neighbours and decides whether, when and how often to call it.

use async_trait::async_trait;
use std::sync::Arc;

use super::message::ChannelMessage;
use super::options::SendOptions;
use crate::error::{ClusterError, OptionConflict, Result};
use crate::membership::types::Member;

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Option bits this stage implements. `0` means it sees every message.
    fn option_flag(&self) -> u32 {
        0
    }

    async fn send(
        &self,
        message: ChannelMessage,
        destinations: Vec<Member>,
        next: Next,
    ) -> Result<()> {
        next.send(message, destinations).await
    }

    async fn receive(&self, message: ChannelMessage, next: Next) -> Result<()> {
        next.receive(message).await
    }

    fn member_added(&self, _member: &Member) {}

    fn member_disappeared(&self, _member: &Member) {}

    /// Called once when the channel starts, bottom stage first. `next` is the same handle
    /// the stage receives on every message and may be kept for background work.
    async fn start(&self, _next: Next) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// End of the outbound path.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, message: ChannelMessage, destinations: Vec<Member>) -> Result<()>;
}

/// End of the inbound path.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, message: ChannelMessage) -> Result<()>;
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Interceptor>>,
    outbound: Arc<dyn OutboundSink>,
    inbound: Arc<dyn InboundSink>,
}

impl Pipeline {
    pub fn new(
        stages: Vec<Arc<dyn Interceptor>>,
        outbound: Arc<dyn OutboundSink>,
        inbound: Arc<dyn InboundSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stages,
            outbound,
            inbound,
        })
    }

    pub fn stages(&self) -> &[Arc<dyn Interceptor>] {
        &self.stages
    }

    /// Whether some stage implements every bit of `option`.
    pub fn handles(&self, option: SendOptions) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.option_flag() != 0 && SendOptions::from_bits(stage.option_flag()).contains(option))
    }

    /// Handle that enters the stack from above (sends) and from below (receives).
    pub fn head(self: &Arc<Self>) -> Next {
        Next {
            pipeline: self.clone(),
            send_from: 0,
            receive_to: self.stages.len(),
        }
    }

    fn next_for(self: &Arc<Self>, index: usize) -> Next {
        Next {
            pipeline: self.clone(),
            send_from: index + 1,
            receive_to: index,
        }
    }

    pub async fn send(self: &Arc<Self>, message: ChannelMessage, destinations: Vec<Member>) -> Result<()> {
        self.head().send(message, destinations).await
    }

    pub async fn receive(self: &Arc<Self>, message: ChannelMessage) -> Result<()> {
        self.head().receive(message).await
    }

    /// Starts every stage, bottom-up. With `option_check` the stack is rejected before any
    /// stage starts if two stages claim overlapping option bits.
    pub async fn start(self: &Arc<Self>, option_check: bool) -> Result<()> {
        if option_check {
            check_option_flags(&self.stages)?;
        }
        for (index, stage) in self.stages.iter().enumerate().rev() {
            stage.start(self.next_for(index)).await?;
            tracing::debug!("Started interceptor {}", stage.name());
        }
        Ok(())
    }

    /// Stops every stage, top-down. Failures are logged and do not stop the others.
    pub async fn stop(&self) {
        for stage in &self.stages {
            if let Err(e) = stage.stop().await {
                tracing::warn!("Interceptor {} failed to stop: {}", stage.name(), e);
            }
        }
    }

    pub fn member_added(&self, member: &Member) {
        for stage in &self.stages {
            stage.member_added(member);
        }
    }

    pub fn member_disappeared(&self, member: &Member) {
        for stage in &self.stages {
            stage.member_disappeared(member);
        }
    }
}

/// A stage handles a message when it implements no option or the message carries every
/// bit of the stage's option.
fn applies(stage: &dyn Interceptor, options: SendOptions) -> bool {
    let flag = stage.option_flag();
    flag == 0 || options.contains(SendOptions::from_bits(flag))
}

/// Reference to the rest of the stack as seen from one stage.
#[derive(Clone)]
pub struct Next {
    pipeline: Arc<Pipeline>,
    send_from: usize,
    receive_to: usize,
}

impl Next {
    /// Passes a message to the next stage down, or to the transport.
    pub async fn send(&self, message: ChannelMessage, destinations: Vec<Member>) -> Result<()> {
        let stages = &self.pipeline.stages;
        for index in self.send_from..stages.len() {
            let stage = &stages[index];
            if applies(stage.as_ref(), message.options) {
                let next = self.pipeline.next_for(index);
                return stage.send(message, destinations, next).await;
            }
        }
        self.pipeline.outbound.send(message, destinations).await
    }

    /// Passes a message to the next stage up, or to the channel listeners.
    pub async fn receive(&self, message: ChannelMessage) -> Result<()> {
        let stages = &self.pipeline.stages;
        for index in (0..self.receive_to).rev() {
            let stage = &stages[index];
            if applies(stage.as_ref(), message.options) {
                let next = self.pipeline.next_for(index);
                return stage.receive(message, next).await;
            }
        }
        self.pipeline.inbound.deliver(message).await
    }
}

/// Rejects stacks in which two stages claim overlapping option bits.
pub fn check_option_flags(stages: &[Arc<dyn Interceptor>]) -> Result<()> {
    let mut conflicts = Vec::new();

    for (i, first) in stages.iter().enumerate() {
        let first_flag = first.option_flag();
        if first_flag == 0 {
            continue;
        }
        for second in &stages[i + 1..] {
            let second_flag = second.option_flag();
            if first_flag & second_flag != 0 {
                conflicts.push(OptionConflict {
                    first: first.name().to_string(),
                    first_flag,
                    second: second.name().to_string(),
                    second_flag,
                });
            }
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(ClusterError::OptionConflict(conflicts))
    }
}
