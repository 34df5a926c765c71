//! Shared helpers for multi-node tests on localhost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::group::{GroupChannel, GroupChannelBuilder};
use crate::config::{ClusterConfig, Discovery};

/// Fast timers, loopback sockets on ephemeral ports, static discovery.
pub(crate) fn local_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.membership.bind = "127.0.0.1:0".parse().unwrap();
    config.membership.discovery = Discovery::Static { peers: Vec::new() };
    config.membership.frequency_ms = 50;
    config.membership.expiry_ms = 600;
    config.membership.sweep_interval_ms = 50;
    config.receiver.bind = "127.0.0.1:0".parse().unwrap();
    config.sender.timeout_ms = 1000;
    config.map.rpc_timeout_ms = 1000;
    config
}

/// Polls `condition` until it holds or `timeout` passes.
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Address of a port nobody listens on.
pub(crate) fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Builds `size` channels that know each other's heartbeat sockets, starts them and waits
/// until everybody sees everybody.
pub(crate) async fn start_cluster<F>(size: usize, configure: F) -> Vec<Arc<GroupChannel>>
where
    F: Fn(GroupChannelBuilder) -> GroupChannelBuilder,
{
    start_cluster_from(vec![local_config(); size], configure).await
}

/// Like [`start_cluster`], one channel per given configuration.
pub(crate) async fn start_cluster_from<F>(configs: Vec<ClusterConfig>, configure: F) -> Vec<Arc<GroupChannel>>
where
    F: Fn(GroupChannelBuilder) -> GroupChannelBuilder,
{
    let size = configs.len();
    let mut channels = Vec::with_capacity(size);
    for config in configs {
        let builder = configure(GroupChannel::builder(config));
        channels.push(builder.build().await.unwrap());
    }

    let addrs: Vec<SocketAddr> = channels
        .iter()
        .map(|c| c.heartbeat_addr().unwrap())
        .collect();
    for (i, channel) in channels.iter().enumerate() {
        for (j, addr) in addrs.iter().enumerate() {
            if i != j {
                channel.add_peer(*addr);
            }
        }
    }

    for channel in &channels {
        channel.start().await.unwrap();
    }

    let converged = wait_until(Duration::from_secs(5), || {
        channels.iter().all(|c| c.members().len() == size - 1)
    })
    .await;
    assert!(converged, "cluster of {} did not converge", size);

    channels
}

/// Builds one more channel, points it at the running `cluster` and starts it once every
/// member sees it.
pub(crate) async fn join_cluster(cluster: &[Arc<GroupChannel>]) -> Arc<GroupChannel> {
    let channel = GroupChannel::builder(local_config()).build().await.unwrap();
    let addr = channel.heartbeat_addr().unwrap();
    for member in cluster {
        channel.add_peer(member.heartbeat_addr().unwrap());
        member.add_peer(addr);
    }
    channel.start().await.unwrap();

    let size = cluster.len() + 1;
    let converged = wait_until(Duration::from_secs(5), || {
        channel.members().len() == size - 1
            && cluster.iter().all(|c| c.members().len() == size - 1)
    })
    .await;
    assert!(converged, "new member did not join");
    channel
}
