use clap::Parser;
use cluster_channel::channel::group::GroupChannel;
use cluster_channel::config::ClusterConfig;
use cluster_channel::http::{self, DocumentMap};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// One member of a replicated cluster, serving its map over HTTP.
#[derive(Parser, Debug)]
#[command(name = "cluster-node", version, about)]
struct Args {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP address for heartbeats.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// TCP address for member-to-member messages.
    #[arg(long = "data-bind")]
    data_bind: Option<SocketAddr>,

    /// Host other members use to reach this node.
    #[arg(long)]
    advertise: Option<IpAddr>,

    /// Heartbeat address of another member. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// HTTP address for the map API.
    #[arg(long, default_value = "127.0.0.1:8080")]
    http: SocketAddr,

    /// Name of the replicated map.
    #[arg(long, default_value = "default")]
    map: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 1. Configuration:
    let mut config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.membership.bind = bind;
    }
    if let Some(bind) = args.data_bind {
        config.receiver.bind = bind;
    }
    if args.advertise.is_some() {
        config.receiver.advertise = args.advertise;
    }

    tracing::info!(
        "Starting node: heartbeat={} data={} http={}",
        config.membership.bind,
        config.receiver.bind,
        args.http
    );

    // 2. Channel (membership + transport + interceptors):
    let map_config = config.map.clone();
    let channel = GroupChannel::builder(config)
        .standard_interceptors()
        .build()
        .await?;
    for peer in &args.peers {
        channel.add_peer(*peer);
    }
    channel.start().await?;
    tracing::info!(
        "Local member: {} at {}",
        channel.local_member().unique_id,
        channel.local_member().name()
    );

    // 3. Replicated map:
    let map = DocumentMap::new(args.map.clone(), channel.clone(), map_config);
    map.start().await?;
    tracing::info!(
        "Map '{}' started with {} other member(s)",
        map.name(),
        map.map_members().len()
    );

    // 4. Spawn stats reporter:
    let stats_channel = channel.clone();
    let stats_map = map.clone();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_channel.members();
            let (primary, backup, proxy) = stats_map.role_counts();
            tracing::info!(
                "Cluster stats: {} alive nodes, entries primary={} backup={} proxy={}",
                alive.len(),
                primary,
                backup,
                proxy
            );
            for member in alive {
                tracing::info!(
                    "  - {} {} (seq={})",
                    member.unique_id,
                    member.name(),
                    member.seq
                );
            }
        }
    });

    // 5. Start HTTP server:
    let app = http::router(map.clone(), channel.clone());
    let listener = tokio::net::TcpListener::bind(args.http).await?;

    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    // 6. Leave the cluster:
    tracing::info!("Shutting down");
    reporter.abort();
    map.stop().await;
    channel.stop().await;

    Ok(())
}
