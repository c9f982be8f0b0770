use axum::Json;
use axum::{Router, extract::Extension, routing::get};
use ring_cluster::membership::config::MembershipConfig;
use ring_cluster::membership::events::MembershipListener;
use ring_cluster::membership::service::MembershipService;
use ring_cluster::membership::types::NodeId;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Logs every membership callback.
struct LoggingListener;

impl MembershipListener for LoggingListener {
    fn member_init(&self, self_id: Option<&NodeId>, members: &[NodeId]) -> anyhow::Result<()> {
        match self_id {
            Some(id) => tracing::info!("Initialised as {} with {} members", id, members.len()),
            None => tracing::info!("Initialised as client with {} members", members.len()),
        }
        Ok(())
    }

    fn member_change(&self, old: &[NodeId], new: &[NodeId]) -> anyhow::Result<()> {
        tracing::info!("Membership changed: {} -> {} members", old.len(), new.len());
        for node in new {
            tracing::info!("  - {}", node);
        }
        Ok(())
    }

    fn change_main(&self) -> anyhow::Result<()> {
        tracing::info!("This node is now the cluster leader");
        Ok(())
    }

    fn change_sub(&self) -> anyhow::Result<()> {
        tracing::info!("This node is now a follower");
        Ok(())
    }
}

#[derive(Serialize)]
struct ClusterStatus {
    node: String,
    client: bool,
    joined: bool,
    main: bool,
    main_doubt: bool,
    leader: Option<String>,
    members: Vec<String>,
    clients: Vec<String>,
}

async fn handle_cluster_status(
    Extension(membership): Extension<Arc<MembershipService>>,
) -> Json<ClusterStatus> {
    let to_strings =
        |nodes: Vec<NodeId>| -> Vec<String> { nodes.iter().map(|n| n.to_string()).collect() };

    Json(ClusterStatus {
        node: membership.local_id().to_string(),
        client: membership.is_client(),
        joined: membership.is_joined().await,
        main: membership.is_main().await,
        main_doubt: membership.is_main_doubt().await,
        leader: membership.leader().await.map(|n| n.to_string()),
        members: to_strings(membership.members().await),
        clients: to_strings(membership.clients()),
    })
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} --bind <addr:port> [--seed <addr:port>]... [--client] [--config <file.json>] [--http <addr:port>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:5000 --seed 127.0.0.1:5000", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000 --http 127.0.0.1:6001",
        program
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("ring-cluster");

    let mut config_path: Option<String> = None;
    let mut bind_addr: Option<SocketAddr> = None;
    let mut seeds: Vec<SocketAddr> = vec![];
    let mut http_addr: Option<SocketAddr> = None;
    let mut is_client = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(v)) => {
                config_path = Some(v.clone());
                i += 2;
            }
            ("--bind", Some(v)) => {
                bind_addr = Some(v.parse()?);
                i += 2;
            }
            ("--seed", Some(v)) => {
                seeds.push(v.parse()?);
                i += 2;
            }
            ("--http", Some(v)) => {
                http_addr = Some(v.parse()?);
                i += 2;
            }
            ("--client", _) => {
                is_client = true;
                i += 1;
            }
            ("--help", _) | ("-h", _) => usage(program),
            _ => {
                i += 1;
            }
        }
    }

    // command-line flags override the config file
    let mut config = match &config_path {
        Some(path) => MembershipConfig::from_json_file(path)?,
        None => MembershipConfig::default(),
    };
    match bind_addr {
        Some(addr) => config.bind_addr = addr,
        None if config_path.is_none() => usage(program),
        None => {}
    }
    config.seeds.extend(seeds);
    config.is_client |= is_client;

    if config.seeds.is_empty() {
        tracing::info!("No seeds given, discovering on the bind address only");
        config.seeds.push(config.bind_addr);
    }
    tracing::info!("Seed nodes: {:?}", config.seeds);

    // 1. Membership (UDP ring):
    let membership = MembershipService::with_seeds(config.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_id());

    membership.add_listener(Arc::new(LoggingListener)).await;
    membership.start().await?;
    membership.join().await?;

    // 2. HTTP status endpoint:
    let app = Router::new()
        .route("/cluster", get(handle_cluster_status))
        .layer(Extension(membership.clone()));

    let http_addr = http_addr.unwrap_or_else(|| {
        let bound = membership.local_addr();
        SocketAddr::new(bound.ip(), bound.port().wrapping_add(1000))
    });

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down, leaving the cluster");
    membership.stop().await;

    Ok(())
}
