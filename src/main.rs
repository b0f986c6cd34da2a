//! TacoNET daemon entry point.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use taconet::node::Node;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "taconet", version, about = "TacoNET friend-to-friend node")]
struct Args {
    /// Directory holding settings.json, keys and downloads
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Override the application bind IP from settings
    #[arg(long)]
    ip: Option<String>,

    /// Override the application port from settings
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the nickname from settings
    #[arg(short, long)]
    nickname: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taconet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("TacoNET v{} starting", VERSION);

    let node = match Node::new(&args.data_dir) {
        Ok(n) => n,
        Err(e) => {
            error!("failed to initialize node: {}", e);
            std::process::exit(1);
        }
    };

    if args.ip.is_some() || args.port.is_some() || args.nickname.is_some() {
        node.save_settings(|s| {
            if let Some(ip) = &args.ip {
                s.app_ip = ip.clone();
            }
            if let Some(port) = args.port {
                s.app_port = port;
            }
            if let Some(nickname) = &args.nickname {
                s.nickname = nickname.clone();
            }
        });
    }

    let (client_key, server_key) = node.public_keys();
    info!("identity: {}", node.local_id());
    info!("client public key: {}", client_key);
    info!("server public key: {}", server_key);

    if let Err(e) = node.start().await {
        error!("failed to start node: {}", e);
        std::process::exit(1);
    }

    let node = Arc::new(node);

    // Periodic status line, the only steady-state output at info level.
    let status_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let connected = status_node
                .peer_status()
                .iter()
                .filter(|p| {
                    p.session
                        .as_ref()
                        .map(|s| s.state == taconet::SessionState::Connected)
                        .unwrap_or(false)
                })
                .count();
            let (up, down) = status_node.speed();
            info!(
                "status: {} peers connected | up {:.1} KB/s | down {:.1} KB/s",
                connected,
                up / 1024.0,
                down / 1024.0
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, stopping");
    node.shutdown().await;
}
