//! CLI for ClusterMQ
//!
//! Subcommands:
//! - `node`: run a broker node (cluster listener, peer links, pending
//!   transaction checks)
//! - `show-config`: print the effective configuration as JSON

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clustermq::broker::message::BrokerAddress;
use clustermq::broker::{BrokerContext, ClusterRouter, RemoteConsumers};
use clustermq::config::load_config_from;
use clustermq::persistence::TxnLog;
use clustermq::transport::create_transport;
use clustermq::transport::websocket::{start_cluster_listener, start_peer_connector};
use clustermq::utils::logging;
use tracing::{error, info};
use uuid::Uuid;

const PEER_RETRY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "clustermq")]
enum Command {
    /// Run a broker node
    Node {
        /// Configuration file, extension optional
        #[arg(long, env = "CLUSTERMQ_CONFIG", default_value = "config/default")]
        config: String,
    },
    /// Print the effective configuration
    ShowConfig {
        #[arg(long, env = "CLUSTERMQ_CONFIG", default_value = "config/default")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cmd = Command::parse();

    match cmd {
        Command::Node { config } => {
            if let Err(e) = run_node(&config).await {
                logging::init("info");
                error!("Node failed: {}", e);
            }
        }
        Command::ShowConfig { config } => {
            if let Err(e) = show_config(&config) {
                logging::init("info");
                error!("Unable to load configuration: {}", e);
            }
        }
    }
}

async fn run_node(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config_from(config_path)?;
    logging::init(&settings.logging.level);

    let local = BrokerAddress::with_session(settings.node.instance.clone(), Uuid::new_v4());
    let transport = create_transport(&settings.cluster.transport, &local)?;
    let txn_log = TxnLog::open(&settings.persistence.path)?;
    let addr = format!("{}:{}", settings.node.host, settings.node.port);
    let peers = settings.cluster.peers.clone();

    let ctx = BrokerContext::new(settings, local.clone());
    let remote = RemoteConsumers::new(ctx.clone(), transport.broadcaster.clone(), txn_log);
    let router = Arc::new(ClusterRouter::new(
        ctx,
        transport.broadcaster.clone(),
        remote.clone(),
    ));

    tokio::spawn(RemoteConsumers::start_pending_check_loop(remote));
    info!("Broker {} started", local);

    match transport.links {
        Some(links) => {
            for peer in peers {
                tokio::spawn(start_peer_connector(
                    peer,
                    router.clone(),
                    links.clone(),
                    PEER_RETRY,
                ));
            }

            tokio::select! {
                result = start_cluster_listener(addr, router.clone(), links.clone()) => {
                    match result {
                        Ok(()) => error!("Cluster listener exited unexpectedly."),
                        Err(e) => error!("Cluster listener failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Exiting gracefully.");
                }
            }
            links.close_all();
        }
        None => {
            info!("Running without peer links");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    router.shutdown();
    router.remote().txn_log().flush()?;
    Ok(())
}

fn show_config(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config_from(config_path)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
