use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kelpie::{Contact, Keypair, Node, NodeId};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    node_id: String,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a node id (format: IP:PORT/NODE_ID)")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        NodeId::from_hex(id_part).map_err(|_| anyhow::anyhow!("node id must be 128 hex chars"))?;
        Ok(BootstrapPeer {
            addr,
            node_id: id_part.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kelpied")]
#[command(author, version, about = "Kademlia DHT node", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Bootstrap peers, nearest tried first (IP:PORT/NODE_ID).
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Replication factor.
    #[arg(long, default_value_t = kelpie::DEFAULT_K)]
    k: usize,

    /// Seconds between status reports.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Keypair::generate();
    let node = Node::builder()
        .keypair(keypair)
        .listen(args.bind)
        .k(args.k)
        .build()
        .await?;
    info!("node id: {}", node.node_id());
    info!("listening on {}", node.contact().primary_endpoint);

    let bootstraps: Vec<Contact> = args
        .bootstrap
        .iter()
        .map(|peer| {
            let node_id = NodeId::from_hex(&peer.node_id).expect("validated at parse time");
            Contact {
                node_id,
                primary_endpoint: peer.addr,
                local_endpoints: Vec::new(),
                rendezvous_endpoint: None,
                public_key_id: node_id,
                public_key: Vec::new(),
                signature: Vec::new(),
            }
        })
        .collect();

    if bootstraps.is_empty() {
        info!("no bootstrap peers given, founding a new network");
        node.join(vec![node.contact()]).await?;
    } else {
        match node.join(bootstraps).await {
            Ok(()) => info!("joined the overlay"),
            Err(err) => warn!(error = %err, "join failed, running isolated"),
        }
    }

    let mut status = time::interval(Duration::from_secs(args.status_interval));
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                info!(contacts = node.known_contacts(), "status");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let hints = node.leave().await;
                for hint in hints.iter().take(8) {
                    info!("bootstrap hint: {}/{}", hint.primary_endpoint, hint.node_id);
                }
                node.shutdown().await;
                break;
            }
        }
    }
    Ok(())
}
