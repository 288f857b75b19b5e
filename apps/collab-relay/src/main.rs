//! Collaboration relay
//! Rooms per document: fans out join announcements, forwards addressed
//! peer messages and answers the server requests against a stored copy.

mod room;
mod store;
mod ws;

use clap::Parser;
use collab_mesh::transport::IceServer;
use room::Relay;
use std::path::PathBuf;
use std::sync::Arc;
use store::DocumentStore;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "collab-relay")]
#[command(about = "Signaling relay and document store for collaborative editing")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9001")]
    bind: String,

    /// STUN/TURN url handed to clients (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Directory for saved documents; kept in memory when absent
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Tracing filter
    #[arg(long, default_value = "collab_relay=debug,collab_mesh=info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(args.log.as_str()).init();

    let store = match &args.data_dir {
        Some(dir) => {
            let store = DocumentStore::open(dir)?;
            info!("Loaded {} documents from {}", store.len(), dir.display());
            store
        }
        None => DocumentStore::in_memory(),
    };
    let ice_servers = args.ice_servers.into_iter().map(IceServer::new).collect();
    let relay = Arc::new(Relay::new(Arc::new(store), ice_servers));

    let listener = TcpListener::bind(&args.bind).await?;
    info!("Collaboration relay listening on: {}", args.bind);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(ws::handle_connection(stream, addr, relay.clone()));
    }

    Ok(())
}
