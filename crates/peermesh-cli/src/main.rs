//! peermesh demo client
//!
//! Usage:
//!   peermesh id [--host ...]
//!   peermesh chat [--id alice] [--peer bob] [--host ...]
//!
//! `chat` joins the mesh and bridges stdin lines to every open peer;
//! incoming payloads are printed with their origin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peermesh::{
    ClientEvent, ConnectOptions, MeshClient, MeshOptions, NodeEvent, Payload, PeerId,
    SendOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "peermesh")]
#[command(about = "WebRTC mesh client", long_about = None)]
struct Cli {
    /// Signaling server host
    #[arg(long, global = true, default_value = "0.peerjs.com")]
    host: String,

    /// Signaling server port
    #[arg(long, global = true, default_value_t = 443)]
    port: u16,

    /// Mount path of the signaling endpoints
    #[arg(long, global = true, default_value = "/")]
    path: String,

    /// API key
    #[arg(long, global = true, default_value = "peerjs")]
    key: String,

    /// Use plain http/ws instead of https/wss
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the signaling server for a fresh peer id
    Id,
    /// Join the mesh and chat over data channels
    Chat {
        /// Use this id instead of a server-assigned one
        #[arg(long)]
        id: Option<String>,
        /// Connect to this peer after the session opens
        #[arg(long)]
        peer: Option<String>,
    },
}

fn options_from(cli: &Cli) -> MeshOptions {
    MeshOptions {
        host: cli.host.clone(),
        port: cli.port,
        path: cli.path.clone(),
        key: cli.key.clone(),
        secure: !cli.insecure,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let options = options_from(&cli);

    match cli.command {
        Commands::Id => {
            let connector = peermesh::signaling::socket::WsConnector::new();
            use peermesh::SignalingConnector;
            let id = connector
                .retrieve_id(&options)
                .await
                .context("could not retrieve an id")?;
            println!("{id}");
        }
        Commands::Chat { id, peer } => {
            chat(options, id, peer).await?;
        }
    }
    Ok(())
}

fn watch_node(node: std::sync::Arc<peermesh::RemoteNode>) {
    let peer = node.peer().clone();
    let mut events = node.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Open => println!("* {peer} connected"),
                NodeEvent::Data(Payload::Json(value)) => match value.as_str() {
                    Some(text) => println!("<{peer}> {text}"),
                    None => println!("<{peer}> {value}"),
                },
                NodeEvent::Data(Payload::Bytes(bytes)) => {
                    println!("<{peer}> {} raw bytes", bytes.len());
                }
                NodeEvent::Ping(ms) => tracing::debug!("{peer} rtt {ms}ms"),
                NodeEvent::Error(e) => eprintln!("! {peer}: {e}"),
                NodeEvent::Close => {
                    println!("* {peer} left");
                    break;
                }
            }
        }
    });
}

async fn chat(options: MeshOptions, id: Option<String>, target: Option<String>) -> Result<()> {
    let client = match id {
        Some(id) => MeshClient::with_id(PeerId::new(id)?, options),
        None => MeshClient::new(options),
    };
    let mut events = client.subscribe();

    let connect_to = match target {
        Some(target) => Some(PeerId::new(target)?),
        None => None,
    };

    let stdin_client = std::sync::Arc::new(client);
    let reader_client = stdin_client.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let sent = reader_client
                .broadcast(Payload::text(line), SendOptions::default())
                .await;
            if sent == 0 {
                eprintln!("! no open peers");
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Open(id) => {
                println!("* online as {id}");
                if let Some(peer) = connect_to.clone() {
                    match stdin_client.connect(peer, ConnectOptions::default()).await {
                        Ok(node) => watch_node(node),
                        Err(e) => eprintln!("! connect failed: {e}"),
                    }
                }
            }
            ClientEvent::Connection(node) => watch_node(node),
            ClientEvent::Disconnected(id) => println!("* {id} disconnected from signaling"),
            ClientEvent::Error(e) => eprintln!("! {e}"),
            ClientEvent::Close => {
                println!("* session closed");
                break;
            }
        }
    }
    Ok(())
}
