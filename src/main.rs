use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use abyss_core::{Aurl, Host, HostEvent, RootKey};

/// Out-of-band peer certificates, given as `ROOT.pem,HANDSHAKE.pem`.
#[derive(Clone, Debug)]
struct KnownPeer {
    root_cert: PathBuf,
    handshake_cert: PathBuf,
}

impl FromStr for KnownPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (root, handshake) = s
            .split_once(',')
            .context("known peer must be given as ROOT.pem,HANDSHAKE.pem")?;
        Ok(KnownPeer { root_cert: root.into(), handshake_cert: handshake.into() })
    }
}

#[derive(Parser, Debug)]
#[command(name = "abyss-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// PKCS#8 PEM file holding the Ed25519 root key. A fresh key is used if omitted.
    #[arg(short, long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Open a world with this URL.
    #[arg(short, long, value_name = "URL")]
    open: Option<String>,

    /// Path the opened world accepts joins on.
    #[arg(short, long, default_value = "/")]
    expose: String,

    /// Join the world at this abyss: URL.
    #[arg(short, long, value_name = "AURL")]
    join: Option<Aurl>,

    #[arg(short = 'K', long = "known-peer", value_name = "ROOT,HANDSHAKE")]
    known_peers: Vec<KnownPeer>,

    /// Write this host's root and handshake certificates here.
    #[arg(long, value_name = "DIR")]
    export: Option<PathBuf>,
}

fn load_root_key(path: Option<&PathBuf>) -> Result<RootKey> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RootKey::from_pkcs8_pem(&pem)
        }
        None => Ok(RootKey::generate()),
    }
}

fn export_certificates(host: &Host, dir: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("root.pem"), host.root_cert_pem())?;
    std::fs::write(dir.join("handshake.pem"), host.handshake_cert_pem())?;
    info!(dir = %dir.display(), "certificates exported");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let root_key = load_root_key(args.key.as_ref())?;
    let host = Host::bind(&args.bind.to_string(), &root_key).await?;
    info!("Host identity: {}", host.id());
    info!("Reachable at {}", host.aurl(&args.expose));

    if let Some(dir) = &args.export {
        export_certificates(&host, dir)?;
    }

    for peer in &args.known_peers {
        let root = std::fs::read_to_string(&peer.root_cert)
            .with_context(|| format!("failed to read {}", peer.root_cert.display()))?;
        let handshake = std::fs::read_to_string(&peer.handshake_cert)
            .with_context(|| format!("failed to read {}", peer.handshake_cert.display()))?;
        host.append_known_peer(&root, &handshake)?;
    }

    if let Some(url) = &args.open {
        let world = host.open_world(url).await;
        host.expose_world(world, &args.expose).await?;
    }

    let cancel = CancellationToken::new();
    if let Some(aurl) = &args.join {
        match host.join_world(aurl, &cancel).await {
            Ok(world) => info!(%world, "join requested"),
            Err(e) => warn!(error = %e, "join failed"),
        }
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            event = host.next_event() => event,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            HostEvent::SessionRequest { world, session } => {
                info!(%world, peer = %session.peer_id, session = %session.session_id, "accepting session");
                host.accept_session(world, &session).await;
            }
            HostEvent::WorldEnter { world, url } => info!(%world, %url, "entered world"),
            HostEvent::SessionReady { world, session } => {
                info!(%world, peer = %session.peer_id, "session ready")
            }
            HostEvent::SessionClose { world, session } => {
                info!(%world, peer = %session.peer_id, "session closed")
            }
            HostEvent::ObjectAppend { world, session, objects } => {
                info!(%world, peer = %session.peer_id, count = objects.len(), "objects appended")
            }
            HostEvent::ObjectDelete { world, session, object_ids } => {
                info!(%world, peer = %session.peer_id, count = object_ids.len(), "objects deleted")
            }
            HostEvent::JoinFail { world, code, message } => {
                warn!(%world, code, %message, "join failed")
            }
            HostEvent::WorldLeave { world, code, message } => {
                info!(%world, code, %message, "left world")
            }
            HostEvent::PeerConnected { peer } => info!(peer = %peer.id(), "peer connected"),
            HostEvent::PeerDisconnected { peer_id } => info!(peer = %peer_id, "peer disconnected"),
        }
    }

    cancel.cancel();
    host.close();
    Ok(())
}
