// Duet node: advertise, discover, and set up calls with the simulated call engine.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use duet_node::{config, Config, DirectoryEvent, Node, Registration, SessionReport};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "duet-node", version, about = "LAN peer discovery and call signaling node")]
struct Args {
    /// Device name to advertise
    #[arg(long)]
    name: Option<String>,
    /// Signaling TCP port
    #[arg(long)]
    port: Option<u16>,
    /// Config file (default: ~/.config/duet/config.toml, then /etc/duet/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dial this target (ws://host:port, tcp://host:port or host:port) and start a call
    #[arg(long, conflicts_with = "call")]
    dial: Option<String>,
    /// Call a discovered peer by name once it appears
    #[arg(long)]
    call: Option<String>,
    /// Do not register on the local network
    #[arg(long)]
    no_advertise: bool,
    /// Print the peer directory whenever it changes
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duet_node=info".parse().context("log directive")?),
        )
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args))
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut cfg = match &args.config {
        Some(path) => {
            let mut c = config::load_from(path)?;
            config::apply_env(&mut c, |k| std::env::var(k).ok());
            c
        }
        None => config::load()?,
    };
    if let Some(name) = &args.name {
        cfg.device_name = name.clone();
    }
    if let Some(port) = args.port {
        cfg.signaling_port = port;
    }
    if args.no_advertise {
        cfg.advertise = false;
    }
    Ok(cfg)
}

async fn run(cfg: Config, args: Args) -> anyhow::Result<()> {
    let node = Node::start_simulated(cfg).await?;
    let directory = node.directory();
    let mut peers = directory.subscribe();
    let mut reports = node.subscribe_reports();
    let mut registration = node.registration();
    log_registration(&registration.borrow_and_update());

    if let Some(target) = &args.dial {
        node.connect(Some(target), true, false)?;
    }
    let mut pending_call = args.call.clone();
    if let Some(name) = pending_call.take() {
        if directory.get(&name).is_some() {
            node.connect_to_peer(&name)?;
        } else {
            info!(%name, "waiting for peer to appear");
            pending_call = Some(name);
        }
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            ev = peers.recv() => match ev {
                Ok(DirectoryEvent::Added(peer)) | Ok(DirectoryEvent::Changed(peer)) => {
                    info!(name = %peer.name, target = %peer.target(), "peer available");
                    if pending_call.as_deref() == Some(peer.name.as_str()) {
                        pending_call = None;
                        node.connect_to_peer(&peer.name)?;
                    }
                    if args.list {
                        print_directory(&directory.list());
                    }
                }
                Ok(DirectoryEvent::Removed(name)) => {
                    info!(%name, "peer gone");
                    if args.list {
                        print_directory(&directory.list());
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "directory events lagged"),
                Err(RecvError::Closed) => {}
            },
            Ok(()) = registration.changed() => {
                log_registration(&registration.borrow_and_update());
            }
            report = reports.recv() => match report {
                Ok(SessionReport::StateChanged(state)) => info!(?state, "call state"),
                Ok(SessionReport::Failed(e)) => warn!(error = %e, "call failed"),
                Ok(SessionReport::Closed) => info!("call ended"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "session reports lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}

fn log_registration(registration: &Registration) {
    match registration {
        Registration::Registered(name) => info!(%name, "registered on the LAN"),
        Registration::Failed(reason) => warn!(%reason, "not advertising, dial-only"),
        Registration::Inactive | Registration::Pending => {}
    }
}

fn print_directory(peers: &[duet_node::PeerRecord]) {
    println!("{} peer(s):", peers.len());
    for peer in peers {
        println!("  {}  {}", peer.name, peer.target());
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
