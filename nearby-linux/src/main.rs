// Nearby mesh daemon for Linux: multicast discovery, TCP sessions, file-backed identity.

mod actor;
mod config;
mod discovery;
mod identity_store;
mod transport;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nearby_core::{Coordinator, DiscoveryInfo, LocalIdentity, PeerSnapshot};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nearby-linux", version, about = "Nearby mesh host for the local network")]
struct Cli {
    /// Config file; defaults to ~/.config/nearby/config.toml, then /etc/nearby/config.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Display name advertised to peers.
    #[arg(short, long)]
    name: Option<String>,
    /// Service type; only peers advertising the same one are discovered.
    #[arg(long)]
    service_type: Option<String>,
    /// Directory holding the local identity.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Extra advertised key (repeatable); saved with the identity.
    #[arg(long = "info", value_name = "KEY=VALUE", value_parser = parse_pair)]
    info: Vec<(String, String)>,
    /// Dictionary entry pushed to every connected peer on SIGUSR2 (repeatable).
    #[arg(long = "announce", value_name = "KEY=VALUE", value_parser = parse_pair)]
    announce: Vec<(String, String)>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        cfg.session.display_name = name;
    }
    if let Some(service_type) = cli.service_type {
        cfg.session.service_type = service_type;
    }
    if cli.data_dir.is_some() {
        cfg.data_dir = cli.data_dir;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    let extra: DiscoveryInfo = cli.info.into_iter().collect();
    let announce: BTreeMap<String, String> = cli.announce.into_iter().collect();
    rt.block_on(run(cfg, extra, announce))
}

/// The persisted identity keeps its name; warn when the configured one differs.
fn name_matches(local: &LocalIdentity, configured: &str) -> bool {
    if local.display_name() == configured {
        return true;
    }
    warn!(
        persisted = %local.display_name(),
        configured,
        "display name differs from the saved identity; keeping the saved one"
    );
    false
}

async fn run(
    cfg: config::Config,
    extra: DiscoveryInfo,
    announce: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let mut store = identity_store::FileIdentityStore::new(&cfg.data_dir());
    let local = nearby_core::load_or_create(&mut store, &cfg.session.display_name)
        .with_context(|| format!("identity at {}", store.path().display()))?;
    name_matches(&local, &cfg.session.display_name);
    let handle = local.handle();
    info!(device = %local.identity(), %handle, "local identity");

    let book: discovery::AddressBook = Arc::new(Mutex::new(Default::default()));
    let (lan, side) = transport::LanTransport::new(book.clone());
    let transport::NetSide {
        commands,
        advert,
        browsing,
        connected,
    } = side;
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
        .await
        .with_context(|| format!("binding session port {}", cfg.transport_port))?;
    let sessions = tokio::spawn(transport::run_sessions(
        listener,
        handle.clone(),
        commands,
        connected,
        events_tx.clone(),
    ));

    let settings = discovery::DiscoverySettings {
        service_type: cfg.session.service_type.clone(),
        local: handle,
        discovery_port: cfg.discovery_port,
        transport_port: cfg.transport_port,
    };
    let discovery_events = events_tx;
    tokio::spawn(async move {
        if let Err(e) =
            discovery::run_discovery(settings, advert, browsing, book, discovery_events).await
        {
            error!(error = %e, "discovery stopped");
        }
    });

    let coordinator = Coordinator::new(lan, cfg.session.clone(), local)?
        .with_observer(Box::new(actor::LogObserver))
        .with_identity_store(Box::new(store));
    let (mesh, task) = actor::spawn_mesh(coordinator, events_rx, Duration::from_millis(cfg.tick_ms));
    if !extra.is_empty() {
        mesh.set_discovery_info(extra).await?;
    }

    serve(&mesh, &announce).await?;
    let peers = mesh.snapshots().await;
    info!(peers = peers.len(), "shutting down");
    mesh.stop().await?;
    task.await?;
    sessions.abort();
    Ok(())
}

fn log_peers(peers: &[PeerSnapshot]) {
    info!(count = peers.len(), "peers");
    for peer in peers {
        info!(peer = %peer.label, state = %peer.state, session = %peer.session_state, "peer");
    }
}

/// Run until Ctrl+C or SIGTERM. On Unix, SIGHUP restarts discovery, SIGUSR1
/// logs the peer table and SIGUSR2 pushes `announce` to every connected peer.
async fn serve(mesh: &actor::MeshHandle, announce: &BTreeMap<String, String>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => {
                    info!("restarting discovery");
                    mesh.cycle().await?;
                }
                _ = sigusr1.recv() => log_peers(&mesh.snapshots().await),
                _ = sigusr2.recv() => match mesh.broadcast_dictionary(announce.clone()).await {
                    Ok(peers) => info!(peers, "dictionary sent"),
                    Err(e) => warn!(error = %e, "dictionary not sent"),
                },
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (mesh, announce);
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::parse_from(["nearby-linux", "--name", "Bench", "--service-type", "lab"]);
        assert_eq!(cli.name.as_deref(), Some("Bench"));
        assert_eq!(cli.service_type.as_deref(), Some("lab"));
        assert!(cli.config.is_none());
        assert!(cli.info.is_empty());
    }

    #[test]
    fn info_and_announce_pairs_parse() {
        let cli = Cli::parse_from([
            "nearby-linux",
            "--info",
            "idiom=server",
            "--info",
            "room=",
            "--announce",
            "status=ready",
        ]);
        assert_eq!(
            cli.info,
            vec![("idiom".into(), "server".into()), ("room".into(), String::new())]
        );
        assert_eq!(cli.announce, vec![("status".into(), "ready".into())]);
        assert!(Cli::try_parse_from(["nearby-linux", "--info", "=x"]).is_err());
        assert!(Cli::try_parse_from(["nearby-linux", "--announce", "novalue"]).is_err());
    }

    #[test]
    fn persisted_name_wins_over_configured() {
        let local = LocalIdentity::generate("Desk");
        assert!(name_matches(&local, "Desk"));
        assert!(!name_matches(&local, "Bench"));
    }
}
