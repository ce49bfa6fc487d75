//! The coordinator runs on one task; everything else talks to it through [`MeshHandle`].
//! Commands are serialized through the actor's queue.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nearby_core::{
    Coordinator, DecodedMessage, DiscoveryInfo, MeshObserver, PeerSnapshot, StreamHandle,
    Transport, TransportEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Snapshots(oneshot::Sender<Vec<PeerSnapshot>>),
    BroadcastDictionary {
        entries: BTreeMap<String, String>,
        reply: oneshot::Sender<anyhow::Result<usize>>,
    },
    SetDiscoveryInfo(DiscoveryInfo),
    Cycle,
    Stop(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
}

fn closed() -> anyhow::Error {
    anyhow::anyhow!("mesh actor closed")
}

impl MeshHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> anyhow::Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    pub async fn snapshots(&self) -> Vec<PeerSnapshot> {
        self.request(Command::Snapshots).await.unwrap_or_default()
    }

    pub async fn broadcast_dictionary(
        &self,
        entries: BTreeMap<String, String>,
    ) -> anyhow::Result<usize> {
        self.request(|reply| Command::BroadcastDictionary { entries, reply })
            .await?
    }

    /// Queue an advertised-info change; the coordinator persists it.
    pub async fn set_discovery_info(&self, info: DiscoveryInfo) -> anyhow::Result<()> {
        self.commands
            .send(Command::SetDiscoveryInfo(info))
            .await
            .map_err(|_| closed())
    }

    /// Stop and restart discovery, dropping every session.
    pub async fn cycle(&self) -> anyhow::Result<()> {
        self.commands.send(Command::Cycle).await.map_err(|_| closed())
    }

    /// Stop the mesh and end the actor. Returns once the coordinator has stopped.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.request(Command::Stop).await
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Start the coordinator and drive it from `events`, a tick every `tick`, and handle commands.
pub fn spawn_mesh<T>(
    mut coordinator: Coordinator<T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    tick: Duration,
) -> (MeshHandle, JoinHandle<()>)
where
    T: Transport + Send + 'static,
{
    let (commands_tx, mut commands) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        coordinator.start();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => coordinator.tick(now()),
                Some(event) = events.recv() => coordinator.handle_event(event, now()),
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("mesh handles dropped, stopping");
                        coordinator.stop(now());
                        break;
                    };
                    if let Some(done) = execute(&mut coordinator, command) {
                        coordinator.stop(now());
                        let _ = done.send(());
                        break;
                    }
                }
            }
        }
        info!("mesh stopped");
    });
    (MeshHandle { commands: commands_tx }, task)
}

/// Apply one command. Returns the reply channel when the command was `Stop`.
fn execute<T: Transport>(
    coordinator: &mut Coordinator<T>,
    command: Command,
) -> Option<oneshot::Sender<()>> {
    match command {
        Command::Snapshots(reply) => {
            let _ = reply.send(coordinator.snapshots());
        }
        Command::BroadcastDictionary { entries, reply } => {
            let result = coordinator
                .send_dictionary_to_all(entries, now())
                .map_err(anyhow::Error::from);
            let _ = reply.send(result);
        }
        Command::SetDiscoveryInfo(info) => coordinator.set_local_discovery_info(info, now()),
        Command::Cycle => coordinator.cycle(now()),
        Command::Stop(done) => return Some(done),
    }
    None
}

/// Observer for the daemon: everything goes to the log.
pub struct LogObserver;

impl MeshObserver for LogObserver {
    fn on_message_received(&mut self, message: DecodedMessage, from: &PeerSnapshot) {
        match message {
            DecodedMessage::Dictionary(entries) => {
                info!(peer = %from.label, ?entries, "dictionary received");
            }
            DecodedMessage::Avatar(avatar) => {
                let bytes = avatar.image_data.as_ref().map_or(0, Vec::len);
                info!(peer = %from.label, name = ?avatar.name, bytes, hash = %avatar.hash, "avatar received");
            }
            DecodedMessage::App(app) => {
                info!(peer = %from.label, kind = %app.kind(), "message received");
            }
        }
    }

    fn on_first_info_received(&mut self, from: &PeerSnapshot) {
        let info = from
            .provisioned_info
            .as_ref()
            .and_then(|i| serde_json::to_string(i).ok())
            .unwrap_or_default();
        info!(peer = %from.label, %info, "device provisioned");
    }

    fn on_info_changed(&mut self, from: &PeerSnapshot) {
        debug!(peer = %from.label, "device info changed");
    }

    fn on_state_changed(&mut self, peer: &PeerSnapshot) {
        info!(peer = %peer.label, state = %peer.state, session = %peer.session_state, "state");
    }

    fn on_stream_chunk(&mut self, from: &PeerSnapshot, stream: StreamHandle, chunk: Vec<u8>) {
        warn!(peer = %from.label, stream = stream.0, bytes = chunk.len(), "unhandled stream data");
    }
}
