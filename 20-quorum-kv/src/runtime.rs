//! Node bootstrap and network accept loops.
//!
//! Startup order matters: the durable store is opened and replayed, the
//! generation is bumped and persisted, and only then are the client and peer
//! listeners bound. Each listener runs its own accept loop and spawns one task
//! per connection:
//!
//! - **Client connections** carry any number of `ClientRequest` lines, each
//!   answered with one `ClientResponse` line once its quorum is decided.
//! - **Peer connections** carry `PeerMessage` lines from other coordinators
//!   and replicas.
//!
//! A background sweep retires peer requests nobody answered. Shutdown is a
//! `watch` flag shared by the accept loops and the sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::correlation::RequestWaitingList;
use crate::generation::increment_and_persist;
use crate::message::{ClientRequest, PeerMessage, StoredValue, read_message, write_message};
use crate::network::Network;
use crate::replica::ReplicaHandler;
use crate::store::DurableKvStore;
use crate::topology::ReplicaSet;

/// How long a peer request may stay unanswered before it counts as failed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const EXPIRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the write-ahead log.
    pub data_dir: PathBuf,
    /// Address clients connect to. Port 0 picks an ephemeral port.
    pub client_addr: SocketAddr,
    /// Address other nodes send peer messages to.
    pub peer_addr: SocketAddr,
    /// Peer addresses of every replica, usually including this node's own.
    pub peers: Vec<SocketAddr>,
    pub request_timeout: Duration,
}

impl NodeConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        client_addr: SocketAddr,
        peer_addr: SocketAddr,
        peers: Vec<SocketAddr>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            client_addr,
            peer_addr,
            peers,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Handle to a running node: its addresses, test controls and shutdown.
pub struct NodeHandle {
    generation: u64,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
    replica: Arc<ReplicaHandler>,
    network: Arc<Network>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// This node's replica copy of `key`, bypassing any quorum.
    pub fn stored_value(&self, key: &str) -> StoredValue {
        self.replica.stored_value(key)
    }

    /// Simulates a broken link: every message to `peer_addr` fails.
    pub fn drop_messages_to(&self, peer_addr: SocketAddr) {
        self.network.drop_messages_to(peer_addr);
    }

    pub fn reconnect_to(&self, peer_addr: SocketAddr) {
        self.network.reconnect_to(peer_addr);
    }

    /// Stops the accept loops and the expiry sweep and waits for them.
    ///
    /// Connections already accepted finish on their own.
    pub async fn shutdown(self) -> Result<()> {
        info!(peer_addr = %self.peer_addr, "node shutting down");
        // Every receiver may already be gone if the tasks ended on their own.
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            task.await.context("node task panicked")?;
        }
        Ok(())
    }
}

pub async fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let replicas = ReplicaSet::new(config.peers.clone()).context("invalid replica set")?;

    let store = Arc::new(
        DurableKvStore::open(&config.data_dir)
            .with_context(|| format!("failed to open store in {}", config.data_dir.display()))?,
    );
    let generation = increment_and_persist(&store).context("failed to bump node generation")?;

    let peer_listener = TcpListener::bind(config.peer_addr)
        .await
        .with_context(|| format!("failed to bind peer listener on {}", config.peer_addr))?;
    let client_listener = TcpListener::bind(config.client_addr)
        .await
        .with_context(|| format!("failed to bind client listener on {}", config.client_addr))?;
    let peer_addr = peer_listener.local_addr()?;
    let client_addr = client_listener.local_addr()?;

    if !replicas.contains(&peer_addr) {
        info!(%peer_addr, "node is not in its own replica set; coordinating only");
    }

    let network = Arc::new(Network::new());
    let waiting_list = Arc::new(RequestWaitingList::new());
    let replica = Arc::new(ReplicaHandler::new(Arc::clone(&store), peer_addr));
    let coordinator = Arc::new(Coordinator::new(
        generation,
        peer_addr,
        replicas,
        Arc::clone(&waiting_list),
        Arc::clone(&network),
        Arc::clone(&replica),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(run_client_listener(
            client_listener,
            Arc::clone(&coordinator),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_peer_listener(
            peer_listener,
            Arc::clone(&coordinator),
            shutdown_rx.clone(),
        )),
        waiting_list.spawn_expiry(config.request_timeout, EXPIRY_INTERVAL, shutdown_rx),
    ];

    info!(
        generation,
        %client_addr,
        %peer_addr,
        replicas = config.peers.len(),
        data_dir = %config.data_dir.display(),
        "node started"
    );

    Ok(NodeHandle {
        generation,
        client_addr,
        peer_addr,
        replica,
        network,
        shutdown_tx,
        tasks,
    })
}

async fn run_client_listener(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client)) => {
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, coordinator).await {
                                warn!(%client, error = ?err, "client connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept client connection"),
                }
            }
        }
    }
}

async fn run_peer_listener(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(err) = serve_peer(stream, coordinator).await {
                                warn!(%peer, error = ?err, "peer connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept peer connection"),
                }
            }
        }
    }
}

async fn serve_client(stream: TcpStream, coordinator: Arc<Coordinator>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, ClientRequest>(&mut reader).await? {
        debug!(?request, "client request");
        let response = coordinator.handle_client_request(request).await;
        write_message(&mut writer, &response).await?;
    }
    Ok(())
}

async fn serve_peer(stream: TcpStream, coordinator: Arc<Coordinator>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    while let Some(message) = read_message::<_, PeerMessage>(&mut reader).await? {
        coordinator.handle_peer_message(message).await;
    }
    Ok(())
}
