//! Shared harness for the integration tests: a cluster of real nodes talking
//! over localhost TCP, each with its own scratch data directory.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use quorum_kv::runtime::{NodeConfig, NodeHandle, spawn_node};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

pub const REPAIR_TIMEOUT: Duration = Duration::from_secs(2);

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub struct TestCluster {
    nodes: Vec<NodeHandle>,
    dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Spawns `n` nodes with peer ports `base_port..base_port + n` and
    /// ephemeral client ports.
    pub async fn spawn(n: usize, base_port: u16) -> Result<Self> {
        Self::spawn_with_extra_replicas(n, base_port, Vec::new()).await
    }

    /// Like [`TestCluster::spawn`], but every node also lists `extra` in its
    /// replica set without anything being started there.
    pub async fn spawn_with_extra_replicas(
        n: usize,
        base_port: u16,
        extra: Vec<SocketAddr>,
    ) -> Result<Self> {
        let local: Vec<SocketAddr> = (0..n).map(|i| localhost(base_port + i as u16)).collect();
        let peers: Vec<SocketAddr> = local.iter().copied().chain(extra).collect();

        let mut nodes = Vec::with_capacity(n);
        let mut dirs = Vec::with_capacity(n);
        for peer_addr in &local {
            let dir = tempfile::tempdir()?;
            let config = NodeConfig::new(dir.path(), localhost(0), *peer_addr, peers.clone());
            nodes.push(spawn_node(config).await?);
            dirs.push(dir);
        }

        Ok(Self { nodes, dirs })
    }

    /// Node by 1-based index.
    pub fn node(&self, id: usize) -> &NodeHandle {
        &self.nodes[id - 1]
    }

    pub fn data_dir(&self, id: usize) -> &Path {
        self.dirs[id - 1].path()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(NodeHandle::peer_addr).collect()
    }

    /// Number of nodes whose replica currently holds `value` for `key`.
    pub fn replicas_holding(&self, key: &str, value: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.stored_value(key).value == value)
            .count()
    }

    pub async fn shutdown(self) -> Result<()> {
        for node in self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }
}

/// A listener whose accept backlog is full and never drained, so connects to
/// it stall instead of failing. Holds the filler connections open.
pub struct StalledListener {
    addr: SocketAddr,
    _listener: TcpListener,
    _held: Vec<TcpStream>,
}

impl StalledListener {
    pub async fn start() -> Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(localhost(0))?;
        let listener = socket.listen(1)?;
        let addr = listener.local_addr()?;

        let mut held = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                Ok(Err(err)) => bail!("filling backlog of {addr}: {err}"),
                Err(_) => break,
            }
        }

        Ok(Self {
            addr,
            _listener: listener,
            _held: held,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(condition: F, timeout: Duration, what: &str) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
