//! Outbound peer messaging.
//!
//! Every message goes out on its own short-lived TCP connection as a single
//! JSON line; replies travel back the same way to the sender's peer address.
//! Links can be cut per destination to simulate partitions.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::message::write_message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct Network {
    dropped: Mutex<HashSet<SocketAddr>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later send to `addr` fail immediately.
    pub fn drop_messages_to(&self, addr: SocketAddr) {
        if self.lock().insert(addr) {
            info!(%addr, "dropping messages to peer");
        }
    }

    pub fn reconnect_to(&self, addr: SocketAddr) {
        if self.lock().remove(&addr) {
            info!(%addr, "reconnected to peer");
        }
    }

    pub fn is_dropped(&self, addr: &SocketAddr) -> bool {
        self.lock().contains(addr)
    }

    pub async fn send_one_way<T: Serialize>(&self, addr: SocketAddr, message: &T) -> Result<()> {
        if self.is_dropped(&addr) {
            bail!("link to {addr} is down");
        }

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        write_message(&mut stream, message)
            .await
            .with_context(|| format!("failed to send message to {addr}"))?;
        stream
            .shutdown()
            .await
            .with_context(|| format!("failed to close connection to {addr}"))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SocketAddr>> {
        self.dropped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientRequest, read_message};
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn delivers_one_json_line_per_connection() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let network = Network::new();

        let request = ClientRequest::Get { key: "title".into() };
        network.send_one_way(addr, &request).await?;

        let (stream, _) = listener.accept().await?;
        let mut reader = BufReader::new(stream);
        let received = read_message::<_, ClientRequest>(&mut reader).await?;
        assert_eq!(received, Some(request));
        assert_eq!(read_message::<_, ClientRequest>(&mut reader).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_link_fails_until_reconnected() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let network = Network::new();
        let request = ClientRequest::Get { key: "title".into() };

        network.drop_messages_to(addr);
        assert!(network.is_dropped(&addr));
        let err = network.send_one_way(addr, &request).await.unwrap_err();
        assert!(err.to_string().contains("is down"), "unexpected error: {err}");

        network.reconnect_to(addr);
        network.send_one_way(addr, &request).await?;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let network = Network::new();
        let request = ClientRequest::Get { key: "title".into() };
        assert!(network.send_one_way(addr, &request).await.is_err());
        Ok(())
    }
}
