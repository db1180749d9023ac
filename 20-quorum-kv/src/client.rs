use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::message::{ClientRequest, ClientResponse, read_message, write_message};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection to one node's client-facing listener.
pub struct KvClient {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl KvClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = timeout(CLIENT_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<ClientResponse> {
        self.request(ClientRequest::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn get(&mut self, key: impl Into<String>) -> Result<ClientResponse> {
        self.request(ClientRequest::Get { key: key.into() }).await
    }

    async fn request(&mut self, request: ClientRequest) -> Result<ClientResponse> {
        write_message(&mut self.writer, &request)
            .await
            .with_context(|| format!("failed to send request to {}", self.addr))?;

        let response = timeout(CLIENT_TIMEOUT, read_message::<_, ClientResponse>(&mut self.reader))
            .await
            .with_context(|| format!("timed out waiting for {}", self.addr))?
            .with_context(|| format!("failed to read response from {}", self.addr))?;
        match response {
            Some(response) => Ok(response),
            None => bail!("{} closed the connection", self.addr),
        }
    }
}

/// Connects, sends one write and returns the node's plain-text reply.
pub async fn set_kv(addr: SocketAddr, key: &str, value: &str) -> Result<String> {
    let mut client = KvClient::connect(addr).await?;
    Ok(client.set(key, value).await?.to_string())
}

/// Connects, sends one read and returns the node's plain-text reply.
pub async fn get_value(addr: SocketAddr, key: &str) -> Result<String> {
    let mut client = KvClient::connect(addr).await?;
    Ok(client.get(key).await?.to_string())
}
