//! Messages exchanged between clients, coordinators and replicas.
//!
//! Everything travels as one JSON document per line. Peer traffic is wrapped
//! in a [`PeerMessage`] envelope carrying the sender's generation, the
//! correlation id chosen by the coordinator and the address replies go to.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One replica's view of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub key: String,
    pub value: String,
    /// Microseconds since the Unix epoch when the replica accepted the write.
    pub timestamp: u64,
    pub generation: u64,
}

impl StoredValue {
    /// Sentinel returned for a key the replica has never stored.
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            timestamp: 0,
            generation: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.generation == 0 && self.timestamp == 0 && self.value.is_empty()
    }

    /// Same key, value and generation; timestamps may differ between replicas.
    pub fn same_version(&self, other: &StoredValue) -> bool {
        self.key == other.key && self.value == other.value && self.generation == other.generation
    }

    /// Higher generation wins; within a generation the later timestamp wins.
    pub fn is_newer_than(&self, other: &StoredValue) -> bool {
        (self.generation, self.timestamp) > (other.generation, other.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Success,
    Error,
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerBody {
    SetValueRequest { key: String, value: String },
    GetValueRequest { key: String },
    SetValueResponse { status: WriteStatus },
    GetValueResponse { value: StoredValue },
}

impl PeerBody {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            PeerBody::SetValueRequest { .. } | PeerBody::GetValueRequest { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub generation: u64,
    pub correlation_id: u64,
    /// Peer address of the sender; replies are routed back here.
    pub from: SocketAddr,
    pub body: PeerBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientResponse {
    Success,
    Value { value: String },
    Error,
    Rejected { message: String },
}

impl fmt::Display for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientResponse::Success => f.write_str("Success"),
            ClientResponse::Value { value } => f.write_str(value),
            ClientResponse::Error => f.write_str("Error"),
            ClientResponse::Rejected { message } => f.write_str(message),
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
