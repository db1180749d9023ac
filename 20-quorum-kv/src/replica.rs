//! Peer-facing request handling for one replica.
//!
//! Replicated values live in the node's [`DurableKvStore`] next to its
//! generation, under keys prefixed with [`VALUE_PREFIX`] and encoded as JSON.
//! Writes are fenced: a `SetValueRequest` stamped with a generation lower than
//! the highest generation among the values this replica already stores is
//! refused, which keeps a paused-then-resumed node from overwriting data its
//! successor wrote.
//!
//! The fence only looks at stored values. A key that was never written still
//! rejects stale writers as long as any other key carries a newer generation,
//! but a replica holding no values at all accepts every generation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::message::{PeerBody, PeerMessage, StoredValue, WriteStatus};
use crate::store::DurableKvStore;

pub const VALUE_PREFIX: &str = "value/";

pub struct ReplicaHandler {
    store: Arc<DurableKvStore>,
    peer_addr: SocketAddr,
    clock: Arc<dyn Clock>,
    /// Makes the fence check and the write it guards one atomic step.
    write_lock: Mutex<()>,
}

impl ReplicaHandler {
    pub fn new(store: Arc<DurableKvStore>, peer_addr: SocketAddr) -> Self {
        Self::with_clock(store, peer_addr, Arc::new(SystemClock))
    }

    /// Like [`ReplicaHandler::new`], with `clock` stamping every stored value.
    pub fn with_clock(store: Arc<DurableKvStore>, peer_addr: SocketAddr, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            peer_addr,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Answers a peer request, echoing its correlation id.
    ///
    /// Returns `None` for messages that are not requests.
    pub fn handle(&self, request: PeerMessage) -> Option<PeerMessage> {
        let body = match request.body {
            PeerBody::SetValueRequest { key, value } => PeerBody::SetValueResponse {
                status: self.set_value(key, value, request.generation),
            },
            PeerBody::GetValueRequest { key } => PeerBody::GetValueResponse {
                value: self.stored_value(&key),
            },
            other => {
                warn!(from = %request.from, body = ?other, "replica received a non-request message");
                return None;
            }
        };

        Some(PeerMessage {
            generation: request.generation,
            correlation_id: request.correlation_id,
            from: self.peer_addr,
            body,
        })
    }

    pub fn set_value(&self, key: String, value: String, generation: u64) -> WriteStatus {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let max_known = self.max_known_generation();
        if generation < max_known {
            let message = format!(
                "Rejecting request from generation {generation} as already accepted from generation {max_known}"
            );
            info!(%key, generation, max_known, "fencing stale write");
            return WriteStatus::Rejected { message };
        }

        let stored = StoredValue {
            key,
            value,
            timestamp: self.clock.now_micros(),
            generation,
        };
        match self.persist(&stored) {
            Ok(()) => WriteStatus::Success,
            Err(err) => {
                warn!(key = %stored.key, error = ?err, "failed to persist replicated value");
                WriteStatus::Error
            }
        }
    }

    /// The replica's current value for `key`, or the empty sentinel.
    pub fn stored_value(&self, key: &str) -> StoredValue {
        let Some(raw) = self.store.get(&value_key(key)) else {
            return StoredValue::empty(key);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(%key, error = ?err, "stored value is not valid json");
                StoredValue::empty(key)
            }
        }
    }

    /// Highest generation among stored values, 0 when nothing is stored.
    pub fn max_known_generation(&self) -> u64 {
        self.store
            .scan_prefix(VALUE_PREFIX)
            .iter()
            .filter_map(|(_, raw)| serde_json::from_str::<StoredValue>(raw).ok())
            .map(|value| value.generation)
            .max()
            .unwrap_or(0)
    }

    fn persist(&self, stored: &StoredValue) -> Result<()> {
        let encoded = serde_json::to_string(stored).context("failed to encode stored value")?;
        self.store.put(value_key(&stored.key), encoded)
    }
}

fn value_key(key: &str) -> String {
    format!("{VALUE_PREFIX}{key}")
}
