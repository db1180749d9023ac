//! Durable key-value storage for a single node.
//!
//! The store keeps every key in an in-memory map and records each mutation in
//! the [`WriteAheadLog`] before applying it. Opening a store replays the whole
//! log, so a restarted node sees exactly what it had acknowledged before the
//! previous shutdown or crash.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::command::Command;
use crate::wal::{WalEntry, WriteAheadLog};

/// Log-backed key-value store.
///
/// A single `Mutex` serializes every operation. It is held across the append
/// so log order always matches apply order.
pub struct DurableKvStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    wal: WriteAheadLog,
    data: BTreeMap<String, String>,
}

impl DurableKvStore {
    /// Opens the store in `dir` and replays its log before returning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let wal = WriteAheadLog::open(dir)?;
        let entries = wal.read_all()?;

        let mut data = BTreeMap::new();
        apply_entries(&mut data, &entries)
            .with_context(|| format!("failed to replay log in {}", dir.display()))?;
        debug!(dir = %dir.display(), entries = entries.len(), keys = data.len(), "replayed write-ahead log");

        Ok(Self {
            inner: Mutex::new(StoreInner { wal, data }),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).cloned()
    }

    /// Stores a key-value pair, overwriting any existing value.
    ///
    /// The command is appended and synced first; the in-memory map only
    /// changes once the log accepted it. On error the map is untouched.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let data = Command::set_value(key.clone(), value.clone()).encode()?;

        let mut inner = self.lock();
        inner.wal.append(data)?;
        inner.wal.flush()?;
        inner.data.insert(key, value);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&self, fault: crate::wal::Fault) {
        self.lock().wal.inject_fault(fault);
    }

    /// Returns every entry whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.lock()
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Returns a copy of all key-value pairs.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // The map is only mutated after a successful append, so a panic while
        // holding the lock cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_entries(data: &mut BTreeMap<String, String>, entries: &[WalEntry]) -> Result<()> {
    let mut last_sequence = 0;
    for entry in entries {
        if entry.sequence <= last_sequence {
            warn!(
                sequence = entry.sequence,
                last_sequence, "write-ahead log sequence went backwards; applying in file order"
            );
        }
        last_sequence = entry.sequence;

        match Command::decode(&entry.data)
            .with_context(|| format!("failed to decode wal entry {}", entry.sequence))?
        {
            Command::SetValue { key, value } => {
                data.insert(key, value);
            }
        }
    }
    Ok(())
}
