//! Per-node generation counter used as a fencing token.
//!
//! The generation lives in the node's own [`DurableKvStore`] under
//! [`GENERATION_KEY`]. Every startup reads it, adds one and writes it back
//! before the node serves any traffic, so a second instance started against
//! the same data directory always outranks the one it replaces.

use anyhow::{Context, Result};

use crate::store::DurableKvStore;

pub const GENERATION_KEY: &str = "generation";

/// Bumps and persists the stored generation, returning the new value.
///
/// A store without a generation yields 1.
pub fn increment_and_persist(store: &DurableKvStore) -> Result<u64> {
    let current = match store.get(GENERATION_KEY) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("stored generation {raw:?} is not a number"))?,
        None => 0,
    };
    let next = current.checked_add(1).context("generation counter overflow")?;
    store
        .put(GENERATION_KEY, next.to_string())
        .context("failed to persist generation")?;
    Ok(next)
}
