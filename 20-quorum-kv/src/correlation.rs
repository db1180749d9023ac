//! Correlation of asynchronous peer replies with the request that caused them.
//!
//! A coordinator registers a [`RequestCallback`] under a fresh correlation id
//! before sending each peer request. Replies arrive on whatever task read them
//! off the network, in any order; the [`RequestWaitingList`] hands each one to
//! its callback exactly once and quietly drops replies for ids it no longer
//! knows about (late, duplicated or already expired).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Error, Result, anyhow, ensure};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::PeerMessage;

/// Completion handler for one or more pending peer requests.
pub trait RequestCallback: Send + Sync {
    fn on_response(&self, response: PeerMessage);
    fn on_error(&self, error: Error);
}

struct PendingRequest {
    callback: Arc<dyn RequestCallback>,
    created_at: Instant,
}

#[derive(Default)]
pub struct RequestWaitingList {
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestWaitingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `correlation_id`.
    ///
    /// Fails if the id is already pending; ids must be unique per node.
    pub fn register(&self, correlation_id: u64, callback: Arc<dyn RequestCallback>) -> Result<()> {
        let mut pending = self.lock();
        ensure!(
            !pending.contains_key(&correlation_id),
            "correlation id {correlation_id} is already pending"
        );
        pending.insert(
            correlation_id,
            PendingRequest {
                callback,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Delivers a reply. Returns `false` if nothing was waiting for it.
    pub fn handle_response(&self, correlation_id: u64, response: PeerMessage) -> bool {
        match self.take(correlation_id) {
            Some(request) => {
                request.callback.on_response(response);
                true
            }
            None => {
                debug!(correlation_id, "dropping reply for unknown or retired request");
                false
            }
        }
    }

    /// Delivers a failure, e.g. the outbound send could not reach the peer.
    pub fn handle_error(&self, correlation_id: u64, error: Error) -> bool {
        match self.take(correlation_id) {
            Some(request) => {
                request.callback.on_error(error);
                true
            }
            None => {
                debug!(correlation_id, error = %error, "dropping error for unknown or retired request");
                false
            }
        }
    }

    /// Retires every request pending for at least `ttl`, failing it with a
    /// timeout error. Returns how many were retired.
    pub fn expire(&self, ttl: Duration) -> usize {
        let expired: Vec<(u64, PendingRequest)> = {
            let mut pending = self.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, request)| request.created_at.elapsed() >= ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        let count = expired.len();
        for (correlation_id, request) in expired {
            warn!(correlation_id, ?ttl, "peer request timed out");
            request
                .callback
                .on_error(anyhow!("request {correlation_id} timed out after {ttl:?}"));
        }
        count
    }

    /// Runs [`expire`](Self::expire) every `interval` until `shutdown` flips to true.
    pub fn spawn_expiry(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let waiting_list = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        waiting_list.expire(ttl);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Remove under the lock, invoke outside it: a callback may register new
    // requests, and only one caller can ever win the removal.
    fn take(&self, correlation_id: u64) -> Option<PendingRequest> {
        self.lock().remove(&correlation_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
