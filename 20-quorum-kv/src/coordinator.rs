//! Client request coordination.
//!
//! Any node can coordinate. A client `Set` or `Get` becomes one peer request
//! per replica, all stamped with the node's generation and registered under
//! fresh correlation ids that share one [`QuorumCallback`]. The node's own
//! replica is served in-process before any remote send starts, so the local
//! write is applied whatever the quorum outcome turns out to be. Remote sends
//! run on their own task; the client is answered once the quorum decides, not
//! once every send has finished.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Error;
use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlation::{RequestCallback, RequestWaitingList};
use crate::message::{ClientRequest, ClientResponse, PeerBody, PeerMessage, StoredValue, WriteStatus};
use crate::network::Network;
use crate::quorum::{QuorumCallback, ReadPolicy, ReadRepair, WritePolicy};
use crate::replica::ReplicaHandler;
use crate::topology::ReplicaSet;

pub struct Coordinator {
    generation: u64,
    peer_addr: SocketAddr,
    replicas: ReplicaSet,
    waiting_list: Arc<RequestWaitingList>,
    network: Arc<Network>,
    replica: Arc<ReplicaHandler>,
    next_request_id: AtomicU64,
}

impl Coordinator {
    pub fn new(
        generation: u64,
        peer_addr: SocketAddr,
        replicas: ReplicaSet,
        waiting_list: Arc<RequestWaitingList>,
        network: Arc<Network>,
        replica: Arc<ReplicaHandler>,
    ) -> Self {
        Self {
            generation,
            peer_addr,
            replicas,
            waiting_list,
            network,
            replica,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Runs one client request through a quorum of replicas.
    ///
    /// Resolves as soon as the quorum outcome is known. Remote sends keep
    /// running in the background; unanswered peers are eventually retired by
    /// the waiting list's expiry sweep.
    pub async fn handle_client_request(self: &Arc<Self>, request: ClientRequest) -> ClientResponse {
        let replicas = self.replicas.len();
        match request {
            ClientRequest::Set { key, value } => {
                debug!(%key, generation = self.generation, "coordinating write");
                let (callback, reply) = QuorumCallback::new(WritePolicy, replicas);
                self.fan_out(callback, PeerBody::SetValueRequest { key, value })
                    .await;
                await_decision(reply).await
            }
            ClientRequest::Get { key } => {
                debug!(%key, "coordinating read");
                let coordinator = Arc::clone(self);
                let repair: Arc<dyn ReadRepair> = coordinator;
                let (callback, reply) =
                    QuorumCallback::new(ReadPolicy::new(key.clone(), repair), replicas);
                self.fan_out(callback, PeerBody::GetValueRequest { key }).await;
                await_decision(reply).await
            }
        }
    }

    /// Dispatches a message received on the peer listener.
    ///
    /// Requests are answered by the local replica and the reply is sent back
    /// to the requester's peer address; responses complete pending requests.
    pub async fn handle_peer_message(&self, message: PeerMessage) {
        if !message.body.is_request() {
            self.waiting_list
                .handle_response(message.correlation_id, message);
            return;
        }

        let requester = message.from;
        let Some(reply) = self.apply_locally(message).await else {
            return;
        };
        if let Err(err) = self.network.send_one_way(requester, &reply).await {
            warn!(%requester, error = ?err, "failed to send reply to peer");
        }
    }

    /// Registers one correlation id per replica, serves the local replica and
    /// starts the remote sends without waiting for them to finish.
    async fn fan_out(self: &Arc<Self>, callback: Arc<dyn RequestCallback>, body: PeerBody) {
        let mut remote = Vec::with_capacity(self.replicas.len());

        for &replica in self.replicas.addrs() {
            let correlation_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self
                .waiting_list
                .register(correlation_id, Arc::clone(&callback))
            {
                callback.on_error(err);
                continue;
            }

            let request = PeerMessage {
                generation: self.generation,
                correlation_id,
                from: self.peer_addr,
                body: body.clone(),
            };
            if replica == self.peer_addr {
                self.serve_locally(request).await;
            } else {
                remote.push((replica, request));
            }
        }

        if remote.is_empty() {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let sends = remote
                .into_iter()
                .map(|(replica, request)| coordinator.send_request(replica, request));
            join_all(sends).await;
        });
    }

    async fn serve_locally(&self, request: PeerMessage) {
        if let Some(reply) = self.apply_locally(request).await {
            self.waiting_list
                .handle_response(reply.correlation_id, reply);
        }
    }

    /// Runs the replica handler off the async workers; writes block on fsync.
    async fn apply_locally(&self, request: PeerMessage) -> Option<PeerMessage> {
        let replica = Arc::clone(&self.replica);
        let correlation_id = request.correlation_id;
        match tokio::task::spawn_blocking(move || replica.handle(request)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(correlation_id, error = ?err, "local replica task failed");
                let err = Error::new(err).context("local replica task failed");
                self.waiting_list.handle_error(correlation_id, err);
                None
            }
        }
    }

    async fn send_request(&self, replica: SocketAddr, request: PeerMessage) {
        let correlation_id = request.correlation_id;
        if let Err(err) = self.network.send_one_way(replica, &request).await {
            debug!(%replica, correlation_id, error = %err, "peer request failed");
            self.waiting_list.handle_error(correlation_id, err);
        }
    }
}

impl ReadRepair for Coordinator {
    fn repair(self: Arc<Self>, replica: SocketAddr, value: StoredValue) {
        tokio::spawn(async move {
            let correlation_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let callback = Arc::new(RepairCallback {
                replica,
                key: value.key.clone(),
            });
            if let Err(err) = self.waiting_list.register(correlation_id, callback) {
                warn!(%replica, error = ?err, "failed to register read repair");
                return;
            }

            info!(%replica, key = %value.key, generation = value.generation, "repairing stale replica");
            // The repair carries the authoritative value's generation, not ours.
            let request = PeerMessage {
                generation: value.generation,
                correlation_id,
                from: self.peer_addr,
                body: PeerBody::SetValueRequest {
                    key: value.key,
                    value: value.value,
                },
            };
            if replica == self.peer_addr {
                self.serve_locally(request).await;
            } else {
                self.send_request(replica, request).await;
            }
        });
    }
}

/// Completion handler for read-repair writes; nothing waits on them.
struct RepairCallback {
    replica: SocketAddr,
    key: String,
}

impl RequestCallback for RepairCallback {
    fn on_response(&self, response: PeerMessage) {
        match response.body {
            PeerBody::SetValueResponse {
                status: WriteStatus::Success,
            } => debug!(replica = %self.replica, key = %self.key, "read repair applied"),
            other => warn!(replica = %self.replica, key = %self.key, body = ?other, "read repair not applied"),
        }
    }

    fn on_error(&self, error: Error) {
        warn!(replica = %self.replica, key = %self.key, error = %error, "read repair failed");
    }
}

async fn await_decision(reply: oneshot::Receiver<ClientResponse>) -> ClientResponse {
    match reply.await {
        Ok(response) => response,
        Err(_) => {
            warn!("quorum callback dropped without a decision");
            ClientResponse::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::store::DurableKvStore;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use tempfile::{TempDir, tempdir};
    use tokio::net::TcpListener;

    struct Fixture {
        coordinator: Arc<Coordinator>,
        replica: Arc<ReplicaHandler>,
        waiting_list: Arc<RequestWaitingList>,
        network: Arc<Network>,
        _dir: TempDir,
    }

    fn fixture(generation: u64, peer_addr: SocketAddr, replicas: Vec<SocketAddr>) -> Fixture {
        fixture_with_clock(generation, peer_addr, replicas, Arc::new(SystemClock))
    }

    fn fixture_with_clock(
        generation: u64,
        peer_addr: SocketAddr,
        replicas: Vec<SocketAddr>,
        clock: Arc<dyn Clock>,
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(DurableKvStore::open(dir.path()).unwrap());
        let replica = Arc::new(ReplicaHandler::with_clock(store, peer_addr, clock));
        let waiting_list = Arc::new(RequestWaitingList::new());
        let network = Arc::new(Network::new());
        let coordinator = Arc::new(Coordinator::new(
            generation,
            peer_addr,
            ReplicaSet::new(replicas).unwrap(),
            waiting_list.clone(),
            network.clone(),
            replica.clone(),
        ));
        Fixture {
            coordinator,
            replica,
            waiting_list,
            network,
            _dir: dir,
        }
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn single_replica_cluster_reads_its_own_writes() {
        let addr = unused_addr().await;
        let fx = fixture(3, addr, vec![addr]);

        let response = fx
            .coordinator
            .handle_client_request(ClientRequest::Set {
                key: "title".into(),
                value: "Microservices".into(),
            })
            .await;
        assert_eq!(response, ClientResponse::Success);
        assert_eq!(fx.replica.stored_value("title").generation, 3);

        let response = fx
            .coordinator
            .handle_client_request(ClientRequest::Get { key: "title".into() })
            .await;
        assert_eq!(
            response,
            ClientResponse::Value {
                value: "Microservices".into()
            }
        );
        assert!(fx.waiting_list.is_empty());
    }

    #[tokio::test]
    async fn write_fails_but_applies_locally_when_peers_are_cut_off() {
        let addr = unused_addr().await;
        let peer_a = unused_addr().await;
        let peer_b = unused_addr().await;
        let fx = fixture(1, addr, vec![addr, peer_a, peer_b]);
        fx.network.drop_messages_to(peer_a);
        fx.network.drop_messages_to(peer_b);

        let response = fx
            .coordinator
            .handle_client_request(ClientRequest::Set {
                key: "title".into(),
                value: "Microservices".into(),
            })
            .await;
        assert_eq!(response, ClientResponse::Error);
        assert_eq!(fx.replica.stored_value("title").value, "Microservices");

        let response = fx
            .coordinator
            .handle_client_request(ClientRequest::Get { key: "title".into() })
            .await;
        assert_eq!(response, ClientResponse::Error);
    }

    #[tokio::test]
    async fn responses_on_the_peer_path_complete_pending_requests() {
        let addr = unused_addr().await;
        let fx = fixture(1, addr, vec![addr]);

        struct Flag(std::sync::Mutex<bool>);
        impl RequestCallback for Flag {
            fn on_response(&self, _response: PeerMessage) {
                *self.0.lock().unwrap() = true;
            }
            fn on_error(&self, _error: Error) {}
        }

        let flag = Arc::new(Flag(std::sync::Mutex::new(false)));
        fx.waiting_list.register(77, flag.clone()).unwrap();
        fx.coordinator
            .handle_peer_message(PeerMessage {
                generation: 1,
                correlation_id: 77,
                from: addr,
                body: PeerBody::SetValueResponse {
                    status: WriteStatus::Success,
                },
            })
            .await;
        assert!(*flag.0.lock().unwrap());
        assert!(fx.waiting_list.is_empty());
    }

    /// Records which thread asked for the time, i.e. which thread wrote.
    #[derive(Default)]
    struct ThreadRecordingClock(Mutex<Vec<ThreadId>>);

    impl Clock for ThreadRecordingClock {
        fn now_micros(&self) -> u64 {
            self.0.lock().unwrap().push(thread::current().id());
            1
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn local_writes_run_off_the_runtime_thread() {
        let addr = unused_addr().await;
        let clock = Arc::new(ThreadRecordingClock::default());
        let fx = fixture_with_clock(1, addr, vec![addr], clock.clone());

        let response = fx
            .coordinator
            .handle_client_request(ClientRequest::Set {
                key: "title".into(),
                value: "Microservices".into(),
            })
            .await;
        assert_eq!(response, ClientResponse::Success);

        fx.coordinator
            .handle_peer_message(PeerMessage {
                generation: 1,
                correlation_id: 9,
                from: addr,
                body: PeerBody::SetValueRequest {
                    key: "author".into(),
                    value: "Unmesh".into(),
                },
            })
            .await;

        let writers = clock.0.lock().unwrap().clone();
        assert_eq!(writers.len(), 2);
        assert!(writers.iter().all(|id| *id != thread::current().id()));
    }
}
