//! Quorum aggregation for fanned-out client requests.
//!
//! A coordinator sends one copy of a client request to every replica and
//! registers a single [`QuorumCallback`] under all of the resulting
//! correlation ids. The callback tallies replies as they trickle in and
//! answers the client exactly once:
//!
//! - as soon as `⌊N/2⌋ + 1` replicas answered successfully, or
//! - as soon as enough replicas failed that a majority is out of reach.
//!
//! What counts as a success and what the client gets back is decided by a
//! [`ResponsePolicy`]: [`WritePolicy`] only counts acknowledgements, while
//! [`ReadPolicy`] picks the newest value and repairs replicas that returned
//! something older.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::correlation::RequestCallback;
use crate::message::{ClientResponse, PeerBody, PeerMessage, StoredValue, WriteStatus};
use crate::topology::quorum_size;

/// Why a replica's reply did not count towards quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The request never reached the replica, or no reply came back in time.
    Unreachable(String),
    /// The replica fenced the write off because of a stale generation.
    Rejected(String),
    /// The replica failed to apply the request.
    Error,
    /// The replica answered with a message of the wrong kind.
    Unexpected(String),
}

pub trait ResponsePolicy: Send + 'static {
    type Vote: Send;

    /// Turns a replica reply into a vote or a failure.
    fn classify(&self, response: PeerMessage) -> Result<Self::Vote, Failure>;

    /// Builds the client reply once quorum votes have been collected.
    fn decide(&mut self, votes: &[Self::Vote]) -> ClientResponse;

    /// Builds the client reply once quorum can no longer be reached.
    ///
    /// A fencing rejection is reported verbatim; anything else is a plain
    /// `Error`.
    fn fail(&mut self, failures: &[Failure]) -> ClientResponse {
        failures
            .iter()
            .find_map(|failure| match failure {
                Failure::Rejected(message) => Some(ClientResponse::Rejected {
                    message: message.clone(),
                }),
                _ => None,
            })
            .unwrap_or(ClientResponse::Error)
    }

    /// Sees a successful reply that arrived after the client was answered.
    fn on_late_vote(&mut self, _vote: Self::Vote) {}
}

pub struct QuorumCallback<P: ResponsePolicy> {
    replicas: usize,
    quorum: usize,
    tally: Mutex<Tally<P>>,
}

struct Tally<P: ResponsePolicy> {
    policy: P,
    votes: Vec<P::Vote>,
    failures: Vec<Failure>,
    /// Taken when the decision is made; `None` means the outcome is final.
    reply_to: Option<oneshot::Sender<ClientResponse>>,
}

impl<P: ResponsePolicy> QuorumCallback<P> {
    /// Creates a callback expecting one reply from each of `replicas`.
    pub fn new(policy: P, replicas: usize) -> (Arc<Self>, oneshot::Receiver<ClientResponse>) {
        let (reply_to, reply) = oneshot::channel();
        let callback = Arc::new(Self {
            replicas,
            quorum: quorum_size(replicas),
            tally: Mutex::new(Tally {
                policy,
                votes: Vec::with_capacity(replicas),
                failures: Vec::new(),
                reply_to: Some(reply_to),
            }),
        });
        (callback, reply)
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn is_decided(&self) -> bool {
        self.lock().reply_to.is_none()
    }

    fn record(&self, outcome: Result<P::Vote, Failure>) {
        let mut guard = self.lock();
        let tally = &mut *guard;

        if tally.reply_to.is_none() {
            match outcome {
                Ok(vote) => tally.policy.on_late_vote(vote),
                Err(failure) => debug!(?failure, "ignoring failure after quorum decision"),
            }
            return;
        }

        let decision = match outcome {
            Ok(vote) => {
                tally.votes.push(vote);
                if tally.votes.len() >= self.quorum {
                    Some(tally.policy.decide(&tally.votes))
                } else {
                    None
                }
            }
            Err(failure) => {
                tally.failures.push(failure);
                if tally.failures.len() > self.replicas - self.quorum {
                    Some(tally.policy.fail(&tally.failures))
                } else {
                    None
                }
            }
        };

        if let Some(response) = decision {
            debug!(
                votes = tally.votes.len(),
                failures = tally.failures.len(),
                quorum = self.quorum,
                %response,
                "quorum decided"
            );
            if let Some(reply_to) = tally.reply_to.take() {
                // The client may have hung up already; nothing left to do then.
                let _ = reply_to.send(response);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tally<P>> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: ResponsePolicy> RequestCallback for QuorumCallback<P> {
    fn on_response(&self, response: PeerMessage) {
        let outcome = self.lock().policy.classify(response);
        self.record(outcome);
    }

    fn on_error(&self, error: Error) {
        self.record(Err(Failure::Unreachable(format!("{error:#}"))));
    }
}

/// Counts replica acknowledgements of a `SetValueRequest`.
#[derive(Debug, Default)]
pub struct WritePolicy;

impl ResponsePolicy for WritePolicy {
    type Vote = ();

    fn classify(&self, response: PeerMessage) -> Result<(), Failure> {
        match response.body {
            PeerBody::SetValueResponse { status } => match status {
                WriteStatus::Success => Ok(()),
                WriteStatus::Rejected { message } => Err(Failure::Rejected(message)),
                WriteStatus::Error => Err(Failure::Error),
            },
            other => Err(Failure::Unexpected(format!("{other:?}"))),
        }
    }

    fn decide(&mut self, _votes: &[()]) -> ClientResponse {
        ClientResponse::Success
    }
}

/// Sends the authoritative value back to a replica that returned stale data.
///
/// Repairs are fire-and-forget: implementations must not block and nothing
/// waits for the repaired replica to acknowledge.
pub trait ReadRepair: Send + Sync {
    fn repair(self: Arc<Self>, replica: SocketAddr, value: StoredValue);
}

#[derive(Debug, Clone)]
pub struct ReadVote {
    pub replica: SocketAddr,
    pub value: StoredValue,
}

/// Picks the newest value among `GetValueResponse`s and repairs the rest.
pub struct ReadPolicy {
    key: String,
    repair: Arc<dyn ReadRepair>,
    authoritative: Option<StoredValue>,
}

impl ReadPolicy {
    pub fn new(key: impl Into<String>, repair: Arc<dyn ReadRepair>) -> Self {
        Self {
            key: key.into(),
            repair,
            authoritative: None,
        }
    }

    fn repair_if_stale(&self, vote: &ReadVote) {
        let Some(authoritative) = &self.authoritative else {
            return;
        };
        if authoritative.is_empty()
            || vote.value.same_version(authoritative)
            || vote.value.is_newer_than(authoritative)
        {
            return;
        }

        debug!(
            replica = %vote.replica,
            key = %authoritative.key,
            stale_generation = vote.value.generation,
            generation = authoritative.generation,
            "read repair"
        );
        Arc::clone(&self.repair).repair(vote.replica, authoritative.clone());
    }
}

impl ResponsePolicy for ReadPolicy {
    type Vote = ReadVote;

    fn classify(&self, response: PeerMessage) -> Result<ReadVote, Failure> {
        match response.body {
            PeerBody::GetValueResponse { value } => Ok(ReadVote {
                replica: response.from,
                value,
            }),
            other => Err(Failure::Unexpected(format!("{other:?}"))),
        }
    }

    fn decide(&mut self, votes: &[ReadVote]) -> ClientResponse {
        let latest = pick_latest(votes.iter().map(|vote| &vote.value))
            .cloned()
            .unwrap_or_else(|| StoredValue::empty(self.key.clone()));
        self.authoritative = Some(latest.clone());

        for vote in votes {
            self.repair_if_stale(vote);
        }

        ClientResponse::Value {
            value: latest.value,
        }
    }

    fn on_late_vote(&mut self, vote: ReadVote) {
        self.repair_if_stale(&vote);
    }
}

/// Highest generation wins, ties go to the later timestamp.
pub fn pick_latest<'a>(values: impl IntoIterator<Item = &'a StoredValue>) -> Option<&'a StoredValue> {
    values.into_iter().fold(None, |best, candidate| match best {
        Some(best) if !candidate.is_newer_than(best) => Some(best),
        _ => Some(candidate),
    })
}
