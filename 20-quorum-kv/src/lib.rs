//! Leaderless key-value store replicated with quorum reads and writes.
//!
//! Every node is both a replica and a coordinator. A client request is fanned
//! out to all replicas and answered once a majority agrees; reads pick the
//! newest value and repair replicas that returned stale data. Each node bumps
//! a persisted generation on startup and replicas refuse writes stamped with
//! an older generation than they have already stored, so a paused instance
//! that comes back cannot overwrite its successor's data.
//!
//! Modules, leaves first:
//!
//! - [`wal`] frames records into the append-only write-ahead log.
//! - [`command`] is the mutation recorded in that log.
//! - [`store`] is the durable map rebuilt from the log on startup.
//! - [`generation`] bumps and persists the node generation.
//! - [`message`] defines the JSON line protocol for clients and peers.
//! - [`correlation`] matches asynchronous peer replies to pending requests.
//! - [`topology`] holds the replica set and quorum arithmetic.
//! - [`quorum`] tallies replies into one client answer, with read repair.
//! - [`clock`] timestamps stored values.
//! - [`replica`] answers peer requests and applies generation fencing.
//! - [`network`] sends peer messages and can cut links for testing.
//! - [`coordinator`] turns client requests into quorum rounds.
//! - [`runtime`] boots a node and runs its accept loops.
//! - [`client`] and [`cli`] are the command-line front end.

pub mod cli;
pub mod client;
pub mod clock;
pub mod command;
pub mod coordinator;
pub mod correlation;
pub mod generation;
pub mod message;
pub mod network;
pub mod quorum;
pub mod replica;
pub mod runtime;
pub mod store;
pub mod topology;
pub mod wal;
