//! A node restarted on its data directory comes back with everything it had
//! acknowledged and a higher generation.

mod common;

use anyhow::Result;
use common::localhost;
use quorum_kv::client::{get_value, set_kv};
use quorum_kv::runtime::{NodeConfig, spawn_node};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_replays_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let peer_addr = localhost(19801);
    let config = NodeConfig::new(dir.path(), localhost(0), peer_addr, vec![peer_addr]);

    let node = spawn_node(config.clone()).await?;
    assert_eq!(node.generation(), 1);
    assert_eq!(set_kv(node.client_addr(), "title", "Microservices").await?, "Success");
    assert_eq!(set_kv(node.client_addr(), "title", "Patterns").await?, "Success");
    assert_eq!(set_kv(node.client_addr(), "author", "Unmesh").await?, "Success");
    let before = node.stored_value("title");
    node.shutdown().await?;

    let node = spawn_node(config.clone()).await?;
    assert_eq!(node.generation(), 2);
    assert_eq!(node.stored_value("title"), before);
    assert_eq!(node.stored_value("author").value, "Unmesh");
    assert_eq!(get_value(node.client_addr(), "title").await?, "Patterns");
    node.shutdown().await?;

    // Replaying twice changes nothing but the generation.
    let node = spawn_node(config).await?;
    assert_eq!(node.generation(), 3);
    assert_eq!(node.stored_value("title"), before);
    node.shutdown().await
}
