use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::runtime::NodeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a replica node that also coordinates client requests.
    Node(NodeArgs),
    /// Write a key through a node's quorum.
    Set(SetArgs),
    /// Read a key through a node's quorum.
    Get(GetArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Directory for the node's write-ahead log.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Address clients connect to.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub client: SocketAddr,

    /// Address other nodes send peer messages to.
    #[arg(long, default_value = "127.0.0.1:9100")]
    pub listen: SocketAddr,

    /// Comma-separated peer addresses of every replica, including this node.
    #[arg(long, value_delimiter = ',', required = true)]
    pub peer: Vec<SocketAddr>,

    /// Milliseconds to wait for a replica before counting it as failed.
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,
}

impl NodeArgs {
    pub fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig::new(self.data_dir, self.client, self.listen, self.peer);
        config.request_timeout = Duration::from_millis(self.request_timeout_ms);
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    /// Client address of the coordinating node.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,

    pub key: String,

    pub value: String,
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    /// Client address of the coordinating node.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,

    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_args_build_a_config() {
        let cli = Cli::try_parse_from([
            "quorum-kv",
            "node",
            "--data-dir",
            "/tmp/athens",
            "--client",
            "127.0.0.1:9001",
            "--listen",
            "127.0.0.1:9101",
            "--peer",
            "127.0.0.1:9101,127.0.0.1:9102,127.0.0.1:9103",
            "--request-timeout-ms",
            "250",
        ])
        .unwrap();

        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        let config = args.into_config();
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.peer_addr, "127.0.0.1:9101".parse().unwrap());
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn node_requires_peers() {
        let result = Cli::try_parse_from(["quorum-kv", "node", "--data-dir", "/tmp/athens"]);
        assert!(result.is_err());
    }

    #[test]
    fn set_takes_key_and_value() {
        let cli = Cli::try_parse_from(["quorum-kv", "set", "title", "Microservices"]).unwrap();
        let Command::Set(args) = cli.command else {
            panic!("expected set subcommand");
        };
        assert_eq!(args.key, "title");
        assert_eq!(args.value, "Microservices");
        assert_eq!(args.server, "127.0.0.1:9000".parse().unwrap());
    }
}
