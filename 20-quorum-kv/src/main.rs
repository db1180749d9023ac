use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use quorum_kv::{
    cli::{Cli, Command},
    client, runtime,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let node = runtime::spawn_node(args.into_config()).await?;
            info!(
                client_addr = %node.client_addr(),
                peer_addr = %node.peer_addr(),
                "node listening; press ctrl-c to stop"
            );
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            node.shutdown().await?;
        }
        Command::Set(args) => {
            println!("{}", client::set_kv(args.server, &args.key, &args.value).await?);
        }
        Command::Get(args) => {
            println!("{}", client::get_value(args.server, &args.key).await?);
        }
    }

    Ok(())
}
