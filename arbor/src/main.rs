use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use arbor::{
    cli::{Cli, Command},
    client,
    server::{self, Server, ServerConfig},
    store::MessageStore,
    tree::MessageTree,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let tree = Arc::new(MessageTree::new(Arc::new(MessageStore::new())));
            let root_id = server::seed_root(&tree, &args.root_content, &args.system_author)?;

            let listener = TcpListener::bind(args.listen).await?;
            let server = Server::new(listener, ServerConfig::from(&args), tree, root_id);
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
