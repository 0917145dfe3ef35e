//! Thin CLI front-end for `dispatch-core`. Loads configuration, assembles a
//! [`Core`], and either answers a single query or runs the background
//! pipeline until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_core::Core;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dispatch-cli")]
#[command(about = "Hierarchical multi-agent dispatcher core")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a single query through the dispatcher and print the response.
    Query {
        /// The user on whose behalf this query is asked.
        #[arg(long)]
        user_id: String,
        /// The natural-language query text.
        message: String,
    },
    /// Start the background pipeline and task engine and run until Ctrl+C.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let core = Core::bootstrap().context("failed to assemble dispatch core")?;
    core.start();

    match args.command {
        Command::Query { user_id, message } => {
            let response = core.handle_query(&user_id, &message, serde_json::Value::Null).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Serve => {
            info!("dispatch-cli serving; press Ctrl+C to stop");
            run_until_shutdown(&core).await;
        }
    }

    core.stop();
    Ok(())
}

async fn run_until_shutdown(_core: &Arc<Core>) {
    tokio::signal::ctrl_c().await.ok();
    info!("received Ctrl+C, shutting down");
}
