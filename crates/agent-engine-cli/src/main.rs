//! Terminal client for a hosted agent engine.
//!
//! Run with: agent-engine <RESOURCE_ID>
//!
//! Connection parameters come from the environment (or a `.env` file):
//! `GOOGLE_CLOUD_PROJECT`, `GOOGLE_CLOUD_LOCATION`, `AGENT_ENGINE_BASE_URL`,
//! `AGENT_ENGINE_ACCESS_TOKEN`, `AGENT_ENGINE_TIMEOUT_SECS`, `USER_ID`.

mod interrupt;
mod repl;
mod terminal;

use std::{process::ExitCode, sync::Arc};

use agent_engine_core::{RemoteAgent, SessionFeed, UserId};
use agent_engine_remote::{AgentEngineClient, EngineConfig};
use agent_engine_session::{SessionController, storage::MemoryStore};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{interrupt::Interrupts, repl::Chat};

#[derive(Debug, Parser)]
#[command(name = "agent-engine", version, about = "Chat with a hosted agent engine")]
struct Args {
    /// Agent engine resource: projects/<p>/locations/<l>/reasoningEngines/<id>, or just <id>
    resource: String,

    /// Send a single message, print the reply and exit
    #[arg(short, long)]
    message: Option<String>,

    /// User identity for new sessions (defaults to $USER_ID, else generated)
    #[arg(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = EngineConfig::load(&args.resource)?;
    eprintln!("Connecting to agent engine: {}", config.resource_name);
    eprintln!("Project: {}, Location: {}", config.project, config.location);

    let client = AgentEngineClient::connect(config)
        .await
        .context("could not connect to the agent engine")?;

    let user_id = UserId::or_generate(
        args.user_id.or_else(|| std::env::var("USER_ID").ok()),
        "cli-user",
    );
    tracing::debug!(resource = %client.resource_name(), user = %user_id, "agent engine connected");
    eprintln!("Connected to {} as {user_id}", client.display_name());

    let feed = Arc::new(SessionFeed::new());
    let controller = SessionController::new(client, MemoryStore::new(), user_id, feed.clone());
    let chat = Chat::new(&controller, &feed, Interrupts::listen());

    match args.message {
        Some(message) => chat.one_shot(&message).await,
        None => chat.run().await,
    }
}
