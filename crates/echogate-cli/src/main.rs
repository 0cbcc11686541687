//! CLI entry point: loads configuration, builds the shared collaborators
//! (VAD pool, balance ledger, transcriber), spawns the reaper for both
//! session stores, and starts the axum gateway.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use echogate_core::balance::InMemoryBalanceLedger;
use echogate_core::config::Config;
use echogate_gateway::reaper;
use echogate_gateway::server::start_gateway;
use echogate_gateway::state::AppState;
use echogate_media::stt::HttpTranscriber;
use echogate_media::vad_pool::{VadPool, DEFAULT_POOL_SIZE};

#[derive(Parser)]
#[command(name = "echogate", about = "Multi-tenant realtime voice dialogue gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a json5 config file. Every section is optional; an absent
    /// file falls back to built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Lower the default log filter to `debug`.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (streaming + push-to-talk pipelines, reaper).
    Serve,

    /// Print the resolved configuration as JSON and exit.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load_or_default(cli.config.as_deref()).await?;

    match cli.command {
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let vad_pool = Arc::new(VadPool::new(DEFAULT_POOL_SIZE));
    vad_pool.initialize().await;

    let balance_ledger = Arc::new(InMemoryBalanceLedger::new());
    let transcriber = Arc::new(HttpTranscriber::new(config.transcription()));

    let state = Arc::new(AppState::new(config.clone(), vad_pool, balance_ledger, transcriber));

    let reaper_config = config.reaper();
    let _streaming_reaper = reaper::spawn(state.sessions_streaming.clone(), reaper_config.interval(), reaper_config.stale_timeout());
    let _push_to_talk_reaper = reaper::spawn(state.sessions_push_to_talk.clone(), reaper_config.interval(), reaper_config.stale_timeout());

    start_gateway(state).await
}
