use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley::agent::BackendRouter;
use parley::daemon::build_playback;
use parley::db::{self, TurnRepo};
use parley::voice::{EngineKind, NoopObserver};
use parley::{Config, Daemon};

/// Parley - talk to a language model by voice
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice loop (default)
    Run,
    /// Probe the configured backends and show the routing
    Probe,
    /// Send one typed turn and print the reply
    Ask {
        /// What to say to the model
        text: String,
    },
    /// Speak text through a synthesis engine
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the speech output.")]
        text: String,
        /// Engine to use instead of the configured one
        #[arg(short, long)]
        engine: Option<EngineKind>,
    },
    /// List the voices an engine offers
    Voices {
        /// Engine to query instead of the configured one
        #[arg(short, long)]
        engine: Option<EngineKind>,
    },
    /// Show recently logged turns
    History {
        /// Number of turns to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let daemon = Daemon::new(config)?;
            daemon.run().await?;
        }
        Command::Probe => probe(&config).await?,
        Command::Ask { text } => ask(&config, &text).await?,
        Command::Say { text, engine } => say(&config, &text, engine).await?,
        Command::Voices { engine } => voices(&config, engine).await?,
        Command::History { limit } => history(&config, limit)?,
    }

    Ok(())
}

async fn probe(config: &Config) -> anyhow::Result<()> {
    let mut router = BackendRouter::from_config(config)?;
    let result = router.probe_backends().await;

    for kind in parley::config::DEFAULT_PRIORITY {
        let url = config.backends.url_for(kind).unwrap_or("(disabled)");
        let status = if router.reachable().contains(&kind) {
            "up"
        } else {
            "down"
        };
        println!("{kind:<9} {status:<5} {url}");
    }
    println!("---");

    match result {
        Ok(routing) => {
            println!("Routing: {routing}");
            println!("Context window: {} tokens", router.usage().window_size);
        }
        Err(e) => println!("No route: {e}"),
    }
    Ok(())
}

async fn ask(config: &Config, text: &str) -> anyhow::Result<()> {
    let mut router = BackendRouter::from_config(config)?;
    let reply = router.send(text).await?;
    if let Some(selection) = router.selection() {
        tracing::info!(routing = %selection.describe(), "answered");
    }
    println!("{reply}");
    Ok(())
}

async fn say(config: &Config, text: &str, engine: Option<EngineKind>) -> anyhow::Result<()> {
    let playback = build_playback(config, Arc::new(NoopObserver))?;
    if let Some(engine) = engine {
        playback.set_engine(engine);
    }
    println!("Speaking with the {} engine...", playback.engine());
    playback.speak(text).await?;
    Ok(())
}

async fn voices(config: &Config, engine: Option<EngineKind>) -> anyhow::Result<()> {
    let playback = build_playback(config, Arc::new(NoopObserver))?;
    let engine = engine.unwrap_or_else(|| playback.engine());
    let available = playback.available_engines();
    println!(
        "Engines: {}",
        available
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    for voice in playback.list_voices(engine).await? {
        println!("{voice}");
    }
    Ok(())
}

fn history(config: &Config, limit: usize) -> anyhow::Result<()> {
    let repo = TurnRepo::new(db::init(config.db_path())?);
    for turn in repo.recent(limit)?.into_iter().rev() {
        let via = if turn.routed { " (routed)" } else { "" };
        println!(
            "[{}] {}{via}",
            turn.created_at.format("%Y-%m-%d %H:%M"),
            turn.backend
        );
        println!("  you: {}", turn.user_text);
        println!("  parley: {}", turn.reply_text);
    }
    Ok(())
}
