use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use relay_core::{Response, StreamHandler, StreamUpdate, UpdateKind, UserId};
use relay_orchestrator::{CommandOrchestrator, RelayOrchestrator};
use relay_settings::{load_settings, relay_home};
use relay_store::{Database, SqliteSessionStore};
use relay_telemetry::{init_telemetry, with_startup_logging, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Run the agent engine with session continuity and tool policy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a prompt, optionally resuming a session.
    Run {
        /// Project directory the engine works in.
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, value_name = "ID")]
        user: UserId,
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
        prompt: String,
    },
    /// Resume the most recent session in a directory.
    Continue {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, value_name = "ID")]
        user: UserId,
        prompt: Option<String>,
    },
    /// List a user's sessions as JSON.
    Sessions {
        #[arg(long, value_name = "ID")]
        user: UserId,
    },
    /// Remove expired sessions.
    Cleanup,
}

/// Echoes streamed updates to stdout as they arrive.
struct PrintUpdates;

#[async_trait]
impl StreamHandler for PrintUpdates {
    async fn on_update(&self, update: &StreamUpdate) -> anyhow::Result<()> {
        for call in &update.tool_calls {
            println!("[tool] {} {}", call.name, call.input);
        }
        match (update.kind, &update.content) {
            (UpdateKind::Assistant, Some(text)) => println!("{text}"),
            (UpdateKind::ToolResult, Some(text)) => println!("[result] {text}"),
            _ => {}
        }
        Ok(())
    }
}

fn print_response(response: &Response) {
    println!();
    if response.is_error {
        println!("{}", response.content);
    }
    println!(
        "session: {}  cost: ${:.4}  turns: {}  duration: {}ms",
        response.session_id.as_deref().unwrap_or("-"),
        response.cost,
        response.num_turns,
        response.duration_ms,
    );
}

fn canonical(dir: PathBuf) -> anyhow::Result<PathBuf> {
    dir.canonicalize()
        .with_context(|| format!("working directory {}", dir.display()))
}

/// Runs one subcommand. `None` when there is no engine response to report.
async fn dispatch(orchestrator: &RelayOrchestrator, command: Command) -> anyhow::Result<Option<Response>> {
    match command {
        Command::Run {
            dir,
            user,
            session,
            prompt,
        } => {
            let dir = canonical(dir)?;
            let response = orchestrator
                .run_command(&prompt, &dir, user, session.as_deref(), Some(Arc::new(PrintUpdates)))
                .await?;
            Ok(Some(response))
        }
        Command::Continue { dir, user, prompt } => {
            let dir = canonical(dir)?;
            let response = orchestrator
                .continue_session(user, &dir, prompt.as_deref(), Some(Arc::new(PrintUpdates)))
                .await?;
            if response.is_none() {
                println!("no session to continue in {}", dir.display());
            }
            Ok(response)
        }
        Command::Sessions { user } => {
            let sessions = orchestrator.user_sessions(user).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(None)
        }
        Command::Cleanup => {
            let purged = orchestrator.cleanup_expired_sessions().await?;
            println!("removed {purged} expired session(s)");
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = with_startup_logging(load_settings).context("loading settings")?;
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.log_level.clone(),
        log_to_sqlite: settings.persist_logs,
        log_db_path: relay_home().join("logs.db"),
    });
    settings.validate().context("invalid settings")?;

    let db = Database::open(&settings.database_path).context("opening session database")?;
    let store = Arc::new(SqliteSessionStore::new(db, settings.max_sessions_per_user));
    let orchestrator = RelayOrchestrator::from_settings(&settings, store);

    let outcome = dispatch(&orchestrator, cli.command).await;
    orchestrator.shutdown().await.context("shutting down")?;

    let Some(response) = outcome? else {
        return Ok(());
    };
    print_response(&response);
    if response.is_error {
        std::process::exit(1);
    }
    Ok(())
}
