use std::path::PathBuf;

use clap::{Parser, Subcommand};

use maestro::config::EngineConfig;
use maestro::store::{FileStore, StateStore};
use maestro::workflow::{GateKind, SessionId, SessionSummary, StatusView, WorkflowStatus};
use maestro::{Error, Result};

/// maestro - inspect and manage persisted workflow sessions
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)\n    MAESTRO_LOG=<filter> Explicit tracing filter (e.g. maestro=trace)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Directory holding session snapshots (overrides the config file)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List stored sessions, oldest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the status of one session
    Status {
        /// Session id (full UUID or unique prefix)
        session: String,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Delete a stored session
    Delete {
        /// Session id (full UUID or unique prefix)
        session: String,
    },

    /// Print the effective engine configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = maestro::log::init(cli.debug) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let mut config = EngineConfig::load()?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.to_string_lossy().into_owned());
    }
    tracing::debug!(command = ?cli.command, "maestro cli starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

async fn run(command: Command, config: EngineConfig) -> Result<()> {
    let store = FileStore::from_config(&config)?;

    match command {
        Command::List { json } => run_list(&store, json).await,
        Command::Status { session, json } => run_status(&store, &session, json).await,
        Command::Delete { session } => run_delete(&store, &session).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_list(store: &FileStore, json: bool) -> Result<()> {
    let summaries: Vec<SessionSummary> = store
        .load_all()
        .await?
        .iter()
        .map(|s| SessionSummary::from_snapshot(s, false))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No sessions in {}", store.dir().display());
        return Ok(());
    }

    println!(
        "{:<10} {:<30} {:<12} {:<10} {}",
        "ID", "CASE", "STATUS", "PHASE", "UPDATED"
    );
    for s in &summaries {
        let status = if s.awaiting_approval {
            format!("{}*", s.status)
        } else {
            s.status.to_string()
        };
        println!(
            "{:<10} {:<30} {:<12} {:<10} {}",
            s.session_id.short(),
            truncate_string(&s.case_name, 30),
            status,
            s.current_phase,
            s.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if summaries.iter().any(|s| s.awaiting_approval) {
        println!();
        println!("* awaiting approval");
    }
    Ok(())
}

async fn run_status(store: &FileStore, session: &str, json: bool) -> Result<()> {
    let id = resolve_session(store, session).await?;
    let snapshot = store
        .load(id)
        .await?
        .ok_or(Error::WorkflowNotFound(id))?;
    let view = StatusView::from_snapshot(&snapshot, false);

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("  ID:        {}", view.session_id);
    println!("  Case:      {}", view.case_name);
    println!("  Status:    {}", format_status(view.status));
    println!("  Phase:     {}", view.current_phase);
    println!(
        "  Tasks:     {} total, {} completed, {} pending, {} running, {} failed",
        view.tasks.total(),
        view.tasks.completed,
        view.tasks.pending,
        view.tasks.in_progress,
        view.tasks.failed
    );
    println!("  Progress:  {:.0}%", view.progress * 100.0);
    println!(
        "  Created:   {}",
        view.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Updated:   {}",
        view.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(gate) = &view.pending_approval {
        let reason = match &gate.kind {
            GateKind::PhaseReview => "phase review".to_string(),
            GateKind::TaskFailure { task_ids } => format!("{} failed task(s)", task_ids.len()),
        };
        println!("  Approval:  {} ({})", gate.phase, reason);
    }
    if let Some(error) = &view.error {
        println!("  Error:     {}", error);
    }

    if !view.failed_tasks.is_empty() {
        println!();
        println!("Failed tasks:");
        for task in &view.failed_tasks {
            println!(
                "  {} [{}] {} - {}",
                task.task_id.short(),
                task.phase,
                truncate_string(&task.description, 40),
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

async fn run_delete(store: &FileStore, session: &str) -> Result<()> {
    let id = resolve_session(store, session).await?;
    if store.delete(id).await? {
        tracing::info!(session_id = %id, "session deleted");
        println!("Deleted session {}", id.short());
        Ok(())
    } else {
        Err(Error::WorkflowNotFound(id))
    }
}

/// Accept a full session id or a unique prefix of one.
async fn resolve_session(store: &FileStore, input: &str) -> Result<SessionId> {
    if let Ok(id) = input.parse::<SessionId>() {
        return Ok(id);
    }

    let matches: Vec<SessionId> = store
        .list()
        .await?
        .into_iter()
        .filter(|id| id.to_string().starts_with(input))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::Validation(format!("no session matches '{}'", input))),
        _ => Err(Error::Validation(format!(
            "'{}' matches {} sessions, use a longer prefix",
            input,
            matches.len()
        ))),
    }
}

fn format_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        WorkflowStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        WorkflowStatus::InProgress => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        WorkflowStatus::Paused => format!("\x1b[34m{}\x1b[0m", status),    // Blue
        WorkflowStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),   // Gray
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
