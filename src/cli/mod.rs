//! Command-line front end.
//!
//! Every subcommand opens the vault and the state file, does one thing and
//! exits. `watch` and `server` keep running until Ctrl-C.

pub mod interactive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::notice::{Notifier, TerminalNotifier};
use crate::process::{HexoCommand, OutputLine, Stream, Supervisor};
use crate::publish::Publisher;
use crate::state::{STATE_FILE_NAME, StateStore};
use crate::sync::{Reconciler, posts_by_status};
use crate::vault::{FsVault, Vault};

#[derive(Parser, Debug)]
#[command(
    name = "hexo-sync",
    version,
    about = "Publish markdown notes from a vault into a Hexo blog"
)]
pub struct Cli {
    /// Vault root directory
    #[arg(long, global = true, env = "HEXO_SYNC_VAULT", default_value = ".")]
    pub vault: PathBuf,

    /// State file [default: <vault>/.hexo-sync.json]
    #[arg(long, global = true, env = "HEXO_SYNC_STATE")]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish notes to the blog
    Publish {
        /// Vault-relative note paths
        #[arg(required_unless_present = "all")]
        notes: Vec<String>,

        /// Publish every draft and unsynced note
        #[arg(long, conflicts_with = "notes")]
        all: bool,
    },
    /// Show every hexo-format note grouped by sync status
    Status {
        /// Print JSON instead of the colored board
        #[arg(long)]
        json: bool,
    },
    /// Add missing title/date/permalink/tags/published keys
    Convert {
        #[arg(required = true)]
        notes: Vec<String>,
    },
    /// Create an empty post template
    New {
        /// Vault directory to create it in
        #[arg(default_value = "")]
        dir: String,
    },
    /// Rename a note and move its published post along
    Rename { from: String, to: String },
    /// Delete images no published post references
    Cleanup {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Demote notes whose published post file is missing
    Scan,
    /// Watch the posts directory and demote notes as posts disappear
    Watch,
    /// Run `hexo generate`
    Generate,
    /// Run `hexo server` until Ctrl-C
    Server {
        /// Port [default: serverPort setting]
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Run `hexo deploy`
    Deploy,
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the settings as JSON
    Show,
    /// Set one camelCase setting, e.g. `slugStyle pinyin`
    Set { key: String, value: String },
}

/// Opened vault, state and notifier shared by every command.
struct Session {
    vault: Arc<FsVault>,
    state: StateStore,
    notifier: Arc<dyn Notifier>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        if !cli.vault.is_dir() {
            bail!("Vault directory {} does not exist", cli.vault.display());
        }
        let state_path = cli
            .state
            .clone()
            .unwrap_or_else(|| cli.vault.join(STATE_FILE_NAME));
        let state = StateStore::open(&state_path)
            .with_context(|| format!("Failed to load state from {}", state_path.display()))?;
        Ok(Self {
            vault: Arc::new(FsVault::new(&cli.vault)),
            state,
            notifier: Arc::new(TerminalNotifier),
        })
    }

    fn publisher(&self) -> Publisher {
        Publisher::new(self.vault.clone(), self.state.clone())
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.vault.clone(), self.state.clone(), self.notifier.clone())
    }

    fn supervisor(&self) -> Result<Supervisor> {
        Supervisor::from_settings(&self.state.settings(), self.notifier.clone())
            .context("Cannot run hexo")
    }

    /// Vault-relative path for a note given on the command line.
    fn note_path(&self, raw: &str) -> Result<String> {
        let path = Path::new(raw);
        let note = if path.is_absolute() {
            self.vault
                .relative_path(path)
                .with_context(|| format!("{raw} is outside the vault"))?
        } else {
            raw.replace('\\', "/").trim_start_matches("./").to_string()
        };
        if !self.vault.exists(&note) {
            bail!("Note {note} not found in vault");
        }
        Ok(note)
    }

    /// Catch up with posts deleted while nothing was watching.
    async fn quiet_scan(&self) {
        if let Err(e) = self.reconciler().full_scan().await {
            tracing::debug!(error = %e, "startup scan skipped");
        }
    }
}

/// Parse arguments and run.
pub async fn run() -> Result<()> {
    execute(Cli::parse()).await
}

/// Run an already parsed command line.
pub async fn execute(cli: Cli) -> Result<()> {
    let session = Session::open(&cli)?;
    tracing::debug!(vault = %cli.vault.display(), command = ?cli.command, "starting");

    match cli.command {
        Commands::Publish { notes, all } => publish(&session, notes, all).await,
        Commands::Status { json } => {
            session.quiet_scan().await;
            let board = posts_by_status(session.vault.as_ref(), &session.state).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                println!("{}", interactive::render_board(&board));
            }
            Ok(())
        }
        Commands::Convert { notes } => {
            let publisher = session.publisher();
            for raw in notes {
                let note = session.note_path(&raw)?;
                publisher
                    .convert(&note)
                    .await
                    .with_context(|| format!("Failed to convert {note}"))?;
                session.notifier.success(&format!("Converted {note}"));
            }
            Ok(())
        }
        Commands::New { dir } => {
            let path = session
                .publisher()
                .create_post(&dir)
                .await
                .context("Failed to create post")?;
            session.notifier.success(&format!("Created {path}"));
            println!("{}", session.vault.abs_path(&path).display());
            Ok(())
        }
        Commands::Rename { from, to } => rename(&session, &from, &to).await,
        Commands::Cleanup { yes } => cleanup(&session, yes).await,
        Commands::Scan => {
            let report = session.reconciler().full_scan().await?;
            if report.is_empty() {
                session.notifier.success("All published posts are present");
            }
            Ok(())
        }
        Commands::Watch => {
            let reconciler = session.reconciler();
            reconciler.full_scan().await?;
            let report = reconciler
                .watch(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for Ctrl-C");
                    }
                })
                .await?;
            tracing::info!(demoted = report.demoted.len(), "watch stopped");
            Ok(())
        }
        Commands::Generate => run_hexo(&session, HexoCommand::Generate).await,
        Commands::Server { port } => {
            let port = port.unwrap_or(session.state.settings().server_port);
            run_hexo(&session, HexoCommand::Server { port }).await
        }
        Commands::Deploy => run_hexo(&session, HexoCommand::Deploy).await,
        Commands::Config { action } => config(&session, action),
    }
}

async fn publish(session: &Session, notes: Vec<String>, all: bool) -> Result<()> {
    session.quiet_scan().await;
    let publisher = session.publisher();
    let notifier = session.notifier.clone();
    let announce = move |outcome: &crate::publish::PublishOutcome| {
        notifier.success(&format!(
            "Published {} -> {}",
            outcome.note_path, outcome.file_name
        ));
    };

    if all {
        let report = publisher
            .publish_pending(&announce)
            .await
            .context("Bulk publish failed")?;
        for (note, e) in &report.failed {
            session.notifier.error(&format!("{note}: {e}"));
        }
        if report.published.is_empty() && report.failed.is_empty() {
            session.notifier.info("Nothing to publish");
        }
        if !report.all_succeeded() {
            bail!(
                "{} of {} notes failed to publish",
                report.failed.len(),
                report.published.len() + report.failed.len()
            );
        }
        return Ok(());
    }

    for raw in notes {
        let note = session.note_path(&raw)?;
        publisher
            .publish(&note, &announce)
            .await
            .with_context(|| format!("Failed to publish {note}"))?;
    }
    Ok(())
}

async fn rename(session: &Session, from: &str, to: &str) -> Result<()> {
    let from = session.note_path(from)?;
    let to = to.replace('\\', "/").trim_start_matches("./").to_string();
    if session.vault.exists(&to) {
        bail!("Note {to} already exists");
    }
    let publisher = session.publisher();
    if publisher.is_tracked(&from) {
        publisher
            .posts_dir()
            .with_context(|| format!("Cannot move the published post of {from}"))?;
    }
    session
        .vault
        .rename(&from, &to)
        .await
        .with_context(|| format!("Failed to rename {from}"))?;
    match publisher.sync_rename(&from, &to).await? {
        Some(outcome) if outcome.moved => session.notifier.success(&format!(
            "Renamed post {} -> {}",
            outcome.from_file, outcome.to_file
        )),
        _ => session.notifier.success(&format!("Renamed {from} -> {to}")),
    }
    Ok(())
}

async fn cleanup(session: &Session, yes: bool) -> Result<()> {
    let publisher = session.publisher();
    let unused = publisher
        .find_all_unused()
        .await
        .context("Failed to scan asset folders")?;
    if unused.is_empty() {
        session.notifier.success("No unused images");
        return Ok(());
    }

    println!("{}", interactive::render_unused(&unused));
    println!();
    let prompt = format!("Delete {} unused images?", unused.len());
    if !yes && !interactive::confirm_action(&prompt, false)? {
        session.notifier.info("Nothing deleted");
        return Ok(());
    }
    let removed = publisher.delete_unused(&unused).await?;
    session
        .notifier
        .success(&format!("Deleted {removed} unused images"));
    Ok(())
}

fn print_output(line: OutputLine) {
    match line.stream {
        Stream::Stdout => println!("{}", line.line),
        Stream::Stderr => eprintln!("{}", line.line.dimmed()),
    }
}

/// Run a hexo command, forwarding Ctrl-C to it.
async fn run_hexo(session: &Session, command: HexoCommand) -> Result<()> {
    let supervisor = session.supervisor()?;
    session.notifier.info(&format!("Running hexo {command}..."));
    let running = supervisor.spawn(command)?;

    let abort = running.abort_handle();
    let stopper = supervisor.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let result = if command.is_server() {
            stopper.stop_server()
        } else {
            abort.abort()
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to stop hexo");
        }
    });

    let report = running.wait(print_output).await;
    interrupt.abort();
    let report = report?;
    if !report.success && !report.aborted {
        bail!("hexo {command} exited with {:?}", report.code);
    }
    Ok(())
}

fn config(session: &Session, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!(
                "{}",
                serde_json::to_string_pretty(&session.state.settings())?
            );
        }
        ConfigAction::Set { key, value } => {
            session
                .state
                .commit(|s| s.set_setting(&key, &value))?
                .with_context(|| format!("Cannot set {key}"))?;
            session.notifier.success(&format!("Set {key}"));
        }
    }
    Ok(())
}
