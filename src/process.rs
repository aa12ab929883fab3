//! Supervision of the Hexo CLI.
//!
//! Commands run in the blog root with stdout and stderr streamed line by
//! line. At most one `server` runs at a time; its slot moves through
//! [`ServerState`] and is released when the process exits, even if the
//! caller never waits on it.
//!
//! Children are started in their own process group on Unix so that stopping
//! one interrupts everything it spawned (`hexo server` forks node workers).
//! On Windows the whole tree is killed with `taskkill /T /F`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::notice::Notifier;
use crate::state::Settings;

/// Printed by `hexo server` once it accepts connections.
pub const SERVER_READY_MARKER: &str = "Hexo is running at";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Hexo root directory not configured")]
    HexoRootNotConfigured,

    #[error("Invalid hexo command {0:?}")]
    InvalidCommand(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hexo server is already running")]
    ServerAlreadyRunning,

    #[error("Hexo server is not running")]
    ServerNotRunning,

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generator subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexoCommand {
    Generate,
    Server { port: u16 },
    Deploy,
}

impl HexoCommand {
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Generate => vec!["generate".into()],
            Self::Server { port } => vec!["server".into(), "-p".into(), port.to_string()],
            Self::Deploy => vec!["deploy".into()],
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server { .. })
    }
}

impl std::fmt::Display for HexoCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Server { port } => write!(f, "server (port {port})"),
            Self::Deploy => write!(f, "deploy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of child output, without its newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub command: HexoCommand,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// Whether an abort or stop was requested while it ran.
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Interrupts one spawned command and its descendants.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    pid: Option<u32>,
    aborted: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl AbortHandle {
    /// No-op once the child has been reaped, so a recycled pid is never signalled.
    pub fn abort(&self) -> Result<(), ProcessError> {
        if self.is_finished() {
            tracing::debug!(pid = ?self.pid, "process already exited, nothing to abort");
            return Ok(());
        }
        self.aborted.store(true, Ordering::SeqCst);
        match self.pid {
            Some(pid) => {
                tracing::info!(pid, "interrupting process tree");
                interrupt_tree(pid)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn interrupt_tree(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::other(format!("pid {pid} out of range")))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
fn interrupt_tree(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[derive(Debug)]
struct ServerSlot {
    state: ServerState,
    abort: Option<AbortHandle>,
}

/// Returns the server slot to `Stopped` when dropped.
#[derive(Debug)]
struct SlotGuard {
    slot: Arc<Mutex<ServerSlot>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.state = ServerState::Stopped;
        slot.abort = None;
    }
}

/// A spawned command whose output has not been consumed yet.
pub struct RunningCommand {
    command: HexoCommand,
    child: Child,
    abort: AbortHandle,
    guard: Option<SlotGuard>,
    notifier: Arc<dyn Notifier>,
}

impl Drop for RunningCommand {
    // The child is killed on drop and reaped in the background.
    fn drop(&mut self) {
        self.abort.mark_finished();
    }
}

impl RunningCommand {
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn command(&self) -> HexoCommand {
        self.command
    }

    /// Stream output to `on_output` until the process exits.
    pub async fn wait<F>(mut self, mut on_output: F) -> Result<ExitReport, ProcessError>
    where
        F: FnMut(OutputLine) + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = self.child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = self.child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            if line.stream == Stream::Stdout && line.line.contains(SERVER_READY_MARKER) {
                self.mark_server_ready(&line.line);
            }
            on_output(line);
        }

        let status = self.child.wait().await;
        self.abort.mark_finished();
        let status = status?;
        let report = ExitReport {
            command: self.command,
            code: status.code(),
            success: status.success(),
            aborted: self.abort.is_aborted(),
        };
        drop(self.guard.take());

        tracing::info!(
            command = %report.command,
            code = ?report.code,
            success = report.success,
            aborted = report.aborted,
            "hexo command finished"
        );
        if report.aborted {
            self.notifier.info(&format!("Hexo {} stopped", report.command));
        } else if report.success {
            self.notifier.success(&format!("Hexo {} finished", report.command));
        } else {
            self.notifier.error(&format!(
                "Hexo {} failed (exit code {})",
                report.command,
                report
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".into())
            ));
        }
        Ok(report)
    }

    fn mark_server_ready(&self, line: &str) {
        let Some(guard) = &self.guard else {
            return;
        };
        let mut slot = guard.slot.lock();
        if slot.state == ServerState::Starting {
            slot.state = ServerState::Running;
            drop(slot);
            tracing::info!(line, "hexo server ready");
            self.notifier.success(line.trim());
        }
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(OutputLine { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(?stream, error = %e, "failed to read process output");
                break;
            }
        }
    }
}

/// Runs generator commands for one blog.
#[derive(Clone)]
pub struct Supervisor {
    cwd: PathBuf,
    program: Vec<String>,
    slot: Arc<Mutex<ServerSlot>>,
    notifier: Arc<dyn Notifier>,
}

impl Supervisor {
    /// `program` is the generator invocation, e.g. `["npx", "hexo"]`.
    pub fn new(
        cwd: impl Into<PathBuf>,
        program: Vec<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ProcessError> {
        if program.is_empty() {
            return Err(ProcessError::InvalidCommand(String::new()));
        }
        Ok(Self {
            cwd: cwd.into(),
            program,
            slot: Arc::new(Mutex::new(ServerSlot {
                state: ServerState::Stopped,
                abort: None,
            })),
            notifier,
        })
    }

    /// Supervisor for the configured blog root and `hexoCommand`.
    pub fn from_settings(settings: &Settings, notifier: Arc<dyn Notifier>) -> Result<Self, ProcessError> {
        let root = settings
            .hexo_root()
            .ok_or(ProcessError::HexoRootNotConfigured)?;
        let program = shell_words::split(&settings.hexo_command)
            .map_err(|_| ProcessError::InvalidCommand(settings.hexo_command.clone()))?;
        if program.is_empty() {
            return Err(ProcessError::InvalidCommand(settings.hexo_command.clone()));
        }
        Self::new(root, program, notifier)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn server_state(&self) -> ServerState {
        self.slot.lock().state
    }

    /// Start `command`. Starting a server claims the server slot.
    pub fn spawn(&self, command: HexoCommand) -> Result<RunningCommand, ProcessError> {
        let guard = if command.is_server() {
            let mut slot = self.slot.lock();
            if slot.state != ServerState::Stopped {
                return Err(ProcessError::ServerAlreadyRunning);
            }
            slot.state = ServerState::Starting;
            Some(SlotGuard {
                slot: self.slot.clone(),
            })
        } else {
            None
        };

        let mut cmd = Command::new(&self.program[0]);
        cmd.args(&self.program[1..])
            .args(command.args())
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.join(" "),
            source,
        })?;
        let abort = AbortHandle {
            pid: child.id(),
            aborted: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        };
        tracing::info!(
            command = %command,
            pid = ?abort.pid,
            cwd = %self.cwd.display(),
            "spawned hexo"
        );

        if let Some(guard) = &guard {
            let mut slot = guard.slot.lock();
            slot.abort = Some(abort.clone());
            // Stop was requested before the pid was known.
            if slot.state == ServerState::Stopping {
                drop(slot);
                abort.abort()?;
            }
        }

        Ok(RunningCommand {
            command,
            child,
            abort,
            guard,
            notifier: self.notifier.clone(),
        })
    }

    /// Run `command` to completion, streaming its output.
    pub async fn run<F>(&self, command: HexoCommand, on_output: F) -> Result<ExitReport, ProcessError>
    where
        F: FnMut(OutputLine) + Send,
    {
        self.notifier.info(&format!("Running hexo {command}..."));
        self.spawn(command)?.wait(on_output).await
    }

    /// Interrupt the running server.
    pub fn stop_server(&self) -> Result<(), ProcessError> {
        let abort = {
            let mut slot = self.slot.lock();
            match slot.state {
                ServerState::Starting | ServerState::Running => {
                    slot.state = ServerState::Stopping;
                    slot.abort.clone()
                }
                ServerState::Stopped | ServerState::Stopping => {
                    return Err(ProcessError::ServerNotRunning);
                }
            }
        };
        match abort {
            Some(abort) => abort.abort(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::MemoryNotifier;
    use std::time::Duration;

    #[test]
    fn test_command_args() {
        assert_eq!(HexoCommand::Generate.args(), vec!["generate"]);
        assert_eq!(
            HexoCommand::Server { port: 4001 }.args(),
            vec!["server", "-p", "4001"]
        );
        assert_eq!(HexoCommand::Deploy.args(), vec!["deploy"]);
        assert!(HexoCommand::Server { port: 1 }.is_server());
    }

    #[test]
    fn test_from_settings_splits_command() {
        let notifier = Arc::new(MemoryNotifier::new());
        let mut settings = Settings::default();
        assert!(matches!(
            Supervisor::from_settings(&settings, notifier.clone()),
            Err(ProcessError::HexoRootNotConfigured)
        ));

        settings.hexo_root = "/blog".into();
        settings.hexo_command = "npx 'hexo'".into();
        let sup = Supervisor::from_settings(&settings, notifier.clone()).unwrap();
        assert_eq!(sup.program, vec!["npx", "hexo"]);
        assert_eq!(sup.cwd(), Path::new("/blog"));

        settings.hexo_command = "npx 'unterminated".into();
        assert!(matches!(
            Supervisor::from_settings(&settings, notifier),
            Err(ProcessError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_stop_without_server_is_refused() {
        let sup = Supervisor::new(".", vec!["true".into()], Arc::new(MemoryNotifier::new())).unwrap();
        assert_eq!(sup.server_state(), ServerState::Stopped);
        assert!(matches!(sup.stop_server(), Err(ProcessError::ServerNotRunning)));
    }

    #[cfg(unix)]
    fn shell(script: &str) -> (Supervisor, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let program = vec!["sh".into(), "-c".into(), script.into(), "sh".into()];
        let sup = Supervisor::new(std::env::temp_dir(), program, notifier.clone()).unwrap();
        (sup, notifier)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streams_both_outputs() {
        let (sup, notifier) = shell("echo \"cmd=$1\"; echo oops >&2; exit 3");
        let mut lines = Vec::new();
        let report = sup
            .run(HexoCommand::Generate, |line| lines.push(line))
            .await
            .unwrap();

        assert_eq!(report.code, Some(3));
        assert!(!report.success);
        assert!(!report.aborted);
        assert!(lines.contains(&OutputLine {
            stream: Stream::Stdout,
            line: "cmd=generate".into()
        }));
        assert!(lines.contains(&OutputLine {
            stream: Stream::Stderr,
            line: "oops".into()
        }));
        assert!(notifier.messages().iter().any(|m| m.contains("failed")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = Supervisor::new(
            std::env::temp_dir(),
            vec!["definitely-not-a-real-binary-xyz".into()],
            Arc::new(MemoryNotifier::new()),
        )
        .unwrap();
        assert!(matches!(
            sup.spawn(HexoCommand::Server { port: 1 }),
            Err(ProcessError::Spawn { .. })
        ));
        assert_eq!(sup.server_state(), ServerState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_lifecycle() {
        let (sup, notifier) = shell("echo \"Hexo is running at http://localhost:$3/\"; exec sleep 30");

        let running = sup.spawn(HexoCommand::Server { port: 4321 }).unwrap();
        assert_eq!(sup.server_state(), ServerState::Starting);
        assert!(matches!(
            sup.spawn(HexoCommand::Server { port: 4321 }),
            Err(ProcessError::ServerAlreadyRunning)
        ));

        let waiter = tokio::spawn(running.wait(|_| {}));
        for _ in 0..100 {
            if sup.server_state() == ServerState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sup.server_state(), ServerState::Running);

        sup.stop_server().unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.aborted);
        assert!(!report.success);
        assert_eq!(sup.server_state(), ServerState::Stopped);
        assert!(
            notifier
                .messages()
                .iter()
                .any(|m| m.contains("http://localhost:4321/"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_non_server_run() {
        let (sup, _) = shell("exec sleep 30");
        let running = sup.spawn(HexoCommand::Deploy).unwrap();
        let handle = running.abort_handle();
        let waiter = tokio::spawn(running.wait(|_| {}));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort().unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.aborted);
        assert_eq!(report.code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_after_exit_is_noop() {
        let (sup, _) = shell("exit 0");
        let running = sup.spawn(HexoCommand::Generate).unwrap();
        let handle = running.abort_handle();
        assert!(!handle.is_finished());

        let report = running.wait(|_| {}).await.unwrap();
        assert!(report.success);
        assert!(handle.is_finished());

        handle.abort().unwrap();
        assert!(!handle.is_aborted());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_command_is_finished() {
        let (sup, _) = shell("exec sleep 30");
        let running = sup.spawn(HexoCommand::Deploy).unwrap();
        let handle = running.abort_handle();
        drop(running);
        assert!(handle.is_finished());
        handle.abort().unwrap();
        assert!(!handle.is_aborted());
    }
}
