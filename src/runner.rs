//! Process runner: spawns, supervises and terminates child processes.
//!
//! Each child gets one supervisor task that owns it for its whole life. The
//! supervisor waits for exit, the deadline or a control message, performs
//! graceful-then-forceful termination, drains output and publishes exactly one
//! terminal status. Status is carried on a `watch` channel so that every
//! observer agrees on it, whatever order cancels and exits arrive in.
//!
//! Two backends exist: pipes (stdout and stderr merged into one sequence) and
//! a pseudo-terminal for interactive shells.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::join_all;
use nix::sys::signal::Signal;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::command::{CommandSpec, ProcessKind, TerminalSize};
use crate::error::{GatewayError, Result};
use crate::ids::{ProcessId, SessionId};
use crate::jail::WorkspaceJail;
use crate::sandbox::{reap, signal_group, wait_exited};

const READ_CHUNK: usize = 8192;
const OUTPUT_BUFFER: usize = 256;
const INPUT_BUFFER: usize = 256;
/// How long to keep collecting output after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a process was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KillReason {
    /// Explicit `closeStream` or `cancel`.
    Cancelled,
    /// The owning session went away.
    Disconnected,
    /// The gateway is stopping.
    Shutdown,
}

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProcessStatus {
    Running,
    /// Exited on its own. Signal deaths are reported as `128 + signo`.
    Exited { code: i32 },
    Killed { reason: KillReason },
    TimedOut,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// One item of a process's output sequence. `Exited` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Bytes),
    Exited(ProcessStatus),
}

/// The merged, ordered output of one process.
#[derive(Debug)]
pub struct ProcessOutput {
    rx: mpsc::Receiver<ProcessEvent>,
    finished: bool,
}

impl ProcessOutput {
    /// Next chunk, or the terminal event. `None` once `Exited` was returned.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        if matches!(event, ProcessEvent::Exited(_)) {
            self.finished = true;
            self.rx.close();
        }
        Some(event)
    }

    /// Collects all output and the terminal status.
    pub async fn read_to_end(mut self) -> (Vec<u8>, Option<ProcessStatus>) {
        let mut data = Vec::new();
        let mut status = None;
        while let Some(event) = self.next().await {
            match event {
                ProcessEvent::Output(chunk) => data.extend_from_slice(&chunk),
                ProcessEvent::Exited(s) => status = Some(s),
            }
        }
        (data, status)
    }
}

#[derive(Debug)]
enum Control {
    Cancel(KillReason),
    Resize(TerminalSize),
}

/// Cheap, cloneable reference to a managed process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    kind: ProcessKind,
    session: SessionId,
    tty: bool,
    status: watch::Receiver<ProcessStatus>,
    control: mpsc::UnboundedSender<Control>,
    input: Option<mpsc::Sender<Bytes>>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_interactive(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_tty(&self) -> bool {
        self.tty
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Waits until the process reaches a terminal status.
    pub async fn wait(&self) -> ProcessStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }

    /// Requests termination. A no-op once the process has ended.
    pub fn cancel(&self, reason: KillReason) {
        if self.control.send(Control::Cancel(reason)).is_err() {
            debug!(process = %self.id, "Cancel for finished process ignored");
        }
    }

    /// Resizes the pseudo-terminal. A no-op for piped processes.
    pub fn resize(&self, size: TerminalSize) {
        let _ = self.control.send(Control::Resize(size));
    }

    /// Queues keystrokes for the child without waiting on it. Fails with
    /// [`InputRejected::Busy`] while the child is not reading its input.
    pub fn send_input(&self, data: Bytes) -> std::result::Result<(), InputRejected> {
        let Some(tx) = &self.input else {
            return Err(InputRejected::Closed);
        };
        tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => InputRejected::Busy,
            TrySendError::Closed(_) => InputRejected::Closed,
        })
    }
}

/// Why [`ProcessHandle::send_input`] refused a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejected {
    /// The input queue is full.
    Busy,
    /// The process takes no input or its input has closed.
    Closed,
}

/// A freshly spawned process: its handle plus its output sequence.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub output: ProcessOutput,
}

/// Snapshot of a live process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub session: SessionId,
    pub command: String,
    pub started_at: u64,
    pub status: ProcessStatus,
}

#[derive(Debug)]
struct LiveProcess {
    handle: ProcessHandle,
    command: String,
    started_at: u64,
}

type LiveSet = Arc<RwLock<HashMap<ProcessId, LiveProcess>>>;

/// Spawns and tracks every child process of the gateway.
#[derive(Clone)]
pub struct ProcessRunner {
    jail: Arc<WorkspaceJail>,
    live: LiveSet,
    max_per_session: usize,
    grace: Duration,
}

impl ProcessRunner {
    pub fn new(jail: Arc<WorkspaceJail>, max_per_session: usize, grace: Duration) -> Self {
        Self {
            jail,
            live: Arc::new(RwLock::new(HashMap::new())),
            max_per_session,
            grace,
        }
    }

    /// Starts `spec` on behalf of `session` and returns immediately.
    pub async fn spawn(&self, session: SessionId, spec: CommandSpec) -> Result<SpawnedProcess> {
        let cwd = self.jail.resolve(&spec.working_dir)?;
        match std::fs::metadata(&cwd) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(GatewayError::NotADirectory(spec.working_dir.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(spec.working_dir.clone()))
            }
            Err(e) => return Err(GatewayError::system("checking working directory", e)),
        }

        // The cap check and the insert happen under one write lock so that
        // concurrent spawns cannot overshoot.
        let mut live = self.live.write().await;
        let running = live.values().filter(|p| p.handle.session == session).count();
        if running >= self.max_per_session {
            return Err(GatewayError::ResourceLimitExceeded {
                session,
                limit: self.max_per_session,
            });
        }

        let id = ProcessId::new();
        let (events_tx, events_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);

        let started = if spec.tty.is_some() {
            spawn_pty(&spec, cwd, events_tx.clone())?
        } else {
            spawn_piped(&spec, cwd, events_tx.clone())?
        };

        let handle = ProcessHandle {
            id,
            kind: spec.kind,
            session,
            tty: spec.tty.is_some(),
            status: status_rx,
            control: control_tx,
            input: started.input,
        };
        let command = describe(&spec);
        info!(
            process = %id,
            session = %session,
            kind = %spec.kind,
            pid = started.pid,
            "Spawned {}",
            command
        );
        live.insert(
            id,
            LiveProcess {
                handle: handle.clone(),
                command,
                started_at: unix_now(),
            },
        );
        drop(live);

        let supervisor = Supervisor {
            id,
            kind: spec.kind,
            pid: started.pid,
            backend: started.backend,
            readers: started.readers,
            control: control_rx,
            events: events_tx,
            status: status_tx,
            live: self.live.clone(),
            deadline: spec.timeout.map(|t| Instant::now() + t),
            timeout: spec.timeout,
            grace: self.grace,
        };
        tokio::spawn(supervisor.run());

        Ok(SpawnedProcess {
            handle,
            output: ProcessOutput {
                rx: events_rx,
                finished: false,
            },
        })
    }

    /// Current status of a live process, `None` once it has been reaped.
    pub async fn status(&self, id: ProcessId) -> Option<ProcessStatus> {
        self.live.read().await.get(&id).map(|p| p.handle.status())
    }

    pub async fn is_live(&self, id: ProcessId) -> bool {
        self.live.read().await.contains_key(&id)
    }

    /// Number of live processes owned by `session`.
    pub async fn live_count(&self, session: SessionId) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|p| p.handle.session == session)
            .count()
    }

    pub async fn list(&self, session: Option<SessionId>) -> Vec<ProcessInfo> {
        let live = self.live.read().await;
        let mut infos: Vec<ProcessInfo> = live
            .iter()
            .filter(|(_, p)| session.map_or(true, |s| p.handle.session == s))
            .map(|(id, p)| ProcessInfo {
                id: *id,
                kind: p.handle.kind,
                session: p.handle.session,
                command: p.command.clone(),
                started_at: p.started_at,
                status: p.handle.status(),
            })
            .collect();
        infos.sort_by_key(|i| i.started_at);
        infos
    }

    /// Kills every live process and waits for all of them to be reaped.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = self
            .live
            .read()
            .await
            .values()
            .map(|p| p.handle.clone())
            .collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} live processes", handles.len());
        for handle in &handles {
            handle.cancel(KillReason::Shutdown);
        }
        join_all(handles.iter().map(|h| h.wait())).await;
    }
}

fn describe(spec: &CommandSpec) -> String {
    std::iter::once(spec.program.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn other_io(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Distinguishes "this program cannot be started" from "the host is out of
/// resources".
fn spawn_error(program: &str, e: io::Error) -> GatewayError {
    match e.raw_os_error() {
        Some(libc::EAGAIN | libc::EMFILE | libc::ENFILE | libc::ENOMEM) => {
            GatewayError::system(format!("spawning {program}"), e)
        }
        _ => GatewayError::SpawnFailed {
            program: program.to_string(),
            reason: e.to_string(),
        },
    }
}

struct Started {
    pid: u32,
    backend: Backend,
    readers: Vec<oneshot::Receiver<()>>,
    input: Option<mpsc::Sender<Bytes>>,
}

enum Backend {
    Piped {
        child: tokio::process::Child,
        exited: Option<oneshot::Receiver<io::Result<()>>>,
    },
    Pty {
        exit: oneshot::Receiver<io::Result<i32>>,
        master: Box<dyn MasterPty + Send>,
    },
}

impl Backend {
    /// Waits for the child, kills whatever is left in its process group and
    /// reaps it. Must not be called again after it returned.
    async fn wait(&mut self) -> io::Result<i32> {
        match self {
            Backend::Piped { child, exited } => {
                if let Some(rx) = exited {
                    let result = rx.await;
                    *exited = None;
                    if let (Ok(Ok(())), Some(pid)) = (result, child.id()) {
                        signal_group(pid, Signal::SIGKILL);
                    }
                }
                child.wait().await.map(|status| {
                    status
                        .code()
                        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
                })
            }
            Backend::Pty { exit, .. } => match exit.await {
                Ok(result) => result,
                Err(_) => Err(other_io("pty waiter exited without a status")),
            },
        }
    }

    fn resize(&self, size: TerminalSize) {
        if let Backend::Pty { master, .. } = self {
            if let Err(e) = master.resize(pty_size(size)) {
                warn!(error = %e, "Failed to resize terminal");
            }
        }
    }

    fn force_kill(&mut self) {
        if let Backend::Piped { child, .. } = self {
            let _ = child.start_kill();
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows.max(1),
        cols: size.cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_piped(
    spec: &CommandSpec,
    cwd: PathBuf,
    events: mpsc::Sender<ProcessEvent>,
) -> Result<Started> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&cwd)
        .envs(&spec.env)
        .stdin(if spec.interactive {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let limits = spec.limits;
    if !limits.is_unlimited() {
        // SAFETY: the closure only calls setrlimit(2), which is
        // async-signal-safe, and touches no shared state.
        unsafe {
            cmd.pre_exec(move || {
                limits.apply();
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| spawn_error(&spec.program, e))?;
    let pid = child
        .id()
        .ok_or_else(|| GatewayError::system("spawning child", other_io("child has no pid")))?;

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, events));
    }

    let input = child.stdin.take().map(|mut stdin| {
        let (tx, mut rx) = mpsc::channel::<Bytes>(INPUT_BUFFER);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });
        tx
    });

    Ok(Started {
        pid,
        backend: Backend::Piped {
            child,
            exited: Some(watch_exit(pid)),
        },
        readers,
        input,
    })
}

/// Resolves once the child has exited, before it is reaped.
fn watch_exit(pid: u32) -> oneshot::Receiver<io::Result<()>> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(wait_exited(pid));
    });
    rx
}

fn spawn_reader<R>(mut source: R, events: mpsc::Sender<ProcessEvent>) -> oneshot::Receiver<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(ProcessEvent::Output(chunk)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

fn spawn_pty(
    spec: &CommandSpec,
    cwd: PathBuf,
    events: mpsc::Sender<ProcessEvent>,
) -> Result<Started> {
    let size = spec.tty.unwrap_or_default();
    if !spec.limits.is_unlimited() {
        debug!("Resource limits are not applied to terminal processes");
    }

    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| GatewayError::system("opening pseudo-terminal", other_io(e)))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    cmd.cwd(&cwd);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| GatewayError::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;
    // Only the child may hold the slave side, or reads never see EOF.
    drop(pair.slave);

    let pid = child.process_id().ok_or_else(|| {
        GatewayError::system("spawning terminal process", other_io("child has no pid"))
    })?;

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| GatewayError::system("cloning terminal reader", other_io(e)))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| GatewayError::system("taking terminal writer", other_io(e)))?;

    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            // EIO after the child exits ends the loop like EOF.
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if events.blocking_send(ProcessEvent::Output(chunk)).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(());
    });

    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_BUFFER);
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let result = wait_exited(pid).and_then(|()| {
            signal_group(pid, Signal::SIGKILL);
            reap(pid)
        });
        drop(child);
        let _ = exit_tx.send(result);
    });

    Ok(Started {
        pid,
        backend: Backend::Pty {
            exit: exit_rx,
            master: pair.master,
        },
        readers: vec![done_rx],
        input: Some(input_tx),
    })
}

/// Owns one child from spawn to reap.
struct Supervisor {
    id: ProcessId,
    kind: ProcessKind,
    pid: u32,
    backend: Backend,
    readers: Vec<oneshot::Receiver<()>>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::Sender<ProcessEvent>,
    status: watch::Sender<ProcessStatus>,
    live: LiveSet,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    grace: Duration,
}

enum Outcome {
    Exited(io::Result<i32>),
    Stop(ProcessStatus),
}

impl Supervisor {
    async fn run(mut self) {
        let mut control_open = true;
        let outcome = loop {
            tokio::select! {
                result = self.backend.wait() => break Outcome::Exited(result),
                _ = deadline_elapsed(self.deadline) => break Outcome::Stop(ProcessStatus::TimedOut),
                msg = self.control.recv(), if control_open => match msg {
                    Some(Control::Cancel(reason)) => {
                        break Outcome::Stop(ProcessStatus::Killed { reason })
                    }
                    Some(Control::Resize(size)) => self.backend.resize(size),
                    None => control_open = false,
                },
            }
        };

        let status = match outcome {
            Outcome::Exited(Ok(code)) => ProcessStatus::Exited { code },
            Outcome::Exited(Err(e)) => {
                error!(process = %self.id, error = %e, "Failed to wait for child");
                ProcessStatus::Exited { code: -1 }
            }
            Outcome::Stop(status) => {
                match status {
                    ProcessStatus::TimedOut => {
                        info!(process = %self.id, "Deadline reached, terminating")
                    }
                    _ => debug!(process = %self.id, ?status, "Terminating"),
                }
                if let Err(e) = self.terminate().await {
                    error!(process = %self.id, error = %e, "Failed to reap child");
                }
                status
            }
        };

        self.finish(status).await;
    }

    /// Polite signal, grace period, then SIGKILL.
    async fn terminate(&mut self) -> io::Result<i32> {
        let polite = match self.kind {
            ProcessKind::Shell => Signal::SIGHUP,
            ProcessKind::Install | ProcessKind::Exec => Signal::SIGTERM,
        };
        signal_group(self.pid, polite);
        match timeout(self.grace, self.backend.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    process = %self.id,
                    "Still running after {:?}, sending SIGKILL",
                    self.grace
                );
                signal_group(self.pid, Signal::SIGKILL);
                self.backend.force_kill();
                self.backend.wait().await
            }
        }
    }

    async fn finish(mut self, status: ProcessStatus) {
        let readers = std::mem::take(&mut self.readers);
        if timeout(DRAIN_TIMEOUT, join_all(readers)).await.is_err() {
            debug!(process = %self.id, "Output still open after exit, not waiting");
        }

        if status == ProcessStatus::TimedOut {
            let secs = self.timeout.map(|t| t.as_secs()).unwrap_or(0);
            let notice = format!("\n[timed out after {secs}s]\n");
            let _ = self
                .events
                .send(ProcessEvent::Output(Bytes::from(notice)))
                .await;
        }

        self.live.write().await.remove(&self.id);
        self.status.send_replace(status);
        info!(process = %self.id, ?status, "Process finished");
        let _ = self.events.send(ProcessEvent::Exited(status)).await;
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
