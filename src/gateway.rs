//! Gateway façade: the operations a connected client can invoke.
//!
//! Every operation first checks the session with the multiplexer and fails
//! with `Unauthorized` before touching the jail or the runner.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{error, info};

use crate::command::{requested_timeout, CommandSpec, TerminalSize};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::ids::{SessionId, StreamId};
use crate::jail::{FileEntry, WorkspaceJail};
use crate::mux::{SessionFeed, SessionInfo, SessionMultiplexer, StreamEvent};
use crate::protocol::{Command, Payload, Reply};
use crate::runner::ProcessRunner;

/// File installed by `installRequirements`, relative to the workspace root.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

pub struct Gateway {
    config: GatewayConfig,
    jail: Arc<WorkspaceJail>,
    runner: ProcessRunner,
    mux: SessionMultiplexer,
}

impl Gateway {
    /// Opens the workspace and builds the runner and multiplexer.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let jail = Arc::new(WorkspaceJail::open(&config.workspace_root)?);
        let runner = ProcessRunner::new(
            jail.clone(),
            config.max_processes_per_session,
            config.grace_period,
        );
        let mux = SessionMultiplexer::new(config.session_ttl);
        info!(root = %jail.root().display(), "Gateway ready");
        Ok(Self {
            config,
            jail,
            runner,
            mux,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn jail(&self) -> &WorkspaceJail {
        &self.jail
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn multiplexer(&self) -> &SessionMultiplexer {
        &self.mux
    }

    /// Opens a session for an identity vouched for by the auth layer.
    pub async fn connect(&self, identity: Option<&str>) -> Result<(SessionId, SessionFeed)> {
        let identity = identity
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .ok_or_else(|| GatewayError::Unauthorized("missing identity".to_string()))?;
        Ok(self.mux.open_session(identity).await)
    }

    /// Ends a session and cancels everything it owns.
    pub async fn disconnect(&self, session: SessionId) -> usize {
        self.mux.detach_session(session).await
    }

    /// Dispatches one decoded client command.
    pub async fn execute(&self, session: SessionId, command: Command) -> Result<Reply> {
        self.mux.authorize(session).await?;
        let result = self.dispatch(session, command).await;
        if let Err(e) = &result {
            if e.is_system() {
                error!(session = %session, error = %e, "Operation failed");
            }
        }
        result
    }

    async fn dispatch(&self, session: SessionId, command: Command) -> Result<Reply> {
        match command {
            Command::ListFiles { path } => {
                let entries = self.list_files(session, &path).await?;
                Ok(Reply::Listing { entries })
            }
            Command::ReadFile { path } => {
                let bytes = self.read_file(session, &path).await?;
                Ok(Reply::File {
                    content: Payload::from_bytes(&bytes),
                })
            }
            Command::WriteFile { path, content } => {
                self.write_file(session, &path, content.into_bytes()?).await?;
                Ok(Reply::Done {})
            }
            Command::DeleteFile { path } => {
                self.delete_file(session, &path).await?;
                Ok(Reply::Done {})
            }
            Command::CreateDirectory { path } => {
                self.create_directory(session, &path).await?;
                Ok(Reply::Done {})
            }
            Command::RenamePath { from, to } => {
                self.rename_path(session, &from, &to).await?;
                Ok(Reply::Done {})
            }
            Command::InstallPackage { name } => {
                let stream = self.install_package(session, &name).await?;
                Ok(Reply::Stream { stream })
            }
            Command::InstallRequirements => {
                let stream = self.install_requirements(session).await?;
                Ok(Reply::Stream { stream })
            }
            Command::RunSnippet {
                code,
                language,
                timeout_secs,
            } => {
                let timeout = requested_timeout(timeout_secs);
                let stream = self.run_snippet(session, &code, &language, timeout).await?;
                Ok(Reply::Stream { stream })
            }
            Command::OpenShell { rows, cols } => {
                let size = match (rows, cols) {
                    (None, None) => None,
                    (rows, cols) => {
                        let default = TerminalSize::default();
                        Some(TerminalSize {
                            rows: rows.unwrap_or(default.rows),
                            cols: cols.unwrap_or(default.cols),
                        })
                    }
                };
                let stream = self.open_shell(session, size).await?;
                Ok(Reply::Stream { stream })
            }
            Command::SendInput { stream, data } => {
                self.send_input(session, stream, Bytes::from(data.into_bytes()?))
                    .await?;
                Ok(Reply::Done {})
            }
            Command::ResizeTerminal { stream, rows, cols } => {
                self.resize_terminal(session, stream, TerminalSize { rows, cols })
                    .await?;
                Ok(Reply::Done {})
            }
            Command::CloseStream { stream } => {
                self.close_stream(session, stream).await?;
                Ok(Reply::Done {})
            }
        }
    }

    /// Runs a jail operation on the blocking pool.
    async fn with_jail<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&WorkspaceJail) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let jail = self.jail.clone();
        tokio::task::spawn_blocking(move || op(&jail))
            .await
            .map_err(|e| {
                GatewayError::system(
                    "running file operation",
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?
    }

    async fn notify_changed(&self, path: &str) {
        self.mux
            .broadcast(StreamEvent::FileChanged {
                path: path.to_string(),
            })
            .await;
    }

    pub async fn list_files(&self, session: SessionId, path: &str) -> Result<Vec<FileEntry>> {
        self.mux.authorize(session).await?;
        let path = path.to_string();
        self.with_jail(move |jail| jail.list(&path)).await
    }

    pub async fn read_file(&self, session: SessionId, path: &str) -> Result<Vec<u8>> {
        self.mux.authorize(session).await?;
        let path = path.to_string();
        self.with_jail(move |jail| jail.read(&path)).await
    }

    pub async fn write_file(&self, session: SessionId, path: &str, content: Vec<u8>) -> Result<()> {
        self.mux.authorize(session).await?;
        let owned = path.to_string();
        self.with_jail(move |jail| jail.write(&owned, &content)).await?;
        self.notify_changed(path).await;
        Ok(())
    }

    pub async fn delete_file(&self, session: SessionId, path: &str) -> Result<()> {
        self.mux.authorize(session).await?;
        let owned = path.to_string();
        self.with_jail(move |jail| jail.delete(&owned)).await?;
        self.notify_changed(path).await;
        Ok(())
    }

    pub async fn create_directory(&self, session: SessionId, path: &str) -> Result<()> {
        self.mux.authorize(session).await?;
        let owned = path.to_string();
        self.with_jail(move |jail| jail.create_dir(&owned)).await?;
        self.notify_changed(path).await;
        Ok(())
    }

    pub async fn rename_path(&self, session: SessionId, from: &str, to: &str) -> Result<()> {
        self.mux.authorize(session).await?;
        let (src, dst) = (from.to_string(), to.to_string());
        self.with_jail(move |jail| jail.rename(&src, &dst)).await?;
        self.notify_changed(from).await;
        self.notify_changed(to).await;
        Ok(())
    }

    async fn start(&self, session: SessionId, spec: CommandSpec) -> Result<StreamId> {
        let process = self.runner.spawn(session, spec).await?;
        self.mux.attach(session, process).await
    }

    /// Installs one package. Output streams under the returned id.
    pub async fn install_package(&self, session: SessionId, name: &str) -> Result<StreamId> {
        self.mux.authorize(session).await?;
        let spec = CommandSpec::install(&self.config, name.trim())?;
        info!(session = %session, package = %name.trim(), "Installing package");
        self.start(session, spec).await
    }

    /// Installs the workspace's `requirements.txt`.
    pub async fn install_requirements(&self, session: SessionId) -> Result<StreamId> {
        self.mux.authorize(session).await?;
        let is_file = self
            .with_jail(|jail| Ok(jail.resolve(REQUIREMENTS_FILE)?.is_file()))
            .await?;
        if !is_file {
            return Err(GatewayError::NotFound(REQUIREMENTS_FILE.to_string()));
        }
        let spec = CommandSpec::install_requirements(&self.config, REQUIREMENTS_FILE);
        self.start(session, spec).await
    }

    /// Saves `code` under the snippet directory and runs it with the
    /// interpreter configured for `language`.
    pub async fn run_snippet(
        &self,
        session: SessionId,
        code: &str,
        language: &str,
        timeout: Option<Duration>,
    ) -> Result<StreamId> {
        self.mux.authorize(session).await?;
        if code.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("snippet is empty".to_string()));
        }
        let language = language.trim().to_lowercase();
        let interpreter = self
            .config
            .interpreters
            .get(&language)
            .ok_or_else(|| GatewayError::UnsupportedLanguage(language.clone()))?;

        let file_name = snippet_file_name(&interpreter.extension);
        let dir = self.config.snippet_dir.clone();
        let relative = format!("{}/{}", dir.trim_end_matches('/'), file_name);
        let content = code.as_bytes().to_vec();
        self.with_jail(move |jail| jail.write(&relative, &content))
            .await?;

        let spec = CommandSpec::snippet(&self.config, interpreter, &file_name, &dir, timeout);
        self.start(session, spec).await
    }

    /// Starts the configured shell, optionally on a terminal of `size`.
    pub async fn open_shell(&self, session: SessionId, size: Option<TerminalSize>) -> Result<StreamId> {
        self.mux.authorize(session).await?;
        let spec = CommandSpec::shell(&self.config, size);
        self.start(session, spec).await
    }

    pub async fn send_input(&self, session: SessionId, stream: StreamId, data: Bytes) -> Result<()> {
        self.mux.authorize(session).await?;
        self.mux.route_input(session, stream, data).await
    }

    pub async fn resize_terminal(
        &self,
        session: SessionId,
        stream: StreamId,
        size: TerminalSize,
    ) -> Result<()> {
        self.mux.authorize(session).await?;
        self.mux.resize(session, stream, size).await
    }

    pub async fn close_stream(&self, session: SessionId, stream: StreamId) -> Result<()> {
        self.mux.authorize(session).await?;
        self.mux.close_stream(session, stream).await
    }

    /// Live sessions of one identity.
    pub async fn sessions(&self, identity: &str) -> Vec<SessionInfo> {
        self.mux.sessions(Some(identity)).await
    }

    /// Force-disconnects `session` if it belongs to `identity`.
    pub async fn end_session(&self, identity: &str, session: SessionId) -> Result<usize> {
        match self.mux.identity(session).await {
            Some(owner) if owner == identity => Ok(self.disconnect(session).await),
            _ => Err(GatewayError::NotFound(format!("session {session}"))),
        }
    }

    /// Expires idle sessions. Returns how many were dropped.
    pub async fn expire_idle_sessions(&self) -> usize {
        self.mux.expire_idle().await.len()
    }

    /// Cancels every process and waits for them to be reaped.
    pub async fn shutdown(&self) {
        let cancelled = self.mux.shutdown().await;
        info!(cancelled, "Gateway shutting down");
        self.runner.shutdown().await;
    }
}

fn snippet_file_name(extension: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("paste_{}_{}.{}", secs, &suffix[..8], extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_file_name() {
        let name = snippet_file_name("py");
        assert!(name.starts_with("paste_"));
        assert!(name.ends_with(".py"));
        assert_ne!(name, snippet_file_name("py"));
    }
}
