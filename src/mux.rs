//! Session multiplexer: routes many process streams over one client feed.
//!
//! Every session owns a bounded outbound queue, exposed to the transport as a
//! [`SessionFeed`]. Each attached process gets a forwarder task that moves its
//! output into that queue tagged with the stream id, so per-stream order is
//! preserved and streams never block each other's producers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::command::{ProcessKind, TerminalSize};
use crate::error::{GatewayError, Result};
use crate::ids::{ProcessId, SessionId, StreamId};
use crate::preview::PreviewDetector;
use crate::runner::{
    InputRejected, KillReason, ProcessEvent, ProcessHandle, ProcessOutput, ProcessStatus,
    SpawnedProcess,
};

const FEED_BUFFER: usize = 512;

/// Everything pushed to a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Output { stream: StreamId, data: Bytes },
    /// End-of-stream sentinel. Always the last event of its stream.
    Ended { stream: StreamId, status: ProcessStatus },
    Preview { stream: StreamId, url: String },
    /// Best-effort notice that a workspace path was modified.
    FileChanged { path: String },
}

/// The fan-in sequence of all stream events for one session.
pub type SessionFeed = ReceiverStream<StreamEvent>;

/// Summary of one attached stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream: StreamId,
    pub process: ProcessId,
    pub kind: ProcessKind,
    pub status: ProcessStatus,
}

/// Summary of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub identity: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub streams: Vec<StreamInfo>,
}

struct SessionEntry {
    identity: String,
    created_at: Instant,
    last_activity: Instant,
    outbound: mpsc::Sender<StreamEvent>,
    streams: HashSet<StreamId>,
}

struct StreamEntry {
    session: SessionId,
    handle: ProcessHandle,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, SessionEntry>,
    streams: HashMap<StreamId, StreamEntry>,
}

struct Inner {
    state: RwLock<State>,
    last_stream: AtomicU64,
    ttl: Duration,
}

/// Maps sessions to their attached processes.
#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<Inner>,
}

impl SessionMultiplexer {
    /// `ttl` is the idle time after which a session stops being authorized.
    /// Zero disables expiry.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                last_stream: AtomicU64::new(0),
                ttl,
            }),
        }
    }

    /// Registers a new session for an authenticated identity.
    pub async fn open_session(&self, identity: impl Into<String>) -> (SessionId, SessionFeed) {
        let id = SessionId::new();
        let identity = identity.into();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let now = Instant::now();
        info!(session = %id, identity = %identity, "Opened session");
        self.inner.state.write().await.sessions.insert(
            id,
            SessionEntry {
                identity,
                created_at: now,
                last_activity: now,
                outbound: tx,
                streams: HashSet::new(),
            },
        );
        (id, ReceiverStream::new(rx))
    }

    /// Fails with `Unauthorized` for unknown or expired sessions and records
    /// activity otherwise.
    pub async fn authorize(&self, session: SessionId) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| GatewayError::Unauthorized("unknown session".to_string()))?;
        if self.is_expired(entry.last_activity) {
            return Err(GatewayError::Unauthorized("session expired".to_string()));
        }
        entry.last_activity = Instant::now();
        Ok(())
    }

    fn is_expired(&self, last_activity: Instant) -> bool {
        !self.inner.ttl.is_zero() && last_activity.elapsed() > self.inner.ttl
    }

    /// Identity the session was opened with.
    pub async fn identity(&self, session: SessionId) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .sessions
            .get(&session)
            .map(|s| s.identity.clone())
    }

    /// Registers `process` under `session` and starts forwarding its output.
    ///
    /// If the session is already gone the process is cancelled.
    pub async fn attach(&self, session: SessionId, process: SpawnedProcess) -> Result<StreamId> {
        let SpawnedProcess { handle, output } = process;
        let mut state = self.inner.state.write().await;
        let Some(entry) = state.sessions.get_mut(&session) else {
            drop(state);
            handle.cancel(KillReason::Disconnected);
            return Err(GatewayError::Unauthorized("unknown session".to_string()));
        };

        let stream = StreamId::from_raw(self.inner.last_stream.fetch_add(1, Ordering::Relaxed) + 1);
        entry.streams.insert(stream);
        let outbound = entry.outbound.clone();
        state.streams.insert(
            stream,
            StreamEntry {
                session,
                handle: handle.clone(),
            },
        );
        drop(state);

        debug!(
            session = %session,
            stream = %stream,
            process = %handle.id(),
            "Attached stream"
        );
        tokio::spawn(forward(self.inner.clone(), session, stream, output, outbound));
        Ok(stream)
    }

    async fn lookup(&self, session: SessionId, stream: StreamId) -> Result<ProcessHandle> {
        let state = self.inner.state.read().await;
        match state.streams.get(&stream) {
            Some(entry) if entry.session == session => Ok(entry.handle.clone()),
            _ => Err(GatewayError::UnknownStream(stream)),
        }
    }

    /// Queues keystrokes for the stream's process, in call order. Never waits
    /// on the child: a process that stopped reading gives `StreamBusy`.
    pub async fn route_input(&self, session: SessionId, stream: StreamId, data: Bytes) -> Result<()> {
        let handle = self.lookup(session, stream).await?;
        if !handle.is_interactive() {
            return Err(GatewayError::NotInteractive(stream));
        }
        if handle.status().is_terminal() {
            return Err(GatewayError::UnknownStream(stream));
        }
        handle.send_input(data).map_err(|e| match e {
            InputRejected::Busy => GatewayError::StreamBusy(stream),
            InputRejected::Closed => GatewayError::UnknownStream(stream),
        })
    }

    /// Resizes the stream's terminal. Piped interactive streams ignore it.
    pub async fn resize(&self, session: SessionId, stream: StreamId, size: TerminalSize) -> Result<()> {
        let handle = self.lookup(session, stream).await?;
        if !handle.is_interactive() {
            return Err(GatewayError::NotInteractive(stream));
        }
        handle.resize(size);
        Ok(())
    }

    /// Cancels the stream's process. Streams that already ended are a no-op.
    pub async fn close_stream(&self, session: SessionId, stream: StreamId) -> Result<()> {
        let state = self.inner.state.read().await;
        match state.streams.get(&stream) {
            Some(entry) if entry.session == session => {
                entry.handle.cancel(KillReason::Cancelled);
                Ok(())
            }
            None if stream.as_u64() != 0 && stream.as_u64() <= self.last_issued() => Ok(()),
            _ => Err(GatewayError::UnknownStream(stream)),
        }
    }

    fn last_issued(&self) -> u64 {
        self.inner.last_stream.load(Ordering::Relaxed)
    }

    /// Cancels every process of the session and forgets it. Safe to call
    /// any number of times. Returns how many processes were cancelled.
    pub async fn detach_session(&self, session: SessionId) -> usize {
        self.detach_with(session, KillReason::Disconnected).await
    }

    async fn detach_with(&self, session: SessionId, reason: KillReason) -> usize {
        let handles: Vec<ProcessHandle> = {
            let mut state = self.inner.state.write().await;
            let Some(entry) = state.sessions.remove(&session) else {
                return 0;
            };
            entry
                .streams
                .iter()
                .filter_map(|stream| state.streams.remove(stream))
                .map(|e| e.handle)
                .collect()
        };
        for handle in &handles {
            handle.cancel(reason);
        }
        info!(session = %session, cancelled = handles.len(), "Detached session");
        handles.len()
    }

    /// Detaches every session idle for longer than the TTL.
    pub async fn expire_idle(&self) -> Vec<SessionId> {
        let expired: Vec<SessionId> = {
            let state = self.inner.state.read().await;
            state
                .sessions
                .iter()
                .filter(|(_, s)| self.is_expired(s.last_activity))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            info!("Cleaning up expired session: {}", id);
            self.detach_with(*id, KillReason::Disconnected).await;
        }
        expired
    }

    /// Live sessions, optionally restricted to one identity.
    pub async fn sessions(&self, identity: Option<&str>) -> Vec<SessionInfo> {
        let state = self.inner.state.read().await;
        let mut list: Vec<SessionInfo> = state
            .sessions
            .iter()
            .filter(|(_, s)| identity.map_or(true, |i| s.identity == i))
            .map(|(id, s)| {
                let mut streams: Vec<StreamInfo> = s
                    .streams
                    .iter()
                    .filter_map(|stream| {
                        state.streams.get(stream).map(|e| StreamInfo {
                            stream: *stream,
                            process: e.handle.id(),
                            kind: e.handle.kind(),
                            status: e.handle.status(),
                        })
                    })
                    .collect();
                streams.sort_by_key(|s| s.stream);
                SessionInfo {
                    id: *id,
                    identity: s.identity.clone(),
                    age_secs: s.created_at.elapsed().as_secs(),
                    idle_secs: s.last_activity.elapsed().as_secs(),
                    streams,
                }
            })
            .collect();
        list.sort_by_key(|s| std::cmp::Reverse(s.age_secs));
        list
    }

    /// Number of streams currently attached to the session.
    pub async fn stream_count(&self, session: SessionId) -> usize {
        self.inner
            .state
            .read()
            .await
            .sessions
            .get(&session)
            .map_or(0, |s| s.streams.len())
    }

    /// Pushes an event to every session without waiting. Full queues drop it.
    pub async fn broadcast(&self, event: StreamEvent) {
        let state = self.inner.state.read().await;
        for (id, session) in &state.sessions {
            if session.outbound.try_send(event.clone()).is_err() {
                debug!(session = %id, "Dropped broadcast for slow or closed session");
            }
        }
    }

    /// Detaches every session. Returns how many processes were cancelled.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.state.read().await.sessions.keys().copied().collect();
        let mut cancelled = 0;
        for id in ids {
            cancelled += self.detach_with(id, KillReason::Shutdown).await;
        }
        cancelled
    }
}

async fn forward(
    inner: Arc<Inner>,
    session: SessionId,
    stream: StreamId,
    mut output: ProcessOutput,
    outbound: mpsc::Sender<StreamEvent>,
) {
    let mut preview = PreviewDetector::new();
    while let Some(event) = output.next().await {
        match event {
            ProcessEvent::Output(data) => {
                let urls = preview.scan(&data);
                // Keep draining after the client is gone so the child never
                // blocks on a full pipe before it is cancelled.
                let _ = outbound.send(StreamEvent::Output { stream, data }).await;
                for url in urls {
                    let _ = outbound.send(StreamEvent::Preview { stream, url }).await;
                }
            }
            ProcessEvent::Exited(status) => {
                for url in preview.finish() {
                    let _ = outbound.send(StreamEvent::Preview { stream, url }).await;
                }
                let _ = outbound.send(StreamEvent::Ended { stream, status }).await;
            }
        }
    }

    let mut state = inner.state.write().await;
    state.streams.remove(&stream);
    if let Some(entry) = state.sessions.get_mut(&session) {
        entry.streams.remove(&stream);
    }
    debug!(session = %session, stream = %stream, "Released stream");
}
