//! Sandbox sessions: one spawned agent process per session, driven turn
//! by turn.
//!
//! ```text
//! starting → running → (idle ⇄ running) → stopping → stopped
//!                 └──────────────────────────────→ crashed
//! ```
//!
//! A turn starts with [`Session::send`] and is consumed through
//! [`Session::stream`], which ends after the agent's `result` record.
//! IPC requests raised during a turn are dispatched concurrently and
//! answered as they complete, so a request blocked on approval does not
//! stall the output.

pub mod mounts;
pub mod process;
pub mod protocol;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Workspace;
use crate::ipc::channel::{DirectoryExchange, IpcChannel, RequestOrigin};
use crate::ipc::dispatcher::Dispatcher;
use crate::ipc::{IpcError, IpcRequest, IpcResponse, RequestContext};
use crate::observe::{EventSink, ObservedEvent};
use crate::security::{TaintCell, TaintRules, TaintState};
use mounts::{MountPolicy, MountRejection, MountSpec};
use process::{LaunchSpec, SandboxLauncher, SandboxProcess};
use protocol::{InboundRecord, ResultStatus, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Crashed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Idle => "idle",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("mount rejected: {0}")]
    MountRejected(#[from] MountRejection),
    #[error("sandbox exited unexpectedly: {0}")]
    ContainerCrashed(String),
    #[error("hard timeout of {}s exceeded", .0.as_secs_f32())]
    HardTimeoutExceeded(Duration),
    #[error("cannot {op} a session in state {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
    #[error("session was stopped")]
    Killed,
    #[error("failed to spawn sandbox: {0}")]
    Spawn(std::io::Error),
    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the job that was running may be delivered again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ContainerCrashed(_)
                | SessionError::HardTimeoutExceeded(_)
                | SessionError::Spawn(_)
                | SessionError::Io(_)
        )
    }
}

/// Secrets available for injection, keyed by environment variable name.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    secrets: HashMap<String, String>,
}

impl Credentials {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// The subset `workspace` is entitled to, in entitlement order.
    pub fn entitled(&self, workspace: &Workspace) -> Vec<(String, String)> {
        workspace
            .credentials
            .iter()
            .filter_map(|name| match self.secrets.get(name) {
                Some(value) => Some((name.clone(), value.clone())),
                None => {
                    warn!("Workspace {} is entitled to unknown credential {name}", workspace.id);
                    None
                }
            })
            .collect()
    }
}

/// Shared by every session of a host.
#[derive(Clone)]
pub struct SessionContext {
    pub launcher: Arc<SandboxLauncher>,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<dyn EventSink>,
    pub taint_rules: Arc<TaintRules>,
    pub data_dir: PathBuf,
    pub grace_period: Duration,
    pub ipc_poll_interval: Duration,
}

/// Cloneable remote control for a session, usable while another task
/// owns the [`Session`] itself.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    kill_tx: Arc<watch::Sender<bool>>,
    dispatcher: Arc<Dispatcher>,
}

impl SessionHandle {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kill_tx: Arc::new(kill_tx),
            dispatcher,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-graceful stop from outside. Pending approvals of the session
    /// resolve to deny right away; the owner's stream then ends with
    /// [`SessionError::Killed`].
    pub async fn kill(&self) {
        self.kill_tx.send_replace(true);
        self.dispatcher.session_closed(&self.id).await;
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: ResultStatus,
    pub text: Option<String>,
}

type PendingDispatch = BoxFuture<'static, (RequestOrigin, IpcResponse)>;

enum Wake {
    Killed,
    Deadline,
    Dispatched(RequestOrigin, IpcResponse),
    Poll,
    Output(Option<SessionEvent>),
}

pub struct Session {
    id: String,
    workspace: Arc<Workspace>,
    state: SessionState,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    process: SandboxProcess,
    channel: IpcChannel,
    taint: Arc<TaintCell>,
    handle: SessionHandle,
    kill_rx: watch::Receiver<bool>,
    ctx: SessionContext,
    pending: FuturesUnordered<PendingDispatch>,
    backlog: VecDeque<SessionEvent>,
    poll: Interval,
    turn_deadline: Option<Instant>,
    tool_names: HashMap<String, String>,
}

impl Session {
    /// Validates mounts, prepares the IPC directory and spawns the sandbox.
    ///
    /// A rejected mount fails before anything is created or spawned.
    pub async fn start(
        workspace: Arc<Workspace>,
        mounts: &[MountSpec],
        credentials: &Credentials,
        handle: SessionHandle,
        ctx: SessionContext,
    ) -> Result<Session, SessionError> {
        let reserved = ctx.launcher.ipc_container_path().to_path_buf();
        let mounts = MountPolicy::new(&workspace.mount_allowlist, &reserved)
            .validate(mounts)
            .inspect_err(|e| warn!(workspace = %workspace.id, "Refusing to start sandbox: {e}"))?;

        let id = handle.id().to_string();
        let ipc_dir = ctx.data_dir.join("ipc").join(&workspace.id).join(&id);
        let exchange = DirectoryExchange::create(&ipc_dir).await?;
        let ipc_host_dir = tokio::fs::canonicalize(exchange.root()).await?;

        let spec = LaunchSpec {
            session_id: id.clone(),
            workspace_id: workspace.id.clone(),
            mounts,
            ipc_host_dir,
            credentials: credentials.entitled(&workspace),
        };
        let process = ctx.launcher.spawn(&spec).map_err(SessionError::Spawn)?;
        info!(
            session = %id,
            workspace = %workspace.id,
            "Sandbox started (pid {:?}, {} mount(s))",
            process.id(),
            spec.mounts.len()
        );

        let mut poll = tokio::time::interval(ctx.ipc_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let now = Utc::now();
        let session = Session {
            kill_rx: handle.subscribe(),
            id,
            workspace,
            state: SessionState::Starting,
            started_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            process,
            channel: IpcChannel::new(Some(exchange)),
            taint: Arc::new(TaintCell::new()),
            handle,
            ctx,
            pending: FuturesUnordered::new(),
            backlog: VecDeque::new(),
            poll,
            turn_deadline: None,
            tool_names: HashMap::new(),
        };
        session.emit_lifecycle(None);
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn taint(&self) -> TaintState {
        self.taint.get()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// When the idle timer runs out, if the session is idle.
    pub fn idle_deadline(&self) -> Option<Instant> {
        (self.state == SessionState::Idle).then(|| self.last_activity + self.workspace.idle_timeout)
    }

    pub fn is_alive(&mut self) -> bool {
        !self.state.is_terminal() && !*self.kill_rx.borrow() && self.process.try_exit().is_none()
    }

    /// Hands one job to the sandbox and opens a turn bounded by the
    /// workspace's hard timeout.
    pub fn send(&mut self, job_id: &str, text: &str) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            SessionState::Starting | SessionState::Running | SessionState::Idle
        ) {
            return Err(SessionError::InvalidState {
                op: "send to",
                state: self.state,
            });
        }
        let record = InboundRecord::Prompt {
            job_id: job_id.to_string(),
            text: text.to_string(),
        };
        if !self.process.send(record) {
            return Err(SessionError::ContainerCrashed("sandbox input is closed".into()));
        }
        debug!(session = %self.id, "Job {job_id} sent to sandbox");
        self.touch();
        self.turn_deadline = Some(Instant::now() + self.workspace.hard_timeout);
        self.set_state(SessionState::Running, None);
        Ok(())
    }

    /// Events of the current turn, ending after the turn marker (once
    /// in-flight IPC requests are answered) or a terminal error. Calling it again resumes where the last call
    /// stopped.
    pub fn stream(&mut self) -> impl Stream<Item = Result<SessionEvent, SessionError>> + '_ {
        futures::stream::unfold(self, |session| async move {
            let item = session.next_event().await?;
            Some((item, session))
        })
    }

    /// Sends a job and drives the turn to completion.
    pub async fn run_turn(&mut self, job_id: &str, text: &str) -> Result<TurnOutcome, SessionError> {
        self.send(job_id, text)?;
        let mut outcome = None;
        {
            let mut events = std::pin::pin!(self.stream());
            while let Some(event) = events.next().await {
                if let SessionEvent::Result { status, text } = event? {
                    outcome = Some(TurnOutcome { status, text });
                }
            }
        }
        outcome.ok_or(SessionError::Killed)
    }

    pub async fn next_event(&mut self) -> Option<Result<SessionEvent, SessionError>> {
        if self.state.is_terminal() {
            return None;
        }
        if *self.kill_rx.borrow() {
            self.terminate(SessionState::Stopped, "killed").await;
            return Some(Err(SessionError::Killed));
        }
        if let Some(event) = self.backlog.pop_front() {
            return Some(Ok(event));
        }
        // After the turn marker, answer requests that are still in flight
        let running = self.state == SessionState::Running;
        if !running && self.pending.is_empty() {
            return None;
        }

        loop {
            let deadline = self.turn_deadline.unwrap_or_else(Instant::now);
            let wake = tokio::select! {
                biased;
                changed = self.kill_rx.changed() => match changed {
                    Ok(()) if *self.kill_rx.borrow() => Wake::Killed,
                    _ => continue,
                },
                _ = tokio::time::sleep_until(deadline), if self.turn_deadline.is_some() => Wake::Deadline,
                Some((origin, response)) = self.pending.next(), if !self.pending.is_empty() => {
                    Wake::Dispatched(origin, response)
                }
                _ = self.poll.tick(), if running && self.channel.has_exchange() => Wake::Poll,
                event = self.process.next_event(), if running => Wake::Output(event),
            };

            match wake {
                Wake::Killed => {
                    self.terminate(SessionState::Stopped, "killed").await;
                    return Some(Err(SessionError::Killed));
                }
                Wake::Deadline => {
                    let limit = self.workspace.hard_timeout;
                    warn!(session = %self.id, "Hard timeout ({}s) exceeded, killing sandbox", limit.as_secs_f32());
                    self.terminate(SessionState::Crashed, "hard timeout exceeded").await;
                    return Some(Err(SessionError::HardTimeoutExceeded(limit)));
                }
                Wake::Dispatched(origin, response) => {
                    let event = self.deliver(origin, response).await;
                    return Some(Ok(event));
                }
                Wake::Poll => {
                    self.poll_directory().await;
                    if let Some(event) = self.backlog.pop_front() {
                        return Some(Ok(event));
                    }
                }
                Wake::Output(None) => {
                    let detail = match self.process.wait_timeout(Duration::from_millis(200)).await {
                        Some(status) => format!("exited with {status} mid-turn"),
                        None => "closed its output mid-turn".to_string(),
                    };
                    warn!(session = %self.id, "Sandbox {detail}");
                    self.terminate(SessionState::Crashed, &detail).await;
                    return Some(Err(SessionError::ContainerCrashed(detail)));
                }
                Wake::Output(Some(event)) => {
                    self.observe(&event);
                    return Some(Ok(event));
                }
            }
        }
    }

    /// Ends the session. Graceful asks the sandbox to close and waits
    /// the grace period before killing it. Safe to call in any state.
    pub async fn stop(&mut self, graceful: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(SessionState::Stopping, None);
        if graceful {
            self.process.send(InboundRecord::Close);
            self.process.close_input();
            if self.process.wait_timeout(self.ctx.grace_period).await.is_none() {
                warn!(session = %self.id, "Sandbox ignored close for {:?}, killing it", self.ctx.grace_period);
            }
        }
        self.terminate(SessionState::Stopped, if graceful { "graceful" } else { "killed" })
            .await;
    }

    async fn terminate(&mut self, state: SessionState, detail: &str) {
        if let Err(e) = self.process.kill().await {
            warn!(session = %self.id, "Failed to kill sandbox: {e}");
        }
        self.ctx.dispatcher.session_closed(&self.id).await;
        self.pending.clear();
        self.turn_deadline = None;
        let lifetime = (Utc::now() - self.started_at()).num_seconds();
        debug!(session = %self.id, "Sandbox ran for {lifetime}s");
        self.set_state(state, Some(detail.to_string()));
    }

    /// Bookkeeping for an output record before it is yielded.
    fn observe(&mut self, event: &SessionEvent) {
        self.touch();
        self.emit(event);
        match event {
            SessionEvent::ToolUse { id, name, .. } => {
                self.tool_names.insert(id.clone(), name.clone());
            }
            SessionEvent::ToolResult {
                tool_use_id, name, ..
            } => {
                let tool = name.clone().or_else(|| self.tool_names.get(tool_use_id).cloned());
                if let Some(tool) = tool {
                    let flags = self.ctx.taint_rules.classify(&tool);
                    if !flags.is_clean() {
                        let state = self.taint.mark(flags);
                        info!(session = %self.id, "Result of `{tool}` taints session: {state}");
                    }
                }
            }
            SessionEvent::IpcRequest {
                request_id,
                request_type,
                payload,
            } => {
                let request = IpcRequest {
                    request_id: request_id.clone(),
                    request_type: request_type.clone(),
                    payload: payload.clone(),
                };
                self.accept_request(RequestOrigin::Stdio, request);
            }
            SessionEvent::Result { status, .. } => {
                debug!(session = %self.id, "Turn finished ({status:?})");
                self.turn_deadline = None;
                self.set_state(SessionState::Idle, None);
            }
            _ => {}
        }
    }

    fn accept_request(&mut self, origin: RequestOrigin, request: IpcRequest) {
        if let Err(e) = self.channel.claim(&request.request_id) {
            if self.channel.is_claimed(&request.request_id) {
                // The first request keeps its response
                warn!(session = %self.id, "Ignoring reused IPC request id {}", request.request_id);
            } else {
                let response = IpcResponse::from_error(request.request_id.clone(), &e);
                self.pending.push(Box::pin(async move { (origin, response) }));
            }
            return;
        }

        let dispatcher = self.ctx.dispatcher.clone();
        let ctx = RequestContext {
            session_id: self.id.clone(),
            workspace: self.workspace.clone(),
            taint: self.taint.clone(),
        };
        self.pending.push(Box::pin(async move {
            let response = dispatcher.dispatch(&ctx, request).await;
            (origin, response)
        }));
    }

    async fn poll_directory(&mut self) {
        let found = self.channel.poll_directory().await;
        for polled in found {
            match polled {
                Ok(request) => {
                    let event = SessionEvent::IpcRequest {
                        request_id: request.request_id.clone(),
                        request_type: request.request_type.clone(),
                        payload: request.payload.clone(),
                    };
                    self.emit(&event);
                    self.backlog.push_back(event);
                    self.accept_request(RequestOrigin::Directory, request);
                }
                Err((id, e)) => self.reject_file(id, e),
            }
        }
    }

    fn reject_file(&mut self, request_id: String, error: IpcError) {
        warn!(session = %self.id, "Rejecting IPC request file {request_id}: {error}");
        if self.channel.claim(&request_id).is_ok() {
            let response = IpcResponse::from_error(request_id, &error);
            self.pending
                .push(Box::pin(async move { (RequestOrigin::Directory, response) }));
        }
    }

    async fn deliver(&mut self, origin: RequestOrigin, response: IpcResponse) -> SessionEvent {
        if let Err(e) = self.channel.complete(origin, response.clone()).await {
            warn!(session = %self.id, "Failed to publish IPC response {}: {e}", response.request_id);
        }
        if origin == RequestOrigin::Stdio
            && !self.process.send(InboundRecord::IpcResponse(response.clone()))
        {
            warn!(session = %self.id, "Sandbox input closed before response {} was sent", response.request_id);
        }
        if response.is_error() {
            debug!(session = %self.id, "IPC request {} answered with an error", response.request_id);
        }
        let event = SessionEvent::IpcResponse { response };
        self.emit(&event);
        event
    }

    /// Idempotent read of an answered request.
    pub fn response(&self, request_id: &str) -> Option<&IpcResponse> {
        self.channel.response(request_id)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>) {
        if self.state != state {
            self.state = state;
            self.emit_lifecycle(detail);
        }
    }

    fn emit_lifecycle(&self, detail: Option<String>) {
        self.ctx.sink.emit(&ObservedEvent::Lifecycle {
            session_id: self.id.clone(),
            workspace_id: self.workspace.id.clone(),
            state: self.state,
            detail,
        });
    }

    fn emit(&self, event: &SessionEvent) {
        self.ctx.sink.emit(&ObservedEvent::Session {
            session_id: self.id.clone(),
            workspace_id: self.workspace.id.clone(),
            event: event.clone(),
        });
    }
}
