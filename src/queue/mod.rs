//! Admission control: which workspace's job runs next, in which session.
//!
//! A single actor task owns all scheduler state. [`GroupQueue`] handles
//! send it commands; session tasks report back when a turn ends.
//!
//! Each workspace has a FIFO lane and at most one session. A job stays at
//! the head of its lane until its session reports a terminal outcome, so
//! a crash or timeout redelivers the same job after a backoff.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Workspace;
use crate::observe::ObservedEvent;
use crate::sandbox::protocol::ResultStatus;
use crate::sandbox::{Credentials, Session, SessionContext, SessionError, SessionHandle, TurnOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub workspace_id: String,
    pub payload: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Admitted,
    Succeeded,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("queue is shut down")]
    QueueClosed,
    #[error("unknown workspace `{0}`")]
    UnknownWorkspace(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Waiting jobs per workspace, the running one excluded
    pub queued: BTreeMap<String, usize>,
    pub running: usize,
    pub idle: usize,
    pub completed: u64,
    pub failed: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub backoff: Backoff,
}

enum Command {
    Enqueue(Job),
    Status(oneshot::Sender<QueueStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct GroupQueue {
    commands: mpsc::UnboundedSender<Command>,
    workspaces: Arc<HashSet<String>>,
    closed: Arc<AtomicBool>,
}

impl GroupQueue {
    /// Spawns the scheduler task.
    pub fn start(
        workspaces: Vec<Workspace>,
        credentials: Credentials,
        ctx: SessionContext,
        settings: QueueSettings,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let ids: HashSet<String> = workspaces.iter().map(|w| w.id.clone()).collect();
        let closed = Arc::new(AtomicBool::new(false));

        let actor = Scheduler::new(workspaces, credentials, ctx, settings, commands_rx);
        tokio::spawn(actor.run());

        Self {
            commands,
            workspaces: Arc::new(ids),
            closed,
        }
    }

    /// Queues a job and returns its id without waiting for admission.
    pub fn enqueue(&self, workspace_id: &str, payload: impl Into<String>, priority: i32) -> Result<String, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::QueueClosed);
        }
        if !self.workspaces.contains(workspace_id) {
            return Err(QueueError::UnknownWorkspace(workspace_id.to_string()));
        }
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            payload: payload.into(),
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let id = job.id.clone();
        self.commands
            .send(Command::Enqueue(job))
            .map_err(|_| QueueError::QueueClosed)?;
        Ok(id)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| QueueError::QueueClosed)?;
        rx.await.map_err(|_| QueueError::QueueClosed)
    }

    /// Closes admission, stops idle sessions gracefully and kills running
    /// ones. Returns once every session is gone.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

enum Slot {
    Empty,
    Busy(SessionHandle),
    Idle(Box<Session>),
}

struct Lane {
    workspace: Arc<Workspace>,
    jobs: VecDeque<Job>,
    slot: Slot,
    retry_at: Option<Instant>,
}

impl Lane {
    fn top_priority(&self) -> i32 {
        self.jobs.iter().map(|j| j.priority).max().unwrap_or(i32::MIN)
    }

    fn waiting(&self, now: Instant) -> bool {
        !self.jobs.is_empty()
            && !matches!(self.slot, Slot::Busy(_))
            && self.retry_at.map_or(true, |at| at <= now)
    }
}

struct Report {
    lane: usize,
    job_id: String,
    session: Option<Box<Session>>,
    outcome: Result<TurnOutcome, SessionError>,
}

struct Scheduler {
    lanes: Vec<Lane>,
    credentials: Arc<Credentials>,
    ctx: SessionContext,
    settings: QueueSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports: mpsc::UnboundedReceiver<Report>,
    stopping: JoinSet<()>,
    round_robin: usize,
    completed: u64,
    failed: u64,
    closed: bool,
}

impl Scheduler {
    fn new(
        workspaces: Vec<Workspace>,
        credentials: Credentials,
        ctx: SessionContext,
        settings: QueueSettings,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let lanes = workspaces
            .into_iter()
            .map(|w| Lane {
                workspace: Arc::new(w),
                jobs: VecDeque::new(),
                slot: Slot::Empty,
                retry_at: None,
            })
            .collect();
        Self {
            lanes,
            credentials: Arc::new(credentials),
            ctx,
            settings,
            commands,
            reports_tx,
            reports,
            stopping: JoinSet::new(),
            round_robin: 0,
            completed: 0,
            failed: 0,
            closed: false,
        }
    }

    async fn run(mut self) {
        info!(
            "Group queue started: {} workspace(s), {} concurrent session(s)",
            self.lanes.len(),
            self.settings.max_concurrent
        );
        loop {
            self.admit();
            let wake = self.next_wake();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Enqueue(job)) => self.push(job),
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                Some(report) = self.reports.recv() => self.on_report(report),
                Some(_) = self.stopping.join_next(), if !self.stopping.is_empty() => {}
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.expire_idle(Instant::now());
                }
            }
        }
        info!("Group queue stopped");
    }

    fn lane_index(&self, workspace_id: &str) -> Option<usize> {
        self.lanes.iter().position(|l| l.workspace.id == workspace_id)
    }

    fn push(&mut self, job: Job) {
        match self.lane_index(&job.workspace_id) {
            Some(i) => {
                debug!(workspace = %job.workspace_id, "Job {} queued (priority {})", job.id, job.priority);
                self.lanes[i].jobs.push_back(job);
            }
            None => warn!("Dropping job {} for unknown workspace {}", job.id, job.workspace_id),
        }
    }

    fn live(&self) -> usize {
        self.lanes
            .iter()
            .filter(|l| !matches!(l.slot, Slot::Empty))
            .count()
    }

    fn admit(&mut self) {
        if self.closed {
            return;
        }
        let now = Instant::now();
        let mut blocked = HashSet::new();
        while let Some(i) = self.pick(now, &blocked) {
            if self.claim_slot(i) {
                self.launch(i);
            } else {
                blocked.insert(i);
            }
        }
    }

    /// Highest pending priority first, then weight, then round-robin
    /// starting after the last admitted lane.
    fn pick(&self, now: Instant, blocked: &HashSet<usize>) -> Option<usize> {
        let n = self.lanes.len();
        self.lanes
            .iter()
            .enumerate()
            .filter(|(i, lane)| !blocked.contains(i) && lane.waiting(now))
            .max_by_key(|(i, lane)| {
                let distance = (i + n - self.round_robin) % n;
                (lane.top_priority(), lane.workspace.weight, std::cmp::Reverse(distance))
            })
            .map(|(i, _)| i)
    }

    /// Makes room for lane `i`, stopping another lane's idle session if
    /// every slot is taken.
    fn claim_slot(&mut self, i: usize) -> bool {
        if matches!(self.lanes[i].slot, Slot::Idle(_)) || self.live() < self.settings.max_concurrent {
            return true;
        }
        let victim = self
            .lanes
            .iter()
            .enumerate()
            .filter_map(|(j, lane)| match &lane.slot {
                Slot::Idle(session) if j != i => {
                    Some((j, !lane.jobs.is_empty(), session.last_activity_at()))
                }
                _ => None,
            })
            .min_by_key(|(_, has_jobs, last)| (*has_jobs, *last))
            .map(|(j, _, _)| j);
        match victim {
            Some(j) => {
                let reason = format!("slot needed by workspace {}", self.lanes[i].workspace.id);
                self.retire(j, &reason);
                true
            }
            None => false,
        }
    }

    fn launch(&mut self, i: usize) {
        let lane = &mut self.lanes[i];
        let Some(head) = lane.jobs.front_mut() else {
            return;
        };
        head.attempts += 1;
        let job = head.clone();
        lane.retry_at = None;

        let (session, handle) = match std::mem::replace(&mut lane.slot, Slot::Empty) {
            Slot::Idle(session) => {
                let handle = session.handle();
                (Some(session), handle)
            }
            _ => (None, SessionHandle::new(self.ctx.dispatcher.clone())),
        };
        lane.slot = Slot::Busy(handle.clone());
        let workspace = lane.workspace.clone();
        self.round_robin = (i + 1) % self.lanes.len();

        info!(
            workspace = %workspace.id,
            session = %handle.id(),
            "Admitting job {} (attempt {}, {})",
            job.id,
            job.attempts,
            if session.is_some() { "reusing idle session" } else { "new session" }
        );
        self.emit_job(&job, JobStatus::Admitted, None);

        let credentials = self.credentials.clone();
        let ctx = self.ctx.clone();
        let reports = self.reports_tx.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let turn = run_job(workspace, job, session, handle, credentials, ctx);
            let (session, outcome) = match AssertUnwindSafe(turn).catch_unwind().await {
                Ok(done) => done,
                Err(_) => (
                    None,
                    Err(SessionError::ContainerCrashed("session task panicked".to_string())),
                ),
            };
            let _ = reports.send(Report {
                lane: i,
                job_id,
                session,
                outcome,
            });
        });
    }

    fn on_report(&mut self, report: Report) {
        let Report {
            lane: i,
            job_id,
            session,
            outcome,
        } = report;
        self.lanes[i].slot = Slot::Empty;

        let Some(job) = self.lanes[i].jobs.front().cloned() else {
            warn!("Report for job {job_id} on an empty lane");
            return;
        };
        if job.id != job_id {
            warn!("Report for job {job_id} does not match lane head {}", job.id);
            return;
        }

        let mut session = session;
        let alive = session.as_mut().is_some_and(|s| s.is_alive());

        match outcome {
            Ok(outcome) => {
                self.lanes[i].jobs.pop_front();
                if alive {
                    if let Some(session) = session.take() {
                        self.lanes[i].slot = Slot::Idle(session);
                    }
                }
                let status = match outcome.status {
                    ResultStatus::Success => {
                        self.completed += 1;
                        JobStatus::Succeeded
                    }
                    ResultStatus::Error => {
                        self.failed += 1;
                        JobStatus::Failed
                    }
                };
                self.emit_job(&job, status, outcome.text);
            }
            Err(SessionError::Killed) => {
                // Left at the head; delivered again if the queue keeps running
                warn!(workspace = %job.workspace_id, "Session killed while running job {}", job.id);
            }
            Err(e) if e.is_retryable() && !self.settings.backoff.exceeded_max_attempts(job.attempts) => {
                let delay = self.settings.backoff.delay_after(job.attempts);
                warn!(
                    workspace = %job.workspace_id,
                    "Job {} failed on attempt {}: {e}; retrying in {delay:?}",
                    job.id,
                    job.attempts
                );
                self.lanes[i].retry_at = Some(Instant::now() + delay);
                self.emit_job(&job, JobStatus::Retrying, Some(e.to_string()));
            }
            Err(e) => {
                self.lanes[i].jobs.pop_front();
                self.failed += 1;
                self.emit_job(&job, JobStatus::Failed, Some(e.to_string()));
            }
        }

        if let Some(mut session) = session {
            self.stopping.spawn(async move { session.stop(false).await });
        }
    }

    /// Earliest idle expiry or retry time.
    fn next_wake(&self) -> Option<Instant> {
        let now = Instant::now();
        self.lanes
            .iter()
            .flat_map(|lane| {
                let idle = match &lane.slot {
                    Slot::Idle(session) => session.idle_deadline(),
                    _ => None,
                };
                let retry = lane.retry_at.filter(|at| *at > now && !lane.jobs.is_empty());
                [idle, retry]
            })
            .flatten()
            .min()
    }

    fn expire_idle(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .lanes
            .iter()
            .enumerate()
            .filter_map(|(i, lane)| match &lane.slot {
                Slot::Idle(session) if session.idle_deadline().is_some_and(|d| d <= now) => Some(i),
                _ => None,
            })
            .collect();
        for i in expired {
            self.retire(i, "idle timeout");
        }
    }

    /// Stops lane `i`'s idle session in the background.
    fn retire(&mut self, i: usize, reason: &str) {
        if let Slot::Idle(mut session) = std::mem::replace(&mut self.lanes[i].slot, Slot::Empty) {
            info!(workspace = %self.lanes[i].workspace.id, session = %session.id(), "Stopping idle session: {reason}");
            self.stopping.spawn(async move { session.stop(true).await });
        }
    }

    async fn drain(&mut self) {
        self.closed = true;
        let mut running = 0;
        for i in 0..self.lanes.len() {
            match std::mem::replace(&mut self.lanes[i].slot, Slot::Empty) {
                Slot::Idle(mut session) => {
                    self.stopping.spawn(async move { session.stop(true).await });
                }
                Slot::Busy(handle) => {
                    handle.kill().await;
                    running += 1;
                }
                Slot::Empty => {}
            }
        }
        while running > 0 {
            let Some(report) = self.reports.recv().await else {
                break;
            };
            running -= 1;
            if let Some(mut session) = report.session {
                session.stop(false).await;
            }
        }
        while self.stopping.join_next().await.is_some() {}

        let undelivered: usize = self.lanes.iter().map(|l| l.jobs.len()).sum();
        if undelivered > 0 {
            warn!("Shutting down with {undelivered} undelivered job(s)");
        }
    }

    fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            completed: self.completed,
            failed: self.failed,
            closed: self.closed,
            ..QueueStatus::default()
        };
        for lane in &self.lanes {
            let running = matches!(lane.slot, Slot::Busy(_));
            status.running += usize::from(running);
            status.idle += usize::from(matches!(lane.slot, Slot::Idle(_)));
            status
                .queued
                .insert(lane.workspace.id.clone(), lane.jobs.len() - usize::from(running));
        }
        status
    }

    fn emit_job(&self, job: &Job, status: JobStatus, detail: Option<String>) {
        self.ctx.sink.emit(&ObservedEvent::Job {
            job_id: job.id.clone(),
            workspace_id: job.workspace_id.clone(),
            status,
            attempt: job.attempts,
            detail,
        });
    }
}

async fn run_job(
    workspace: Arc<Workspace>,
    job: Job,
    session: Option<Box<Session>>,
    handle: SessionHandle,
    credentials: Arc<Credentials>,
    ctx: SessionContext,
) -> (Option<Box<Session>>, Result<TurnOutcome, SessionError>) {
    let mut session = match session {
        Some(session) => session,
        None => match Session::start(workspace.clone(), &workspace.mounts, &credentials, handle, ctx).await {
            Ok(session) => Box::new(session),
            Err(e) => return (None, Err(e)),
        },
    };
    let outcome = session.run_turn(&job.id, &job.payload).await;
    (Some(session), outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::dispatcher::Dispatcher;
    use crate::observe::MemorySink;
    use crate::sandbox::mounts::{AllowedRoot, MountMode, MountSpec};
    use crate::sandbox::SessionState;
    use crate::test_support::{session_context, sh_launcher, workspace};
    use std::path::PathBuf;
    use std::time::Duration;

    const AGENT: &str = r#"
while read -r line; do
  case "$line" in
    *'"close"'*) exit 0 ;;
    *'"prompt"'*) sleep 0.1; echo '{"type":"result","status":"success","text":"ok"}' ;;
  esac
done
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        sink: Arc<MemorySink>,
        queue: GroupQueue,
    }

    fn fixture(script: &str, workspaces: Vec<Workspace>, max_concurrent: usize, max_attempts: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let ctx = session_context(
            sh_launcher(script),
            Arc::new(Dispatcher::new()),
            sink.clone(),
            dir.path(),
        );
        let settings = QueueSettings {
            max_concurrent,
            backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(50), 2, max_attempts),
        };
        let queue = GroupQueue::start(workspaces, Credentials::default(), ctx, settings);
        Fixture {
            _dir: dir,
            sink,
            queue,
        }
    }

    async fn settle(queue: &GroupQueue, finished: u64) -> QueueStatus {
        for _ in 0..500 {
            let status = queue.status().await.unwrap();
            if status.completed + status.failed >= finished {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("jobs did not finish: {:?}", queue.status().await);
    }

    fn with_status(sink: &MemorySink, wanted: JobStatus) -> Vec<String> {
        sink.jobs()
            .into_iter()
            .filter(|(_, status)| *status == wanted)
            .map(|(id, _)| id)
            .collect()
    }

    #[tokio::test]
    async fn test_same_workspace_runs_in_order_on_one_session() {
        let f = fixture(AGENT, vec![workspace("main")], 1, 3);
        let j1 = f.queue.enqueue("main", "first", 0).unwrap();
        let j2 = f.queue.enqueue("main", "second", 0).unwrap();

        let status = settle(&f.queue, 2).await;

        // J2 is admitted only once J1's turn has parked the session, and it
        // runs on that session without a respawn
        let events = f.sink.events();
        let first_idle = events
            .iter()
            .position(|e| matches!(e, ObservedEvent::Lifecycle { state: SessionState::Idle, .. }))
            .unwrap();
        let j2_admitted = events
            .iter()
            .position(|e| {
                matches!(e, ObservedEvent::Job { job_id, status: JobStatus::Admitted, .. } if *job_id == j2)
            })
            .unwrap();
        assert!(first_idle < j2_admitted);
        assert_eq!(
            f.sink.lifecycle(),
            vec![
                SessionState::Starting,
                SessionState::Running,
                SessionState::Idle,
                SessionState::Running,
                SessionState::Idle,
            ]
        );

        assert_eq!(status.completed, 2);
        assert_eq!(status.idle, 1);
        assert_eq!(
            f.sink.jobs(),
            vec![
                (j1.clone(), JobStatus::Admitted),
                (j1, JobStatus::Succeeded),
                (j2.clone(), JobStatus::Admitted),
                (j2, JobStatus::Succeeded),
            ]
        );
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_wins_and_idle_session_yields_slot() {
        let f = fixture(AGENT, vec![workspace("a"), workspace("b"), workspace("c")], 1, 3);
        let a1 = f.queue.enqueue("a", "x", 0).unwrap();
        let b1 = f.queue.enqueue("b", "x", 0).unwrap();
        let c1 = f.queue.enqueue("c", "x", 5).unwrap();

        settle(&f.queue, 3).await;
        assert_eq!(with_status(&f.sink, JobStatus::Admitted), vec![a1, c1, b1]);
        // Idle sessions of a and c were stopped to make room
        let stopped = f
            .sink
            .lifecycle()
            .into_iter()
            .filter(|s| *s == SessionState::Stopped)
            .count();
        assert_eq!(stopped, 2);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_robin_between_equal_workspaces() {
        let f = fixture(AGENT, vec![workspace("a"), workspace("b")], 1, 3);
        let a1 = f.queue.enqueue("a", "x", 0).unwrap();
        let a2 = f.queue.enqueue("a", "x", 0).unwrap();
        let b1 = f.queue.enqueue("b", "x", 0).unwrap();

        settle(&f.queue, 3).await;
        assert_eq!(with_status(&f.sink, JobStatus::Admitted), vec![a1, b1, a2]);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_respected() {
        let workspaces = ["w1", "w2", "w3", "w4", "w5"].map(workspace).to_vec();
        let f = fixture(AGENT, workspaces, 2, 3);
        for id in ["w1", "w2", "w3", "w4", "w5"] {
            f.queue.enqueue(id, "x", 0).unwrap();
        }

        let mut peak = 0;
        for _ in 0..500 {
            let status = f.queue.status().await.unwrap();
            assert!(status.running + status.idle <= 2, "{status:?}");
            peak = peak.max(status.running);
            if status.completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.queue.status().await.unwrap().completed, 5);
        assert_eq!(peak, 2);

        let mut running = 0i32;
        for (_, status) in f.sink.jobs() {
            match status {
                JobStatus::Admitted => running += 1,
                _ => running -= 1,
            }
            assert!(running <= 2);
        }
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_is_retried_with_same_job() {
        let marker = tempfile::tempdir().unwrap();
        let mark = marker.path().join("crashed-once");
        let script = format!(
            r#"read -r line
if [ -f '{mark}' ]; then
  echo '{{"type":"result","status":"success"}}'
else
  touch '{mark}'
  exit 1
fi"#,
            mark = mark.display()
        );
        let f = fixture(&script, vec![workspace("main")], 1, 3);
        let job = f.queue.enqueue("main", "x", 0).unwrap();

        let status = settle(&f.queue, 1).await;
        assert_eq!(status.completed, 1);
        assert_eq!(
            f.sink.jobs(),
            vec![
                (job.clone(), JobStatus::Admitted),
                (job.clone(), JobStatus::Retrying),
                (job.clone(), JobStatus::Admitted),
                (job, JobStatus::Succeeded),
            ]
        );
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let f = fixture("read -r line; exit 1", vec![workspace("main")], 1, 2);
        let job = f.queue.enqueue("main", "x", 0).unwrap();

        let status = settle(&f.queue, 1).await;
        assert_eq!(status.failed, 1);
        assert_eq!(status.queued["main"], 0);
        assert_eq!(
            f.sink.jobs(),
            vec![
                (job.clone(), JobStatus::Admitted),
                (job.clone(), JobStatus::Retrying),
                (job.clone(), JobStatus::Admitted),
                (job, JobStatus::Failed),
            ]
        );
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_error_is_terminal() {
        let script = r#"
n=0
while read -r line; do
  case "$line" in
    *'"prompt"'*)
      n=$((n+1))
      if [ "$n" -eq 1 ]; then
        echo '{"type":"result","status":"error","text":"cannot do that"}'
      else
        echo '{"type":"result","status":"success"}'
      fi ;;
    *) exit 0 ;;
  esac
done
"#;
        let f = fixture(script, vec![workspace("main")], 1, 3);
        let j1 = f.queue.enqueue("main", "x", 0).unwrap();
        let j2 = f.queue.enqueue("main", "y", 0).unwrap();

        let status = settle(&f.queue, 2).await;
        assert_eq!((status.completed, status.failed), (1, 1));
        assert_eq!(with_status(&f.sink, JobStatus::Failed), vec![j1]);
        assert_eq!(with_status(&f.sink, JobStatus::Succeeded), vec![j2]);
        assert!(with_status(&f.sink, JobStatus::Retrying).is_empty());
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_mount_rejection_fails_job_once() {
        let mut ws = workspace("main");
        ws.mount_allowlist = vec![AllowedRoot {
            path: PathBuf::from("/home/user/project"),
            read_write: false,
        }];
        ws.mounts = vec![MountSpec {
            host_path: PathBuf::from("/etc"),
            container_path: PathBuf::from("/workspace/etc"),
            mode: MountMode::Ro,
        }];
        let f = fixture(AGENT, vec![ws], 1, 3);
        let job = f.queue.enqueue("main", "x", 0).unwrap();

        let status = settle(&f.queue, 1).await;
        assert_eq!(status.failed, 1);
        assert_eq!(
            f.sink.jobs(),
            vec![(job.clone(), JobStatus::Admitted), (job, JobStatus::Failed)]
        );
        assert!(f.sink.lifecycle().is_empty());
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_session_stopped_after_timeout() {
        let mut ws = workspace("main");
        ws.idle_timeout = Duration::from_millis(100);
        let f = fixture(AGENT, vec![ws], 1, 3);
        f.queue.enqueue("main", "x", 0).unwrap();
        settle(&f.queue, 1).await;

        for _ in 0..200 {
            if f.sink.lifecycle().last() == Some(&SessionState::Stopped) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.sink.lifecycle().last(), Some(&SessionState::Stopped));
        assert_eq!(f.queue.status().await.unwrap().idle, 0);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_validation_and_shutdown() {
        let f = fixture(AGENT, vec![workspace("main")], 1, 3);
        assert_eq!(
            f.queue.enqueue("nope", "x", 0),
            Err(QueueError::UnknownWorkspace("nope".to_string()))
        );

        f.queue.shutdown().await;
        assert_eq!(f.queue.enqueue("main", "x", 0), Err(QueueError::QueueClosed));
        assert_eq!(f.queue.status().await, Err(QueueError::QueueClosed));
        // Idempotent
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_session() {
        let f = fixture("read -r line; exec sleep 30", vec![workspace("main")], 1, 3);
        f.queue.enqueue("main", "x", 0).unwrap();
        for _ in 0..200 {
            if f.queue.status().await.unwrap().running == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), f.queue.shutdown())
            .await
            .unwrap();
        assert_eq!(f.sink.lifecycle().last(), Some(&SessionState::Stopped));
        // Never reported done
        assert!(with_status(&f.sink, JobStatus::Succeeded).is_empty());
        assert!(with_status(&f.sink, JobStatus::Failed).is_empty());
    }
}
