//! Background task lifecycle: queue, bounded execution, progress, cancellation.
//!
//! ```text
//! queued ──▶ running ──▶ succeeded
//!   │           ├──────▶ failed
//!   └───────────┴──────▶ cancelled
//! ```
//!
//! Terminal states are final. Each task's pipeline runs at most once, on a
//! blocking worker thread, with at most `worker_pool_size` pipelines running
//! at the same time. Finished tasks are forgotten once they exceed the
//! [`Retention`] count or age; queued and running tasks are always kept.

use crate::attendance::SessionReport;
use crate::error::{ErrorCategory, PipelineError, PipelineFailure};
use crate::registration::RegistrationSummary;
use chrono::{DateTime, Utc};
use edusense_media::StopSignal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(TaskId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    VideoAttendance,
    BulkRegistration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// What a finished pipeline produced.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Attendance(SessionReport),
    Registration(RegistrationSummary),
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub category: ErrorCategory,
    pub message: String,
}

/// Point-in-time view of a task, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: f32,
    pub result: Option<TaskOutput>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The same flag, as seen by a frame decoder.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal::new(self.0.clone())
    }
}

/// Fraction in [0, 1] that only moves forward. Stored as f32 bits.
#[derive(Debug, Default)]
struct Progress(AtomicU32);

impl Progress {
    fn advance(&self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
            (value > f32::from_bits(bits)).then_some(value.to_bits())
        });
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::SeqCst))
    }
}

/// Handle a running pipeline uses to report progress and observe cancellation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancelToken,
    progress: Arc<Progress>,
}

impl TaskContext {
    /// A context not tracked by any manager.
    pub fn detached() -> Self {
        Self {
            id: TaskId::new(),
            cancel: CancelToken::default(),
            progress: Arc::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop here if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            tracing::info!(task_id = %self.id, "cancellation observed");
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report `done` of `total` units processed. Never moves progress backwards.
    pub fn set_progress(&self, done: u64, total: u64) {
        let fraction = if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        };
        self.progress.advance(fraction as f32);
    }

    pub fn progress(&self) -> f32 {
        self.progress.get()
    }
}

struct TaskEntry {
    kind: TaskKind,
    status: watch::Sender<TaskStatus>,
    ctx: TaskContext,
    result: Option<TaskOutput>,
    error: Option<TaskError>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn current(&self) -> TaskStatus {
        *self.status.borrow()
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.ctx.id,
            kind: self.kind,
            status: self.current(),
            progress: self.ctx.progress(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// How long finished tasks stay queryable.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// Finished tasks kept, newest first.
    pub max_finished: usize,
    pub max_age: chrono::Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_finished: 500,
            max_age: chrono::Duration::hours(24),
        }
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
}

impl Registry {
    /// Drop finished tasks that are older than `retention.max_age` or beyond
    /// the newest `retention.max_finished`.
    fn prune(&mut self, retention: &Retention, now: DateTime<Utc>) {
        let cutoff = now - retention.max_age;
        let mut finished: Vec<(DateTime<Utc>, usize, TaskId)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| Some((self.tasks.get(id)?.finished_at?, pos, *id)))
            .collect();
        finished.sort_unstable_by(|a, b| b.cmp(a));

        let mut forgotten = 0;
        for (rank, (finished_at, _, id)) in finished.into_iter().enumerate() {
            if rank >= retention.max_finished || finished_at < cutoff {
                self.tasks.remove(&id);
                forgotten += 1;
            }
        }
        if forgotten > 0 {
            let tasks = &self.tasks;
            self.order.retain(|id| tasks.contains_key(id));
            tracing::debug!(forgotten, kept = self.order.len(), "pruned finished tasks");
        }
    }
}

struct Inner {
    registry: Mutex<Registry>,
    pool: Arc<Semaphore>,
    retention: Retention,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// queued → running. False if the task already left `queued`.
    fn start(&self, id: TaskId) -> bool {
        let mut registry = self.registry();
        let Some(entry) = registry.tasks.get_mut(&id) else {
            return false;
        };
        if entry.current() != TaskStatus::Queued {
            return false;
        }
        entry.started_at = Some(Utc::now());
        entry.status.send_replace(TaskStatus::Running);
        true
    }

    fn finish(&self, id: TaskId, outcome: Result<TaskOutput, PipelineFailure>) {
        let mut registry = self.registry();
        let Some(entry) = registry.tasks.get_mut(&id) else {
            return;
        };
        if entry.current().is_terminal() {
            return;
        }

        let status = match outcome {
            Ok(output) => {
                entry.ctx.progress.advance(1.0);
                entry.result = Some(output);
                TaskStatus::Succeeded
            }
            Err(failure) if failure.error.is_cancelled() => TaskStatus::Cancelled,
            Err(failure) => {
                tracing::warn!(task_id = %id, error = %failure.error, "task failed");
                entry.error = Some(TaskError {
                    category: failure.error.category(),
                    message: failure.error.to_string(),
                });
                entry.result = failure.partial;
                TaskStatus::Failed
            }
        };
        let now = Utc::now();
        entry.finished_at = Some(now);
        entry.status.send_replace(status);
        tracing::info!(task_id = %id, kind = ?entry.kind, ?status, "task finished");
        registry.prune(&self.retention, now);
    }
}

/// Owns every task's state machine and the worker pool that runs them.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(worker_pool_size: usize) -> Self {
        Self::with_retention(worker_pool_size, Retention::default())
    }

    pub fn with_retention(worker_pool_size: usize, retention: Retention) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
                retention,
            }),
        }
    }

    /// Queue `job` and return its id immediately.
    ///
    /// Must be called from within a Tokio runtime. The job is dropped without
    /// running if the task is cancelled while still queued.
    pub fn submit<F>(&self, kind: TaskKind, job: F) -> TaskId
    where
        F: FnOnce(&TaskContext) -> Result<TaskOutput, PipelineFailure> + Send + 'static,
    {
        let ctx = TaskContext::detached();
        let id = ctx.id;
        let (status, mut status_rx) = watch::channel(TaskStatus::Queued);
        {
            let mut registry = self.inner.registry();
            registry.tasks.insert(
                id,
                TaskEntry {
                    kind,
                    status,
                    ctx: ctx.clone(),
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                },
            );
            registry.order.push(id);
        }
        tracing::info!(task_id = %id, ?kind, "task queued");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let pool = inner.pool.clone();
            let permit = tokio::select! {
                permit = pool.acquire_owned() => permit,
                _ = status_rx.wait_for(TaskStatus::is_terminal) => {
                    tracing::debug!(task_id = %id, "dropping cancelled task before start");
                    return;
                }
            };
            let Ok(_permit) = permit else {
                inner.finish(id, Err(PipelineError::Internal("worker pool closed".into()).into()));
                return;
            };
            if !inner.start(id) {
                return;
            }
            tracing::info!(task_id = %id, "task running");

            let outcome = tokio::task::spawn_blocking(move || job(&ctx))
                .await
                .unwrap_or_else(|e| Err(PipelineError::Internal(format!("pipeline panicked: {e}")).into()));
            inner.finish(id, outcome);
        });

        id
    }

    /// `None` for an unknown id, including finished tasks already forgotten.
    pub fn status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.registry().tasks.get(&id).map(TaskEntry::snapshot)
    }

    /// Every task, oldest first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let registry = self.inner.registry();
        registry
            .order
            .iter()
            .filter_map(|id| registry.tasks.get(id))
            .map(TaskEntry::snapshot)
            .collect()
    }

    /// Request cancellation.
    ///
    /// Returns `None` for an unknown id and `Some(false)` if the task already
    /// finished. A queued task is cancelled at once; a running one stops at
    /// its next checkpoint.
    pub fn cancel(&self, id: TaskId) -> Option<bool> {
        let mut registry = self.inner.registry();
        let entry = registry.tasks.get_mut(&id)?;
        match entry.current() {
            TaskStatus::Queued => {
                let now = Utc::now();
                entry.ctx.cancel.cancel();
                entry.finished_at = Some(now);
                entry.status.send_replace(TaskStatus::Cancelled);
                tracing::info!(task_id = %id, "queued task cancelled");
                registry.prune(&self.inner.retention, now);
                Some(true)
            }
            TaskStatus::Running => {
                entry.ctx.cancel.cancel();
                tracing::info!(task_id = %id, "cancellation requested");
                Some(true)
            }
            _ => Some(false),
        }
    }

    /// Wait until the task reaches a terminal state.
    ///
    /// `None` if the id is unknown, or if the finished task was pruned
    /// before its snapshot could be taken.
    pub async fn wait(&self, id: TaskId) -> Option<TaskSnapshot> {
        let mut rx = {
            let registry = self.inner.registry();
            registry.tasks.get(&id)?.status.subscribe()
        };
        let _ = rx.wait_for(TaskStatus::is_terminal).await;
        self.status(id)
    }
}
