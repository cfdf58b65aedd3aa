use crate::attendance::{AttendancePolicy, SessionPipeline, SessionTally};
use crate::config::{Config, ConfigError};
use crate::error::PipelineError;
use crate::identity_key::IdentityKeyExtractor;
use crate::registration::BulkRegistrar;
use crate::staged::StagedFile;
use crate::store::{AttendanceStore, StoreError};
use crate::tasks::{Retention, TaskId, TaskKind, TaskManager, TaskOutput, TaskSnapshot};
use edusense_core::{EmotionClassifier, FaceExtractor};
use edusense_media::FrameExtractor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Retention ages above this (about a century) are clamped.
const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Long-lived collaborators handed to the engine at startup.
pub struct EngineDeps {
    pub extractor: Arc<dyn FaceExtractor>,
    pub store: Arc<dyn AttendanceStore>,
    pub frames: Arc<dyn FrameExtractor>,
    pub emotion: Option<Arc<dyn EmotionClassifier>>,
}

/// Upload size limits checked before a task is queued.
#[derive(Debug, Clone, Copy)]
struct IntakeLimits {
    min_archive_bytes: u64,
    max_archive_bytes: u64,
    max_video_bytes: u64,
}

struct EngineInner {
    tasks: TaskManager,
    store: Arc<dyn AttendanceStore>,
    sessions: Arc<SessionPipeline>,
    registrar: Arc<BulkRegistrar>,
    limits: IntakeLimits,
}

/// Entry point for everything the daemon exposes: intake, polling, tallies.
///
/// Cheap to clone. Submissions return a task id immediately; the work runs
/// on the task manager's worker pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: &Config, deps: EngineDeps) -> Result<Self, ConfigError> {
        let keys = IdentityKeyExtractor::new(&config.identity_pattern)?;
        let policy = AttendancePolicy {
            threshold: config.similarity_threshold,
            min_appearances: config.min_appearances,
            emotion_enabled: config.emotion_enabled && deps.emotion.is_some(),
        };
        if config.emotion_enabled && deps.emotion.is_none() {
            tracing::warn!("emotion analysis enabled but no classifier loaded; dominant emotions stay empty");
        }

        let sessions = SessionPipeline {
            extractor: deps.extractor.clone(),
            frames: deps.frames,
            store: deps.store.clone(),
            emotion: deps.emotion,
            policy,
            sample_rate_hz: config.sample_rate_hz,
            evidence_dir: config.evidence_dir.clone(),
        };
        let registrar = BulkRegistrar::new(deps.extractor, deps.store.clone(), keys)
            .with_limits(config.max_entry_bytes, config.scratch_dir.clone());
        let retention = Retention {
            max_finished: config.task_history,
            max_age: chrono::Duration::seconds(config.task_retention_secs.min(MAX_RETENTION_SECS) as i64),
        };

        tracing::info!(
            threshold = policy.threshold,
            min_appearances = policy.min_appearances,
            sample_rate_hz = config.sample_rate_hz,
            workers = config.worker_pool_size,
            "engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                tasks: TaskManager::with_retention(config.worker_pool_size, retention),
                store: deps.store,
                sessions: Arc::new(sessions),
                registrar: Arc::new(registrar),
                limits: IntakeLimits {
                    min_archive_bytes: config.min_archive_bytes,
                    max_archive_bytes: config.max_archive_bytes,
                    max_video_bytes: config.max_video_bytes,
                },
            }),
        })
    }

    /// Queue attendance processing of `video` for `session_id`.
    ///
    /// The video is read in place and left on disk.
    pub fn submit_video(&self, session_id: &str, video: &Path) -> Result<TaskId, PipelineError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(PipelineError::InputRejected("session id is empty".into()));
        }
        let size = file_size(video)?;
        if size == 0 {
            return Err(PipelineError::InputRejected(format!("{} is empty", video.display())));
        }
        if size > self.inner.limits.max_video_bytes {
            return Err(PipelineError::InputRejected(format!(
                "video is {size} bytes, limit is {}",
                self.inner.limits.max_video_bytes
            )));
        }

        let sessions = self.inner.sessions.clone();
        let session = session_id.to_string();
        let video: PathBuf = video.to_path_buf();
        let id = self.inner.tasks.submit(TaskKind::VideoAttendance, move |ctx| {
            sessions.run(ctx, &session, &video).map(TaskOutput::Attendance)
        });
        tracing::info!(task_id = %id, session_id, bytes = size, "video accepted");
        Ok(id)
    }

    /// Queue bulk registration from a ZIP archive.
    ///
    /// The archive is deleted once the task ends, or right away if it is rejected.
    pub fn submit_archive(&self, archive: StagedFile) -> Result<TaskId, PipelineError> {
        let size = file_size(archive.path())?;
        let limits = self.inner.limits;
        if size < limits.min_archive_bytes || size > limits.max_archive_bytes {
            return Err(PipelineError::InputRejected(format!(
                "archive is {size} bytes, allowed range is {}..={} bytes",
                limits.min_archive_bytes, limits.max_archive_bytes
            )));
        }

        let registrar = self.inner.registrar.clone();
        let id = self.inner.tasks.submit(TaskKind::BulkRegistration, move |ctx| {
            registrar.process_archive(ctx, archive).map(TaskOutput::Registration)
        });
        tracing::info!(task_id = %id, bytes = size, "archive accepted");
        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.tasks.status(id)
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.inner.tasks.list()
    }

    pub fn cancel(&self, id: TaskId) -> Option<bool> {
        self.inner.tasks.cancel(id)
    }

    pub async fn wait(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.tasks.wait(id).await
    }

    pub fn tallies(&self, session_id: &str) -> Result<Vec<SessionTally>, StoreError> {
        self.inner.store.tallies(session_id)
    }

    pub fn override_tally(
        &self,
        session_id: &str,
        identity_id: &str,
        note: Option<&str>,
    ) -> Result<SessionTally, StoreError> {
        self.inner.store.override_tally(session_id, identity_id, note)
    }

    pub fn flag_dispute(&self, session_id: &str, identity_id: &str, note: &str) -> Result<SessionTally, StoreError> {
        self.inner.store.flag_dispute(session_id, identity_id, note)
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.inner.store
    }
}

fn file_size(path: &Path) -> Result<u64, PipelineError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(PipelineError::InputRejected(format!("{} is not a file", path.display()))),
        Err(e) => Err(PipelineError::InputRejected(format!("{}: {e}", path.display()))),
    }
}
