use edusense_engine::{Engine, PipelineError, StagedFile, StoreError, TaskId, TaskStatus};
use std::path::Path;
use zbus::interface;

/// Facts about the running daemon reported by `Status`.
pub struct DaemonInfo {
    pub model_dir: String,
    pub db_path: String,
    pub similarity_threshold: f32,
    pub sample_rate_hz: f64,
    pub worker_pool_size: usize,
    pub emotion_loaded: bool,
}

/// D-Bus interface for the EduSense attendance daemon.
///
/// Bus name: org.edusense.Attendance1
/// Object path: /org/edusense/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceService {
    pub engine: Engine,
    pub info: DaemonInfo,
}

#[interface(name = "org.edusense.Attendance1")]
impl AttendanceService {
    /// Queue attendance processing of a lecture video. Returns the task id.
    async fn submit_video(&self, session_id: &str, video_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, video_path, "submit_video requested");
        let id = self
            .engine
            .submit_video(session_id, Path::new(video_path))
            .map_err(pipeline_error)?;
        Ok(id.to_string())
    }

    /// Queue bulk registration from a ZIP of photos. Returns the task id.
    ///
    /// With `remove_after` the daemon deletes the archive once it is done with it.
    async fn submit_archive(&self, archive_path: &str, remove_after: bool) -> zbus::fdo::Result<String> {
        tracing::info!(archive_path, remove_after, "submit_archive requested");
        let archive = if remove_after {
            StagedFile::owned(archive_path)
        } else {
            StagedFile::borrowed(archive_path)
        };
        let id = self.engine.submit_archive(archive).map_err(pipeline_error)?;
        Ok(id.to_string())
    }

    /// Snapshot of one task: status, progress and result or error.
    async fn task_status(&self, task_id: &str) -> zbus::fdo::Result<String> {
        let id = parse_task_id(task_id)?;
        let snapshot = self
            .engine
            .task(id)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown task {task_id}")))?;
        to_json(&snapshot)
    }

    /// Snapshots of every task since the daemon started, oldest first.
    async fn list_tasks(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.tasks())
    }

    /// Request cancellation. False if the task had already finished.
    async fn cancel_task(&self, task_id: &str) -> zbus::fdo::Result<bool> {
        let id = parse_task_id(task_id)?;
        tracing::info!(task_id, "cancel_task requested");
        self.engine
            .cancel(id)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown task {task_id}")))
    }

    /// Stored tallies of a session.
    async fn session_tallies(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let tallies = self.engine.tallies(session_id).map_err(store_error)?;
        to_json(&tallies)
    }

    /// Mark a student present by hand. An empty note keeps the existing one.
    async fn override_tally(&self, session_id: &str, identity_id: &str, note: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, identity_id, "override_tally requested");
        let note = (!note.is_empty()).then_some(note);
        let tally = self
            .engine
            .override_tally(session_id, identity_id, note)
            .map_err(store_error)?;
        to_json(&tally)
    }

    /// Flag a stored tally as disputed.
    async fn flag_dispute(&self, session_id: &str, identity_id: &str, note: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, identity_id, "flag_dispute requested");
        let tally = self
            .engine
            .flag_dispute(session_id, identity_id, note)
            .map_err(store_error)?;
        to_json(&tally)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let tasks = self.engine.tasks();
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_dir": self.info.model_dir,
            "db_path": self.info.db_path,
            "similarity_threshold": self.info.similarity_threshold,
            "sample_rate_hz": self.info.sample_rate_hz,
            "worker_pool_size": self.info.worker_pool_size,
            "emotion_loaded": self.info.emotion_loaded,
            "tasks": {
                "queued": count(TaskStatus::Queued),
                "running": count(TaskStatus::Running),
                "succeeded": count(TaskStatus::Succeeded),
                "failed": count(TaskStatus::Failed),
                "cancelled": count(TaskStatus::Cancelled),
            },
        })
        .to_string())
    }
}

fn parse_task_id(task_id: &str) -> zbus::fdo::Result<TaskId> {
    task_id
        .parse()
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad task id {task_id:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn pipeline_error(e: PipelineError) -> zbus::fdo::Error {
    match e {
        PipelineError::InputRejected(msg) => zbus::fdo::Error::InvalidArgs(msg),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    if e.is_unavailable() {
        tracing::error!(error = %e, "attendance store error");
        zbus::fdo::Error::Failed(e.to_string())
    } else {
        zbus::fdo::Error::InvalidArgs(e.to_string())
    }
}
