//! Bulk face registration from a ZIP archive of photos.
//!
//! Every photo yields an outcome. A photo that cannot be read, or that does
//! not show exactly one face, is recorded as failed and the batch continues.
//! Only archive-level and model/store problems end the run.

use crate::error::{PipelineError, PipelineFailure};
use crate::identity_key::{IdentityKeyExtractor, KeyStrategy};
use crate::staged::StagedFile;
use crate::store::{AttendanceStore, UpsertAction};
use crate::tasks::{TaskContext, TaskOutput};
use edusense_core::{decode_rgb, FaceExtractor};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use zip::ZipArchive;

/// Photo formats accepted from an archive.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Why a photo was not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UnreadableImage,
    NoFaceDetected,
    MultipleFaces(usize),
    /// Uncompressed entry exceeds the per-entry cap (bytes).
    TooLarge(u64),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnreadableImage => f.write_str("unreadable image"),
            FailureReason::NoFaceDetected => f.write_str("no face detected"),
            FailureReason::MultipleFaces(n) => write!(f, "multiple faces detected ({n})"),
            FailureReason::TooLarge(cap) => write!(f, "image larger than {cap} bytes"),
        }
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Result of registering one archive entry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub identity_key: String,
    pub filename: String,
    pub status: OutcomeStatus,
    pub error_reason: Option<FailureReason>,
    pub faces_detected: usize,
    pub key_source: KeyStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<UpsertAction>,
}

impl RegistrationOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationSummary {
    pub total_processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub created_count: usize,
    pub updated_count: usize,
    pub processing_time_seconds: f64,
    pub results: Vec<RegistrationOutcome>,
}

impl RegistrationSummary {
    fn new(results: Vec<RegistrationOutcome>, started: Instant) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let count_action = |action| results.iter().filter(|r| r.action == Some(action)).count();
        Self {
            total_processed: results.len(),
            success_count,
            failed_count: results.len() - success_count,
            created_count: count_action(UpsertAction::Created),
            updated_count: count_action(UpsertAction::Updated),
            processing_time_seconds: started.elapsed().as_secs_f64(),
            results,
        }
    }
}

/// One lock per key, alive only while someone holds or waits on it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Keys with a live lock.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

/// An archive entry staged on disk, or the reason it could not be.
struct StagedEntry {
    filename: String,
    path: Result<PathBuf, FailureReason>,
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if let Ok(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "cannot remove staged entry");
            }
        }
    }
}

/// An open registration archive whose photos are staged one at a time.
struct ArchiveEntries {
    zip: ZipArchive<File>,
    max_entry_bytes: u64,
}

impl ArchiveEntries {
    fn open(archive: &Path, max_entry_bytes: u64) -> Result<Self, PipelineError> {
        let file = File::open(archive).map_err(|e| PipelineError::Archive(format!("{}: {e}", archive.display())))?;
        let zip = ZipArchive::new(file).map_err(|e| PipelineError::Archive(e.to_string()))?;
        Ok(Self { zip, max_entry_bytes })
    }

    /// Entries in the central directory, photos or not.
    fn len(&self) -> usize {
        self.zip.len()
    }

    /// Extract entry `index` into `dir`. `None` for directories and non-photo entries.
    fn stage(&mut self, index: usize, dir: &Path) -> Option<StagedEntry> {
        let mut item = match self.zip.by_index(index) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(index, error = %e, "unreadable archive entry");
                return Some(StagedEntry {
                    filename: format!("entry #{index}"),
                    path: Err(FailureReason::UnreadableImage),
                });
            }
        };
        if item.is_dir() {
            return None;
        }
        let filename = item.name().to_string();
        let Some(name) = item.enclosed_name() else {
            tracing::warn!(filename = %filename, "skipping entry with unsafe path");
            return None;
        };
        if is_metadata(&name) || !is_supported(&name) {
            tracing::debug!(filename = %filename, "skipping non-photo entry");
            return None;
        }

        let cap = self.max_entry_bytes;
        if item.size() > cap {
            tracing::warn!(filename = %filename, size = item.size(), cap, "archive entry too large");
            return Some(StagedEntry {
                filename,
                path: Err(FailureReason::TooLarge(cap)),
            });
        }

        // The declared size can lie, so the copy is capped as well.
        let base = name.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let dest = dir.join(format!("{index:06}_{base}"));
        let copied = File::create(&dest).and_then(|mut out| {
            let mut capped = (&mut item).take(cap.saturating_add(1));
            std::io::copy(&mut capped, &mut out)
        });
        let path = match copied {
            Ok(n) if n > cap => {
                tracing::warn!(filename = %filename, cap, "archive entry too large");
                let _ = std::fs::remove_file(&dest);
                Err(FailureReason::TooLarge(cap))
            }
            Ok(_) => Ok(dest),
            Err(e) => {
                tracing::warn!(filename = %filename, error = %e, "cannot extract archive entry");
                let _ = std::fs::remove_file(&dest);
                Err(FailureReason::UnreadableImage)
            }
        };
        Some(StagedEntry { filename, path })
    }
}

/// Archive → one embedding per identity key.
pub struct BulkRegistrar {
    pub extractor: Arc<dyn FaceExtractor>,
    pub store: Arc<dyn AttendanceStore>,
    pub keys: IdentityKeyExtractor,
    pub locks: KeyedLocks,
    /// Largest uncompressed photo staged from an archive.
    pub max_entry_bytes: u64,
    /// Parent of the per-task scratch directory; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
}

impl BulkRegistrar {
    pub fn new(extractor: Arc<dyn FaceExtractor>, store: Arc<dyn AttendanceStore>, keys: IdentityKeyExtractor) -> Self {
        Self {
            extractor,
            store,
            keys,
            locks: KeyedLocks::default(),
            max_entry_bytes: u64::MAX,
            scratch_dir: None,
        }
    }

    pub fn with_limits(mut self, max_entry_bytes: u64, scratch_dir: Option<PathBuf>) -> Self {
        self.max_entry_bytes = max_entry_bytes;
        self.scratch_dir = scratch_dir;
        self
    }

    /// Register every supported photo in `archive`, in archive order.
    ///
    /// Entries are staged one at a time and deleted once registered, so at
    /// most one photo sits in the scratch directory. The archive file (if
    /// owned) and the scratch directory are removed when this returns.
    /// Upserts committed before a cancellation stay.
    pub fn process_archive(&self, ctx: &TaskContext, archive: StagedFile) -> Result<RegistrationSummary, PipelineFailure> {
        let started = Instant::now();
        let mut builder = tempfile::Builder::new();
        builder.prefix("edusense-archive-");
        let scratch = match &self.scratch_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| PipelineError::Internal(format!("cannot create scratch directory: {e}")))?;

        let mut entries = ArchiveEntries::open(archive.path(), self.max_entry_bytes)?;
        let total = entries.len() as u64;
        tracing::info!(task_id = %ctx.id(), entries = total, "registering archive");
        ctx.set_progress(0, total);

        let mut results = Vec::new();
        for index in 0..entries.len() {
            ctx.checkpoint()?;
            if let Some(entry) = entries.stage(index, scratch.path()) {
                match self.register_entry(&entry) {
                    Ok(outcome) => results.push(outcome),
                    Err(error) => {
                        let partial = RegistrationSummary::new(results, started);
                        return Err(PipelineFailure::with_partial(error, TaskOutput::Registration(partial)));
                    }
                }
            }
            ctx.set_progress(index as u64 + 1, total);
        }
        drop(entries);
        drop(archive);

        let summary = RegistrationSummary::new(results, started);
        tracing::info!(
            task_id = %ctx.id(),
            succeeded = summary.success_count,
            failed = summary.failed_count,
            created = summary.created_count,
            updated = summary.updated_count,
            "archive registered"
        );
        Ok(summary)
    }

    fn register_entry(&self, entry: &StagedEntry) -> Result<RegistrationOutcome, PipelineError> {
        let key = self.keys.extract(&entry.filename);
        let outcome = |reason: Option<FailureReason>, faces: usize, action: Option<UpsertAction>| RegistrationOutcome {
            identity_key: key.value.clone(),
            filename: entry.filename.clone(),
            status: if reason.is_none() {
                OutcomeStatus::Success
            } else {
                OutcomeStatus::Failed
            },
            error_reason: reason,
            faces_detected: faces,
            key_source: key.source,
            action,
        };

        let path = match &entry.path {
            Ok(path) => path,
            Err(reason) => return Ok(outcome(Some(reason.clone()), 0, None)),
        };
        let Some(image) = read_image(path) else {
            tracing::warn!(filename = %entry.filename, "unreadable image");
            return Ok(outcome(Some(FailureReason::UnreadableImage), 0, None));
        };

        let mut detections = match self.extractor.extract(&image) {
            Ok(detections) => detections,
            Err(e) if e.is_item_level() => {
                return Ok(outcome(Some(FailureReason::UnreadableImage), 0, None));
            }
            Err(e) => return Err(PipelineError::Model(e)),
        };

        let faces = detections.len();
        let detection = match faces {
            0 => return Ok(outcome(Some(FailureReason::NoFaceDetected), 0, None)),
            1 => detections.remove(0),
            n => return Ok(outcome(Some(FailureReason::MultipleFaces(n)), n, None)),
        };

        let action = {
            let lock = self.locks.lock_for(&key.value);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.upsert_embedding(&key.value, &detection.embedding)?
        };
        tracing::info!(identity_id = %key.value, filename = %entry.filename, ?action, "face registered");
        Ok(outcome(None, 1, Some(action)))
    }
}

fn read_image(path: &Path) -> Option<image::RgbImage> {
    let bytes = std::fs::read(path).ok()?;
    decode_rgb(&bytes).ok()
}

fn is_supported(name: &Path) -> bool {
    name.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// macOS resource forks and Finder metadata that ride along in archives.
fn is_metadata(name: &Path) -> bool {
    name.components().any(|c| matches!(c, Component::Normal(s) if s == "__MACOSX"))
        || name
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("._"))
            .unwrap_or(false)
}
