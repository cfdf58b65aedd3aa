use std::path::{Path, PathBuf};

/// An uploaded file handed to the engine.
///
/// Owned files are deleted when the value is dropped, so an upload is removed
/// whether its task succeeds, fails, is cancelled or is never started.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    owned: bool,
}

impl StagedFile {
    /// Take ownership of `path`; it is deleted on drop.
    pub fn owned(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: true,
        }
    }

    /// Refer to `path` without taking ownership.
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "staged file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "cannot remove staged file"),
        }
    }
}
