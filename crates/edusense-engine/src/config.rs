use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default identity key pattern: `A11.2025.16442`-style student numbers.
pub const DEFAULT_IDENTITY_PATTERN: &str = r"[A-Z]\d{2}\.\d{4}\.\d{5}";

const MIB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid identity pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(ConfigError::Invalid(format!("unknown bus {other:?}"))),
        }
    }
}

/// Engine and daemon configuration.
///
/// Resolved in three layers: built-in defaults, then the TOML file named by
/// `EDUSENSE_CONFIG` (if set), then individual `EDUSENSE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity at or above which a face matches an identity.
    pub similarity_threshold: f32,
    /// Frames sampled per second of video.
    pub sample_rate_hz: f64,
    /// Matched frames an identity needs to be marked present.
    pub min_appearances: u32,
    /// Run the expression classifier on matched faces.
    pub emotion_enabled: bool,
    /// Pipelines allowed to run at the same time.
    pub worker_pool_size: usize,
    pub min_archive_bytes: u64,
    pub max_archive_bytes: u64,
    pub max_video_bytes: u64,
    /// Largest uncompressed photo accepted from a registration archive.
    pub max_entry_bytes: u64,
    /// Parent of per-task scratch directories. Unset: the system temp directory.
    pub scratch_dir: Option<PathBuf>,
    /// Finished tasks remembered for status queries, newest first.
    pub task_history: usize,
    /// Seconds a finished task is remembered for.
    pub task_retention_secs: u64,
    /// Where evidence face crops are written. Unset: evidence is a frame reference only.
    pub evidence_dir: Option<PathBuf>,
    /// ffmpeg binary used for frame extraction.
    pub ffmpeg: PathBuf,
    /// Regex for identity keys embedded in registration photo file names.
    pub identity_pattern: String,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: edusense_core::default_model_dir(),
            db_path: edusense_core::default_data_dir().join("attendance.db"),
            similarity_threshold: edusense_core::DEFAULT_SIMILARITY_THRESHOLD,
            sample_rate_hz: edusense_media::DEFAULT_SAMPLE_RATE_HZ,
            min_appearances: 1,
            emotion_enabled: false,
            worker_pool_size: 2,
            min_archive_bytes: 1,
            max_archive_bytes: 500 * MIB,
            max_video_bytes: 2048 * MIB,
            max_entry_bytes: 50 * MIB,
            scratch_dir: None,
            task_history: 500,
            task_retention_secs: 24 * 60 * 60,
            evidence_dir: None,
            ffmpeg: PathBuf::from("ffmpeg"),
            identity_pattern: DEFAULT_IDENTITY_PATTERN.to_string(),
            bus: BusKind::Session,
        }
    }
}

/// Optional overrides read from the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    sample_rate_hz: Option<f64>,
    min_appearances: Option<u32>,
    emotion_enabled: Option<bool>,
    worker_pool_size: Option<usize>,
    min_archive_bytes: Option<u64>,
    max_archive_bytes: Option<u64>,
    max_video_bytes: Option<u64>,
    max_entry_bytes: Option<u64>,
    scratch_dir: Option<PathBuf>,
    task_history: Option<usize>,
    task_retention_secs: Option<u64>,
    evidence_dir: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
    identity_pattern: Option<String>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load configuration from defaults, `EDUSENSE_CONFIG` and `EDUSENSE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = lookup("EDUSENSE_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(&Env(lookup))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");

        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = file.$field { self.$field = v; } )*
            };
        }
        overlay!(
            model_dir,
            db_path,
            similarity_threshold,
            sample_rate_hz,
            min_appearances,
            emotion_enabled,
            worker_pool_size,
            min_archive_bytes,
            max_archive_bytes,
            max_video_bytes,
            max_entry_bytes,
            task_history,
            task_retention_secs,
            ffmpeg,
            identity_pattern,
            bus,
        );
        if file.evidence_dir.is_some() {
            self.evidence_dir = file.evidence_dir;
        }
        if file.scratch_dir.is_some() {
            self.scratch_dir = file.scratch_dir;
        }
        Ok(())
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, env: &Env<F>) -> Result<(), ConfigError> {
        if let Some(dir) = env.string("EDUSENSE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env.string("EDUSENSE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.similarity_threshold = env.f32("EDUSENSE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.sample_rate_hz = env.f64("EDUSENSE_SAMPLE_RATE_HZ", self.sample_rate_hz);
        self.min_appearances = env.u32("EDUSENSE_MIN_APPEARANCES", self.min_appearances);
        self.emotion_enabled = env.flag("EDUSENSE_EMOTION_ENABLED", self.emotion_enabled);
        self.worker_pool_size = env.usize("EDUSENSE_WORKER_POOL_SIZE", self.worker_pool_size);
        self.min_archive_bytes = env.u64("EDUSENSE_MIN_ARCHIVE_BYTES", self.min_archive_bytes);
        self.max_archive_bytes = env.u64("EDUSENSE_MAX_ARCHIVE_BYTES", self.max_archive_bytes);
        self.max_video_bytes = env.u64("EDUSENSE_MAX_VIDEO_BYTES", self.max_video_bytes);
        self.max_entry_bytes = env.u64("EDUSENSE_MAX_ENTRY_BYTES", self.max_entry_bytes);
        self.task_history = env.usize("EDUSENSE_TASK_HISTORY", self.task_history);
        self.task_retention_secs = env.u64("EDUSENSE_TASK_RETENTION_SECS", self.task_retention_secs);
        if let Some(dir) = env.string("EDUSENSE_SCRATCH_DIR") {
            self.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env.string("EDUSENSE_EVIDENCE_DIR") {
            self.evidence_dir = Some(PathBuf::from(dir));
        }
        if let Some(bin) = env.string("EDUSENSE_FFMPEG") {
            self.ffmpeg = PathBuf::from(bin);
        }
        if let Some(pattern) = env.string("EDUSENSE_IDENTITY_PATTERN") {
            self.identity_pattern = pattern;
        }
        if let Some(bus) = env.string("EDUSENSE_BUS") {
            self.bus = bus.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sample rate {} must be finite and > 0",
                self.sample_rate_hz
            )));
        }
        if self.min_appearances == 0 {
            return Err(ConfigError::Invalid("min_appearances must be at least 1".into()));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1".into()));
        }
        if self.min_archive_bytes > self.max_archive_bytes {
            return Err(ConfigError::Invalid(format!(
                "min_archive_bytes {} exceeds max_archive_bytes {}",
                self.min_archive_bytes, self.max_archive_bytes
            )));
        }
        if self.max_entry_bytes == 0 {
            return Err(ConfigError::Invalid("max_entry_bytes must be at least 1".into()));
        }
        regex::Regex::new(&self.identity_pattern)?;
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path(edusense_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_path(edusense_core::RECOGNIZER_MODEL_FILE)
    }

    /// Path to the FER+ expression model.
    pub fn emotion_model_path(&self) -> String {
        self.model_path(edusense_core::EMOTION_MODEL_FILE)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

/// Typed reads over an environment lookup. Unparseable values keep the current setting.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }),
            None => default,
        }
    }

    fn f32(&self, key: &str, default: f32) -> f32 {
        self.parse(key, default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key, default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key, default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.parse(key, default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key, default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key).map(|v| v.trim() != "0").unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.sample_rate_hz, 1.0);
        assert_eq!(config.min_appearances, 1);
        assert!(!config.emotion_enabled);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.min_archive_bytes, 1);
        assert_eq!(config.max_archive_bytes, 500 * 1024 * 1024);
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.evidence_dir.is_none());
        assert_eq!(config.max_entry_bytes, 50 * 1024 * 1024);
        assert_eq!(config.task_history, 500);
        assert_eq!(config.task_retention_secs, 86_400);
        assert!(config.scratch_dir.is_none());
        assert!(config.detector_model_path().ends_with("det_10g.onnx"));
        // Database and models share one data directory
        assert_eq!(config.db_path.parent(), config.model_dir.parent());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EDUSENSE_SIMILARITY_THRESHOLD", "0.45"),
            ("EDUSENSE_MIN_APPEARANCES", "3"),
            ("EDUSENSE_EMOTION_ENABLED", "1"),
            ("EDUSENSE_BUS", "system"),
            ("EDUSENSE_EVIDENCE_DIR", "/var/lib/edusense/evidence"),
            ("EDUSENSE_MAX_ENTRY_BYTES", "1048576"),
            ("EDUSENSE_SCRATCH_DIR", "/var/tmp/edusense"),
            ("EDUSENSE_TASK_HISTORY", "20"),
        ]))
        .unwrap();
        assert_eq!(config.max_entry_bytes, 1_048_576);
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/var/tmp/edusense")));
        assert_eq!(config.task_history, 20);
        assert_eq!(config.similarity_threshold, 0.45);
        assert_eq!(config.min_appearances, 3);
        assert!(config.emotion_enabled);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.evidence_dir, Some(PathBuf::from("/var/lib/edusense/evidence")));
    }

    #[test]
    fn test_unparseable_env_keeps_default() {
        let config = Config::from_lookup(lookup(&[("EDUSENSE_WORKER_POOL_SIZE", "lots")])).unwrap();
        assert_eq!(config.worker_pool_size, 2);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edusense.toml");
        std::fs::write(
            &path,
            "similarity_threshold = 0.5\nsample_rate_hz = 2.0\nidentity_pattern = '[A-Z]\\d{3}'\n",
        )
        .unwrap();

        let config = Config::from_lookup(lookup(&[
            ("EDUSENSE_CONFIG", path.to_str().unwrap()),
            ("EDUSENSE_SAMPLE_RATE_HZ", "0.5"),
        ]))
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.5);
        assert_eq!(config.sample_rate_hz, 0.5);
        assert_eq!(config.identity_pattern, r"[A-Z]\d{3}");
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edusense.toml");
        std::fs::write(&path, "camera_device = \"/dev/video0\"\n").unwrap();
        let err = Config::from_lookup(lookup(&[("EDUSENSE_CONFIG", path.to_str().unwrap())])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation() {
        for (key, value) in [
            ("EDUSENSE_SIMILARITY_THRESHOLD", "1.5"),
            ("EDUSENSE_SAMPLE_RATE_HZ", "0"),
            ("EDUSENSE_MIN_APPEARANCES", "0"),
            ("EDUSENSE_WORKER_POOL_SIZE", "0"),
            ("EDUSENSE_MIN_ARCHIVE_BYTES", "999999999999"),
            ("EDUSENSE_MAX_ENTRY_BYTES", "0"),
        ] {
            let err = Config::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{key}={value}");
        }

        let err = Config::from_lookup(lookup(&[("EDUSENSE_IDENTITY_PATTERN", "[unclosed")])).unwrap_err();
        assert!(matches!(err, ConfigError::Pattern(_)));

        let err = Config::from_lookup(lookup(&[("EDUSENSE_BUS", "starship")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
