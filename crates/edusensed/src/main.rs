use anyhow::{Context, Result};
use edusense_core::{EmotionClassifier, FaceAnalyzer, FerPlusClassifier};
use edusense_engine::{BusKind, Config, Engine, EngineDeps, SqliteStore};
use edusense_media::FrameExtractor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod dbus_interface;

use dbus_interface::{AttendanceService, DaemonInfo};

const BUS_NAME: &str = "org.edusense.Attendance1";
const OBJECT_PATH: &str = "/org/edusense/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("edusensed starting");

    let config = Config::from_env().context("invalid configuration")?;

    // Models load once here and are shared by every task; a missing model is fatal.
    let analyzer = FaceAnalyzer::load(&config.detector_model_path(), &config.recognizer_model_path())
        .context("loading face models")?;

    let emotion: Option<Arc<dyn EmotionClassifier>> = if config.emotion_enabled {
        match FerPlusClassifier::load(&config.emotion_model_path()) {
            Ok(classifier) => Some(Arc::new(classifier)),
            Err(e) => {
                tracing::warn!(error = %e, "emotion model unavailable; continuing without emotion labels");
                None
            }
        }
    } else {
        None
    };

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening attendance store at {}", config.db_path.display()))?;

    let info = DaemonInfo {
        model_dir: config.model_dir.display().to_string(),
        db_path: config.db_path.display().to_string(),
        similarity_threshold: config.similarity_threshold,
        sample_rate_hz: config.sample_rate_hz,
        worker_pool_size: config.worker_pool_size,
        emotion_loaded: emotion.is_some(),
    };

    let engine = Engine::new(
        &config,
        EngineDeps {
            extractor: Arc::new(analyzer),
            store: Arc::new(store),
            frames: frame_extractor(&config),
            emotion,
        },
    )?;

    let service = AttendanceService { engine, info };
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("claiming {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "edusensed ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("edusensed shutting down");

    Ok(())
}

#[cfg(not(feature = "ffmpeg-native"))]
fn frame_extractor(config: &Config) -> Arc<dyn FrameExtractor> {
    tracing::info!(ffmpeg = %config.ffmpeg.display(), "decoding video with the ffmpeg binary");
    Arc::new(edusense_media::FfmpegExtractor::new(config.ffmpeg.clone()))
}

#[cfg(feature = "ffmpeg-native")]
fn frame_extractor(_config: &Config) -> Arc<dyn FrameExtractor> {
    tracing::info!("decoding video in process");
    Arc::new(edusense_media::LibavExtractor)
}
