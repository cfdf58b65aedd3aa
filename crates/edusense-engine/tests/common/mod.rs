//! Shared fixtures: a scripted face extractor and helpers to build frames and archives.
//!
//! Test images carry their own "faces": the red channel of pixel (0, 0) is
//! the number of faces, and the red channel of pixel (i + 1, 0) is the
//! identity index of face `i`. Identity `k` embeds as the `k`-th unit vector.

#![allow(dead_code)]

use edusense_core::{BoundingBox, Detection, Embedding, ExtractError, FaceExtractor};
use edusense_engine::{AttendanceStore, Config, Engine, EngineDeps, SqliteStore};
use edusense_media::{FrameDir, FrameExtractor, FrameSource, RawFrame, SampleError, StopSignal};
use image::{Rgb, RgbImage};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

pub const DIM: usize = 16;
/// Identity index never enrolled anywhere.
pub const STRANGER: u8 = 15;

pub fn unit(k: u8) -> Embedding {
    let mut values = vec![0.0; DIM];
    values[k as usize] = 1.0;
    Embedding::new(values)
}

pub fn student(k: u8) -> String {
    format!("A11.2025.{:05}", k)
}

/// Image showing one face per entry of `faces`.
pub fn scripted_image(faces: &[u8]) -> RgbImage {
    let mut img = RgbImage::from_pixel(32, 8, Rgb([0, 0, 0]));
    img.put_pixel(0, 0, Rgb([faces.len() as u8, 0, 0]));
    for (i, &k) in faces.iter().enumerate() {
        img.put_pixel(i as u32 + 1, 0, Rgb([k, 0, 0]));
    }
    img
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Pause point inside [`ScriptedExtractor`]: the N-th call reports in and waits.
struct Gate {
    at_call: usize,
    reached: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

pub struct GateHandle {
    pub reached: mpsc::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

#[derive(Default)]
pub struct ScriptedExtractor {
    calls: AtomicUsize,
    gate: Option<Gate>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the `at_call`-th extraction (0-based) until released.
    pub fn gated(at_call: usize) -> (Self, GateHandle) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let extractor = Self {
            calls: AtomicUsize::new(0),
            gate: Some(Gate {
                at_call,
                reached: Mutex::new(reached_tx),
                release: Mutex::new(release_rx),
            }),
        };
        (
            extractor,
            GateHandle {
                reached: reached_rx,
                release: release_tx,
            },
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceExtractor for ScriptedExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Detection>, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if gate.at_call == call {
                gate.reached.lock().unwrap().send(()).unwrap();
                gate.release.lock().unwrap().recv().unwrap();
            }
        }

        let count = image.get_pixel(0, 0).0[0] as u32;
        Ok((0..count)
            .map(|i| {
                let k = image.get_pixel(i + 1, 0).0[0];
                Detection {
                    face: BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        width: 8.0,
                        height: 8.0,
                        confidence: 0.99,
                        landmarks: None,
                    },
                    embedding: unit(k),
                }
            })
            .collect())
    }
}

/// Frame extraction that reads a prepared directory of frames.
pub struct PreparedFrames {
    pub source: PathBuf,
}

impl FrameExtractor for PreparedFrames {
    fn open(&self, _video: &Path, _rate_hz: f64, _stop: &StopSignal) -> Result<Box<dyn FrameSource>, SampleError> {
        Ok(Box::new(FrameDir::open(&self.source)?))
    }
}

/// A decoder that never produces a frame, like ffmpeg grinding through a long
/// video. It only returns once stopped, and reports when it starts waiting.
pub struct StalledFrames {
    pub waiting: Mutex<mpsc::Sender<()>>,
}

impl StalledFrames {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { waiting: Mutex::new(tx) }, rx)
    }
}

struct StalledSource {
    stop: StopSignal,
    waiting: mpsc::Sender<()>,
}

impl FrameSource for StalledSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SampleError> {
        let _ = self.waiting.send(());
        let deadline = Instant::now() + Duration::from_secs(30);
        while !self.stop.is_raised() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(None)
    }
}

impl FrameExtractor for StalledFrames {
    fn open(&self, _video: &Path, _rate_hz: f64, stop: &StopSignal) -> Result<Box<dyn FrameSource>, SampleError> {
        Ok(Box::new(StalledSource {
            stop: stop.clone(),
            waiting: self.waiting.lock().unwrap().clone(),
        }))
    }
}

/// A session video on disk plus the frames it decodes to.
pub struct FakeVideo {
    pub dir: tempfile::TempDir,
    pub video: PathBuf,
    pub frames: PathBuf,
}

/// Frame `i` shows the faces in `script[i]`; `None` writes an undecodable frame.
pub fn fake_video(script: &[Option<Vec<u8>>]) -> FakeVideo {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    std::fs::create_dir(&frames).unwrap();
    for (i, faces) in script.iter().enumerate() {
        let path = frames.join(format!("frame_{:08}.png", i + 1));
        match faces {
            Some(faces) => scripted_image(faces).save(&path).unwrap(),
            None => std::fs::write(&path, b"\x89PNG truncated").unwrap(),
        }
    }
    let video = dir.path().join("lecture.mp4");
    std::fs::write(&video, b"not really a video").unwrap();
    FakeVideo { dir, video, frames }
}

/// ZIP with the given `(name, bytes)` entries.
pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Store with class `IF-101`, session `S1`, and students 0..n enrolled and registered.
pub fn class_store(n: u8) -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store.define_session("S1", "IF-101").unwrap();
    for k in 0..n {
        store.enroll("IF-101", &student(k)).unwrap();
        store.upsert_embedding(&student(k), &unit(k)).unwrap();
    }
    Arc::new(store)
}

pub fn engine(
    config: &Config,
    store: Arc<SqliteStore>,
    extractor: Arc<ScriptedExtractor>,
    frames: Option<&Path>,
) -> Engine {
    let frames: Arc<dyn FrameExtractor> = Arc::new(PreparedFrames {
        source: frames.map(Path::to_path_buf).unwrap_or_default(),
    });
    engine_with_frames(config, store, extractor, frames)
}

pub fn engine_with_frames(
    config: &Config,
    store: Arc<SqliteStore>,
    extractor: Arc<ScriptedExtractor>,
    frames: Arc<dyn FrameExtractor>,
) -> Engine {
    Engine::new(
        config,
        EngineDeps {
            extractor,
            store: store as Arc<dyn AttendanceStore>,
            frames,
            emotion: None,
        },
    )
    .unwrap()
}

pub fn test_config() -> Config {
    Config {
        worker_pool_size: 2,
        ..Config::default()
    }
}
