//! Video → decoded still frames, one at a time.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("video not found: {0}")]
    VideoNotFound(String),
    #[error("invalid sampling rate {0} (must be finite and > 0)")]
    InvalidRate(f64),
    #[error("frame extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("ffmpeg not available at {path}: {source}")]
    DecoderUnavailable {
        path: String,
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared flag that tells a frame source to stop decoding.
///
/// Sources poll it while waiting on the decoder, so raising it ends a
/// stream even when no frame is due for a long time.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Observe an existing flag, e.g. a task's cancel flag.
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One position of the sampled stream.
pub enum RawFrame {
    Decoded(RgbImage),
    /// The source knows a frame was here but could not decode it.
    Corrupt(String),
}

/// Frames of one video in presentation order.
///
/// Dropping a source releases its decoder, including any child process.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` at the end of the stream or once stopped.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SampleError>;

    /// Frames the source expects to produce, once known.
    fn expected_frames(&self) -> Option<u64> {
        None
    }
}

/// Opens a frame stream of `video` sampled at `rate_hz`.
pub trait FrameExtractor: Send + Sync {
    fn open(&self, video: &Path, rate_hz: f64, stop: &StopSignal) -> Result<Box<dyn FrameSource>, SampleError>;
}

/// How often a waiting source re-checks its stop signal.
pub(crate) const STOP_POLL: Duration = Duration::from_millis(50);

pub(crate) enum Received<T> {
    Item(T),
    Stopped,
    Closed,
}

/// Wait for the decoder thread's next message, giving up once `stop` is raised.
pub(crate) fn receive<T>(rx: &Receiver<T>, stop: &StopSignal) -> Received<T> {
    loop {
        if stop.is_raised() {
            return Received::Stopped;
        }
        match rx.recv_timeout(STOP_POLL) {
            Ok(item) => return Received::Item(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Received::Closed,
        }
    }
}

const FRAME_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Directory of already-extracted frame images, taken in file-name order.
///
/// An image that fails to decode is reported as [`RawFrame::Corrupt`].
pub struct FrameDir {
    frames: std::vec::IntoIter<PathBuf>,
    total: u64,
}

impl FrameDir {
    pub fn open(dir: &Path) -> Result<Self, SampleError> {
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && has_frame_extension(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(Self {
            total: frames.len() as u64,
            frames: frames.into_iter(),
        })
    }
}

impl FrameSource for FrameDir {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SampleError> {
        let Some(path) = self.frames.next() else {
            return Ok(None);
        };
        Ok(Some(match image::open(&path) {
            Ok(img) => RawFrame::Decoded(img.to_rgb8()),
            Err(e) => RawFrame::Corrupt(format!("{}: {e}", path.display())),
        }))
    }

    fn expected_frames(&self) -> Option<u64> {
        Some(self.total)
    }
}

fn has_frame_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_frame_dir_order_and_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([20, 20, 20]))
            .save(dir.path().join("frame_00000002.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]))
            .save(dir.path().join("frame_00000001.png"))
            .unwrap();
        std::fs::write(dir.path().join("frame_00000003.jpg"), b"truncated").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = FrameDir::open(dir.path()).unwrap();
        assert_eq!(source.expected_frames(), Some(3));

        let shade = |frame: RawFrame| match frame {
            RawFrame::Decoded(img) => img.get_pixel(0, 0).0[0],
            RawFrame::Corrupt(reason) => panic!("unexpected corrupt frame: {reason}"),
        };
        assert_eq!(shade(source.next_frame().unwrap().unwrap()), 10);
        assert_eq!(shade(source.next_frame().unwrap().unwrap()), 20);
        assert!(matches!(source.next_frame().unwrap(), Some(RawFrame::Corrupt(_))));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_receive_gives_up_when_stopped() {
        let (_tx, rx) = mpsc::sync_channel::<u32>(1);
        let stop = StopSignal::default();
        let raiser = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            raiser.raise();
        });

        let started = Instant::now();
        assert!(matches!(receive(&rx, &stop), Received::Stopped));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_receive_reports_closed_channel() {
        let (tx, rx) = mpsc::sync_channel::<u32>(1);
        tx.send(7).unwrap();
        drop(tx);
        let stop = StopSignal::default();
        assert!(matches!(receive(&rx, &stop), Received::Item(7)));
        assert!(matches!(receive(&rx, &stop), Received::Closed));
    }

    #[test]
    fn test_stop_signal_shares_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let stop = StopSignal::new(flag.clone());
        assert!(!stop.is_raised());
        flag.store(true, Ordering::SeqCst);
        assert!(stop.is_raised());
    }
}
