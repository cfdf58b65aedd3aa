//! In-process decoding through the FFmpeg libraries (`ffmpeg-next`).
//!
//! Keeps one frame per sampling interval: the first decoded frame at or after
//! each `k / rate_hz` mark, measured from the first frame's timestamp.

use crate::extract::{receive, FrameExtractor, FrameSource, RawFrame, Received, SampleError, StopSignal};
use ffmpeg::util::error::{EAGAIN, EWOULDBLOCK};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};

const CHANNEL_CAPACITY: usize = 4;
/// `AVFormatContext::duration` unit.
const AV_TIME_BASE: f64 = 1_000_000.0;

type FrameResult = Result<RgbImage, SampleError>;

/// Decodes on a dedicated thread without spawning `ffmpeg`.
#[derive(Debug, Clone, Default)]
pub struct LibavExtractor;

impl FrameExtractor for LibavExtractor {
    fn open(&self, video: &Path, rate_hz: f64, stop: &StopSignal) -> Result<Box<dyn FrameSource>, SampleError> {
        ffmpeg::init().map_err(failed)?;

        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let source = LibavSource {
            frames: rx,
            stop: stop.clone(),
            halt: StopSignal::default(),
            expected: Arc::default(),
            done: false,
        };
        let job = DecodeJob {
            input: video.to_path_buf(),
            rate_hz,
            stop: stop.clone(),
            halt: source.halt.clone(),
            expected: source.expected.clone(),
        };
        std::thread::Builder::new()
            .name("libav-frames".into())
            .spawn(move || {
                if let Err(e) = job.run(&tx) {
                    let _ = tx.send(Err(e));
                }
            })?;

        Ok(Box::new(source))
    }
}

struct DecodeJob {
    input: PathBuf,
    rate_hz: f64,
    stop: StopSignal,
    /// Raised when the consuming source is dropped.
    halt: StopSignal,
    expected: Arc<Mutex<Option<u64>>>,
}

impl DecodeJob {
    fn halted(&self) -> bool {
        self.stop.is_raised() || self.halt.is_raised()
    }

    fn run(&self, tx: &SyncSender<FrameResult>) -> Result<(), SampleError> {
        let mut ictx = ffmpeg::format::input(&self.input).map_err(failed)?;
        if ictx.duration() > 0 {
            let seconds = ictx.duration() as f64 / AV_TIME_BASE;
            *self.expected.lock().unwrap_or_else(PoisonError::into_inner) = Some((seconds * self.rate_hz).ceil() as u64);
        }

        let input_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| SampleError::ExtractionFailed("no video stream found".into()))?;
        let stream_index = input_stream.index();
        let time_base = input_stream.time_base();

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters()).map_err(failed)?;
        let mut decoder = context.decoder().video().map_err(failed)?;
        let mut scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::FAST_BILINEAR,
        )
        .map_err(failed)?;

        let interval = 1.0 / self.rate_hz;
        let mut next_due = 0.0f64;
        let mut origin: Option<f64> = None;
        let mut decoded = ffmpeg::util::frame::Video::empty();
        let mut converted = ffmpeg::util::frame::Video::empty();

        // Ok(false) once the consumer is gone
        let mut drain = |decoder: &mut ffmpeg::decoder::Video| -> Result<bool, SampleError> {
            loop {
                match decoder.receive_frame(&mut decoded) {
                    Ok(()) => {
                        let seconds = decoded
                            .pts()
                            .map(|pts| pts as f64 * f64::from(time_base))
                            .unwrap_or(next_due);
                        let offset = seconds - *origin.get_or_insert(seconds);
                        if offset + 1e-6 < next_due {
                            continue;
                        }
                        while next_due <= offset + 1e-6 {
                            next_due += interval;
                        }
                        scaler.run(&decoded, &mut converted).map_err(failed)?;
                        if tx.send(Ok(rgb_image(&converted)?)).is_err() {
                            return Ok(false);
                        }
                    }
                    Err(err) if is_retryable_error(&err) || matches!(err, ffmpeg::Error::Eof) => return Ok(true),
                    Err(err) => return Err(failed(err)),
                }
            }
        };

        for (stream, packet) in ictx.packets() {
            if self.halted() {
                tracing::debug!(video = %self.input.display(), "decoder stopped");
                return Ok(());
            }
            if stream.index() != stream_index {
                continue;
            }
            if let Err(err) = decoder.send_packet(&packet) {
                if !is_retryable_error(&err) {
                    return Err(failed(err));
                }
            }
            if !drain(&mut decoder)? {
                return Ok(());
            }
        }

        decoder.send_eof().map_err(failed)?;
        drain(&mut decoder)?;
        Ok(())
    }
}

struct LibavSource {
    frames: Receiver<FrameResult>,
    stop: StopSignal,
    halt: StopSignal,
    expected: Arc<Mutex<Option<u64>>>,
    done: bool,
}

impl FrameSource for LibavSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SampleError> {
        if self.done {
            return Ok(None);
        }
        match receive(&self.frames, &self.stop) {
            Received::Item(Ok(image)) => Ok(Some(RawFrame::Decoded(image))),
            Received::Item(Err(e)) => {
                self.done = true;
                Err(e)
            }
            Received::Stopped | Received::Closed => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn expected_frames(&self) -> Option<u64> {
        *self.expected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LibavSource {
    fn drop(&mut self) {
        self.halt.raise();
    }
}

fn rgb_image(frame: &ffmpeg::util::frame::Video) -> Result<RgbImage, SampleError> {
    let width = frame.width();
    let height = frame.height();
    let plane = frame.data(0);
    let stride = frame.stride(0);
    let row = width as usize * 3;
    let mut buffer = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let offset = y * stride;
        buffer.extend_from_slice(&plane[offset..offset + row]);
    }
    RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| SampleError::ExtractionFailed("decoded frame has an unexpected size".into()))
}

fn is_retryable_error(error: &ffmpeg::Error) -> bool {
    matches!(
        error,
        ffmpeg::Error::Other { errno }
            if *errno == EAGAIN || *errno == EWOULDBLOCK
    )
}

fn failed(err: ffmpeg::Error) -> SampleError {
    SampleError::ExtractionFailed(err.to_string())
}
