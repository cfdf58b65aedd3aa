//! Lazy fixed-rate frame sampling.
//!
//! The sampling rate is the one knob that trades detection recall against
//! processing cost: every sampled frame goes through face detection and
//! embedding, so doubling the rate doubles the work and the chances of
//! catching a briefly visible face.

use crate::extract::{FrameDir, FrameExtractor, FrameSource, RawFrame, SampleError, StopSignal};
use crate::frame::{sample_timestamp, SampledFrame};
use std::path::Path;

/// Default sampling rate: one frame per second of video.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 1.0;

/// Single forward pass over the sampled frames of one video.
///
/// Frames are pulled from the decoder one at a time as the iterator advances;
/// nothing is written to disk. A frame that fails to decode is logged and
/// skipped. A decoder failure is yielded once and ends the iteration.
/// Dropping the sampler stops the decoder.
pub struct FrameSampler {
    source: Box<dyn FrameSource>,
    rate_hz: f64,
    next_index: u64,
    skipped: usize,
    finished: bool,
}

impl FrameSampler {
    /// Start decoding `video` at `rate_hz`. Raising `stop` ends the stream early.
    pub fn open(
        video: &Path,
        rate_hz: f64,
        extractor: &dyn FrameExtractor,
        stop: &StopSignal,
    ) -> Result<Self, SampleError> {
        check_rate(rate_hz)?;
        if !video.is_file() {
            return Err(SampleError::VideoNotFound(video.display().to_string()));
        }

        let source = extractor.open(video, rate_hz, stop)?;
        tracing::info!(video = %video.display(), rate_hz, "sampling video");
        Self::from_source(source, rate_hz)
    }

    /// Sample a directory of already-extracted frame images.
    ///
    /// Images are taken in file-name order; the `n`-th image is stamped `n / rate_hz`.
    pub fn from_frame_dir(dir: &Path, rate_hz: f64) -> Result<Self, SampleError> {
        check_rate(rate_hz)?;
        Self::from_source(Box::new(FrameDir::open(dir)?), rate_hz)
    }

    pub fn from_source(source: Box<dyn FrameSource>, rate_hz: f64) -> Result<Self, SampleError> {
        check_rate(rate_hz)?;
        Ok(Self {
            source,
            rate_hz,
            next_index: 0,
            skipped: 0,
            finished: false,
        })
    }

    /// Sampled positions the video is expected to have, once the decoder knows.
    pub fn expected_total(&self) -> Option<u64> {
        self.source.expected_frames()
    }

    /// Frames skipped so far because they could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Sampled positions consumed so far (decoded or skipped).
    pub fn position(&self) -> u64 {
        self.next_index
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }
}

impl Iterator for FrameSampler {
    type Item = Result<SampledFrame, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let raw = match self.source.next_frame() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            let index = self.next_index;
            self.next_index += 1;

            match raw {
                RawFrame::Decoded(image) => {
                    return Some(Ok(SampledFrame {
                        index,
                        timestamp: sample_timestamp(index, self.rate_hz),
                        image,
                    }));
                }
                RawFrame::Corrupt(reason) => {
                    self.skipped += 1;
                    tracing::warn!(frame = index, reason = %reason, "skipping undecodable frame");
                }
            }
        }
        self.finished = true;
        None
    }
}

impl std::iter::FusedIterator for FrameSampler {}

fn check_rate(rate_hz: f64) -> Result<(), SampleError> {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        Ok(())
    } else {
        Err(SampleError::InvalidRate(rate_hz))
    }
}
