//! Sampled video frame type.

use image::RgbImage;
use std::time::Duration;

/// One decoded frame taken from a video at a fixed sampling rate.
#[derive(Clone)]
pub struct SampledFrame {
    /// Position in the sampled sequence (0-based), counting skipped frames.
    pub index: u64,
    /// Offset from the start of the video.
    pub timestamp: Duration,
    pub image: RgbImage,
}

impl SampledFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Stable textual reference for this frame, e.g. `frame:12@12000ms`.
    pub fn reference(&self) -> String {
        format!("frame:{}@{}ms", self.index, self.timestamp.as_millis())
    }
}

/// Timestamp of the `index`-th sample at `rate_hz` samples per second.
pub fn sample_timestamp(index: u64, rate_hz: f64) -> Duration {
    Duration::from_secs_f64(index as f64 / rate_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_timestamp_one_hz() {
        assert_eq!(sample_timestamp(0, 1.0), Duration::ZERO);
        assert_eq!(sample_timestamp(42, 1.0), Duration::from_secs(42));
    }

    #[test]
    fn test_sample_timestamp_fractional_rate() {
        assert_eq!(sample_timestamp(3, 2.0), Duration::from_millis(1500));
        assert_eq!(sample_timestamp(2, 0.5), Duration::from_secs(4));
    }

    #[test]
    fn test_reference_format() {
        let frame = SampledFrame {
            index: 7,
            timestamp: Duration::from_millis(3500),
            image: RgbImage::new(2, 2),
        };
        assert_eq!(frame.reference(), "frame:7@3500ms");
        assert_eq!((frame.width(), frame.height()), (2, 2));
    }
}
