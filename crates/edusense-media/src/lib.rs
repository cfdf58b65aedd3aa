//! edusense-media: turning lecture videos into sampled still frames.
//!
//! Frames are decoded one at a time, by an `ffmpeg` child streaming over a
//! pipe or in process with the `ffmpeg-native` feature, so only a couple of
//! decoded frames are held in memory and nothing is written to disk.

pub mod extract;
pub mod frame;
#[cfg(feature = "ffmpeg-native")]
pub mod native;
pub mod pipe;
pub mod sampler;

pub use extract::{FrameDir, FrameExtractor, FrameSource, RawFrame, SampleError, StopSignal};
pub use frame::{sample_timestamp, SampledFrame};
#[cfg(feature = "ffmpeg-native")]
pub use native::LibavExtractor;
pub use pipe::FfmpegExtractor;
pub use sampler::{FrameSampler, DEFAULT_SAMPLE_RATE_HZ};
