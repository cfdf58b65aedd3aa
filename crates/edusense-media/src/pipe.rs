//! Frame extraction through an `ffmpeg` child that streams PPM images over a pipe.

use crate::extract::{receive, FrameExtractor, FrameSource, RawFrame, Received, SampleError, StopSignal};
use image::RgbImage;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Decoded frames buffered ahead of the consumer.
const CHANNEL_CAPACITY: usize = 2;
/// Diagnostic lines kept for error reports.
const STDERR_TAIL: usize = 8;
/// Largest frame accepted from the pipe (16384 x 16384 RGB).
const MAX_FRAME_BYTES: u64 = 16384 * 16384 * 3;

/// Frame extraction through the `ffmpeg` binary (`-vf fps=<rate> -f image2pipe`).
///
/// Frames are read off the child's stdout one at a time. The child is killed
/// when the stream is stopped or dropped.
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    binary: PathBuf,
}

impl FfmpegExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, video: &Path, rate_hz: f64) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-nostdin")
            .args(["-hide_banner", "-nostats"])
            .args(["-v", "info"])
            .arg("-i")
            .arg(video)
            .arg("-vf")
            .arg(format!("fps={rate_hz}"))
            .args(["-f", "image2pipe", "-vcodec", "ppm", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn open(&self, video: &Path, rate_hz: f64, stop: &StopSignal) -> Result<Box<dyn FrameSource>, SampleError> {
        tracing::debug!(video = %video.display(), rate_hz, "starting ffmpeg");

        let mut child = self
            .command(video, rate_hz)
            .spawn()
            .map_err(|source| SampleError::DecoderUnavailable {
                path: self.binary.display().to_string(),
                source,
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);

        // From here on, dropping `source` kills the child.
        let mut source = PipeSource {
            child,
            frames: rx,
            log: Arc::default(),
            stderr_reader: None,
            stop: stop.clone(),
            rate_hz,
            delivered: 0,
            done: false,
        };
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(SampleError::ExtractionFailed("ffmpeg pipes were not captured".into()));
        };

        let log = source.log.clone();
        source.stderr_reader = Some(
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || collect_stderr(stderr, &log))?,
        );
        std::thread::Builder::new()
            .name("ffmpeg-frames".into())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    let item = match read_ppm(&mut reader) {
                        Ok(Some(image)) => Ok(image),
                        Ok(None) => break,
                        Err(e) => Err(e),
                    };
                    let failed = item.is_err();
                    // Receiver gone: the source was dropped
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(Box::new(source))
    }
}

#[derive(Default)]
struct StderrLog {
    duration: Option<Duration>,
    tail: VecDeque<String>,
}

fn collect_stderr(stderr: ChildStderr, log: &Mutex<StderrLog>) {
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        tracing::trace!(target: "ffmpeg", "{line}");
        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.duration.is_none() {
            log.duration = parse_duration(&line);
        }
        if log.tail.len() == STDERR_TAIL {
            log.tail.pop_front();
        }
        log.tail.push_back(line);
    }
}

struct PipeSource {
    child: Child,
    frames: Receiver<Result<RgbImage, SampleError>>,
    log: Arc<Mutex<StderrLog>>,
    stderr_reader: Option<JoinHandle<()>>,
    stop: StopSignal,
    rate_hz: f64,
    delivered: u64,
    done: bool,
}

impl PipeSource {
    fn log(&self) -> MutexGuard<'_, StderrLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminate(&mut self) {
        self.done = true;
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "ffmpeg already gone");
        }
        let _ = self.child.wait();
    }

    /// Stdout closed: collect the exit status.
    fn finish(&mut self) -> Result<Option<RawFrame>, SampleError> {
        self.done = true;
        let status = self.child.wait()?;
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
        if status.success() {
            tracing::debug!(frames = self.delivered, "ffmpeg finished");
            return Ok(None);
        }

        let detail = self
            .log()
            .tail
            .back()
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| "no diagnostic output".into());
        if self.delivered == 0 {
            Err(SampleError::ExtractionFailed(format!("ffmpeg exited with {status}: {detail}")))
        } else {
            tracing::warn!(%status, frames = self.delivered, detail = %detail, "ffmpeg stopped early; keeping frames decoded so far");
            Ok(None)
        }
    }
}

impl FrameSource for PipeSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SampleError> {
        if self.done {
            return Ok(None);
        }
        match receive(&self.frames, &self.stop) {
            Received::Item(Ok(image)) => {
                self.delivered += 1;
                Ok(Some(RawFrame::Decoded(image)))
            }
            Received::Item(Err(e)) => {
                self.terminate();
                Err(e)
            }
            Received::Stopped => {
                tracing::debug!(frames = self.delivered, "stop requested; killing ffmpeg");
                self.terminate();
                Ok(None)
            }
            Received::Closed => self.finish(),
        }
    }

    fn expected_frames(&self) -> Option<u64> {
        let duration = self.log().duration?;
        Some((duration.as_secs_f64() * self.rate_hz).ceil() as u64)
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        if !self.done {
            self.terminate();
        }
    }
}

/// Read one binary PPM (`P6`, maxval 255). `Ok(None)` at a clean end of stream.
fn read_ppm<R: BufRead>(reader: &mut R) -> Result<Option<RgbImage>, SampleError> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic)?;
    if &magic != b"P6" {
        return Err(malformed("not a binary PPM frame"));
    }
    let width = header_number(reader)?;
    let height = header_number(reader)?;
    if header_number(reader)? != 255 {
        return Err(malformed("only 8-bit PPM frames are supported"));
    }

    let size = u64::from(width) * u64::from(height) * 3;
    if size == 0 || size > MAX_FRAME_BYTES {
        return Err(malformed(&format!("unsupported frame size {width}x{height}")));
    }
    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data)?;
    RgbImage::from_raw(width, height, data)
        .map(Some)
        .ok_or_else(|| malformed("frame buffer does not match its header"))
}

/// Next header field. Consumes the single whitespace byte that ends it.
fn header_number<R: BufRead>(reader: &mut R) -> Result<u32, SampleError> {
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        match byte[0] {
            b'#' => {
                let mut comment = Vec::new();
                reader.read_until(b'\n', &mut comment)?;
            }
            b if b.is_ascii_whitespace() => {}
            _ => break,
        }
    }

    let mut value: u32 = 0;
    loop {
        if !byte[0].is_ascii_digit() {
            return Err(malformed("bad PPM header"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u32::from(byte[0] - b'0')))
            .ok_or_else(|| malformed("PPM header value overflows"))?;
        reader.read_exact(&mut byte)?;
        if byte[0].is_ascii_whitespace() {
            return Ok(value);
        }
    }
}

fn malformed(detail: &str) -> SampleError {
    SampleError::ExtractionFailed(format!("ffmpeg output: {detail}"))
}

/// `  Duration: 00:01:02.50, start: ...` → 62.5s.
fn parse_duration(line: &str) -> Option<Duration> {
    let rest = line.trim_start().strip_prefix("Duration: ")?;
    let stamp = rest.split(',').next()?.trim();
    let mut parts = stamp.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let whole = Duration::from_secs(hours * 3600 + minutes * 60);
    Some(whole + Duration::try_from_secs_f64(seconds).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ppm(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let mut bytes = format!("P6\n{width} {height}\n255\n").into_bytes();
        bytes.extend(std::iter::repeat(shade).take((width * height * 3) as usize));
        bytes
    }

    #[test]
    fn test_ffmpeg_command_line() {
        let extractor = FfmpegExtractor::new("/usr/bin/ffmpeg");
        let cmd = extractor.command(Path::new("/videos/lecture.mp4"), 0.5);

        assert_eq!(cmd.get_program(), "/usr/bin/ffmpeg");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["-i", "/videos/lecture.mp4"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "fps=0.5"]));
        assert!(args.windows(2).any(|w| w == ["-f", "image2pipe"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let extractor = FfmpegExtractor::new("/nonexistent/ffmpeg-binary");
        let err = extractor
            .open(Path::new("video.mp4"), 1.0, &StopSignal::default())
            .err()
            .unwrap();
        assert!(matches!(err, SampleError::DecoderUnavailable { .. }));
    }

    #[test]
    fn test_reads_consecutive_ppm_frames() {
        let mut stream = ppm(2, 1, 10);
        stream.extend(b"P6\n# written by a test\n1 2 255\n");
        stream.extend([1, 2, 3, 4, 5, 6]);
        let mut reader = Cursor::new(stream);

        let first = read_ppm(&mut reader).unwrap().unwrap();
        assert_eq!(first.dimensions(), (2, 1));
        assert_eq!(first.get_pixel(1, 0).0, [10, 10, 10]);

        let second = read_ppm(&mut reader).unwrap().unwrap();
        assert_eq!(second.dimensions(), (1, 2));
        assert_eq!(second.get_pixel(0, 1).0, [4, 5, 6]);

        assert!(read_ppm(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let mut png_like = Cursor::new(b"\x89PNG\r\n".to_vec());
        assert!(matches!(read_ppm(&mut png_like), Err(SampleError::ExtractionFailed(_))));

        let mut wide = Cursor::new(b"P6\n2 2\n65535\n".to_vec());
        assert!(matches!(read_ppm(&mut wide), Err(SampleError::ExtractionFailed(_))));

        let mut truncated = ppm(4, 4, 0);
        truncated.truncate(20);
        assert!(matches!(read_ppm(&mut Cursor::new(truncated)), Err(SampleError::Io(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s"),
            Some(Duration::from_millis(62_500))
        );
        assert_eq!(parse_duration("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration("Stream #0:0: Video: h264"), None);
    }

    #[cfg(unix)]
    mod child {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        /// A stand-in `ffmpeg` that runs `body` as a shell script.
        fn fake_ffmpeg(dir: &Path, body: &str) -> FfmpegExtractor {
            let path = dir.join("ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            FfmpegExtractor::new(path)
        }

        fn open(extractor: &FfmpegExtractor, stop: &StopSignal) -> Box<dyn FrameSource> {
            // A freshly written script can briefly be busy while another test forks
            for _ in 0..50 {
                match extractor.open(Path::new("lecture.mp4"), 1.0, stop) {
                    Err(SampleError::DecoderUnavailable { source, .. }) if source.raw_os_error() == Some(26) => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    other => return other.unwrap(),
                }
            }
            panic!("fake ffmpeg stayed busy");
        }

        #[test]
        fn test_streams_frames_until_exit() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = fake_ffmpeg(
                dir.path(),
                "echo '  Duration: 00:00:02.00, start: 0.000000' >&2\n\
                 printf 'P6\\n1 1\\n255\\n\\377\\000\\000'\n\
                 printf 'P6\\n1 1\\n255\\n\\000\\377\\000'",
            );
            let mut source = open(&extractor, &StopSignal::default());

            let mut colors = Vec::new();
            while let Some(frame) = source.next_frame().unwrap() {
                match frame {
                    RawFrame::Decoded(img) => colors.push(img.get_pixel(0, 0).0),
                    RawFrame::Corrupt(reason) => panic!("unexpected corrupt frame: {reason}"),
                }
            }
            assert_eq!(colors, vec![[255, 0, 0], [0, 255, 0]]);
            assert_eq!(source.expected_frames(), Some(2));
        }

        #[test]
        fn test_failure_without_frames_reports_diagnostic() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = fake_ffmpeg(dir.path(), "echo 'lecture.mp4: moov atom not found' >&2\nexit 1");
            let mut source = open(&extractor, &StopSignal::default());

            match source.next_frame() {
                Err(SampleError::ExtractionFailed(msg)) => assert!(msg.contains("moov atom not found"), "{msg}"),
                other => panic!("expected extraction failure, got {:?}", other.map(|f| f.is_some())),
            }
            assert!(source.next_frame().unwrap().is_none());
        }

        #[test]
        fn test_stop_kills_a_stalled_decoder() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = fake_ffmpeg(dir.path(), "exec sleep 30");
            let stop = StopSignal::default();
            let mut source = open(&extractor, &stop);

            let raiser = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                raiser.raise();
            });

            let started = Instant::now();
            assert!(source.next_frame().unwrap().is_none());
            assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
            assert!(source.next_frame().unwrap().is_none());
        }

        #[test]
        fn test_drop_kills_the_child() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("pid");
            let extractor = fake_ffmpeg(dir.path(), &format!("echo $$ > {}\nexec sleep 30", pid_file.display()));
            let source = open(&extractor, &StopSignal::default());

            let deadline = Instant::now() + Duration::from_secs(5);
            let pid = loop {
                let pid = std::fs::read_to_string(&pid_file).unwrap_or_default().trim().to_string();
                if !pid.is_empty() {
                    break pid;
                }
                assert!(Instant::now() < deadline, "fake ffmpeg never started");
                std::thread::sleep(Duration::from_millis(10));
            };
            drop(source);

            // The killed child has been reaped, so its pid is gone
            assert!(!Path::new("/proc").join(&pid).exists());
        }
    }
}
