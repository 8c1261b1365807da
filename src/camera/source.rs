use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use opencv::core::{Mat, Vector};
use opencv::prelude::*;
use opencv::videoio;

use super::CaptureError;
use crate::analytics::render::encode_jpeg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// How a stream gets decoded. `Pipeline` is the external ffmpeg process and
/// needs the probed resolution; `Direct` is the in-process OpenCV reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Pipeline(Resolution),
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(CapturedFrame),
    /// Source is still up but produced nothing.
    Empty,
    /// Source is gone and must be reopened.
    Closed,
    Error(CaptureError),
}

pub trait FrameSource: Send {
    fn read(&mut self) -> ReadOutcome;
}

pub trait SourceOpener: Send + Sync {
    fn probe(&self, url: &str) -> Result<Resolution, CaptureError>;

    fn open(&self, url: &str, strategy: DecodeStrategy) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// ffprobe for resolution, ffmpeg rawvideo for the pipeline, OpenCV for direct reads.
pub struct StreamOpener {
    sample_fps: u32,
    jpeg_quality: i32,
    read_timeout: Duration,
}

impl StreamOpener {
    pub fn new(sample_fps: u32, jpeg_quality: i32) -> Self {
        let sample_fps = sample_fps.max(1);
        Self {
            sample_fps,
            jpeg_quality,
            read_timeout: Duration::from_secs(3).max(Duration::from_secs_f64(3.0 / sample_fps as f64)),
        }
    }
}

impl SourceOpener for StreamOpener {
    fn probe(&self, url: &str) -> Result<Resolution, CaptureError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-rw_timeout",
                "5000000",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=,:p=0",
                url,
            ])
            .stdin(Stdio::null())
            .output()
            .map_err(spawn_error)?;
        if !output.status.success() {
            return Err(CaptureError::ProbeFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            CaptureError::ProbeFailed(format!(
                "unexpected ffprobe output {:?}",
                String::from_utf8_lossy(&output.stdout)
            ))
        })
    }

    fn open(&self, url: &str, strategy: DecodeStrategy) -> Result<Box<dyn FrameSource>, CaptureError> {
        match strategy {
            DecodeStrategy::Pipeline(resolution) => Ok(Box::new(FfmpegSource::spawn(
                url,
                resolution,
                self.sample_fps,
                self.jpeg_quality,
                self.read_timeout,
            )?)),
            DecodeStrategy::Direct => Ok(Box::new(OpenCvSource::open(
                url,
                self.jpeg_quality,
                self.read_timeout,
            )?)),
        }
    }
}

fn spawn_error(e: std::io::Error) -> CaptureError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CaptureError::FfmpegNotFound
    } else {
        CaptureError::Io(e)
    }
}

/// First `width,height` line of ffprobe csv output.
pub fn parse_probe_output(output: &str) -> Option<Resolution> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once(',')?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().trim_end_matches(',').parse().ok()?;
    (width > 0 && height > 0).then_some(Resolution { width, height })
}

/// ffmpeg decoding to raw BGR frames on stdout. A reader thread slices stdout
/// into whole frames so reads can time out.
pub struct FfmpegSource {
    child: Option<Child>,
    frame_rx: Receiver<Vec<u8>>,
    resolution: Resolution,
    jpeg_quality: i32,
    read_timeout: Duration,
    _reader_handle: JoinHandle<()>,
    _stderr_handle: JoinHandle<()>,
}

impl FfmpegSource {
    pub fn spawn(
        url: &str,
        resolution: Resolution,
        sample_fps: u32,
        jpeg_quality: i32,
        read_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(
            [
                "-fflags", "nobuffer", "-flags", "low_delay", "-i", url, "-an", "-vf",
            ]
            .map(String::from),
        );
        args.push(format!("fps={sample_fps}"));
        args.extend(["-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1"].map(String::from));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::ConnectFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CaptureError::ConnectFailed("failed to capture stderr".into()))?;

        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<u8>>(4);
        let frame_size = resolution.frame_bytes();

        let reader_handle = thread::spawn(move || {
            let mut stdout = stdout;
            let mut buf = vec![0u8; frame_size];
            while stdout.read_exact(&mut buf).is_ok() {
                if frame_tx.send(buf.clone()).is_err() {
                    break;
                }
            }
        });

        let stream = url.to_string();
        let stderr_handle = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                tracing::debug!(url = %stream, "ffmpeg: {line}");
            }
        });

        Ok(Self {
            child: Some(child),
            frame_rx,
            resolution,
            jpeg_quality,
            read_timeout,
            _reader_handle: reader_handle,
            _stderr_handle: stderr_handle,
        })
    }

    fn to_jpeg(&self, raw: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let flat = Mat::from_slice(raw)?;
        let frame = flat.reshape(3, self.resolution.height as i32)?;
        let frame = frame.try_clone()?;
        encode_jpeg(&frame, self.jpeg_quality)
            .ok_or_else(|| CaptureError::ReadFailed("jpeg encoding failed".into()))
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> ReadOutcome {
        match self.frame_rx.recv_timeout(self.read_timeout) {
            Ok(raw) => match self.to_jpeg(&raw) {
                Ok(jpeg) => ReadOutcome::Frame(CapturedFrame {
                    jpeg,
                    width: self.resolution.width,
                    height: self.resolution.height,
                }),
                Err(e) => ReadOutcome::Error(e),
            },
            Err(RecvTimeoutError::Timeout) => ReadOutcome::Empty,
            Err(RecvTimeoutError::Disconnected) => ReadOutcome::Closed,
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

const DIRECT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Open and read timeouts for the OpenCV backend, as `[prop, value, ...]` pairs.
fn capture_params(open: Duration, read: Duration) -> Vec<i32> {
    let millis = |d: Duration| d.as_millis().min(i32::MAX as u128) as i32;
    vec![
        videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
        millis(open),
        videoio::CAP_PROP_READ_TIMEOUT_MSEC,
        millis(read),
    ]
}

pub struct OpenCvSource {
    capture: videoio::VideoCapture,
    jpeg_quality: i32,
}

impl OpenCvSource {
    pub fn open(url: &str, jpeg_quality: i32, read_timeout: Duration) -> Result<Self, CaptureError> {
        let params = Vector::from_iter(capture_params(DIRECT_OPEN_TIMEOUT, read_timeout));
        let capture = videoio::VideoCapture::from_file_with_params(url, videoio::CAP_ANY, &params)?;
        if !capture.is_opened()? {
            return Err(CaptureError::ConnectFailed(format!("VideoCapture could not open {url}")));
        }
        Ok(Self {
            capture,
            jpeg_quality,
        })
    }
}

impl FrameSource for OpenCvSource {
    fn read(&mut self) -> ReadOutcome {
        let mut frame = Mat::default();
        match self.capture.read(&mut frame) {
            Ok(true) if !frame.empty() => match encode_jpeg(&frame, self.jpeg_quality) {
                Some(jpeg) => ReadOutcome::Frame(CapturedFrame {
                    jpeg,
                    width: frame.cols() as u32,
                    height: frame.rows() as u32,
                }),
                None => ReadOutcome::Error(CaptureError::ReadFailed("jpeg encoding failed".into())),
            },
            Ok(_) => match self.capture.is_opened() {
                Ok(true) => ReadOutcome::Empty,
                _ => ReadOutcome::Closed,
            },
            Err(e) => ReadOutcome::Error(e.into()),
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        let _ = self.capture.release();
    }
}
