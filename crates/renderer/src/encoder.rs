//! Video encoder collaborators.
//!
//! The recorder only needs three things from an encoder: a hint before each
//! frame, a sink the encoder surface can push read-back frames into, and a
//! non-blocking stop. [`FfmpegEncoder`] implements them by piping raw RGBA
//! into an `ffmpeg` child process from a writer thread.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use camconfig::VideoCodec;
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::types::{RecordingSettings, Size};

/// Frames queued between the render thread and the writer thread.
const FRAME_QUEUE_DEPTH: usize = 4;

/// One presented frame of the encoder surface.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub size: Size,
    /// Presentation time set on the surface before the swap.
    pub pts_nanos: u64,
    /// Tightly packed RGBA rows, top row first.
    pub rgba: Vec<u8>,
}

/// Input side of an encoder, fed by the encoder surface on every swap.
pub trait FrameSink: Send {
    fn submit(&mut self, frame: VideoFrame) -> Result<(), EncoderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("encoder input is closed")]
    Closed,
    #[error("frame is {actual} but the encoder was configured for {expected}")]
    FrameSize { expected: Size, actual: Size },
    #[error("encoder input was already taken")]
    NoInput,
    #[error("unsupported encoder setting: {0}")]
    Unsupported(String),
    #[error("writing to the encoder failed: {0}")]
    Io(#[from] io::Error),
    #[error("encoder exited with {status}: {detail}")]
    Exited { status: ExitStatus, detail: String },
    #[error("encoder output error: {0}")]
    Output(String),
}

/// A running encoder session writing one output file.
pub trait VideoEncoder: Send {
    fn output(&self) -> &Path;

    /// Called right before a frame is rendered to the encoder surface.
    fn frame_available_soon(&mut self);

    /// Hands out the input sink. Only the first call succeeds.
    fn input_sink(&mut self) -> Result<Box<dyn FrameSink>, EncoderError>;

    /// Closes the input and returns without waiting for the output to be
    /// finalized.
    fn stop(self: Box<Self>) -> Finalizer;
}

/// Creates encoders for the recorder.
pub trait EncoderFactory: Send {
    fn create(&self, settings: &RecordingSettings) -> Result<Box<dyn VideoEncoder>, EncoderError>;
}

/// Completion handle for an encoder that is flushing its output.
#[derive(Debug)]
pub struct Finalizer {
    path: PathBuf,
    worker: Option<JoinHandle<Result<(), EncoderError>>>,
}

impl Finalizer {
    /// A finalizer for an encoder that had nothing left to flush.
    pub fn completed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            worker: None,
        }
    }

    pub fn from_worker(
        path: impl Into<PathBuf>,
        worker: JoinHandle<Result<(), EncoderError>>,
    ) -> Self {
        Self {
            path: path.into(),
            worker: Some(worker),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Blocks until the output is complete.
    pub fn wait(self) -> Result<PathBuf, EncoderError> {
        if let Some(worker) = self.worker {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => return Err(EncoderError::Output("encoder writer panicked".into())),
            }
        }
        Ok(self.path)
    }
}

/// Maps frame timestamps onto the fixed output rate, repeating frames that
/// cover more than one output slot and skipping frames that arrive before
/// the next slot is due. A gap longer than
/// [`scheduler::MAX_FRAME_INTERVAL_NANOS`], or time running backwards, is a
/// pause: the pacer restarts at the new frame instead of filling the gap.
#[derive(Debug, Clone)]
pub struct RatePacer {
    frame_rate: u32,
    origin: Option<u64>,
    last_pts: Option<u64>,
    written: u64,
}

impl RatePacer {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            origin: None,
            last_pts: None,
            written: 0,
        }
    }

    /// Number of times the frame stamped `pts_nanos` should be written.
    pub fn copies_for(&mut self, pts_nanos: u64) -> u64 {
        if let Some(last) = self.last_pts.replace(pts_nanos) {
            if pts_nanos < last || pts_nanos - last > scheduler::MAX_FRAME_INTERVAL_NANOS {
                tracing::debug!(last, pts_nanos, "frame gap; restarting output pacing");
                self.origin = None;
                self.written = 0;
            }
        }
        let origin = *self.origin.get_or_insert(pts_nanos);
        let elapsed = pts_nanos.saturating_sub(origin) as u128;
        let due = (elapsed * u128::from(self.frame_rate) / 1_000_000_000) as u64 + 1;
        let copies = due.saturating_sub(self.written);
        self.written += copies;
        copies
    }
}

/// Spawns `ffmpeg` processes.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    program: PathBuf,
}

impl FfmpegEncoderFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegEncoderFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, settings: &RecordingSettings) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        Ok(Box::new(FfmpegEncoder::spawn(&self.program, settings)?))
    }
}

pub fn codec_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::Hevc => "libx265",
        VideoCodec::Vp9 => "libvpx-vp9",
    }
}

/// Command line reading raw RGBA frames on stdin.
pub fn ffmpeg_args(settings: &RecordingSettings) -> Result<Vec<OsString>, EncoderError> {
    let size = settings.size;
    if size.is_empty() {
        return Err(EncoderError::Unsupported(format!("frame size {size}")));
    }
    if size.width % 2 != 0 || size.height % 2 != 0 {
        return Err(EncoderError::Unsupported(format!(
            "yuv420p output needs even dimensions, got {size}"
        )));
    }
    if settings.frame_rate == 0 {
        return Err(EncoderError::Unsupported("frame rate 0".into()));
    }

    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push("-s".into());
    args.push(size.to_string().into());
    args.push("-r".into());
    args.push(settings.frame_rate.to_string().into());
    for arg in ["-i", "-", "-an", "-c:v", codec_name(settings.codec)] {
        args.push(arg.into());
    }
    args.push("-pix_fmt".into());
    args.push("yuv420p".into());
    args.push("-b:v".into());
    args.push(settings.bitrate.to_string().into());
    args.push(settings.output.as_os_str().to_owned());
    Ok(args)
}

enum WriterMsg {
    Frame { rgba: Vec<u8>, copies: u64 },
    Stop,
}

pub struct FfmpegEncoder {
    output: PathBuf,
    size: Size,
    frame_rate: u32,
    tx: Sender<WriterMsg>,
    worker: Option<JoinHandle<Result<(), EncoderError>>>,
    sink_taken: bool,
    warned_exit: bool,
}

impl FfmpegEncoder {
    pub fn spawn(program: &Path, settings: &RecordingSettings) -> Result<Self, EncoderError> {
        let args = ffmpeg_args(settings)?;
        tracing::info!(
            program = %program.display(),
            output = %settings.output.display(),
            size = %settings.size,
            codec = settings.codec.label(),
            "starting encoder"
        );
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Output("encoder stdin unavailable".into()))?;

        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("camfx-encoder".into())
            .spawn(move || write_frames(child, stdin, rx))?;

        Ok(Self {
            output: settings.output.clone(),
            size: settings.size,
            frame_rate: settings.frame_rate,
            tx,
            worker: Some(worker),
            sink_taken: false,
            warned_exit: false,
        })
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn output(&self) -> &Path {
        &self.output
    }

    fn frame_available_soon(&mut self) {
        let exited = self.worker.as_ref().is_some_and(JoinHandle::is_finished);
        if exited && !self.warned_exit {
            tracing::warn!(output = %self.output.display(), "encoder process exited early");
            self.warned_exit = true;
        }
    }

    fn input_sink(&mut self) -> Result<Box<dyn FrameSink>, EncoderError> {
        if self.sink_taken {
            return Err(EncoderError::NoInput);
        }
        self.sink_taken = true;
        Ok(Box::new(FfmpegSink {
            tx: self.tx.clone(),
            size: self.size,
            pacer: RatePacer::new(self.frame_rate),
            dropped: 0,
        }))
    }

    fn stop(mut self: Box<Self>) -> Finalizer {
        // A full queue means the writer is busy; it stops once the sink
        // sender is dropped with the encoder surface.
        let _ = self.tx.try_send(WriterMsg::Stop);
        match self.worker.take() {
            Some(worker) => Finalizer::from_worker(self.output.clone(), worker),
            None => Finalizer::completed(self.output.clone()),
        }
    }
}

struct FfmpegSink {
    tx: Sender<WriterMsg>,
    size: Size,
    pacer: RatePacer,
    dropped: u64,
}

impl FrameSink for FfmpegSink {
    fn submit(&mut self, frame: VideoFrame) -> Result<(), EncoderError> {
        if frame.size != self.size {
            return Err(EncoderError::FrameSize {
                expected: self.size,
                actual: frame.size,
            });
        }
        let copies = self.pacer.copies_for(frame.pts_nanos);
        if copies == 0 {
            return Ok(());
        }
        match self.tx.try_send(WriterMsg::Frame {
            rgba: frame.rgba,
            copies,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!(dropped = self.dropped, "encoder queue full; frame dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(EncoderError::Closed),
        }
    }
}

fn write_frames(
    child: Child,
    mut stdin: ChildStdin,
    rx: Receiver<WriterMsg>,
) -> Result<(), EncoderError> {
    let mut written = 0u64;
    let mut write_error = None;
    for msg in rx.iter() {
        match msg {
            WriterMsg::Frame { rgba, copies } => {
                let result = (0..copies).try_for_each(|_| stdin.write_all(&rgba));
                if let Err(err) = result {
                    write_error = Some(err);
                    break;
                }
                written += copies;
            }
            WriterMsg::Stop => break,
        }
    }
    drop(stdin);

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncoderError::Exited {
            status: output.status,
            detail: stderr.lines().last().unwrap_or("no diagnostics").to_string(),
        });
    }
    if let Some(err) = write_error {
        return Err(err.into());
    }
    tracing::debug!(frames = written, "encoder input closed");
    Ok(())
}
