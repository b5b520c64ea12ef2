use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camconfig::PixelFormat;
use renderer::gpu::{GpuOp, HeadlessProbe, SurfaceKind};
use renderer::{
    CameraBridge, CameraOrientation, DeviceFactory, DisplayTarget, EncoderError, EncoderFactory,
    Finalizer, FilterGroup, FrameSink, GpuDevice, HeadlessDevice, Pipeline, PipelineError,
    PipelineEvent, PipelineOptions, RecordingSettings, RecordingState, ShaderStage, Size,
    SlotFeed, ThreadState, VideoEncoder, VideoFrame,
};
use scheduler::ManualClock;

const NOW: u64 = 1_000_000_000;
const DISPLAY: Size = Size::new(64, 32);

#[derive(Default)]
struct EncoderLog {
    created: usize,
    stopped: usize,
    frames: Vec<u64>,
}

struct FakeSink(Arc<Mutex<EncoderLog>>);

impl FrameSink for FakeSink {
    fn submit(&mut self, frame: VideoFrame) -> Result<(), EncoderError> {
        self.0.lock().unwrap().frames.push(frame.pts_nanos);
        Ok(())
    }
}

struct FakeEncoder {
    output: PathBuf,
    log: Arc<Mutex<EncoderLog>>,
}

impl VideoEncoder for FakeEncoder {
    fn output(&self) -> &Path {
        &self.output
    }

    fn frame_available_soon(&mut self) {}

    fn input_sink(&mut self) -> Result<Box<dyn FrameSink>, EncoderError> {
        Ok(Box::new(FakeSink(Arc::clone(&self.log))))
    }

    fn stop(self: Box<Self>) -> Finalizer {
        self.log.lock().unwrap().stopped += 1;
        Finalizer::completed(self.output)
    }
}

struct FakeFactory(Arc<Mutex<EncoderLog>>);

impl EncoderFactory for FakeFactory {
    fn create(&self, settings: &RecordingSettings) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        self.0.lock().unwrap().created += 1;
        Ok(Box::new(FakeEncoder {
            output: settings.output.clone(),
            log: Arc::clone(&self.0),
        }))
    }
}

struct Harness {
    pipeline: Pipeline,
    probe: HeadlessProbe,
    clock: Arc<ManualClock>,
    encoder: Arc<Mutex<EncoderLog>>,
}

impl Harness {
    fn new() -> Self {
        let (device, probe) = HeadlessDevice::new();
        let device_factory: DeviceFactory =
            Box::new(move || Ok(Box::new(device) as Box<dyn GpuDevice>));
        let encoder = Arc::new(Mutex::new(EncoderLog::default()));
        let clock = Arc::new(ManualClock::new(NOW));
        let pipeline = Pipeline::spawn(
            PipelineOptions::default(),
            device_factory,
            Box::new(FakeFactory(Arc::clone(&encoder))),
            clock.clone(),
        )
        .unwrap();
        Self {
            pipeline,
            probe,
            clock,
            encoder,
        }
    }

    /// Display plus a 4x4 RGBA camera.
    fn wired() -> (Self, CameraBridge) {
        let harness = Self::new();
        harness
            .pipeline
            .bind_display_surface(DisplayTarget::Offscreen, DISPLAY)
            .unwrap();
        let feed = Arc::new(SlotFeed::new(
            PixelFormat::Rgba,
            Size::new(4, 4),
            CameraOrientation::default(),
        ));
        let bridge = harness.pipeline.bind_camera_source(feed).unwrap();
        (harness, bridge)
    }

    /// Posts frame `index` well within the budget. The clock stays put, so
    /// the verdict does not depend on how far the render thread lags behind.
    fn fresh_frame(&self, bridge: &CameraBridge, index: u64) {
        bridge.frame_available_at(frame_timestamp(index)).unwrap();
    }
}

/// Frames 1..=5 are 4..0 ms behind the pinned clock, 1 ms apart.
fn frame_timestamp(index: u64) -> u64 {
    NOW - 5_000_000 + index * 1_000_000
}

fn draw_labels(ops: &[GpuOp]) -> Vec<String> {
    ops.iter()
        .filter_map(|op| match op {
            GpuOp::Draw { label, .. } => Some(label.clone()),
            _ => None,
        })
        .collect()
}

fn wait_for_state(pipeline: &Pipeline, state: ThreadState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.state() != state {
        assert!(Instant::now() < deadline, "render thread never reached {state:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn frames_render_in_arrival_order() {
    let (harness, bridge) = Harness::wired();
    let handle = harness.pipeline.handle();
    for index in 1..=5 {
        harness.fresh_frame(&bridge, index);
    }
    harness.pipeline.shutdown().unwrap();

    let frames: Vec<i32> = harness
        .probe
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            GpuOp::Draw { label, frame, .. } if label == "camera input" => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames, [0, 1, 2, 3, 4]);
    assert_eq!(handle.rendered_frames(), 5);
    assert_eq!(handle.dropped_frames(), 0);
}

#[test]
fn late_frames_are_dropped_and_counted() {
    let (harness, bridge) = Harness::wired();
    let handle = harness.pipeline.handle();
    harness.clock.set(NOW);
    bridge.frame_available_at(NOW - 15_000_000).unwrap();
    bridge.frame_available_at(NOW - 10_000_000).unwrap();
    harness.pipeline.shutdown().unwrap();

    assert_eq!(handle.dropped_frames(), 1);
    assert_eq!(handle.rendered_frames(), 1);
    let camera_draws = draw_labels(&harness.probe.ops())
        .into_iter()
        .filter(|label| label == "camera input")
        .count();
    assert_eq!(camera_draws, 1);
}

#[test]
fn filter_insert_is_first_visible_in_the_next_frame() {
    let (harness, bridge) = Harness::wired();
    harness.fresh_frame(&bridge, 1);
    harness
        .pipeline
        .insert_filter(0, Box::new(ShaderStage::grayscale()))
        .unwrap();
    harness.fresh_frame(&bridge, 2);
    harness.pipeline.shutdown().unwrap();

    assert_eq!(
        draw_labels(&harness.probe.ops()),
        ["camera input", "record", "camera input", "grayscale", "record"]
    );
}

#[test]
fn replacing_the_chain_swaps_user_filters() {
    let (harness, bridge) = Harness::wired();
    harness
        .pipeline
        .set_filter_chain(FilterGroup::with_stages(
            "warm",
            vec![Box::new(ShaderStage::sepia())],
        ))
        .unwrap();
    harness.fresh_frame(&bridge, 1);
    harness
        .pipeline
        .set_filter_chain(FilterGroup::with_stages(
            "negative",
            vec![Box::new(ShaderStage::invert()), Box::new(ShaderStage::grayscale())],
        ))
        .unwrap();
    harness.fresh_frame(&bridge, 2);
    harness.pipeline.remove_filter(0).unwrap();
    harness.fresh_frame(&bridge, 3);
    harness.pipeline.shutdown().unwrap();

    assert_eq!(
        draw_labels(&harness.probe.ops()),
        [
            "camera input",
            "sepia",
            "record",
            "camera input",
            "invert",
            "grayscale",
            "record",
            "camera input",
            "grayscale",
            "record",
        ]
    );
}

#[test]
fn recording_toggles_are_idempotent() {
    let (harness, bridge) = Harness::wired();
    let events = harness.pipeline.events().clone();
    let handle = harness.pipeline.handle();

    handle.set_recording_enabled(true).unwrap();
    handle.set_recording_enabled(true).unwrap();
    harness.fresh_frame(&bridge, 1);
    handle.set_recording_enabled(false).unwrap();
    handle.set_recording_enabled(false).unwrap();
    harness.fresh_frame(&bridge, 2);
    harness.pipeline.shutdown().unwrap();

    let log = harness.encoder.lock().unwrap();
    assert_eq!(log.created, 1);
    assert_eq!(log.stopped, 1);
    assert_eq!(log.frames, [frame_timestamp(1)]);
    assert_eq!(handle.recording_state(), RecordingState::Idle);

    let events: Vec<_> = events.try_iter().collect();
    let path = RecordingSettings::default().output;
    assert_eq!(
        events,
        [
            PipelineEvent::RecordingStarted { path: path.clone() },
            PipelineEvent::RecordingStopped { path: path.clone() },
            PipelineEvent::RecordingFinalized { path },
            PipelineEvent::Terminated,
        ]
    );
}

#[test]
fn encoder_surface_failure_releases_the_encoder() {
    let (harness, bridge) = Harness::wired();
    let events = harness.pipeline.events().clone();
    let handle = harness.pipeline.handle();
    harness.probe.reject_encoder_surfaces(true);

    handle.set_recording_enabled(true).unwrap();
    harness.fresh_frame(&bridge, 1);
    harness.pipeline.shutdown().unwrap();

    let log = harness.encoder.lock().unwrap();
    assert_eq!(log.created, 1);
    assert_eq!(log.stopped, 1);
    assert!(log.frames.is_empty());
    assert_eq!(handle.recording_state(), RecordingState::Idle);
    assert_eq!(handle.rendered_frames(), 1);

    let events: Vec<_> = events.try_iter().collect();
    assert!(matches!(events[0], PipelineEvent::RecordingFailed { .. }));
    assert!(!events
        .iter()
        .any(|event| matches!(event, PipelineEvent::RecordingStarted { .. })));
}

#[test]
fn lost_display_shuts_the_render_thread_down() {
    let (harness, bridge) = Harness::wired();
    let events = harness.pipeline.events().clone();
    let handle = harness.pipeline.handle();
    harness.probe.lose_next_swap(SurfaceKind::Offscreen);
    harness.fresh_frame(&bridge, 1);

    wait_for_state(&harness.pipeline, ThreadState::Terminated);
    assert!(matches!(
        handle.set_recording_enabled(true),
        Err(PipelineError::Closed)
    ));
    assert!(matches!(
        bridge.frame_available_at(NOW),
        Err(PipelineError::Closed)
    ));
    harness.pipeline.shutdown().unwrap();

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(events, [PipelineEvent::SurfaceLost, PipelineEvent::Terminated]);
}

#[test]
fn shutdown_releases_every_resource() {
    let (harness, bridge) = Harness::wired();
    let handle = harness.pipeline.handle();
    handle
        .set_filter_chain(FilterGroup::with_stages(
            "look",
            vec![Box::new(ShaderStage::sepia()), Box::new(ShaderStage::grayscale())],
        ))
        .unwrap();
    handle.set_recording_enabled(true).unwrap();
    harness.fresh_frame(&bridge, 1);
    harness.pipeline.shutdown().unwrap();

    assert_eq!(handle.state(), ThreadState::Terminated);
    assert!(matches!(
        handle.surface_changed(Size::new(1, 1)),
        Err(PipelineError::Closed)
    ));

    let ops = harness.probe.ops();
    let count = |predicate: fn(&GpuOp) -> bool| ops.iter().filter(|op| predicate(op)).count();
    assert_eq!(
        count(|op| matches!(op, GpuOp::CreateSurface { .. })),
        count(|op| matches!(op, GpuOp::ReleaseSurface(_)))
    );
    assert_eq!(
        count(|op| matches!(op, GpuOp::CreateTexture { .. })),
        count(|op| matches!(op, GpuOp::DestroyTexture(_)))
    );
    assert_eq!(
        count(|op| matches!(op, GpuOp::CreateProgram { .. })),
        count(|op| matches!(op, GpuOp::DestroyProgram(_)))
    );
    assert_eq!(harness.encoder.lock().unwrap().stopped, 1);
}

#[test]
fn frames_without_a_display_are_ignored() {
    let harness = Harness::new();
    let handle = harness.pipeline.handle();
    let feed = Arc::new(SlotFeed::new(
        PixelFormat::Rgba,
        Size::new(4, 4),
        CameraOrientation::default(),
    ));
    let bridge = handle.bind_camera_source(feed).unwrap();
    harness.fresh_frame(&bridge, 1);
    harness.pipeline.shutdown().unwrap();

    assert_eq!(handle.rendered_frames(), 0);
    assert_eq!(handle.dropped_frames(), 0);
    assert!(draw_labels(&harness.probe.ops()).is_empty());
}

#[test]
fn device_failure_is_reported_from_spawn() {
    let device_factory: DeviceFactory = Box::new(|| Err(anyhow::anyhow!("no adapter available")));
    let result = Pipeline::spawn(
        PipelineOptions::default(),
        device_factory,
        Box::new(FakeFactory(Arc::default())),
        Arc::new(ManualClock::new(0)),
    );
    let Err(PipelineError::Startup(message)) = result else {
        panic!("expected a startup error");
    };
    assert!(message.contains("no adapter available"));
}
