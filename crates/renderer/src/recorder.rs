//! Recording state machine and the terminal stage that renders each frame a
//! second time into the encoder surface.

use std::path::{Path, PathBuf};

use crate::context::RenderContext;
use crate::encoder::{EncoderFactory, Finalizer, VideoEncoder};
use crate::error::{GpuError, RecordingError};
use crate::event::{EventSender, PipelineEvent};
use crate::filter::{DrawContext, FilterStage, ProgramSlot, PASSTHROUGH_BODY};
use crate::gpu::{DrawCall, FilterUniforms, GpuDevice, InputKind, SurfaceId, TextureId};
use crate::types::{RecordingSettings, Size, TargetRect, Viewport};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
}

/// Centres the largest rectangle with the window's aspect ratio inside the
/// fixed encode resolution.
pub fn aspect_fit(window: Size, encode: Size) -> TargetRect {
    if window.is_empty() || encode.is_empty() {
        return TargetRect {
            left: 0,
            top: 0,
            right: encode.width,
            bottom: encode.height,
        };
    }
    let aspect = f64::from(window.height) / f64::from(window.width);
    let (encode_w, encode_h) = (f64::from(encode.width), f64::from(encode.height));
    let (out_w, out_h) = if encode_h > encode_w * aspect {
        (encode.width, (encode_w * aspect).round() as u32)
    } else {
        ((encode_h / aspect).round() as u32, encode.height)
    };
    let out_w = out_w.min(encode.width);
    let out_h = out_h.min(encode.height);
    let left = (encode.width - out_w) / 2;
    let top = (encode.height - out_h) / 2;
    TargetRect {
        left,
        top,
        right: left + out_w,
        bottom: top + out_h,
    }
}

/// Resources held while recording.
pub struct RecordingSession {
    encoder: Box<dyn VideoEncoder>,
    surface: SurfaceId,
    rect: TargetRect,
    encode_size: Size,
    frames: u64,
    failure: Option<RecordingError>,
}

impl RecordingSession {
    pub fn output(&self) -> &Path {
        self.encoder.output()
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Where the filtered image lands inside the encode frame.
    pub fn rect(&self) -> TargetRect {
        self.rect
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Steps (a) to (g) of a recorded frame. The caller restores bindings.
    fn render_frame(
        &mut self,
        render: &mut RenderContext,
        program: crate::gpu::ProgramId,
        input: TextureId,
        input_size: Size,
        timing: &scheduler::FrameTiming,
    ) -> Result<(), RecordingError> {
        self.encoder.frame_available_soon();
        render
            .make_current(Some(self.surface))
            .map_err(RecordingError::Draw)?;
        render.bind_framebuffer(None).map_err(RecordingError::Draw)?;
        render.set_viewport(Viewport::full(self.encode_size));
        render.clear(BLACK).map_err(RecordingError::Draw)?;
        render.set_viewport(self.rect.viewport());

        let mut uniforms = FilterUniforms::new(
            Size::new(self.rect.width(), self.rect.height()),
            input_size,
        );
        uniforms.set_timing(timing);
        render
            .draw(&DrawCall {
                program,
                inputs: &[input],
                uniforms,
            })
            .map_err(RecordingError::Draw)?;

        render.set_presentation_time(self.surface, timing.timestamp);
        render
            .swap_buffers(self.surface)
            .map_err(RecordingError::Present)?;
        self.frames += 1;
        Ok(())
    }
}

struct PendingFinalize {
    finalizer: Finalizer,
    announce: bool,
}

/// Idle/Recording state machine. Lives on the render thread.
pub struct Recorder {
    settings: RecordingSettings,
    factory: Box<dyn EncoderFactory>,
    session: Option<RecordingSession>,
    finalizing: Vec<PendingFinalize>,
    events: EventSender,
}

impl Recorder {
    pub(crate) fn new(
        settings: RecordingSettings,
        factory: Box<dyn EncoderFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            settings,
            factory,
            session: None,
            finalizing: Vec::new(),
            events,
        }
    }

    pub fn state(&self) -> RecordingState {
        if self.session.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut RecordingSession> {
        self.session.as_mut()
    }

    pub fn set_enabled(&mut self, render: &mut RenderContext, enabled: bool) {
        if enabled {
            if let Err(err) = self.enable(render) {
                tracing::warn!(error = %err, "failed to start recording");
                self.events.emit(PipelineEvent::RecordingFailed {
                    error: err.to_string(),
                });
            }
        } else {
            self.disable(render);
        }
    }

    /// Starts a session sized to the current display. A no-op while
    /// already recording.
    pub fn enable(&mut self, render: &mut RenderContext) -> Result<(), RecordingError> {
        if self.session.is_some() {
            tracing::debug!("recording already enabled");
            return Ok(());
        }
        let display = render.display().ok_or(RecordingError::NoDisplaySurface)?;
        let rect = aspect_fit(display.size, self.settings.size);

        let mut encoder = self.factory.create(&self.settings)?;
        let surface = match encoder.input_sink() {
            Ok(sink) => render
                .device()
                .create_encoder_surface(self.settings.size, sink)
                .map_err(RecordingError::Surface),
            Err(err) => Err(RecordingError::Encoder(err)),
        };
        let surface = match surface {
            Ok(surface) => surface,
            Err(err) => {
                // Nothing was written; stop the encoder without announcing a file.
                self.finalizing.push(PendingFinalize {
                    finalizer: encoder.stop(),
                    announce: false,
                });
                return Err(err);
            }
        };

        let path = encoder.output().to_path_buf();
        let window = display.size;
        tracing::info!(
            path = %path.display(),
            encode = %self.settings.size,
            %window,
            left = rect.left,
            top = rect.top,
            right = rect.right,
            bottom = rect.bottom,
            "recording started"
        );
        self.session = Some(RecordingSession {
            encoder,
            surface,
            rect,
            encode_size: self.settings.size,
            frames: 0,
            failure: None,
        });
        self.events.emit(PipelineEvent::RecordingStarted { path });
        Ok(())
    }

    /// Ends the session. Finalisation continues in the background.
    pub fn disable(&mut self, render: &mut RenderContext) {
        if let Some(path) = self.close_session(render) {
            self.events.emit(PipelineEvent::RecordingStopped { path });
        }
    }

    fn close_session(&mut self, render: &mut RenderContext) -> Option<PathBuf> {
        let session = self.session.take()?;
        render.release_surface(session.surface);
        let path = session.encoder.output().to_path_buf();
        tracing::info!(path = %path.display(), frames = session.frames, "recording stopped");
        self.finalizing.push(PendingFinalize {
            finalizer: session.encoder.stop(),
            announce: true,
        });
        Some(path)
    }

    /// Ends a session whose last frame failed.
    pub fn take_failure(&mut self, render: &mut RenderContext) {
        let Some(failure) = self
            .session
            .as_mut()
            .and_then(|session| session.failure.take())
        else {
            return;
        };
        tracing::warn!(error = %failure, "recording frame failed; ending session");
        self.close_session(render);
        self.events.emit(PipelineEvent::RecordingFailed {
            error: failure.to_string(),
        });
    }

    /// Reports encoders that finished writing. Never blocks.
    pub fn reap_finalized(&mut self) {
        if self.finalizing.is_empty() {
            return;
        }
        let (done, pending): (Vec<_>, Vec<_>) = self
            .finalizing
            .drain(..)
            .partition(|pending| pending.finalizer.is_finished());
        self.finalizing = pending;
        for finished in done {
            self.report(finished);
        }
    }

    /// Waits for every stopped encoder.
    pub fn finish_all(&mut self) {
        for pending in std::mem::take(&mut self.finalizing) {
            self.report(pending);
        }
    }

    pub fn finalizing(&self) -> usize {
        self.finalizing.len()
    }

    fn report(&self, pending: PendingFinalize) {
        let PendingFinalize {
            finalizer,
            announce,
        } = pending;
        match finalizer.wait() {
            Ok(path) => {
                tracing::info!(path = %path.display(), "recording finalized");
                if announce {
                    self.events.emit(PipelineEvent::RecordingFinalized { path });
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "encoder failed to finalize");
                if announce {
                    self.events.emit(PipelineEvent::RecordingFailed {
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Last stage of every chain.
///
/// While recording it renders its input into the encoder surface first,
/// restoring the display bindings afterwards. It always draws its input to
/// the display.
pub struct RecordStage {
    program: ProgramSlot,
    output: Size,
}

impl RecordStage {
    pub fn new() -> Self {
        Self {
            program: ProgramSlot::new("record", PASSTHROUGH_BODY, vec![InputKind::Texture2d]),
            output: Size::default(),
        }
    }

    pub fn output_size(&self) -> Size {
        self.output
    }
}

impl Default for RecordStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for RecordStage {
    fn name(&self) -> &str {
        self.program.label()
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        self.program.init(device).map(|_| ())
    }

    fn on_output_size_changed(
        &mut self,
        _device: &mut dyn GpuDevice,
        size: Size,
    ) -> Result<(), GpuError> {
        self.output = size;
        Ok(())
    }

    fn on_draw(&mut self, ctx: &mut DrawContext<'_>, input: TextureId) -> Result<(), GpuError> {
        let Some(program) = self.program.id() else {
            return Ok(());
        };
        let DrawContext {
            render,
            timing,
            recording,
        } = ctx;

        if let Some(session) = recording.as_deref_mut() {
            if session.failure.is_none() {
                let surface = render.current_surface();
                let framebuffer = render.framebuffer();
                let viewport = render.viewport();

                let recorded = session.render_frame(render, program, input, self.output, timing);

                let restored = render
                    .make_current(surface)
                    .and_then(|()| render.bind_framebuffer(framebuffer));
                render.set_viewport(viewport);
                restored?;
                if let Err(err) = recorded {
                    session.failure = Some(err);
                }
            }
        }

        let mut uniforms = FilterUniforms::new(self.output, self.output);
        uniforms.set_timing(timing);
        render.draw(&DrawCall {
            program,
            inputs: &[input],
            uniforms,
        })
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.program.destroy(device);
    }

    fn is_initialized(&self) -> bool {
        self.program.id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::encoder::{EncoderError, FrameSink, VideoFrame};
    use crate::gpu::{DisplayTarget, GpuOp, HeadlessDevice, HeadlessProbe};

    #[test]
    fn landscape_window_fits_by_width() {
        let rect = aspect_fit(Size::new(1280, 720), Size::new(720, 1280));
        assert_eq!(
            rect,
            TargetRect {
                left: 0,
                top: 437,
                right: 720,
                bottom: 842
            }
        );
    }

    #[test]
    fn tall_window_fits_by_height() {
        let rect = aspect_fit(Size::new(400, 1000), Size::new(720, 1280));
        assert_eq!(rect.height(), 1280);
        assert_eq!(rect.width(), 512);
        assert_eq!(rect.left, 104);
    }

    #[test]
    fn matching_aspect_fills_the_frame() {
        let rect = aspect_fit(Size::new(360, 640), Size::new(720, 1280));
        assert_eq!(rect.viewport(), Viewport::full(Size::new(720, 1280)));
    }

    #[derive(Default)]
    struct Counts {
        created: usize,
        stopped: usize,
        frames: usize,
    }

    struct CountingSink(Arc<Mutex<Counts>>);

    impl FrameSink for CountingSink {
        fn submit(&mut self, _frame: VideoFrame) -> Result<(), EncoderError> {
            self.0.lock().unwrap().frames += 1;
            Ok(())
        }
    }

    struct CountingEncoder {
        output: PathBuf,
        counts: Arc<Mutex<Counts>>,
    }

    impl VideoEncoder for CountingEncoder {
        fn output(&self) -> &Path {
            &self.output
        }

        fn frame_available_soon(&mut self) {}

        fn input_sink(&mut self) -> Result<Box<dyn FrameSink>, EncoderError> {
            Ok(Box::new(CountingSink(Arc::clone(&self.counts))))
        }

        fn stop(self: Box<Self>) -> Finalizer {
            self.counts.lock().unwrap().stopped += 1;
            Finalizer::completed(self.output)
        }
    }

    struct CountingFactory(Arc<Mutex<Counts>>);

    impl EncoderFactory for CountingFactory {
        fn create(
            &self,
            settings: &RecordingSettings,
        ) -> Result<Box<dyn VideoEncoder>, EncoderError> {
            self.0.lock().unwrap().created += 1;
            Ok(Box::new(CountingEncoder {
                output: settings.output.clone(),
                counts: Arc::clone(&self.0),
            }))
        }
    }

    fn recorder() -> (
        Recorder,
        RenderContext,
        HeadlessProbe,
        Arc<Mutex<Counts>>,
        crossbeam_channel::Receiver<PipelineEvent>,
    ) {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let (events, rx) = crate::event::channel();
        let recorder = Recorder::new(
            RecordingSettings::default(),
            Box::new(CountingFactory(Arc::clone(&counts))),
            events,
        );
        let (device, probe) = HeadlessDevice::new();
        let mut render = RenderContext::new(Box::new(device));
        render
            .attach_display(&DisplayTarget::Offscreen, Size::new(1280, 720))
            .unwrap();
        (recorder, render, probe, counts, rx)
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let (mut recorder, mut render, _probe, counts, rx) = recorder();
        recorder.enable(&mut render).unwrap();
        recorder.enable(&mut render).unwrap();
        assert_eq!(recorder.state(), RecordingState::Recording);
        assert_eq!(counts.lock().unwrap().created, 1);

        recorder.disable(&mut render);
        recorder.disable(&mut render);
        assert_eq!(recorder.state(), RecordingState::Idle);
        assert_eq!(counts.lock().unwrap().stopped, 1);

        recorder.reap_finalized();
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events[0], PipelineEvent::RecordingStarted { .. }));
        assert!(matches!(events[1], PipelineEvent::RecordingStopped { .. }));
        assert!(matches!(events[2], PipelineEvent::RecordingFinalized { .. }));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn surface_failure_stops_the_encoder_silently() {
        let (mut recorder, mut render, probe, counts, rx) = recorder();
        probe.reject_encoder_surfaces(true);
        let err = recorder.enable(&mut render).unwrap_err();
        assert!(matches!(err, RecordingError::Surface(_)));
        assert_eq!(recorder.state(), RecordingState::Idle);
        assert_eq!(counts.lock().unwrap().stopped, 1);

        recorder.reap_finalized();
        assert_eq!(recorder.finalizing(), 0);
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn enable_without_display_fails() {
        let (mut recorder, mut render, _probe, counts, _rx) = recorder();
        render.detach_display();
        assert!(matches!(
            recorder.enable(&mut render),
            Err(RecordingError::NoDisplaySurface)
        ));
        assert_eq!(counts.lock().unwrap().created, 0);
    }

    #[test]
    fn record_stage_renders_encoder_then_display() {
        let (mut recorder, mut render, probe, counts, _rx) = recorder();
        let display = render.display().unwrap();
        recorder.enable(&mut render).unwrap();
        let encoder_surface = recorder.session_mut().unwrap().surface();

        let mut stage = RecordStage::new();
        stage.init(render.device()).unwrap();
        stage
            .on_output_size_changed(render.device(), display.size)
            .unwrap();
        let input = render
            .device()
            .create_texture(&crate::gpu::TextureDesc {
                label: "input".into(),
                size: display.size,
                usage: crate::gpu::TextureUsage::RenderTarget,
            })
            .unwrap();
        probe.clear_ops();

        let timing = scheduler::FrameTiming {
            timestamp: 42,
            ..Default::default()
        };
        let mut ctx = DrawContext {
            render: &mut render,
            timing,
            recording: recorder.session_mut(),
        };
        stage.on_draw(&mut ctx, input).unwrap();

        let ops = probe.ops();
        let draws: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                GpuOp::Draw {
                    surface, viewport, ..
                } => Some((*surface, *viewport)),
                _ => None,
            })
            .collect();
        assert_eq!(
            draws,
            vec![
                (Some(encoder_surface), Viewport {
                    x: 0,
                    y: 437,
                    width: 720,
                    height: 405
                }),
                (Some(display.id), Viewport::full(display.size)),
            ]
        );
        assert!(ops.contains(&GpuOp::SetPresentationTime {
            surface: encoder_surface,
            nanos: 42
        }));
        assert!(ops.contains(&GpuOp::Swap {
            surface: encoder_surface
        }));
        assert_eq!(render.current_surface(), Some(display.id));
        assert_eq!(counts.lock().unwrap().frames, 1);
        assert_eq!(recorder.session_mut().unwrap().frames(), 1);
    }

    #[test]
    fn lost_encoder_surface_ends_the_session_but_not_the_display() {
        let (mut recorder, mut render, probe, _counts, rx) = recorder();
        let display = render.display().unwrap();
        recorder.enable(&mut render).unwrap();
        let mut stage = RecordStage::new();
        stage.init(render.device()).unwrap();
        stage
            .on_output_size_changed(render.device(), display.size)
            .unwrap();
        let input = render
            .device()
            .create_texture(&crate::gpu::TextureDesc {
                label: "input".into(),
                size: display.size,
                usage: crate::gpu::TextureUsage::RenderTarget,
            })
            .unwrap();
        probe.lose_next_swap(crate::gpu::SurfaceKind::Encoder);

        let mut ctx = DrawContext {
            render: &mut render,
            timing: scheduler::FrameTiming::default(),
            recording: recorder.session_mut(),
        };
        stage.on_draw(&mut ctx, input).unwrap();
        assert_eq!(render.current_surface(), Some(display.id));

        recorder.take_failure(&mut render);
        assert_eq!(recorder.state(), RecordingState::Idle);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RecordingFailed { .. })
        ));
    }
}
