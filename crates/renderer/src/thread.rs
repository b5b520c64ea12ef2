//! The render thread: sole owner of the graphics device.
//!
//! Producers post [`Command`]s; the thread runs them one at a time in
//! arrival order. Filter and recording changes are parked in the render
//! context's deferred queue and applied at the start of the next accepted
//! frame, so a change requested while frame N draws is first visible in
//! frame N+1.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use scheduler::{Clock, FrameDecision, FrameScheduler, FrameTiming};

use crate::command::{self, Command, CommandReceiver, CommandSender};
use crate::context::{DeferredAction, DisplaySurface, RenderContext};
use crate::encoder::EncoderFactory;
use crate::error::{GpuError, PipelineError, PresentError};
use crate::event::{EventSender, PipelineEvent};
use crate::filter::{DrawContext, FilterChain};
use crate::gpu::DeviceFactory;
use crate::recorder::{Recorder, RecordingState};
use crate::types::{PipelineOptions, Size, Viewport};

pub const RENDER_THREAD_NAME: &str = "camfx-render";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Starting,
    Ready,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug)]
struct LifecycleInner {
    state: ThreadState,
    startup_error: Option<String>,
}

/// Render thread state shared with its owner.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    changed: Condvar,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: ThreadState::Starting,
                startup_error: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    fn set(&self, state: ThreadState) {
        self.lock().state = state;
        self.changed.notify_all();
    }

    fn fail_startup(&self, error: String) {
        let mut inner = self.lock();
        inner.state = ThreadState::Terminated;
        inner.startup_error = Some(error);
        drop(inner);
        self.changed.notify_all();
    }

    /// Blocks until the thread has left `Starting`.
    fn wait_ready(&self) -> Result<(), String> {
        let mut inner = self.lock();
        while inner.state == ThreadState::Starting {
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match inner.startup_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Counters published by the render thread for lock-free reads.
#[derive(Debug, Default)]
pub struct Telemetry {
    fps_bits: AtomicU64,
    dropped: AtomicU64,
    rendered: AtomicU64,
    recording: AtomicBool,
}

impl Telemetry {
    /// Latest throughput estimate; `None` until the first window closes.
    pub fn fps(&self) -> Option<f64> {
        let bits = self.fps_bits.load(Ordering::Relaxed);
        (bits != 0).then(|| f64::from_bits(bits))
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn recording_state(&self) -> RecordingState {
        if self.recording.load(Ordering::Relaxed) {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// Owner handle for the render thread. Dropping it shuts the thread down.
pub struct RenderThread {
    sender: CommandSender,
    lifecycle: Arc<Lifecycle>,
    telemetry: Arc<Telemetry>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Starts the thread and waits until its device exists. Device
    /// construction errors are returned here and the thread is joined.
    pub(crate) fn spawn(
        options: PipelineOptions,
        device_factory: DeviceFactory,
        encoder_factory: Box<dyn EncoderFactory>,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Result<Self, PipelineError> {
        let (sender, receiver) = command::channel();
        let lifecycle = Arc::new(Lifecycle::new());
        let telemetry = Arc::new(Telemetry::default());

        let thread_lifecycle = Arc::clone(&lifecycle);
        let thread_telemetry = Arc::clone(&telemetry);
        let handle = thread::Builder::new()
            .name(RENDER_THREAD_NAME.into())
            .spawn(move || {
                run_render_thread(
                    options,
                    device_factory,
                    encoder_factory,
                    clock,
                    events,
                    receiver,
                    thread_lifecycle,
                    thread_telemetry,
                )
            })?;

        if let Err(error) = lifecycle.wait_ready() {
            if handle.join().is_err() {
                tracing::error!("render thread panicked during startup");
            }
            return Err(PipelineError::Startup(error));
        }

        Ok(Self {
            sender,
            lifecycle,
            telemetry,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> &CommandSender {
        &self.sender
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn state(&self) -> ThreadState {
        self.lifecycle.state()
    }

    /// Posts `Shutdown` and joins. Resources are released when this returns.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(PipelineError::Closed) = self.sender.send(Command::Shutdown) {
            tracing::debug!("render thread already stopping");
        }
        handle.join().map_err(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            PipelineError::Panicked(message)
        })
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "render thread did not shut down cleanly");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_render_thread(
    options: PipelineOptions,
    device_factory: DeviceFactory,
    encoder_factory: Box<dyn EncoderFactory>,
    clock: Arc<dyn Clock>,
    events: EventSender,
    receiver: CommandReceiver,
    lifecycle: Arc<Lifecycle>,
    telemetry: Arc<Telemetry>,
) {
    let _terminated = TerminationGuard(Arc::clone(&lifecycle));
    let device = match device_factory() {
        Ok(device) => device,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "failed to create graphics device");
            lifecycle.fail_startup(format!("{err:#}"));
            return;
        }
    };
    tracing::info!(backend = device.backend_name(), "render thread ready");

    let mut render = RenderContext::new(device);
    let mut chain = FilterChain::new();
    if let Err(err) = chain.init(render.device()) {
        chain.destroy(render.device());
        lifecycle.fail_startup(format!("failed to initialise filter chain: {err}"));
        return;
    }

    let worker = Worker {
        render,
        chain,
        scheduler: FrameScheduler::new(options.pacing),
        recorder: Recorder::new(options.recording, encoder_factory, events.clone()),
        clock,
        telemetry,
        events,
        background: options.background,
    };
    lifecycle.set(ThreadState::Ready);
    worker.run(&receiver, &lifecycle);
}

/// Marks the lifecycle terminated however the thread exits, so a panic
/// during startup cannot leave `spawn` waiting forever.
struct TerminationGuard(Arc<Lifecycle>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        if self.0.state() == ThreadState::Starting {
            self.0
                .fail_startup("render thread exited during startup".to_string());
        } else {
            self.0.set(ThreadState::Terminated);
        }
    }
}

enum Flow {
    Continue,
    Break,
}

struct Worker {
    render: RenderContext,
    chain: FilterChain,
    scheduler: FrameScheduler,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,
    events: EventSender,
    background: [f32; 4],
}

impl Worker {
    fn run(mut self, receiver: &CommandReceiver, lifecycle: &Lifecycle) {
        lifecycle.set(ThreadState::Running);
        while let Some(command) = receiver.recv() {
            tracing::trace!(command = command.name(), "processing command");
            let flow = self.handle(command);
            self.recorder.reap_finalized();
            self.publish_recording_state();
            if let Flow::Break = flow {
                break;
            }
        }

        let discarded = receiver.close();
        if discarded > 0 {
            tracing::debug!(discarded, "discarding commands queued behind shutdown");
        }
        lifecycle.set(ThreadState::ShuttingDown);
        self.teardown();
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::SurfaceCreated {
                target,
                width,
                height,
            } => self.surface_created(&target, Size::new(width, height)),
            Command::SurfaceChanged { width, height } => {
                self.surface_changed(Size::new(width, height))
            }
            Command::SurfaceDestroyed => {
                self.recorder.disable(&mut self.render);
                self.render.detach_display();
                tracing::info!("display surface destroyed; frames ignored until a new one");
            }
            Command::DoFrame(timestamp) => return self.do_frame(timestamp),
            Command::SetRecording(enabled) => {
                self.defer(DeferredAction::SetRecording(enabled));
            }
            Command::SetFilterChain(group) => self.defer(DeferredAction::ReplaceFilters(group)),
            Command::InsertFilter { index, stage } => {
                self.defer(DeferredAction::InsertFilter { index, stage })
            }
            Command::RemoveFilter { index } => self.defer(DeferredAction::RemoveFilter { index }),
            Command::BindCamera(feed) => self.defer(DeferredAction::BindCamera(feed)),
            Command::Shutdown => {
                tracing::info!("shutdown requested");
                return Flow::Break;
            }
        }
        Flow::Continue
    }

    fn defer(&mut self, action: DeferredAction) {
        tracing::debug!(action = action.name(), "deferring until the next frame");
        self.render.deferred().push(action);
    }

    fn surface_created(&mut self, target: &crate::gpu::DisplayTarget, size: Size) {
        match self.render.attach_display(target, size) {
            Ok(surface) => {
                let surface = surface.id.raw();
                tracing::info!(surface, %size, "display surface created");
                if let Err(err) = self.chain.set_output_size(self.render.device(), size) {
                    tracing::error!(error = %err, "failed to resize filter chain");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to create display surface"),
        }
    }

    fn surface_changed(&mut self, size: Size) {
        if self.render.display().is_none() {
            tracing::debug!(%size, "surface change without a display surface; ignoring");
            return;
        }
        if let Err(err) = self.render.resize_display(size) {
            tracing::error!(error = %err, %size, "failed to resize display surface");
            return;
        }
        tracing::debug!(%size, "display surface changed");
        if let Err(err) = self.chain.set_output_size(self.render.device(), size) {
            tracing::error!(error = %err, "failed to resize filter chain");
        }
    }

    fn do_frame(&mut self, timestamp: u64) -> Flow {
        let Some(display) = self.render.display() else {
            tracing::trace!(timestamp, "no display surface; ignoring frame");
            return Flow::Continue;
        };

        let now = self.clock.now_nanos();
        if let FrameDecision::Drop { lag_nanos } = self.scheduler.schedule(timestamp, now) {
            self.telemetry
                .dropped
                .store(self.scheduler.stats().dropped(), Ordering::Relaxed);
            tracing::trace!(timestamp, lag_nanos, "frame too late; dropped");
            return Flow::Continue;
        }

        self.apply_deferred();
        let timing = self.scheduler.timing(timestamp);
        if let Err(err) = self.draw_frame(display, timing) {
            tracing::error!(error = %err, timestamp, "frame draw failed");
        }
        self.recorder.take_failure(&mut self.render);

        if let Err(err) = self.render.ensure_display_current() {
            tracing::error!(error = %err, "failed to restore the display surface");
            self.events.emit(PipelineEvent::SurfaceLost);
            return Flow::Break;
        }

        match self.render.swap_buffers(display.id) {
            Ok(()) => {
                if let Some(fps) = self.scheduler.record_rendered(timestamp) {
                    let dropped = self.scheduler.stats().dropped();
                    self.telemetry.set_fps(fps);
                    tracing::debug!(fps, dropped, "frame rate window closed");
                    self.events.emit(PipelineEvent::Fps { fps, dropped });
                }
                self.telemetry
                    .rendered
                    .store(self.scheduler.stats().rendered(), Ordering::Relaxed);
                Flow::Continue
            }
            Err(err) if err.is_recoverable() => {
                tracing::debug!(error = %err, "display not ready; skipping frame");
                if matches!(err, PresentError::Outdated) {
                    if let Err(err) = self.render.resize_display(display.size) {
                        tracing::warn!(error = %err, "failed to reconfigure display surface");
                    }
                }
                Flow::Continue
            }
            Err(err) => {
                tracing::error!(error = %err, "display presentation failed; shutting down");
                self.events.emit(PipelineEvent::SurfaceLost);
                Flow::Break
            }
        }
    }

    fn draw_frame(&mut self, display: DisplaySurface, timing: FrameTiming) -> Result<(), GpuError> {
        self.render.make_current(Some(display.id))?;
        self.render.bind_framebuffer(None)?;
        self.render.set_viewport(Viewport::full(display.size));
        self.render.clear(self.background)?;
        if !self.chain.has_camera() {
            return Ok(());
        }
        let mut ctx = DrawContext {
            render: &mut self.render,
            timing,
            recording: self.recorder.session_mut(),
        };
        self.chain.draw(&mut ctx)
    }

    fn apply_deferred(&mut self) {
        for action in self.render.deferred().take_all() {
            let name = action.name();
            let result = match action {
                DeferredAction::ReplaceFilters(group) => {
                    self.chain.replace_user(self.render.device(), group)
                }
                DeferredAction::InsertFilter { index, stage } => {
                    self.chain.insert_filter(self.render.device(), index, stage)
                }
                DeferredAction::RemoveFilter { index } => {
                    self.chain.remove_filter(self.render.device(), index)
                }
                DeferredAction::BindCamera(feed) => {
                    self.chain.bind_camera(self.render.device(), feed)
                }
                DeferredAction::SetRecording(enabled) => {
                    self.recorder.set_enabled(&mut self.render, enabled);
                    Ok(())
                }
            };
            if let Err(err) = result {
                tracing::warn!(action = name, error = %err, "deferred action failed");
            }
        }
        self.publish_recording_state();
    }

    fn publish_recording_state(&self) {
        self.telemetry.recording.store(
            self.recorder.state() == RecordingState::Recording,
            Ordering::Relaxed,
        );
    }

    fn teardown(&mut self) {
        self.recorder.disable(&mut self.render);
        self.recorder.finish_all();
        self.chain.destroy(self.render.device());
        self.render.detach_display();
        self.publish_recording_state();
        tracing::info!(
            rendered = self.scheduler.stats().rendered(),
            dropped = self.scheduler.stats().dropped(),
            "render thread terminated"
        );
        self.events.emit(PipelineEvent::Terminated);
    }
}
