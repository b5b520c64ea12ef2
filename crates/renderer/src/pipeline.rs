use std::sync::Arc;

use crossbeam_channel::Receiver;
use scheduler::Clock;

use crate::camera::{CameraBridge, CameraFeed};
use crate::command::{Command, CommandSender};
use crate::encoder::EncoderFactory;
use crate::error::PipelineError;
use crate::event::{self, PipelineEvent};
use crate::filter::{FilterGroup, FilterStage};
use crate::gpu::{DeviceFactory, DisplayTarget};
use crate::recorder::RecordingState;
use crate::thread::{Lifecycle, RenderThread, Telemetry, ThreadState};
use crate::types::{PipelineOptions, Size};

/// Camera to display pipeline with optional recording.
///
/// Every mutating call only posts a command and returns; the render thread
/// applies it in order. `shutdown` is the one blocking call.
pub struct Pipeline {
    handle: PipelineHandle,
    events: Receiver<PipelineEvent>,
    thread: RenderThread,
}

impl Pipeline {
    /// Starts the render thread and returns once its device is ready.
    pub fn spawn(
        options: PipelineOptions,
        device_factory: DeviceFactory,
        encoder_factory: Box<dyn EncoderFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        let (events_tx, events) = event::channel();
        let thread = RenderThread::spawn(
            options,
            device_factory,
            encoder_factory,
            Arc::clone(&clock),
            events_tx,
        )?;
        let handle = PipelineHandle {
            sender: thread.sender().clone(),
            lifecycle: Arc::clone(thread.lifecycle()),
            telemetry: Arc::clone(thread.telemetry()),
            clock,
        };
        Ok(Self {
            handle,
            events,
            thread,
        })
    }

    /// Clonable control handle for other threads.
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn set_filter_chain(&self, group: FilterGroup) -> Result<(), PipelineError> {
        self.handle.set_filter_chain(group)
    }

    pub fn insert_filter(&self, index: usize, stage: Box<dyn FilterStage>) -> Result<(), PipelineError> {
        self.handle.insert_filter(index, stage)
    }

    pub fn remove_filter(&self, index: usize) -> Result<(), PipelineError> {
        self.handle.remove_filter(index)
    }

    pub fn set_recording_enabled(&self, enabled: bool) -> Result<(), PipelineError> {
        self.handle.set_recording_enabled(enabled)
    }

    pub fn bind_camera_source(&self, feed: Arc<dyn CameraFeed>) -> Result<CameraBridge, PipelineError> {
        self.handle.bind_camera_source(feed)
    }

    pub fn bind_display_surface(&self, target: DisplayTarget, size: Size) -> Result<(), PipelineError> {
        self.handle.bind_display_surface(target, size)
    }

    pub fn surface_changed(&self, size: Size) -> Result<(), PipelineError> {
        self.handle.surface_changed(size)
    }

    pub fn surface_destroyed(&self) -> Result<(), PipelineError> {
        self.handle.surface_destroyed()
    }

    pub fn fps(&self) -> Option<f64> {
        self.handle.fps()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.handle.dropped_frames()
    }

    pub fn rendered_frames(&self) -> u64 {
        self.handle.rendered_frames()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.handle.recording_state()
    }

    pub fn state(&self) -> ThreadState {
        self.handle.state()
    }

    /// Events emitted by the render thread, oldest first.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// Posts `Shutdown` and waits for the render thread to release its
    /// resources and exit. Recordings in progress are finalized first.
    pub fn shutdown(self) -> Result<(), PipelineError> {
        self.thread.shutdown()
    }
}

/// Thread-safe control handle. Once the pipeline has shut down every post
/// fails with [`PipelineError::Closed`].
#[derive(Clone)]
pub struct PipelineHandle {
    sender: CommandSender,
    lifecycle: Arc<Lifecycle>,
    telemetry: Arc<Telemetry>,
    clock: Arc<dyn Clock>,
}

impl PipelineHandle {
    pub fn sender(&self) -> &CommandSender {
        &self.sender
    }

    pub fn set_filter_chain(&self, group: FilterGroup) -> Result<(), PipelineError> {
        self.sender.send(Command::SetFilterChain(group))
    }

    pub fn insert_filter(&self, index: usize, stage: Box<dyn FilterStage>) -> Result<(), PipelineError> {
        self.sender.send(Command::InsertFilter { index, stage })
    }

    pub fn remove_filter(&self, index: usize) -> Result<(), PipelineError> {
        self.sender.send(Command::RemoveFilter { index })
    }

    pub fn set_recording_enabled(&self, enabled: bool) -> Result<(), PipelineError> {
        self.sender.send(Command::SetRecording(enabled))
    }

    /// Binds `feed` as the camera and returns the bridge its notification
    /// thread should call for every new frame.
    pub fn bind_camera_source(&self, feed: Arc<dyn CameraFeed>) -> Result<CameraBridge, PipelineError> {
        self.sender.send(Command::BindCamera(feed))?;
        Ok(CameraBridge::new(self.sender.clone(), Arc::clone(&self.clock)))
    }

    pub fn bind_display_surface(&self, target: DisplayTarget, size: Size) -> Result<(), PipelineError> {
        self.sender.send(Command::SurfaceCreated {
            target,
            width: size.width,
            height: size.height,
        })
    }

    pub fn surface_changed(&self, size: Size) -> Result<(), PipelineError> {
        self.sender.send(Command::SurfaceChanged {
            width: size.width,
            height: size.height,
        })
    }

    pub fn surface_destroyed(&self) -> Result<(), PipelineError> {
        self.sender.send(Command::SurfaceDestroyed)
    }

    pub fn fps(&self) -> Option<f64> {
        self.telemetry.fps()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.telemetry.dropped_frames()
    }

    pub fn rendered_frames(&self) -> u64 {
        self.telemetry.rendered_frames()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.telemetry.recording_state()
    }

    pub fn state(&self) -> ThreadState {
        self.lifecycle.state()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("sender", &self.sender)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
