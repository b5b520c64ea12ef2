//! Preview window acting as the display collaborator.
//!
//! The window lives on the calling thread; the render thread draws into it
//! through a surface created from the shared window handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowBuilder;

use crate::filter::{FilterGroup, FilterStage};
use crate::gpu::DisplayTarget;
use crate::pipeline::PipelineHandle;
use crate::thread::ThreadState;
use crate::types::Size;

#[derive(Debug, Clone)]
pub struct PreviewOptions {
    pub title: String,
    pub size: Size,
    /// How often throughput is logged.
    pub stats_interval: Duration,
    /// Presets cycled with `F`.
    pub preset_count: usize,
    /// Index of the preset active when the window opens.
    pub initial_preset: usize,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            title: "camfx preview".to_string(),
            size: Size::new(1280, 720),
            stats_interval: Duration::from_secs(2),
            preset_count: 0,
            initial_preset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviewKey {
    ToggleRecording,
    NextPreset,
    Quit,
}

fn preview_key(key: &Key) -> Option<PreviewKey> {
    match key {
        Key::Named(NamedKey::Escape) => Some(PreviewKey::Quit),
        Key::Character(value) if value.eq_ignore_ascii_case("r") => {
            Some(PreviewKey::ToggleRecording)
        }
        Key::Character(value) if value.eq_ignore_ascii_case("f") => Some(PreviewKey::NextPreset),
        _ => None,
    }
}

/// Opens the preview window and runs its event loop until the window is
/// closed or the pipeline stops. `build_preset` is called with the index of
/// the preset to switch to.
pub fn run_preview<F>(pipeline: PipelineHandle, options: PreviewOptions, mut build_preset: F) -> Result<()>
where
    F: FnMut(usize) -> Result<FilterGroup> + 'static,
{
    let event_loop = EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let window = WindowBuilder::new()
        .with_title(options.title.clone())
        .with_inner_size(PhysicalSize::new(options.size.width, options.size.height))
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create preview window: {err}"))?;
    let window = Arc::new(window);

    let initial = window.inner_size();
    pipeline.bind_display_surface(
        DisplayTarget::Window(window.clone()),
        Size::new(initial.width, initial.height),
    )?;
    tracing::info!(
        width = initial.width,
        height = initial.height,
        "preview window ready (R: record, F: next filter, Esc: quit)"
    );

    let mut recording = false;
    let mut preset = options.initial_preset;
    let mut next_stats = Instant::now() + options.stats_interval;

    let run_result = event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                if let Err(err) = pipeline.surface_destroyed() {
                    tracing::debug!(error = %err, "pipeline already closed");
                }
                elwt.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    return;
                }
                if let Err(err) = pipeline.surface_changed(Size::new(size.width, size.height)) {
                    tracing::warn!(error = %err, "failed to forward resize");
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state != ElementState::Pressed || event.repeat {
                    return;
                }
                match preview_key(&event.logical_key) {
                    Some(PreviewKey::ToggleRecording) => {
                        recording = !recording;
                        tracing::info!(enabled = recording, "toggling recording");
                        if let Err(err) = pipeline.set_recording_enabled(recording) {
                            tracing::warn!(error = %err, "failed to toggle recording");
                        }
                    }
                    Some(PreviewKey::NextPreset) if options.preset_count > 0 => {
                        preset = (preset + 1) % options.preset_count;
                        match build_preset(preset) {
                            Ok(group) => {
                                tracing::info!(preset, name = group.name(), "switching filters");
                                if let Err(err) = pipeline.set_filter_chain(group) {
                                    tracing::warn!(error = %err, "failed to switch filters");
                                }
                            }
                            Err(err) => {
                                tracing::error!(error = %format!("{err:#}"), "failed to build preset")
                            }
                        }
                    }
                    Some(PreviewKey::Quit) => {
                        if let Err(err) = pipeline.surface_destroyed() {
                            tracing::debug!(error = %err, "pipeline already closed");
                        }
                        elwt.exit();
                    }
                    _ => {}
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            if pipeline.state() == ThreadState::Terminated {
                tracing::warn!("render thread stopped; closing preview");
                elwt.exit();
                return;
            }
            let now = Instant::now();
            if now >= next_stats {
                tracing::info!(
                    fps = pipeline.fps().unwrap_or(0.0),
                    dropped = pipeline.dropped_frames(),
                    rendered = pipeline.rendered_frames(),
                    recording = ?pipeline.recording_state(),
                    "pipeline stats"
                );
                next_stats = now + options.stats_interval;
            }
            elwt.set_control_flow(ControlFlow::WaitUntil(next_stats));
        }
        _ => {}
    });

    run_result.map_err(|err| anyhow!("preview event loop error: {err}"))
}
