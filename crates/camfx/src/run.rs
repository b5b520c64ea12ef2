use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camconfig::PipelineConfig;
use crossbeam_channel::Receiver;
use renderer::{
    build_group, run_preview, CameraFeed, DeviceFactory, DisplayTarget, FfmpegEncoderFactory,
    GpuDevice, HeadlessDevice, Pipeline, PipelineEvent, PipelineOptions, PreviewOptions,
    WgpuDevice, WgpuOptions,
};
use scheduler::MonotonicClock;
use tracing_subscriber::EnvFilter;

use crate::cli::RunArgs;
use crate::sources::{open_camera, CameraSource};

const DEFAULT_HEADLESS_FRAMES: u64 = 120;
const HEADLESS_LOG_LIMIT: usize = 4096;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Parsed configuration plus the directory relative paths resolve against.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub base_dir: PathBuf,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let Some(path) = path else {
        tracing::debug!("no configuration file given; using built-in defaults");
        return Ok(LoadedConfig {
            config: PipelineConfig::default(),
            base_dir: PathBuf::from("."),
        });
    };

    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let config = PipelineConfig::from_toml_str(&text)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tracing::debug!(path = %path.display(), presets = config.presets.len(), "loaded configuration");
    Ok(LoadedConfig { config, base_dir })
}

/// Index of the preset named on the command line, or the first preset.
pub fn resolve_start_preset(config: &PipelineConfig, requested: Option<&str>) -> Result<Option<usize>> {
    match requested {
        Some(name) => {
            let index = config
                .presets
                .iter()
                .position(|preset| preset.name == name);
            match index {
                Some(index) => Ok(Some(index)),
                None => {
                    let known: Vec<&str> = config.presets.iter().map(|p| p.name.as_str()).collect();
                    bail!("unknown preset '{name}' (available: {})", known.join(", "))
                }
            }
        }
        None if config.presets.is_empty() => Ok(None),
        None => Ok(Some(0)),
    }
}

pub fn run(args: RunArgs) -> Result<()> {
    let LoadedConfig { config, base_dir } = load_config(args.config.as_deref())?;
    let options = PipelineOptions::from_config(&config).context("invalid display pacing")?;
    let start_preset = resolve_start_preset(&config, args.preset.as_deref())?;
    let (feed, producer) = open_camera(&config.camera, &base_dir)?;

    let device_factory: DeviceFactory = if args.headless {
        Box::new(|| {
            let (device, _probe) = HeadlessDevice::with_log_limit(HEADLESS_LOG_LIMIT);
            Ok(Box::new(device) as Box<dyn GpuDevice>)
        })
    } else {
        let wgpu_options = WgpuOptions {
            power: args.power,
            vsync: !args.no_vsync,
        };
        Box::new(move || Ok(Box::new(WgpuDevice::new(wgpu_options)?) as Box<dyn GpuDevice>))
    };
    let encoder_factory = Box::new(FfmpegEncoderFactory::new(config.recording.ffmpeg.clone()));

    tracing::info!(
        headless = args.headless,
        camera = ?config.camera.source,
        width = feed.dimensions().width,
        height = feed.dimensions().height,
        refresh_ms = options.pacing.refresh_period().as_secs_f64() * 1000.0,
        "starting camera pipeline"
    );
    let pipeline = Pipeline::spawn(
        options,
        device_factory,
        encoder_factory,
        Arc::new(MonotonicClock::new()),
    )
    .context("failed to start the render thread")?;

    if let Some(index) = start_preset {
        let preset = &config.presets[index];
        let group = build_group(preset, &base_dir)
            .with_context(|| format!("failed to build preset '{}'", preset.name))?;
        tracing::info!(preset = %preset.name, filters = preset.filters.len(), "applying preset");
        pipeline.set_filter_chain(group)?;
    }
    if args.record {
        pipeline.set_recording_enabled(true)?;
    }

    let bridge = pipeline.bind_camera_source(feed.clone())?;
    let fps = config.camera.fps;

    if args.headless {
        let frames = args.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES);
        if frames == 0 {
            bail!("headless runs need a frame limit (--frames N with N > 0)");
        }
        let size = args.size.unwrap_or_else(|| feed.dimensions());
        pipeline.bind_display_surface(DisplayTarget::Offscreen, size)?;
        let source = CameraSource::spawn(&feed, producer, bridge, fps, Some(frames))?;
        let sent = source.wait();
        finish(pipeline, sent)
    } else {
        let limit = args.frames.filter(|frames| *frames > 0);
        let source = CameraSource::spawn(&feed, producer, bridge, fps, limit)?;
        let preview = PreviewOptions {
            size: args.size.unwrap_or_else(|| PreviewOptions::default().size),
            preset_count: config.presets.len(),
            initial_preset: start_preset.unwrap_or(0),
            ..PreviewOptions::default()
        };
        let presets = config.presets.clone();
        let preview_result = run_preview(pipeline.handle(), preview, move |index| {
            let preset = presets
                .get(index)
                .with_context(|| format!("no preset at index {index}"))?;
            Ok(build_group(preset, &base_dir)?)
        });
        let sent = source.stop();
        let finished = finish(pipeline, sent);
        preview_result?;
        finished
    }
}

fn finish(pipeline: Pipeline, sent: u64) -> Result<()> {
    let handle = pipeline.handle();
    let events = pipeline.events().clone();
    pipeline.shutdown().context("render thread did not shut down cleanly")?;
    log_events(&events);

    println!(
        "frames sent: {sent}, rendered: {}, dropped: {}",
        handle.rendered_frames(),
        handle.dropped_frames()
    );
    Ok(())
}

fn log_events(events: &Receiver<PipelineEvent>) {
    for event in events.try_iter() {
        match event {
            PipelineEvent::RecordingStarted { path } => {
                tracing::info!(path = %path.display(), "recording started")
            }
            PipelineEvent::RecordingStopped { path } => {
                tracing::info!(path = %path.display(), "recording stopped")
            }
            PipelineEvent::RecordingFinalized { path } => {
                tracing::info!(path = %path.display(), "recording written")
            }
            PipelineEvent::RecordingFailed { error } => {
                tracing::error!(%error, "recording failed")
            }
            PipelineEvent::Fps { fps, dropped } => tracing::debug!(fps, dropped, "frame rate"),
            PipelineEvent::SurfaceLost => tracing::warn!("display surface was lost"),
            PipelineEvent::Terminated => tracing::debug!("render thread terminated"),
        }
    }
}
