mod cli;
mod run;
mod sources;

use std::path::Path;

use anyhow::{Context, Result};
use camconfig::{CameraSourceKind, PipelineConfig};
use cli::Command;
use renderer::build_group;
use scheduler::PacingPolicy;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Command::Run(args) => run::run(args),
        Command::Check(args) => run_check(&args.path),
        Command::Defaults => run_defaults(),
    }
}

fn run_check(path: &Path) -> Result<()> {
    let loaded = run::load_config(Some(path))?;
    let config = &loaded.config;
    let pacing = PacingPolicy::from_display(&config.display).context("invalid display pacing")?;

    println!("Configuration {} is valid.", path.display());
    println!("Display:");
    println!(
        "  refresh:    {:.3} ms",
        pacing.refresh_period().as_secs_f64() * 1000.0
    );
    println!(
        "  margin:     {:.3} ms",
        pacing.safety_margin().as_secs_f64() * 1000.0
    );
    println!("Recording:");
    println!("  output:     {}", config.recording.output.display());
    println!(
        "  encode:     {}x{} {} @ {} fps, {} bps",
        config.recording.width,
        config.recording.height,
        config.recording.codec.label(),
        config.recording.frame_rate,
        config.recording.bitrate
    );
    println!("  ffmpeg:     {}", config.recording.ffmpeg.display());
    println!("Camera:");
    match config.camera.source {
        CameraSourceKind::Pattern => println!(
            "  source:     pattern {}x{} @ {} fps",
            config.camera.width, config.camera.height, config.camera.fps
        ),
        CameraSourceKind::Image => println!(
            "  source:     image {}",
            config
                .camera
                .image
                .as_deref()
                .map(|image| image.display().to_string())
                .unwrap_or_default()
        ),
    }
    println!(
        "  format:     {:?}, rotation {}, {:?} facing",
        config.camera.format, config.camera.rotation, config.camera.facing
    );

    if config.presets.is_empty() {
        println!("No filter presets.");
        return Ok(());
    }
    println!("Presets:");
    for preset in &config.presets {
        build_group(preset, &loaded.base_dir)
            .with_context(|| format!("preset '{}' cannot be built", preset.name))?;
        let kinds: Vec<&str> = preset.filters.iter().map(|filter| filter.kind()).collect();
        println!("  {:<16} {}", preset.name, kinds.join(" > "));
    }
    Ok(())
}

fn run_defaults() -> Result<()> {
    let text = PipelineConfig::default()
        .to_toml_string()
        .context("failed to render default configuration")?;
    print!("{text}");
    Ok(())
}
