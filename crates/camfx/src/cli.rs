use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use renderer::{GpuPowerPreference, Size};

#[derive(Parser, Debug)]
#[command(
    name = "camfx",
    author,
    version,
    about = "Camera filter preview and recorder",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline with the configured camera source.
    Run(RunArgs),
    /// Validate a configuration file and summarise it.
    Check(CheckArgs),
    /// Print the default configuration as TOML.
    Defaults,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pipeline configuration (TOML). Built-in defaults when omitted.
    #[arg(long, value_name = "FILE", env = "CAMFX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Render without a GPU or window and exit after `--frames` frames.
    #[arg(long)]
    pub headless: bool,

    /// Number of camera frames to produce before exiting (0 = until closed).
    #[arg(long, value_name = "N")]
    pub frames: Option<u64>,

    /// Start recording as soon as the pipeline is up.
    #[arg(long)]
    pub record: bool,

    /// Filter preset to start with (by name).
    #[arg(long, value_name = "NAME")]
    pub preset: Option<String>,

    /// Preview window size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<Size>,

    /// GPU power preference: `low` or `high`.
    #[arg(long, value_name = "PREF", value_parser = parse_power, default_value = "low")]
    pub power: GpuPowerPreference,

    /// Present without waiting for vertical blank.
    #[arg(long)]
    pub no_vsync: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<Size, String> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width '{}'", w.trim()))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height '{}'", h.trim()))?;
    if width == 0 || height == 0 {
        return Err("dimensions must be greater than zero".into());
    }
    Ok(Size::new(width, height))
}

pub fn parse_power(value: &str) -> Result<GpuPowerPreference, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "low" | "low-power" | "integrated" => Ok(GpuPowerPreference::Low),
        "high" | "high-performance" | "discrete" => Ok(GpuPowerPreference::High),
        other => Err(format!("unknown power preference '{other}'; expected low or high")),
    }
}
