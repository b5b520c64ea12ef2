use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<FilterPreset>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_hz: Option<f64>,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_period: Option<Duration>,
    #[serde(
        default = "default_safety_margin",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub safety_margin: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: Some(DEFAULT_REFRESH_HZ),
            refresh_period: None,
            safety_margin: default_safety_margin(),
        }
    }
}

impl DisplayConfig {
    /// Period between display refreshes. An explicit `refresh_period` wins
    /// over `refresh_hz`.
    pub fn refresh_period(&self) -> Duration {
        if let Some(period) = self.refresh_period {
            return period;
        }
        let hz = self.refresh_hz.unwrap_or(DEFAULT_REFRESH_HZ);
        Duration::from_nanos((1_000_000_000.0 / hz).round() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Vp9,
}

impl VideoCodec {
    pub fn label(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Vp9 => "vp9",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default = "default_encode_width")]
    pub width: u32,
    #[serde(default = "default_encode_height")]
    pub height: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default)]
    pub codec: VideoCodec,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            width: default_encode_width(),
            height: default_encode_height(),
            bitrate: default_bitrate(),
            frame_rate: default_frame_rate(),
            codec: VideoCodec::default(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSourceKind {
    #[default]
    Pattern,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgba,
    Bgra,
    Nv12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: CameraSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: f32,
    #[serde(default)]
    pub format: PixelFormat,
    #[serde(default)]
    pub rotation: u32,
    #[serde(default)]
    pub facing: CameraFacing,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSourceKind::default(),
            image: None,
            width: default_camera_width(),
            height: default_camera_height(),
            fps: default_camera_fps(),
            format: PixelFormat::default(),
            rotation: 0,
            facing: CameraFacing::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilterPreset {
    pub name: String,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterSpec {
    Passthrough,
    Grayscale,
    Sepia,
    Invert,
    Smooth {
        #[serde(default = "default_strength")]
        strength: f32,
    },
    Lookup {
        table: PathBuf,
        #[serde(default = "default_strength")]
        intensity: f32,
    },
    Shader {
        path: PathBuf,
    },
}

impl FilterSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Grayscale => "grayscale",
            Self::Sepia => "sepia",
            Self::Invert => "invert",
            Self::Smooth { .. } => "smooth",
            Self::Lookup { .. } => "lookup",
            Self::Shader { .. } => "shader",
        }
    }
}

const DEFAULT_REFRESH_HZ: f64 = 60.0;

fn default_safety_margin() -> Duration {
    Duration::from_millis(2)
}

fn default_output() -> PathBuf {
    PathBuf::from("camera-test.mp4")
}

fn default_encode_width() -> u32 {
    720
}

fn default_encode_height() -> u32 {
    1280
}

fn default_bitrate() -> u32 {
    4_000_000
}

fn default_frame_rate() -> u32 {
    30
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_camera_width() -> u32 {
    1280
}

fn default_camera_height() -> u32 {
    720
}

fn default_camera_fps() -> f32 {
    30.0
}

fn default_strength() -> f32 {
    1.0
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_safety_margin))
}

/// Accepts humantime strings (`"2ms"`, `"16.6ms"`) or bare numbers, which
/// are read as milliseconds.
fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as milliseconds or a human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v / 1000.0)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn serialize_duration_opt<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => serialize_duration(duration, serializer),
        None => serializer.serialize_none(),
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn preset(&self, name: &str) -> Option<&FilterPreset> {
        self.presets.iter().find(|preset| preset.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_display()?;
        self.validate_recording()?;
        self.validate_camera()?;
        self.validate_presets()
    }

    fn validate_display(&self) -> Result<(), ConfigError> {
        let display = &self.display;
        if let Some(hz) = display.refresh_hz {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(ConfigError::Invalid(
                    "display.refresh_hz must be greater than zero".into(),
                ));
            }
        }

        let period = display.refresh_period();
        if period.is_zero() {
            return Err(ConfigError::Invalid(
                "display refresh period must be greater than zero".into(),
            ));
        }
        if display.safety_margin >= period {
            return Err(ConfigError::Invalid(format!(
                "display.safety_margin ({}) must be shorter than the refresh period ({})",
                humantime::format_duration(display.safety_margin),
                humantime::format_duration(period)
            )));
        }
        Ok(())
    }

    fn validate_recording(&self) -> Result<(), ConfigError> {
        let recording = &self.recording;
        if recording.width == 0 || recording.height == 0 {
            return Err(ConfigError::Invalid(
                "recording width and height must be greater than zero".into(),
            ));
        }
        if recording.width % 2 != 0 || recording.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "recording size {}x{} must use even dimensions for yuv420p output",
                recording.width, recording.height
            )));
        }
        if recording.bitrate == 0 {
            return Err(ConfigError::Invalid(
                "recording.bitrate must be greater than zero".into(),
            ));
        }
        if recording.frame_rate == 0 {
            return Err(ConfigError::Invalid(
                "recording.frame_rate must be greater than zero".into(),
            ));
        }
        if recording.output.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "recording.output may not be empty".into(),
            ));
        }
        Ok(())
    }

    fn validate_camera(&self) -> Result<(), ConfigError> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(ConfigError::Invalid(
                "camera width and height must be greater than zero".into(),
            ));
        }
        if camera.format == PixelFormat::Nv12 && (camera.width % 2 != 0 || camera.height % 2 != 0)
        {
            return Err(ConfigError::Invalid(
                "nv12 camera frames need even width and height".into(),
            ));
        }
        if !camera.fps.is_finite() || camera.fps <= 0.0 {
            return Err(ConfigError::Invalid(
                "camera.fps must be greater than zero".into(),
            ));
        }
        if !matches!(camera.rotation, 0 | 90 | 180 | 270) {
            return Err(ConfigError::Invalid(format!(
                "camera.rotation {} is invalid; expected 0, 90, 180 or 270",
                camera.rotation
            )));
        }
        if camera.source == CameraSourceKind::Image && camera.image.is_none() {
            return Err(ConfigError::Invalid(
                "camera.source = \"image\" requires camera.image".into(),
            ));
        }
        Ok(())
    }

    fn validate_presets(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for preset in &self.presets {
            if preset.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "filter preset names may not be empty".into(),
                ));
            }
            if !seen.insert(preset.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "filter preset '{}' is defined more than once",
                    preset.name
                )));
            }
            for filter in &preset.filters {
                match filter {
                    FilterSpec::Smooth { strength } if !(0.0..=4.0).contains(strength) => {
                        return Err(ConfigError::Invalid(format!(
                            "preset '{}' smooth strength must be within 0..=4",
                            preset.name
                        )));
                    }
                    FilterSpec::Lookup { table, intensity } => {
                        if table.as_os_str().is_empty() {
                            return Err(ConfigError::Invalid(format!(
                                "preset '{}' lookup filter needs a table image",
                                preset.name
                            )));
                        }
                        if !(0.0..=1.0).contains(intensity) {
                            return Err(ConfigError::Invalid(format!(
                                "preset '{}' lookup intensity must be within 0..=1",
                                preset.name
                            )));
                        }
                    }
                    FilterSpec::Shader { path } if path.as_os_str().is_empty() => {
                        return Err(ConfigError::Invalid(format!(
                            "preset '{}' shader filter needs a path",
                            preset.name
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[display]
refresh_hz = 60
safety_margin = "2ms"

[recording]
output = "/tmp/out.mp4"
bitrate = 6000000
codec = "hevc"

[camera]
source = "image"
image = "still.png"
format = "nv12"
rotation = 90
facing = "front"

[[presets]]
name = "beauty"
filters = [{ kind = "smooth", strength = 1.5 }, { kind = "lookup", table = "lut.png" }]

[[presets]]
name = "mono"
filters = [{ kind = "grayscale" }]
"#;

    #[test]
    fn parses_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.display.refresh_period(), Duration::from_nanos(16_666_667));
        assert_eq!(config.display.safety_margin, Duration::from_millis(2));
        assert_eq!(config.recording.codec, VideoCodec::Hevc);
        assert_eq!(config.recording.width, 720);
        assert_eq!(config.recording.height, 1280);
        assert_eq!(config.camera.format, PixelFormat::Nv12);
        assert_eq!(config.camera.facing, CameraFacing::Front);
        let beauty = config.preset("beauty").expect("beauty preset");
        assert_eq!(
            beauty.filters[1],
            FilterSpec::Lookup {
                table: PathBuf::from("lut.png"),
                intensity: 1.0
            }
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.recording.bitrate, 4_000_000);
        assert_eq!(config.recording.output, PathBuf::from("camera-test.mp4"));
        assert_eq!(config.camera.source, CameraSourceKind::Pattern);
        assert!(config.presets.is_empty());
    }

    #[test]
    fn explicit_period_beats_rate() {
        let config = PipelineConfig::from_toml_str(
            r#"
[display]
refresh_hz = 30
refresh_period = 8
"#,
        )
        .unwrap();
        assert_eq!(config.display.refresh_period(), Duration::from_millis(8));
    }

    #[test]
    fn rejects_margin_longer_than_period() {
        let err = PipelineConfig::from_toml_str(
            r#"
[display]
refresh_period = "10ms"
safety_margin = "12ms"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_odd_encode_size() {
        let err = PipelineConfig::from_toml_str(
            r#"
[recording]
width = 721
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_rotation() {
        let err = PipelineConfig::from_toml_str("[camera]\nrotation = 45\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn image_source_requires_path() {
        let err = PipelineConfig::from_toml_str("[camera]\nsource = \"image\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_presets() {
        let err = PipelineConfig::from_toml_str(
            r#"
[[presets]]
name = "a"

[[presets]]
name = "a"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_filter_kind() {
        let err = PipelineConfig::from_toml_str(
            r#"
[[presets]]
name = "x"
filters = [{ kind = "swirl" }]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn defaults_render_and_parse_back() {
        let rendered = PipelineConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("safety_margin = \"2ms\""));
        let parsed = PipelineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.recording.width, 720);
    }
}
