use crate::encoder::EncoderError;

/// Failures reported by a [`GpuDevice`](crate::gpu::GpuDevice).
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("no surface is current")]
    NoCurrentSurface,
    #[error("failed to create surface: {0}")]
    SurfaceCreation(String),
    #[error("failed to build program '{label}': {reason}")]
    Program { label: String, reason: String },
    #[error("texture upload of {actual} bytes does not match the expected {expected}")]
    UploadSize { expected: usize, actual: usize },
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("device error: {0}")]
    Device(String),
}

/// Failures while presenting a surface.
#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    #[error("surface was lost")]
    Lost,
    #[error("surface configuration is outdated")]
    Outdated,
    #[error("timed out acquiring the next surface image")]
    Timeout,
    #[error("encoder rejected frame: {0}")]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

impl PresentError {
    /// Whether the surface can keep presenting after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Outdated | Self::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("no display surface to fit the recording into")]
    NoDisplaySurface,
    #[error("failed to start encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("failed to allocate encoder surface: {0}")]
    Surface(#[source] GpuError),
    #[error("encoder surface presentation failed: {0}")]
    Present(#[source] PresentError),
    #[error("recording draw failed: {0}")]
    Draw(#[source] GpuError),
}

/// Errors surfaced to callers of [`Pipeline`](crate::Pipeline).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("render thread has shut down")]
    Closed,
    #[error("render thread failed to start: {0}")]
    Startup(String),
    #[error("render thread panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failures while turning a filter configuration into a stage.
#[derive(Debug, thiserror::Error)]
pub enum FilterBuildError {
    #[error("failed to read shader {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load lookup table {path}: {source}")]
    Image {
        path: std::path::PathBuf,
        #[source]
        source: image::ImageError,
    },
}
