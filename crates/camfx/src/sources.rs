//! Synthetic camera collaborators: a moving test pattern and a still image,
//! each publishing into a [`FrameSlot`] from its own thread and notifying
//! the pipeline through a [`CameraBridge`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camconfig::{CameraConfig, CameraSourceKind, PixelFormat};
use renderer::{
    CameraBridge, CameraFeed, CameraFrame, CameraOrientation, FrameSlot, PipelineError, Rotation,
    Size, SlotFeed,
};
use scheduler::Clock;

const SOURCE_THREAD_NAME: &str = "camfx-camera";

/// Pixels a source publishes for each frame.
#[derive(Debug, Clone)]
pub enum Producer {
    Pattern,
    Still(Arc<[u8]>),
}

/// Builds the feed described by `config`. Image paths resolve against
/// `base_dir`.
pub fn open_camera(config: &CameraConfig, base_dir: &Path) -> Result<(Arc<SlotFeed>, Producer)> {
    let rotation = Rotation::from_degrees(config.rotation)
        .with_context(|| format!("unsupported camera rotation {}", config.rotation))?;
    let orientation = CameraOrientation {
        rotation,
        facing: config.facing,
    };

    match config.source {
        CameraSourceKind::Pattern => {
            let size = Size::new(config.width, config.height);
            let feed = SlotFeed::new(config.format, size, orientation);
            Ok((Arc::new(feed), Producer::Pattern))
        }
        CameraSourceKind::Image => {
            let relative = config
                .image
                .as_ref()
                .ok_or_else(|| anyhow!("camera source `image` needs an image path"))?;
            let path = base_dir.join(relative);
            let image = image::open(&path)
                .with_context(|| format!("failed to load camera image {}", path.display()))?
                .to_rgba8();
            let size = Size::new(image.width(), image.height());
            let pixels = convert_rgba(image.as_raw(), size, config.format);
            tracing::info!(
                path = %path.display(),
                width = size.width,
                height = size.height,
                format = ?config.format,
                "loaded still camera image"
            );
            let feed = SlotFeed::new(config.format, size, orientation);
            Ok((Arc::new(feed), Producer::Still(pixels.into())))
        }
    }
}

/// Producer thread standing in for a camera driver.
pub struct CameraSource {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl CameraSource {
    /// Starts publishing at `fps` until stopped, until `limit` frames were
    /// sent, or until the pipeline closes.
    pub fn spawn(
        feed: &SlotFeed,
        producer: Producer,
        bridge: CameraBridge,
        fps: f32,
        limit: Option<u64>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_secs_f32(1.0 / fps.max(1.0));
        let state = SourceState {
            slot: feed.slot(),
            size: feed.dimensions(),
            format: feed.format(),
            producer,
            bridge,
            interval,
            limit,
            stop: Arc::clone(&stop),
        };
        let handle = thread::Builder::new()
            .name(SOURCE_THREAD_NAME.to_string())
            .spawn(move || state.run())
            .context("failed to spawn camera source thread")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Waits for a frame-limited source to run out.
    pub fn wait(mut self) -> u64 {
        self.join()
    }

    pub fn stop(mut self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.join()
    }

    fn join(&mut self) -> u64 {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(sent)) => sent,
            Some(Err(_)) => {
                tracing::error!("camera source thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join();
    }
}

struct SourceState {
    slot: Arc<FrameSlot>,
    size: Size,
    format: PixelFormat,
    producer: Producer,
    bridge: CameraBridge,
    interval: Duration,
    limit: Option<u64>,
    stop: Arc<AtomicBool>,
}

impl SourceState {
    fn run(self) -> u64 {
        let mut sent = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            if self.limit.is_some_and(|limit| sent >= limit) {
                break;
            }

            let data: Arc<[u8]> = match &self.producer {
                Producer::Pattern => {
                    convert_rgba(&pattern_rgba(self.size, sent), self.size, self.format).into()
                }
                Producer::Still(pixels) => Arc::clone(pixels),
            };
            let timestamp = self.bridge.clock().now_nanos();
            self.slot
                .publish(CameraFrame::new(self.size, self.format, data, timestamp));

            match self.bridge.frame_available_at(timestamp) {
                Ok(()) => sent += 1,
                Err(PipelineError::Closed) => {
                    tracing::debug!(sent, "pipeline closed; camera source stopping");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to notify pipeline");
                    break;
                }
            }
            thread::sleep(self.interval);
        }
        tracing::debug!(sent, "camera source finished");
        sent
    }
}

/// Vertical colour bars scrolling one pixel per frame over a luma ramp.
pub fn pattern_rgba(size: Size, frame: u64) -> Vec<u8> {
    const BARS: [[u8; 3]; 7] = [
        [235, 235, 235],
        [235, 235, 16],
        [16, 235, 235],
        [16, 235, 16],
        [235, 16, 235],
        [235, 16, 16],
        [16, 16, 235],
    ];
    let width = size.width.max(1) as u64;
    let height = size.height.max(1) as u64;
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        let shade = 128 + (y * 127 / height) as u16;
        for x in 0..width {
            let bar = (((x + frame) % width) * BARS.len() as u64 / width) as usize;
            let [r, g, b] = BARS[bar];
            out.push(((r as u16 * shade) / 255) as u8);
            out.push(((g as u16 * shade) / 255) as u8);
            out.push(((b as u16 * shade) / 255) as u8);
            out.push(255);
        }
    }
    out
}

/// Repacks tightly packed RGBA into the camera's native layout.
pub fn convert_rgba(rgba: &[u8], size: Size, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba => rgba.to_vec(),
        PixelFormat::Bgra => rgba
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0], px[3]])
            .collect(),
        PixelFormat::Nv12 => rgba_to_nv12(rgba, size),
    }
}

fn rgba_to_nv12(rgba: &[u8], size: Size) -> Vec<u8> {
    let width = size.width as usize;
    let height = size.height as usize;
    let pixel = |x: usize, y: usize| {
        let offset = (y * width + x) * 4;
        (
            f32::from(rgba[offset]),
            f32::from(rgba[offset + 1]),
            f32::from(rgba[offset + 2]),
        )
    };

    let mut out = Vec::with_capacity(width * height + width * height / 2);
    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = pixel(x, y);
            out.push((16.0 + 0.257 * r + 0.504 * g + 0.098 * b).round().clamp(0.0, 255.0) as u8);
        }
    }
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            let (r, g, b) = pixel(x, y);
            let u = 128.0 - 0.148 * r - 0.291 * g + 0.439 * b;
            let v = 128.0 + 0.439 * r - 0.368 * g - 0.071 * b;
            out.push(u.round().clamp(0.0, 255.0) as u8);
            out.push(v.round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_scrolls_between_frames() {
        let size = Size::new(14, 2);
        let first = pattern_rgba(size, 0);
        let second = pattern_rgba(size, 2);
        assert_eq!(first.len(), 14 * 2 * 4);
        assert_ne!(first, second);
        assert_eq!(&first[8..12], &second[0..4]);
        assert!(first.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn conversions_match_upload_sizes() {
        let size = Size::new(4, 2);
        let rgba = pattern_rgba(size, 0);
        let bgra = convert_rgba(&rgba, size, PixelFormat::Bgra);
        assert_eq!(bgra.len(), rgba.len());
        assert_eq!(bgra[0], rgba[2]);
        assert_eq!(bgra[2], rgba[0]);

        let nv12 = convert_rgba(&rgba, size, PixelFormat::Nv12);
        assert_eq!(nv12.len(), 4 * 2 + 4);
    }

    #[test]
    fn white_maps_to_studio_range_luma() {
        let nv12 = rgba_to_nv12(&[255; 16], Size::new(2, 2));
        assert_eq!(&nv12[..4], &[235; 4]);
        assert_eq!(&nv12[4..], &[128, 128]);
    }

    #[test]
    fn image_source_requires_a_path() {
        let config = CameraConfig {
            source: CameraSourceKind::Image,
            ..CameraConfig::default()
        };
        let err = open_camera(&config, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("image path"));
    }

    #[test]
    fn still_images_set_the_feed_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbaImage::from_pixel(6, 4, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();
        let config = CameraConfig {
            source: CameraSourceKind::Image,
            image: Some("still.png".into()),
            ..CameraConfig::default()
        };
        let (feed, producer) = open_camera(&config, dir.path()).unwrap();
        assert_eq!(feed.dimensions(), Size::new(6, 4));
        let Producer::Still(pixels) = producer else {
            panic!("expected a still producer");
        };
        assert_eq!(pixels.len(), 6 * 4 * 4);
        assert_eq!(&pixels[..4], &[10, 20, 30, 255]);
    }
}
