//! Camera collaborator contract and the bridge that turns its frame
//! notifications into `DoFrame` commands.
//!
//! The camera side never touches graphics state. It publishes pixels into a
//! [`FrameSlot`] from whatever thread delivers them and calls
//! [`CameraBridge::frame_available`]; the render thread later uploads the
//! latest frame into the external texture while running the chain.

use std::fmt;
use std::sync::{Arc, Mutex};

use camconfig::{CameraFacing, PixelFormat};
use scheduler::Clock;

use crate::command::{Command, CommandSender};
use crate::error::PipelineError;
use crate::gpu::{upload_len, TextureUsage};
use crate::types::Size;

/// Clockwise rotation of the sensor image relative to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            0 => Some(Self::None),
            90 => Some(Self::Cw90),
            180 => Some(Self::Cw180),
            270 => Some(Self::Cw270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    pub fn is_quarter_turn(&self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }

    /// Quad texture coordinates, corners in strip order.
    pub fn tex_coords(&self) -> [f32; 8] {
        match self {
            Self::None => [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            Self::Cw90 => [1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            Self::Cw180 => [1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            Self::Cw270 => [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraOrientation {
    pub rotation: Rotation,
    pub facing: CameraFacing,
}

impl CameraOrientation {
    /// Texture axes to flip so front cameras preview like a mirror. After a
    /// quarter turn the display's horizontal axis is the texture's `v`.
    pub fn mirror_flips(&self) -> (bool, bool) {
        let mirror = self.facing == CameraFacing::Front;
        if self.rotation.is_quarter_turn() {
            (false, mirror)
        } else {
            (mirror, false)
        }
    }
}

/// One camera image in its native layout.
#[derive(Clone, PartialEq)]
pub struct CameraFrame {
    pub size: Size,
    pub format: PixelFormat,
    pub data: Arc<[u8]>,
    /// Capture time on the shared clock.
    pub timestamp: u64,
}

impl CameraFrame {
    pub fn new(
        size: Size,
        format: PixelFormat,
        data: impl Into<Arc<[u8]>>,
        timestamp: u64,
    ) -> Self {
        Self {
            size,
            format,
            data: data.into(),
            timestamp,
        }
    }

    /// Whether `data` holds exactly one full image.
    pub fn is_complete(&self) -> bool {
        self.data.len() == upload_len(TextureUsage::External(self.format), self.size)
    }
}

impl fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFrame")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Camera collaborator as seen by the render thread.
pub trait CameraFeed: Send + Sync {
    fn format(&self) -> PixelFormat;
    fn dimensions(&self) -> Size;
    fn orientation(&self) -> CameraOrientation;
    /// Most recent frame, if any has arrived yet.
    fn latest_frame(&self) -> Option<CameraFrame>;
}

/// Latest-frame mailbox. Writers replace the frame; readers see the newest.
#[derive(Debug, Default)]
pub struct FrameSlot {
    frame: Mutex<Option<CameraFrame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: CameraFrame) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = Some(frame);
        }
    }

    pub fn latest(&self) -> Option<CameraFrame> {
        self.frame.lock().ok().and_then(|slot| slot.clone())
    }
}

/// [`CameraFeed`] with fixed properties reading from a [`FrameSlot`].
#[derive(Debug)]
pub struct SlotFeed {
    format: PixelFormat,
    size: Size,
    orientation: CameraOrientation,
    slot: Arc<FrameSlot>,
}

impl SlotFeed {
    pub fn new(format: PixelFormat, size: Size, orientation: CameraOrientation) -> Self {
        Self {
            format,
            size,
            orientation,
            slot: Arc::new(FrameSlot::new()),
        }
    }

    pub fn slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.slot)
    }
}

impl CameraFeed for SlotFeed {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn dimensions(&self) -> Size {
        self.size
    }

    fn orientation(&self) -> CameraOrientation {
        self.orientation
    }

    fn latest_frame(&self) -> Option<CameraFrame> {
        self.slot.latest()
    }
}

/// Posts a frame request for every camera frame notification.
#[derive(Clone)]
pub struct CameraBridge {
    sender: CommandSender,
    clock: Arc<dyn Clock>,
}

impl CameraBridge {
    pub fn new(sender: CommandSender, clock: Arc<dyn Clock>) -> Self {
        Self { sender, clock }
    }

    /// Stamps the notification with the shared clock and posts `DoFrame`.
    pub fn frame_available(&self) -> Result<u64, PipelineError> {
        let timestamp = self.clock.now_nanos();
        self.frame_available_at(timestamp)?;
        Ok(timestamp)
    }

    /// Posts `DoFrame` for a frame the camera already timestamped.
    pub fn frame_available_at(&self, timestamp: u64) -> Result<(), PipelineError> {
        self.sender.send(Command::DoFrame(timestamp))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl fmt::Debug for CameraBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraBridge").finish_non_exhaustive()
    }
}

fn flip(coord: f32) -> f32 {
    1.0 - coord
}

/// Rotation table with optional mirroring applied.
pub fn rotated_tex_coords(
    rotation: Rotation,
    flip_horizontal: bool,
    flip_vertical: bool,
) -> [f32; 8] {
    let mut coords = rotation.tex_coords();
    for pair in coords.chunks_exact_mut(2) {
        if flip_horizontal {
            pair[0] = flip(pair[0]);
        }
        if flip_vertical {
            pair[1] = flip(pair[1]);
        }
    }
    coords
}

/// Texture coordinates that fill `output` with the camera image, cropping
/// whatever overflows the output aspect around the centre.
pub fn camera_tex_coords(orientation: CameraOrientation, image: Size, output: Size) -> [f32; 8] {
    let (flip_horizontal, flip_vertical) = orientation.mirror_flips();
    let mut coords = rotated_tex_coords(orientation.rotation, flip_horizontal, flip_vertical);
    if image.is_empty() || output.is_empty() {
        return coords;
    }

    let output = if orientation.rotation.is_quarter_turn() {
        output.transposed()
    } else {
        output
    };
    let (out_w, out_h) = (output.width as f32, output.height as f32);
    let (img_w, img_h) = (image.width as f32, image.height as f32);
    let scale = (out_w / img_w).max(out_h / img_h);
    let scaled_w = (img_w * scale).round();
    let scaled_h = (img_h * scale).round();
    let crop_x = (1.0 - out_w / scaled_w) / 2.0;
    let crop_y = (1.0 - out_h / scaled_h) / 2.0;

    for pair in coords.chunks_exact_mut(2) {
        pair[0] = inset(pair[0], crop_x);
        pair[1] = inset(pair[1], crop_y);
    }
    coords
}

fn inset(coord: f32, distance: f32) -> f32 {
    if coord == 0.0 {
        distance
    } else {
        1.0 - distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_round_trip_only_for_quarter_turns() {
        assert_eq!(Rotation::from_degrees(270), Some(Rotation::Cw270));
        assert_eq!(Rotation::Cw90.degrees(), 90);
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn matching_aspect_needs_no_crop() {
        let coords = camera_tex_coords(
            CameraOrientation::default(),
            Size::new(1280, 720),
            Size::new(640, 360),
        );
        assert_eq!(coords, Rotation::None.tex_coords());
    }

    #[test]
    fn wide_image_is_cropped_horizontally() {
        let coords = camera_tex_coords(
            CameraOrientation::default(),
            Size::new(1280, 720),
            Size::new(720, 720),
        );
        assert!((coords[0] - 0.21875).abs() < 1e-6);
        assert!((coords[2] - 0.78125).abs() < 1e-6);
        assert_eq!(coords[1], 1.0);
        assert_eq!(coords[5], 0.0);
    }

    #[test]
    fn quarter_turn_crops_against_transposed_output() {
        // A portrait output fed by a landscape sensor rotated 90 degrees
        // covers the sensor exactly.
        let orientation = CameraOrientation {
            rotation: Rotation::Cw90,
            facing: CameraFacing::Back,
        };
        let coords = camera_tex_coords(orientation, Size::new(1280, 720), Size::new(720, 1280));
        assert_eq!(coords, Rotation::Cw90.tex_coords());
    }

    #[test]
    fn front_camera_is_mirrored() {
        let orientation = CameraOrientation {
            rotation: Rotation::None,
            facing: CameraFacing::Front,
        };
        let coords = camera_tex_coords(orientation, Size::new(4, 4), Size::new(4, 4));
        assert_eq!(coords, [1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0]);

        let portrait = CameraOrientation {
            rotation: Rotation::Cw90,
            facing: CameraFacing::Front,
        };
        assert_eq!(portrait.mirror_flips(), (false, true));
        let coords = camera_tex_coords(portrait, Size::new(4, 4), Size::new(4, 4));
        assert_eq!(coords, [1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn slot_keeps_only_the_newest_frame() {
        let feed = SlotFeed::new(PixelFormat::Rgba, Size::new(1, 1), CameraOrientation::default());
        assert!(feed.latest_frame().is_none());
        let slot = feed.slot();
        slot.publish(CameraFrame::new(Size::new(1, 1), PixelFormat::Rgba, vec![1, 2, 3, 4], 10));
        slot.publish(CameraFrame::new(Size::new(1, 1), PixelFormat::Rgba, vec![5, 6, 7, 8], 20));
        let latest = feed.latest_frame().unwrap();
        assert_eq!(latest.timestamp, 20);
        assert!(latest.is_complete());
    }
}
