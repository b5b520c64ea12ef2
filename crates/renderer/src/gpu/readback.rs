use crate::error::GpuError;
use crate::types::Size;

const BYTES_PER_PIXEL: u32 = 4;

/// Row pitch wgpu requires for texture to buffer copies.
pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Staging buffer sized for one RGBA frame of `size`.
pub(crate) fn create_staging_buffer(device: &wgpu::Device, size: Size) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("encoder readback"),
        size: u64::from(padded_bytes_per_row(size.width)) * u64::from(size.height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

pub(crate) fn encode_copy(
    encoder: &mut wgpu::CommandEncoder,
    texture: &wgpu::Texture,
    staging: &wgpu::Buffer,
    size: Size,
) {
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row(size.width)),
                rows_per_image: Some(size.height),
            },
        },
        wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
    );
}

/// Maps the staging buffer after the copy has been submitted and returns
/// tightly packed rows.
pub(crate) fn read_rgba(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    size: Size,
) -> Result<Vec<u8>, GpuError> {
    let slice = staging.slice(..);
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| GpuError::Device(format!("readback poll failed: {err}")))?;
    rx.recv()
        .map_err(|_| GpuError::Device("readback callback dropped".into()))?
        .map_err(|err| GpuError::Device(format!("readback map failed: {err}")))?;

    let rgba = {
        let mapped = slice.get_mapped_range();
        strip_row_padding(&mapped, size)
    };
    staging.unmap();
    Ok(rgba)
}

pub(crate) fn strip_row_padding(padded: &[u8], size: Size) -> Vec<u8> {
    let row_bytes = (size.width * BYTES_PER_PIXEL) as usize;
    let pitch = padded_bytes_per_row(size.width) as usize;
    if row_bytes == pitch {
        return padded[..row_bytes * size.height as usize].to_vec();
    }
    let mut rgba = Vec::with_capacity(row_bytes * size.height as usize);
    for row in padded.chunks(pitch).take(size.height as usize) {
        rgba.extend_from_slice(&row[..row_bytes]);
    }
    rgba
}
