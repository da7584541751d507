use jpeg_decoder::Decoder;

use super::frame::{FrameBuffer, PixelFormat, RawFrame, Resolution, CHANNELS};
use crate::error::{CamError, Result};

/// Decode a driver payload into an RGB24 frame
pub fn decode_frame(raw: &RawFrame) -> Result<FrameBuffer> {
    match raw.format {
        PixelFormat::Mjpeg => decode_mjpeg(&raw.data),
        PixelFormat::Rgb24 => {
            // Already in RGB format
            FrameBuffer::from_raw(raw.resolution, raw.data.to_vec())
        }
        PixelFormat::Yuyv4 => {
            let rgb = yuyv_to_rgb(&raw.data, raw.resolution).ok_or_else(|| {
                CamError::Decode(format!(
                    "short YUYV payload: {} bytes for {}",
                    raw.data.len(),
                    raw.resolution
                ))
            })?;
            FrameBuffer::from_raw(raw.resolution, rgb)
        }
    }
}

fn decode_mjpeg(data: &[u8]) -> Result<FrameBuffer> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| CamError::Decode("JPEG header missing".into()))?;
    let resolution = Resolution::new(info.width as u32, info.height as u32);

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => {
            let mut rgb = Vec::with_capacity(pixels.len() * CHANNELS);
            for luma in pixels {
                rgb.extend_from_slice(&[luma, luma, luma]);
            }
            rgb
        }
        other => {
            return Err(CamError::Decode(format!(
                "unsupported JPEG pixel format {:?}",
                other
            )))
        }
    };
    FrameBuffer::from_raw(resolution, rgb)
}

/// YUYV 4:2:2 to RGB24 using BT.601 coefficients.
///
/// Returns `None` when `data` is shorter than `width * height * 2`.
pub fn yuyv_to_rgb(data: &[u8], resolution: Resolution) -> Option<Vec<u8>> {
    let pixel_count = resolution.pixel_count() as usize;
    let expected_len = pixel_count * 2;
    if data.len() < expected_len {
        return None;
    }

    let mut rgb = Vec::with_capacity(pixel_count * CHANNELS);
    for chunk in data[..expected_len].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    Some(rgb)
}
