use image::{codecs::jpeg::JpegEncoder, ExtendedColorType, ImageFormat};
use thiserror::Error;

pub const BYTES_PER_PIXEL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Jpeg,
    /// 24-bit pixels, blue-green-red byte order.
    Rgb888,
    /// 16-bit big-endian 5-6-5 pixels.
    Rgb565,
    Grayscale,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to allocate {bytes} byte frame buffer")]
    Allocation { bytes: usize },
    #[error("unsupported pixel format {0:?}")]
    Unsupported(PixelFormat),
    #[error("frame holds {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// A frame handed out by the camera driver.
///
/// Dropping the frame gives its buffer back to the driver, so every
/// acquisition is released exactly once on every exit path.
pub trait CameraFrame {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn format(&self) -> PixelFormat;
    fn data(&self) -> &[u8];
}

pub trait FrameSource {
    type Frame: CameraFrame;

    /// Blocks until the driver produces a frame. `None` means the capture failed.
    fn acquire(&mut self) -> Option<Self::Frame>;
}

/// Heap frame for sources that do not lend out driver memory.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl CameraFrame for OwnedFrame {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Decoded frame in blue-green-red byte order, the layout the camera
/// converter produces. All analysis and overlay work happens in place here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocates a zeroed buffer, reporting exhaustion instead of aborting.
    pub fn try_alloc(width: usize, height: usize) -> Result<Self, CodecError> {
        let len = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or(CodecError::Allocation { bytes: usize::MAX })?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| CodecError::Allocation { bytes: len })?;
        data.resize(len, 0);

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        (data.len() == width * height * BYTES_PER_PIXEL).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.width * BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.stride();
        &self.data[y * stride..(y + 1) * stride]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let stride = self.stride();
        &mut self.data[y * stride..(y + 1) * stride]
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y * self.stride() + x * BYTES_PER_PIXEL;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Writes one pixel; coordinates outside the frame are ignored.
    pub fn put_pixel(&mut self, x: i32, y: i32, bgr: [u8; 3]) {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return;
        }
        let offset = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        self.data[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&bgr);
    }
}

pub trait FrameCodec {
    /// Converts any camera format into a freshly allocated pixel buffer.
    fn to_pixels<F: CameraFrame>(&self, frame: &F) -> Result<PixelBuffer, CodecError>;

    fn encode(&self, pixels: &PixelBuffer, quality: u8) -> Result<Vec<u8>, CodecError>;

    fn frame_to_jpeg<F: CameraFrame>(&self, frame: &F, quality: u8) -> Result<Vec<u8>, CodecError> {
        let pixels = self.to_pixels(frame)?;
        self.encode(&pixels, quality)
    }
}

/// Software codec backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl FrameCodec for ImageCodec {
    fn to_pixels<F: CameraFrame>(&self, frame: &F) -> Result<PixelBuffer, CodecError> {
        let (width, height) = (frame.width(), frame.height());
        let data = frame.data();

        match frame.format() {
            PixelFormat::Jpeg => {
                let decoded = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                    .map_err(|err| CodecError::Decode(err.to_string()))?
                    .to_rgb8();
                let mut pixels =
                    PixelBuffer::try_alloc(decoded.width() as usize, decoded.height() as usize)?;
                for (dst, src) in pixels
                    .data_mut()
                    .chunks_exact_mut(BYTES_PER_PIXEL)
                    .zip(decoded.as_raw().chunks_exact(BYTES_PER_PIXEL))
                {
                    dst.copy_from_slice(&[src[2], src[1], src[0]]);
                }
                Ok(pixels)
            }
            PixelFormat::Rgb888 => {
                let mut pixels = PixelBuffer::try_alloc(width, height)?;
                let len = pixels.data().len();
                expect_len(data, len)?;
                pixels.data_mut().copy_from_slice(&data[..len]);
                Ok(pixels)
            }
            PixelFormat::Rgb565 => {
                let mut pixels = PixelBuffer::try_alloc(width, height)?;
                expect_len(data, width * height * 2)?;
                for (dst, src) in pixels
                    .data_mut()
                    .chunks_exact_mut(BYTES_PER_PIXEL)
                    .zip(data.chunks_exact(2))
                {
                    let [r, g, b] = rgb565_to_rgb888(u16::from_be_bytes([src[0], src[1]]));
                    dst.copy_from_slice(&[b, g, r]);
                }
                Ok(pixels)
            }
            PixelFormat::Grayscale => {
                let mut pixels = PixelBuffer::try_alloc(width, height)?;
                expect_len(data, width * height)?;
                for (dst, luma) in pixels
                    .data_mut()
                    .chunks_exact_mut(BYTES_PER_PIXEL)
                    .zip(data.iter())
                {
                    dst.fill(*luma);
                }
                Ok(pixels)
            }
        }
    }

    fn encode(&self, pixels: &PixelBuffer, quality: u8) -> Result<Vec<u8>, CodecError> {
        let mut rgb = Vec::new();
        rgb.try_reserve_exact(pixels.data().len())
            .map_err(|_| CodecError::Allocation {
                bytes: pixels.data().len(),
            })?;
        for bgr in pixels.data().chunks_exact(BYTES_PER_PIXEL) {
            rgb.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
            .encode(
                &rgb,
                pixels.width() as u32,
                pixels.height() as u32,
                ExtendedColorType::Rgb8,
            )
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(jpeg)
    }

    fn frame_to_jpeg<F: CameraFrame>(&self, frame: &F, quality: u8) -> Result<Vec<u8>, CodecError> {
        if frame.format() == PixelFormat::Jpeg {
            return Ok(frame.data().to_vec());
        }
        let pixels = self.to_pixels(frame)?;
        self.encode(&pixels, quality)
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), CodecError> {
    if data.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn rgb565_to_rgb888(pixel: u16) -> [u8; 3] {
    let r5 = (pixel >> 11) & 0x1f;
    let g6 = (pixel >> 5) & 0x3f;
    let b5 = pixel & 0x1f;

    let r = ((r5 as u32 * 255 + 15) / 31) as u8;
    let g = ((g6 as u32 * 255 + 31) / 63) as u8;
    let b = ((b5 as u32 * 255 + 15) / 31) as u8;
    [r, g, b]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> PixelBuffer {
        let mut pixels = PixelBuffer::try_alloc(width, height).unwrap();
        for y in 0..height {
            for x in 0..width {
                let shade = ((x + y) * 255 / (width + height)) as u8;
                pixels.put_pixel(x as i32, y as i32, [shade, shade, shade]);
            }
        }
        pixels
    }

    #[test]
    fn encode_produces_jpeg_that_decodes_to_same_size() {
        let codec = ImageCodec;
        let jpeg = codec.encode(&gradient(32, 24), 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let frame = OwnedFrame {
            width: 32,
            height: 24,
            format: PixelFormat::Jpeg,
            data: jpeg,
        };
        let decoded = codec.to_pixels(&frame).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn rgb565_is_expanded_into_bgr_order() {
        let frame = OwnedFrame {
            width: 1,
            height: 1,
            format: PixelFormat::Rgb565,
            data: 0xF800_u16.to_be_bytes().to_vec(),
        };
        let pixels = ImageCodec.to_pixels(&frame).unwrap();
        assert_eq!(pixels.pixel(0, 0), Some([0, 0, 255]));
    }

    #[test]
    fn short_raw_frame_is_rejected() {
        let frame = OwnedFrame {
            width: 4,
            height: 4,
            format: PixelFormat::Rgb888,
            data: vec![0; 10],
        };
        assert!(matches!(
            ImageCodec.to_pixels(&frame),
            Err(CodecError::Truncated { expected: 48, actual: 10 })
        ));
    }

    #[test]
    fn put_pixel_ignores_out_of_bounds() {
        let mut pixels = PixelBuffer::try_alloc(2, 2).unwrap();
        pixels.put_pixel(-1, 0, [9, 9, 9]);
        pixels.put_pixel(2, 1, [9, 9, 9]);
        assert!(pixels.data().iter().all(|byte| *byte == 0));
    }
}
