use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};

use crate::geometry::BoundingRect;

/// JPEG quality used whenever a frame has to be re-encoded.
pub const JPEG_QUALITY: u8 = 90;

/// A single camera image travelling through the pipeline.
///
/// Holds the decoded RGB pixels together with their JPEG encoding. The two
/// are always kept in sync: any pixel change goes through
/// [`Frame::replace_image`] which re-encodes.
///
/// `Clone` yields an independent frame. The JPEG bytes are immutable and
/// shared, the pixels are copied.
///
/// A frame can be cleared to signal "discard". A cleared frame has no pixels
/// and a zero-length encoding; every stage must return early on it.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    jpeg: Bytes,
}

impl Frame {
    /// Decode a JPEG buffer. The buffer is kept as the frame's encoding.
    pub fn from_jpeg(jpeg: impl Into<Bytes>) -> Result<Self, FrameError> {
        let jpeg = jpeg.into();
        if jpeg.is_empty() {
            return Err(FrameError::EmptyBuffer);
        }
        let image = ImageReader::new(Cursor::new(&jpeg[..]))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();
        Ok(Self { image, jpeg })
    }

    /// Build a frame from pixels, encoding them as JPEG.
    pub fn from_image(image: RgbImage) -> Result<Self, FrameError> {
        let jpeg = encode_jpeg(&image)?;
        Ok(Self { image, jpeg })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// The encoded JPEG bytes. Empty once the frame has been cleared.
    pub fn jpeg(&self) -> &Bytes {
        &self.jpeg
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    /// Mark the frame as discarded.
    pub fn clear(&mut self) {
        self.image = RgbImage::new(0, 0);
        self.jpeg = Bytes::new();
    }

    /// Swap in new pixels and re-encode.
    pub fn replace_image(&mut self, image: RgbImage) -> Result<(), FrameError> {
        self.jpeg = encode_jpeg(&image)?;
        self.image = image;
        Ok(())
    }

    /// Crop in place to `rect`. The rectangle must lie inside the frame.
    pub fn crop(&mut self, rect: BoundingRect) -> Result<(), FrameError> {
        if rect.is_empty()
            || rect.left + rect.width > self.width()
            || rect.top + rect.height > self.height()
        {
            return Err(FrameError::CropOutOfBounds {
                rect,
                width: self.width(),
                height: self.height(),
            });
        }
        let cropped =
            image::imageops::crop_imm(&self.image, rect.left, rect.top, rect.width, rect.height)
                .to_image();
        self.replace_image(cropped)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            image: RgbImage::new(0, 0),
            jpeg: Bytes::new(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("jpeg_bytes", &self.jpeg.len())
            .finish()
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Bytes, FrameError> {
    let mut buf = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer is empty")]
    EmptyBuffer,
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("crop {rect:?} outside {width}x{height} frame")]
    CropOutOfBounds {
        rect: BoundingRect,
        width: u32,
        height: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn jpeg_roundtrip_keeps_dimensions() {
        let frame = Frame::from_image(solid(32, 24, 128)).unwrap();
        assert!(!frame.is_empty());

        let decoded = Frame::from_jpeg(frame.jpeg().clone()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(decoded.jpeg(), frame.jpeg(), "source bytes are kept as-is");
    }

    #[test]
    fn clear_empties_but_keeps_object() {
        let mut frame = Frame::from_image(solid(8, 8, 10)).unwrap();
        frame.clear();
        assert!(frame.is_empty());
        assert_eq!(frame.jpeg().len(), 0);
        assert_eq!((frame.width(), frame.height()), (0, 0));
    }

    #[test]
    fn clone_is_independent() {
        let original = Frame::from_image(solid(8, 8, 10)).unwrap();
        let mut copy = original.clone();
        copy.clear();
        assert!(!original.is_empty());
        assert_eq!(original.width(), 8);
    }

    #[test]
    fn crop_reencodes() {
        let mut frame = Frame::from_image(solid(40, 30, 200)).unwrap();
        frame.crop(BoundingRect::new(10, 5, 20, 10)).unwrap();
        assert_eq!((frame.width(), frame.height()), (20, 10));
        let decoded = Frame::from_jpeg(frame.jpeg().clone()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
    }

    #[test]
    fn crop_outside_is_rejected() {
        let mut frame = Frame::from_image(solid(40, 30, 200)).unwrap();
        assert!(frame.crop(BoundingRect::new(30, 0, 20, 10)).is_err());
        assert!(frame.crop(BoundingRect::new(0, 0, 0, 10)).is_err());
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(Frame::from_jpeg(vec![1, 2, 3]), Err(FrameError::Decode(_))));
        assert!(matches!(Frame::from_jpeg(Vec::new()), Err(FrameError::EmptyBuffer)));
    }
}
