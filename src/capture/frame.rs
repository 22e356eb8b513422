//! Frame type representing a captured image with metadata.

use ndarray::Array2;

/// Single-channel 8-bit image, indexed `[[row, col]]`.
pub type Image = Array2<u8>;

/// A single captured frame from the camera.
///
/// Frames travel by value: whichever stage holds one owns it, and a stage
/// that needs to modify pixels works on its own copy.
#[derive(Clone)]
pub struct Frame {
    /// Pixel data.
    image: Image,
    /// Seconds since the experiment epoch.
    timestamp: f64,
    /// Monotonic sequence number.
    sequence: u64,
}

impl Frame {
    /// Creates a new frame with the given parameters.
    pub fn new(image: Image, timestamp: f64, sequence: u64) -> Self {
        Self {
            image,
            timestamp,
            sequence,
        }
    }

    /// Creates a frame from a flat row-major pixel buffer.
    ///
    /// Returns `None` if the buffer length does not match the dimensions.
    pub fn from_pixels(
        pixels: Vec<u8>,
        width: usize,
        height: usize,
        timestamp: f64,
        sequence: u64,
    ) -> Option<Self> {
        let image = Array2::from_shape_vec((height, width), pixels).ok()?;
        Some(Self::new(image, timestamp, sequence))
    }

    /// Same pixels and sequence number, stamped at `timestamp`.
    pub fn with_timestamp(self, timestamp: f64) -> Self {
        Self { timestamp, ..self }
    }

    /// Returns a reference to the image.
    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Consumes the frame, returning the image.
    #[inline]
    pub fn into_image(self) -> Image {
        self.image
    }

    /// Returns the frame width.
    #[inline]
    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    /// Returns the frame height.
    #[inline]
    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    /// Returns the capture timestamp in seconds since the experiment epoch.
    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Returns the sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the total number of pixels (width * height).
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.image.len()
    }

    /// A frame is usable when it holds at least one pixel.
    pub fn is_valid(&self) -> bool {
        self.pixel_count() > 0 && self.timestamp.is_finite()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(Array2::zeros((480, 640)), 0.5, 1);

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.timestamp(), 0.5);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_frame_from_pixels_size_mismatch() {
        assert!(Frame::from_pixels(vec![0u8; 100], 640, 480, 0.0, 1).is_none());

        let frame = Frame::from_pixels(vec![7u8; 12], 4, 3, 0.0, 1).unwrap();
        assert_eq!(frame.image()[[2, 3]], 7);
    }

    #[test]
    fn test_empty_frame_invalid() {
        let frame = Frame::new(Array2::zeros((0, 0)), 0.0, 1);
        assert!(!frame.is_valid());
    }
}
