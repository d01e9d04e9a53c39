//! Decoded image isolation layer.
//!
//! - `PixelBuffer`: owned RGB8 pixels for one request. Bytes are private.
//! - `InferenceView`: borrowed view that detection models receive.
//! - `decode_image`: the only constructor from untrusted bytes.
//!
//! A `PixelBuffer` is moved into the cascade, so it is dropped (and zeroized)
//! on every exit path of a request, including unwinding out of a model.

use std::io::Cursor;

use zeroize::Zeroize;

/// Maximum accepted compressed payload (20 MiB).
pub const MAX_COMPRESSED_BYTES: usize = 20 * 1024 * 1024;

/// Maximum decoded pixel count (100 megapixels).
pub const MAX_PIXELS: u64 = 100_000_000;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,

    #[error("compressed image too large: {0} bytes (max: {MAX_COMPRESSED_BYTES})")]
    TooLarge(usize),

    #[error("decoded image too large: {width}x{height} pixels (max: {MAX_PIXELS})")]
    TooManyPixels { width: u32, height: u32 },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("pixel data does not match {width}x{height} RGB8 ({len} bytes)")]
    LengthMismatch { width: u32, height: u32, len: usize },

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

// ----------------------------------------------------------------------------
// PixelBuffer: per-request decoded image
// ----------------------------------------------------------------------------

/// Decoded RGB8 image. There is no `Clone`, no `Serialize`, no `AsRef<[u8]>`.
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl PixelBuffer {
    /// Wrap already-decoded RGB8 pixels (row-major, 3 bytes per pixel).
    pub fn from_rgb8(data: Vec<u8>, width: u32, height: u32) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidDimensions { width, height });
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3));
        if expected != Some(data.len()) {
            return Err(DecodeError::LengthMismatch {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            on_release: None,
        })
    }

    /// Register a hook that runs once, after the pixels have been zeroized.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Models get a borrowed view; they cannot keep pixels beyond the call.
    pub fn inference_view(&self) -> InferenceView<'_> {
        InferenceView { frame: self }
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

// ----------------------------------------------------------------------------
// InferenceView: what models see
// ----------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct InferenceView<'a> {
    frame: &'a PixelBuffer,
}

impl<'a> InferenceView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    /// Row-major RGB8 pixels, valid for the lifetime of the view.
    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode an uploaded JPEG/PNG into a `PixelBuffer`.
///
/// Dimensions are checked before the full decode so oversized images are
/// rejected without allocating their pixels.
pub fn decode_image(bytes: &[u8]) -> Result<PixelBuffer, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > MAX_COMPRESSED_BYTES {
        return Err(DecodeError::TooLarge(bytes.len()));
    }

    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidDimensions { width, height });
    }
    if (width as u64).saturating_mul(height as u64) > MAX_PIXELS {
        return Err(DecodeError::TooManyPixels { width, height });
    }

    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    PixelBuffer::from_rgb8(rgb.into_raw(), width, height)
}
