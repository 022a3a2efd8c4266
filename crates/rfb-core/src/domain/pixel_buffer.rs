//! Framebuffer pixel storage.
//!
//! Pixels are 32 bits wide and stored as `R, G, B, X` bytes, row-major, with
//! `stride` pixels per row.  Pixel-format conversion for viewers happens in
//! the protocol layer and is not modelled here.

use std::fmt;

use super::geometry::{Point, Rect, Region};

/// Bytes per framebuffer pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A framebuffer supplied by a capture backend.
///
/// The session reads pixels through this trait and calls
/// [`PixelBuffer::grab_region`] before it does, so that backends which copy
/// from the real screen lazily can refresh exactly the damaged area.
pub trait PixelBuffer: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Pixels per row; at least [`PixelBuffer::width`].
    fn stride(&self) -> usize {
        self.width() as usize
    }

    /// The raw pixel bytes, `stride() * height() * BYTES_PER_PIXEL` long.
    fn pixels(&self) -> &[u8];

    /// Makes the pixels inside `region` current.
    ///
    /// Buffers that are always current keep the default no-op.
    fn grab_region(&mut self, _region: &Region) {}

    /// The rectangle covering the whole buffer.
    fn rect(&self) -> Rect {
        Rect::from_size(0, 0, self.width(), self.height())
    }
}

impl fmt::Debug for dyn PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelBuffer({}x{})", self.width(), self.height())
    }
}

/// Returns the bytes of row `y`, columns `x1..x2`, of `buffer`.
fn row_slice(buffer: &dyn PixelBuffer, y: i32, x1: i32, x2: i32) -> &[u8] {
    let start = (y as usize * buffer.stride() + x1 as usize) * BYTES_PER_PIXEL;
    let end = start + (x2 - x1) as usize * BYTES_PER_PIXEL;
    &buffer.pixels()[start..end]
}

/// An owned, in-memory framebuffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ManagedPixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ManagedPixelBuffer {
    /// Creates a black buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Copies every pixel of `source` into a new buffer of the same size.
    pub fn snapshot_of(source: &dyn PixelBuffer) -> Self {
        let mut copy = Self::new(source.width(), source.height());
        copy.image_rect(source, &source.rect());
        copy
    }

    /// Reallocates to a new size; the contents become black.
    pub fn set_size(&mut self, width: u32, height: u32) {
        *self = Self::new(width, height);
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the `[R, G, B, X]` bytes at `(x, y)`.
    pub fn pixel_at(&self, x: i32, y: i32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let mut pixel = [0; 4];
        pixel.copy_from_slice(&self.data[offset..offset + BYTES_PER_PIXEL]);
        pixel
    }

    /// Paints `rect` (clipped to the buffer) with one colour.
    pub fn fill_rect(&mut self, rect: &Rect, pixel: [u8; 4]) {
        let rect = rect.intersect(&self.rect());
        if rect.is_empty() {
            return;
        }
        let stride = self.width as usize;
        for y in rect.tl.y..rect.br.y {
            let start = (y as usize * stride + rect.tl.x as usize) * BYTES_PER_PIXEL;
            let end = start + rect.width() as usize * BYTES_PER_PIXEL;
            for chunk in self.data[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                chunk.copy_from_slice(&pixel);
            }
        }
    }

    /// Copies `rect` from `source` into the same position in `self`.
    ///
    /// The rectangle is clipped to both buffers.
    pub fn image_rect(&mut self, source: &dyn PixelBuffer, rect: &Rect) {
        let rect = rect.intersect(&self.rect()).intersect(&source.rect());
        if rect.is_empty() {
            return;
        }
        let stride = self.width as usize;
        for y in rect.tl.y..rect.br.y {
            let src = row_slice(source, y, rect.tl.x, rect.br.x);
            let start = (y as usize * stride + rect.tl.x as usize) * BYTES_PER_PIXEL;
            self.data[start..start + src.len()].copy_from_slice(src);
        }
    }

    /// Moves the content found at `dest - delta` to `dest`, within this buffer.
    ///
    /// Source and destination may overlap.  Destination pixels whose source
    /// lies outside the buffer are left untouched.
    pub fn copy_rect(&mut self, dest: &Rect, delta: Point) {
        let dest = dest
            .intersect(&self.rect())
            .intersect(&self.rect().translate(delta));
        if dest.is_empty() {
            return;
        }
        let source = ManagedPixelBuffer::snapshot_region(self, &dest.translate(-delta));
        let stride = self.width as usize;
        let row_len = dest.width() as usize * BYTES_PER_PIXEL;
        for (row, y) in (dest.tl.y..dest.br.y).enumerate() {
            let start = (y as usize * stride + dest.tl.x as usize) * BYTES_PER_PIXEL;
            self.data[start..start + row_len]
                .copy_from_slice(&source[row * row_len..(row + 1) * row_len]);
        }
    }

    /// Returns `true` if `rect` holds identical pixels in `self` and `other`.
    pub fn rect_matches(&self, other: &dyn PixelBuffer, rect: &Rect) -> bool {
        let rect = rect.intersect(&self.rect()).intersect(&other.rect());
        (rect.tl.y..rect.br.y)
            .all(|y| row_slice(self, y, rect.tl.x, rect.br.x) == row_slice(other, y, rect.tl.x, rect.br.x))
    }

    /// Packs the pixels of `rect` into a contiguous byte vector.
    fn snapshot_region(buffer: &ManagedPixelBuffer, rect: &Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity(rect.area() as usize * BYTES_PER_PIXEL);
        for y in rect.tl.y..rect.br.y {
            out.extend_from_slice(row_slice(buffer, y, rect.tl.x, rect.br.x));
        }
        out
    }
}

impl fmt::Debug for ManagedPixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedPixelBuffer({}x{})", self.width, self.height)
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixels(&self) -> &[u8] {
        &self.data
    }
}
