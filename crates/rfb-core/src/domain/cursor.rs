//! Cursor images.
//!
//! A [`Cursor`] is an RGBA image with a hotspot: the pixel that sits exactly
//! at the pointer position.  Viewers that can draw the cursor locally receive
//! the image itself.  For the others the server composites the cursor into
//! the framebuffer stream; [`RenderedCursor`] caches that composite.

use thiserror::Error;

use super::geometry::{Point, Rect};
use super::pixel_buffer::{PixelBuffer, BYTES_PER_PIXEL};

/// Errors raised when building a cursor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor {width}x{height} needs {expected} bytes of RGBA data, got {actual}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("hotspot ({x},{y}) lies outside a {width}x{height} cursor")]
    HotspotOutside {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

/// An RGBA cursor image (straight, non-premultiplied alpha).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    width: u32,
    height: u32,
    hotspot: Point,
    pixels: Vec<u8>,
}

impl Cursor {
    /// Builds a cursor from RGBA bytes.
    ///
    /// # Errors
    ///
    /// [`CursorError::SizeMismatch`] if `pixels` is not `width * height * 4`
    /// bytes, [`CursorError::HotspotOutside`] if a non-empty cursor's hotspot
    /// is not one of its pixels.
    pub fn new(width: u32, height: u32, hotspot: Point, pixels: Vec<u8>) -> Result<Self, CursorError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(CursorError::SizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        let bounds = Rect::from_size(0, 0, width, height);
        if !bounds.is_empty() && !bounds.contains(hotspot) {
            return Err(CursorError::HotspotOutside {
                x: hotspot.x,
                y: hotspot.y,
                width,
                height,
            });
        }
        Ok(Self {
            width,
            height,
            hotspot,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn hotspot(&self) -> Point {
        self.hotspot
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn alpha_at(&self, x: i32, y: i32) -> u8 {
        self.pixels[(y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL + 3]
    }

    /// Trims fully transparent rows and columns from the edges.
    ///
    /// The hotspot pixel is always kept, so the image still lines up with the
    /// pointer position afterwards.
    pub fn crop(&mut self) {
        let bounds = Rect::from_size(0, 0, self.width, self.height);
        let mut busy = bounds.intersect(&Rect::new(
            self.hotspot.x,
            self.hotspot.y,
            self.hotspot.x + 1,
            self.hotspot.y + 1,
        ));
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                if self.alpha_at(x, y) != 0 {
                    busy = busy.union_boundary(&Rect::new(x, y, x + 1, y + 1));
                }
            }
        }

        if busy == bounds || busy.is_empty() {
            return;
        }

        let mut pixels = Vec::with_capacity(busy.area() as usize * BYTES_PER_PIXEL);
        for y in busy.tl.y..busy.br.y {
            let start = (y as usize * self.width as usize + busy.tl.x as usize) * BYTES_PER_PIXEL;
            let end = start + busy.width() as usize * BYTES_PER_PIXEL;
            pixels.extend_from_slice(&self.pixels[start..end]);
        }

        self.width = busy.width() as u32;
        self.height = busy.height() as u32;
        self.hotspot = self.hotspot - busy.tl;
        self.pixels = pixels;
    }

    /// The framebuffer area the cursor covers when the pointer is at `pos`.
    pub fn footprint_at(&self, pos: Point) -> Rect {
        Rect::from_size(0, 0, self.width, self.height).translate(pos - self.hotspot)
    }
}

/// The cursor composited over the framebuffer at the current pointer position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedCursor {
    rect: Rect,
    pixels: Vec<u8>,
}

impl RenderedCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framebuffer area covered by the composite (clipped to the framebuffer).
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Composited `R, G, B, X` pixels for [`RenderedCursor::rect`], row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Recomputes the composite from the current framebuffer contents.
    pub fn update(&mut self, framebuffer: &dyn PixelBuffer, cursor: &Cursor, pos: Point) {
        let footprint = cursor.footprint_at(pos);
        let rect = footprint.intersect(&framebuffer.rect());
        self.pixels.clear();
        if rect.is_empty() {
            self.rect = Rect::default();
            return;
        }

        self.rect = rect;
        self.pixels.reserve(rect.area() as usize * BYTES_PER_PIXEL);
        let fb = framebuffer.pixels();
        let stride = framebuffer.stride();
        for y in rect.tl.y..rect.br.y {
            for x in rect.tl.x..rect.br.x {
                let fb_offset = (y as usize * stride + x as usize) * BYTES_PER_PIXEL;
                let cx = (x - footprint.tl.x) as usize;
                let cy = (y - footprint.tl.y) as usize;
                let c_offset = (cy * cursor.width() as usize + cx) * BYTES_PER_PIXEL;
                let alpha = cursor.pixels()[c_offset + 3] as u32;
                for channel in 0..3 {
                    let under = fb[fb_offset + channel] as u32;
                    let over = cursor.pixels()[c_offset + channel] as u32;
                    self.pixels
                        .push(((over * alpha + under * (255 - alpha)) / 255) as u8);
                }
                self.pixels.push(0);
            }
        }
    }
}
