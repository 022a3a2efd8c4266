//! # rfb-core
//!
//! Value types shared by the RFB session core: rectangle and region algebra,
//! multi-monitor screen layouts, pixel buffers, cursor images and keysym
//! remapping.
//!
//! Nothing in this crate performs I/O or owns a thread.  Every type can be
//! built and tested in isolation.
//!
//! # Architecture overview (for beginners)
//!
//! An RFB ("remote framebuffer", the protocol behind VNC) server shares one
//! desktop image with any number of viewers.  Most of its work is bookkeeping
//! about *which part* of that image changed and *who* still needs to see it.
//! This crate supplies the vocabulary for that bookkeeping:
//!
//! - **`domain::geometry`** – `Point`, `Rect` and `Region`.  A `Region` is a
//!   set of pixels stored as non-overlapping rectangles, with union,
//!   intersection, subtraction and translation.
//!
//! - **`domain::screen`** – `Screen` and `ScreenSet`.  A desktop may span
//!   several monitors; the `ScreenSet` says where each one sits inside the
//!   framebuffer and refuses layouts that do not fit.
//!
//! - **`domain::pixel_buffer`** – the `PixelBuffer` trait a capture backend
//!   implements, plus `ManagedPixelBuffer`, a plain in-memory buffer.
//!
//! - **`domain::cursor`** – cursor images and the composited "rendered
//!   cursor" for viewers that cannot draw the cursor themselves.
//!
//! - **`keymap`** – X11 keysym constants and the `KeyRemapper`.

pub mod domain;
pub mod keymap;

// Re-export the most-used types at the crate root so callers can write
// `rfb_core::Region` instead of `rfb_core::domain::geometry::Region`.
pub use domain::cursor::{Cursor, CursorError, RenderedCursor};
pub use domain::geometry::{Point, Rect, Region};
pub use domain::pixel_buffer::{ManagedPixelBuffer, PixelBuffer, BYTES_PER_PIXEL};
pub use domain::screen::{Screen, ScreenLayoutError, ScreenSet};
pub use keymap::{KeyRemapper, RemapError};
