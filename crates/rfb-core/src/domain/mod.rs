//! Domain value types for the RFB session core.
//!
//! This module contains pure logic with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain**.  Domain code:
//!
//! - Contains the rules that make the system what it is: here, how damaged
//!   areas combine, when a monitor layout is acceptable, and how a cursor is
//!   drawn over the desktop.
//! - Has **no** imports from sockets, timers, capture APIs or UI frameworks.
//! - Can be compiled and tested on any platform without external setup.
//!
//! The session core in `rfb-server` depends on these types, but nothing here
//! depends on the session core.

/// Rectangles and regions.
pub mod geometry;

/// Multi-monitor screen layouts.
pub mod screen;

/// Framebuffer pixel storage.
pub mod pixel_buffer;

/// Cursor images and their composited form.
pub mod cursor;
