//! rfb-server library entry point.
//!
//! The session core of a multi-client RFB server: it decides *when* damaged
//! framebuffer areas are flushed and *to whom*, and arbitrates the pointer,
//! clipboard and desktop-size requests of concurrently connected viewers.
//!
//! Re-exports all public modules so that integration tests in `tests/` share
//! the same module tree as embedding applications.

pub mod application;
pub mod infrastructure;
