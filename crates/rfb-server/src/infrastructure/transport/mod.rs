//! The per-client transport seam.
//!
//! A [`ClientTransport`] is everything the session core needs from the
//! protocol layer for one viewer: the peer's address, a way to ask for the
//! connection to be shut down, and one method per server-to-client message
//! the core decides to send.  Encoding those messages onto the wire (pixel
//! formats, encodings, compression) happens behind this trait.
//!
//! # Ownership
//!
//! The transport layer owns the socket.  `shutdown` only *requests* closure;
//! the connection is unlinked from its session when the transport later
//! reports the socket as gone (see `VncServer::remove_socket`).
//!
//! # Testability
//!
//! [`mock::RecordingTransport`] records every message so tests can assert on
//! exactly what a client was sent.

use rfb_core::{Cursor, Point, Region, ScreenSet};
use thiserror::Error;

pub mod mock;

/// Who triggered a desktop-size notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutChangeReason {
    /// The desktop itself changed size or layout.
    Server,
    /// Reply to this client's own request.
    Client,
    /// Another client's request changed the layout.
    OtherClient,
}

/// Result of a client's request to change the desktop size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopSizeResult {
    Success,
    /// The client may not change the desktop size.
    Prohibited,
    /// The requested layout does not fit the requested size.
    Invalid,
    /// The backend could not apply the layout.
    Refused,
}

/// One framebuffer update, ready for encoding.
///
/// Apply `copied` (shifted by `copy_delta`) before redrawing `changed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferUpdate {
    pub changed: Region,
    pub copied: Region,
    pub copy_delta: Point,
    /// Server-rendered cursor composite, for clients that cannot draw the
    /// cursor themselves.
    pub cursor: Option<RenderedCursorUpdate>,
}

/// The rendered cursor as it goes into one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCursorUpdate {
    pub region: Region,
    pub pixels: Vec<u8>,
}

/// Desktop size or layout notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopSizeNotice {
    pub width: u32,
    pub height: u32,
    pub layout: ScreenSet,
    pub reason: LayoutChangeReason,
    pub result: DesktopSizeResult,
}

/// Errors surfaced by a transport write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Per-client protocol collaborator.
pub trait ClientTransport: Send {
    /// Address of the remote peer, `host:port` or similar.
    fn peer_address(&self) -> String;

    /// Requests that the connection be shut down.
    fn shutdown(&mut self, reason: &str);

    fn write_framebuffer_update(&mut self, update: &FramebufferUpdate) -> Result<(), TransportError>;

    fn write_desktop_size(&mut self, notice: &DesktopSizeNotice) -> Result<(), TransportError>;

    /// Sends a new cursor shape to a client that draws its own cursor.
    fn write_cursor(&mut self, cursor: &Cursor) -> Result<(), TransportError>;

    fn write_led_state(&mut self, state: u32) -> Result<(), TransportError>;

    fn write_bell(&mut self) -> Result<(), TransportError>;

    fn write_desktop_name(&mut self, name: &str) -> Result<(), TransportError>;

    fn write_clipboard_announce(&mut self, available: bool) -> Result<(), TransportError>;

    fn write_clipboard_request(&mut self) -> Result<(), TransportError>;

    fn write_clipboard_data(&mut self, data: &str) -> Result<(), TransportError>;
}
