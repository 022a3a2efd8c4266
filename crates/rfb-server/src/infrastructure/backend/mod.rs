//! The capture backend seam.
//!
//! A [`DesktopBackend`] owns the real pixel source of one desktop: a screen
//! grabber, a virtual X server, a test double.  The session core drives it
//! through this trait and never touches platform APIs itself.
//!
//! # How events flow (for beginners)
//!
//! ```text
//!   DesktopSession ──start/stop/key/pointer/clipboard──►  DesktopBackend
//!   DesktopSession ◄──────── poll_events() ──────────────  (Damage, Cursor, ...)
//! ```
//!
//! Calls *into* the backend are synchronous and complete before the calling
//! session operation returns.  Things the backend notices on its own (damage,
//! cursor changes, LED changes) are queued inside the backend and drained by
//! the event loop with [`DesktopBackend::poll_events`]; the session applies
//! them through its ordinary public operations.
//!
//! [`DesktopBackend::start`] returns the framebuffer it created, so a started
//! desktop always has one.

use std::fmt;

use rfb_core::{Cursor, PixelBuffer, Point, Region, ScreenSet};
use thiserror::Error;

pub mod mock;

/// A framebuffer together with the layout describing it.
#[derive(Debug)]
pub struct DesktopFrame {
    pub buffer: Box<dyn PixelBuffer>,
    pub layout: ScreenSet,
}

/// What the backend actually applied after a layout request.
#[derive(Debug)]
pub struct ResizeOutcome {
    /// A replacement framebuffer when the size changed, `None` when the
    /// existing one was kept.
    pub buffer: Option<Box<dyn PixelBuffer>>,
    pub layout: ScreenSet,
}

/// Something the backend observed on the desktop.
#[derive(Debug)]
pub enum BackendEvent {
    /// Pixels in the region changed.
    Damage(Region),
    /// The region now holds content previously at `region - delta`.
    Copy { dest: Region, delta: Point },
    Cursor(Cursor),
    CursorPos(Point),
    LedState(u32),
    /// The screen layout changed without a size change.
    ScreenLayout(ScreenSet),
    /// The desktop was resized from the backend side.  The current layout
    /// is reconciled against the new size.
    Resize(Box<dyn PixelBuffer>),
    Bell,
    Name(String),
    /// A local application wants the clipboard contents.
    ClipboardRequest,
    /// The local clipboard changed.
    ClipboardAnnounce(bool),
    /// Clipboard contents answering an earlier request.
    ClipboardData(String),
}

/// Optional backend features; a missing one means degraded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCapability {
    Damage,
    Cursor,
    Randr,
}

impl fmt::Display for BackendCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Damage => "no damage events, polling the whole screen for changes",
            Self::Cursor => "no cursor capture, cursor shape updates unavailable",
            Self::Randr => "no screen resize support, desktop size requests will be refused",
        };
        f.write_str(text)
    }
}

/// Errors reported by a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("desktop failed to start: {0}")]
    Start(String),

    #[error("screen layout rejected: {0}")]
    LayoutRejected(String),

    #[error("no desktop available for `{0}`")]
    UnknownIdentity(String),
}

/// One desktop's pixel source and input sink.
#[cfg_attr(test, mockall::automock)]
pub trait DesktopBackend: Send {
    /// Starts capturing and returns the framebuffer to share.
    fn start(&mut self) -> Result<DesktopFrame, BackendError>;

    fn stop(&mut self);

    /// Tries to reconfigure the desktop to `width` x `height` with `layout`.
    fn set_screen_layout(
        &mut self,
        width: u32,
        height: u32,
        layout: &ScreenSet,
    ) -> Result<ResizeOutcome, BackendError>;

    fn key_event(&mut self, keysym: u32, keycode: u32, down: bool);

    fn pointer_event(&mut self, pos: Point, button_mask: u8);

    /// Asks the desktop for its clipboard contents.
    fn request_clipboard(&mut self);

    /// Tells the desktop whether some client has clipboard data.
    fn announce_clipboard(&mut self, available: bool);

    /// Delivers client clipboard contents to the desktop.
    fn clipboard_data(&mut self, data: &str);

    /// Drains events observed since the last call.
    fn poll_events(&mut self) -> Vec<BackendEvent>;

    /// Features this backend cannot provide.
    fn missing_capabilities(&self) -> Vec<BackendCapability>;
}

/// Creates the backend for a user identity.
pub trait BackendFactory: Send + Sync {
    fn create(&self, identity: &str) -> Result<Box<dyn DesktopBackend>, BackendError>;
}

impl<F> BackendFactory for F
where
    F: Fn(&str) -> Result<Box<dyn DesktopBackend>, BackendError> + Send + Sync,
{
    fn create(&self, identity: &str) -> Result<Box<dyn DesktopBackend>, BackendError> {
        self(identity)
    }
}
