//! DesktopSession: one shared desktop and the viewers looking at it.
//!
//! The session owns the framebuffer, its screen layout, the change tracker,
//! the cursor, the frame clock and the ordered list of joined clients.  It
//! is the only place that decides *when* a frame is produced and *which*
//! client may drive the pointer or supply the clipboard.
//!
//! # Desktop lifecycle (for beginners)
//!
//! ```text
//!   Stopped ──start_desktop()──► Started ──stop_desktop()──► Stopped
//! ```
//!
//! Starting asks the backend for a framebuffer; stopping releases it.  Both
//! calls are idempotent.
//!
//! # Frame production
//!
//! Damage reported through [`DesktopSession::add_changed`] and
//! [`DesktopSession::add_copied`] accumulates in the change tracker and arms
//! the frame clock.  When the clock fires, [`DesktopSession::handle_frame_timer`]
//! grabs the damaged pixels, optionally filters unchanged blocks, and pushes
//! the result into every joined client.  While updates are blocked the
//! clock never runs and the whole framebuffer counts as pending.
//!
//! Every operation runs to completion on the caller's thread; a session is
//! never touched by two threads at once (see `SessionHandle`).

use std::time::{Duration, Instant};

use rfb_core::keymap::keysym::LED_UNKNOWN;
use rfb_core::{Cursor, PixelBuffer, Point, Rect, Region, RenderedCursor, ScreenLayoutError, ScreenSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::change_tracker::ComparingUpdateTracker;
use super::client_connection::{
    AccessRights, ClientCapabilities, ClientConnection, ConnectionId, FrameContext,
    REASON_IDLE_TIMEOUT,
};
use super::frame_clock::FrameClock;
use super::key_events::KeyEvent;
use super::policy::{CompareMode, SessionPolicy};
use crate::infrastructure::backend::{BackendError, BackendEvent, DesktopBackend};
use crate::infrastructure::transport::{DesktopSizeResult, LayoutChangeReason};

pub const REASON_SERVER_SHUTDOWN: &str = "Server shutdown";
pub const REASON_NON_SHARED: &str = "Non-shared connection requested";
pub const REASON_IN_USE: &str = "Server is already in use";

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid screen layout: {0}")]
    InvalidLayout(#[from] ScreenLayoutError),

    #[error("no framebuffer installed")]
    NoFramebuffer,

    #[error("framebuffer removed while the desktop is running")]
    FramebufferRemovedWhileStarted,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("desktop configured a different screen layout than requested")]
    LayoutMismatch,

    #[error("invalid carriage return in clipboard data")]
    InvalidClipboardData,

    #[error("unknown client {0}")]
    UnknownClient(ConnectionId),
}

/// Outcome of [`DesktopSession::client_ready`].
#[derive(Debug)]
pub enum Admission {
    Joined,
    /// The client was closed and handed back; it never joined.
    Refused(ClientConnection),
}

pub struct DesktopSession {
    identity: String,
    policy: SessionPolicy,
    backend: Box<dyn DesktopBackend>,
    framebuffer: Option<Box<dyn PixelBuffer>>,
    layout: ScreenSet,
    tracker: Option<ComparingUpdateTracker>,
    clock: FrameClock,
    cursor: Cursor,
    cursor_pos: Point,
    rendered_cursor: RenderedCursor,
    rendered_cursor_valid: bool,
    led_state: u32,
    name: String,
    block_counter: u32,
    started: bool,
    torn_down: bool,
    clients: Vec<ClientConnection>,
    pointer_owner: Option<ConnectionId>,
    clipboard_owner: Option<ConnectionId>,
    clipboard_requestors: Vec<ConnectionId>,
    frames_produced: u64,
}

impl std::fmt::Debug for DesktopSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopSession")
            .field("identity", &self.identity)
            .field("started", &self.started)
            .field("block_counter", &self.block_counter)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl DesktopSession {
    pub fn new(identity: &str, backend: Box<dyn DesktopBackend>, policy: SessionPolicy) -> Self {
        Self {
            identity: identity.to_string(),
            clock: FrameClock::new(policy.frame_rate),
            name: policy.desktop_name.clone(),
            policy,
            backend,
            framebuffer: None,
            layout: ScreenSet::new(),
            tracker: None,
            cursor: Cursor::default(),
            cursor_pos: Point::default(),
            rendered_cursor: RenderedCursor::new(),
            rendered_cursor_valid: false,
            led_state: LED_UNKNOWN,
            block_counter: 0,
            started: false,
            torn_down: false,
            clients: Vec::new(),
            pointer_owner: None,
            clipboard_owner: None,
            clipboard_requestors: Vec::new(),
            frames_produced: 0,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_blocked(&self) -> bool {
        self.block_counter > 0
    }

    pub fn layout(&self) -> &ScreenSet {
        &self.layout
    }

    pub fn framebuffer_size(&self) -> Option<(u32, u32)> {
        self.framebuffer
            .as_ref()
            .map(|fb| (fb.width(), fb.height()))
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn cursor_pos(&self) -> Point {
        self.cursor_pos
    }

    pub fn led_state(&self) -> u32 {
        self.led_state
    }

    pub fn clients(&self) -> &[ClientConnection] {
        &self.clients
    }

    pub fn client(&self, id: ConnectionId) -> Option<&ClientConnection> {
        self.clients.iter().find(|c| c.id() == id)
    }

    pub fn pointer_owner(&self) -> Option<ConnectionId> {
        self.pointer_owner
    }

    pub fn clipboard_owner(&self) -> Option<ConnectionId> {
        self.clipboard_owner
    }

    pub fn clipboard_requestors(&self) -> &[ConnectionId] {
        &self.clipboard_requestors
    }

    pub fn is_frame_clock_running(&self) -> bool {
        self.clock.is_running()
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    /// Joined clients that are authenticated and not closing.
    pub fn auth_client_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_authenticated()).count()
    }

    // ── Desktop lifecycle ─────────────────────────────────────────────────────

    /// Starts the backend if it is not running yet.
    ///
    /// Damage accumulated while stopped is flushed straight away.
    ///
    /// # Errors
    ///
    /// [`SessionError::Backend`] when the backend fails to start, or
    /// [`SessionError::InvalidLayout`] when the framebuffer it returned does
    /// not match its layout.  The desktop stays stopped in both cases.
    pub fn start_desktop(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }
        debug!("starting desktop for {}", self.identity);
        let frame = self.backend.start().map_err(|err| {
            error!("{}: {err}", self.identity);
            err
        })?;
        if let Err(err) = self.set_framebuffer(Some(frame.buffer), frame.layout) {
            error!("{}: backend produced an unusable framebuffer: {err}", self.identity);
            self.backend.stop();
            return Err(err);
        }
        for capability in self.backend.missing_capabilities() {
            warn!("{}: {capability}", self.identity);
        }
        self.started = true;

        if !self.is_blocked() && self.tracker.as_ref().is_some_and(|t| !t.is_empty()) {
            self.produce_frame();
        }
        Ok(())
    }

    /// Stops the backend and releases the framebuffer.
    pub fn stop_desktop(&mut self) {
        if !self.started {
            return;
        }
        debug!("stopping desktop for {}", self.identity);
        self.started = false;
        self.clock.stop();
        self.backend.stop();
        self.release_framebuffer();
    }

    // ── Framebuffer and layout ────────────────────────────────────────────────

    /// Installs a framebuffer with `layout`, or removes it with `None`.
    ///
    /// A new framebuffer resets change tracking and marks its whole area
    /// changed; every joined client is told about the new dimensions.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidLayout`] if `layout` does not fit the buffer,
    /// [`SessionError::FramebufferRemovedWhileStarted`] for `None` while the
    /// desktop runs.  Nothing changes on error.
    pub fn set_framebuffer(
        &mut self,
        buffer: Option<Box<dyn PixelBuffer>>,
        layout: ScreenSet,
    ) -> Result<(), SessionError> {
        let Some(buffer) = buffer else {
            if self.started {
                return Err(SessionError::FramebufferRemovedWhileStarted);
            }
            self.release_framebuffer();
            return Ok(());
        };

        let (width, height) = (buffer.width(), buffer.height());
        layout.validate(width, height)?;

        if let Some(tracker) = &self.tracker {
            tracker.log_stats();
        }
        self.framebuffer = Some(buffer);
        self.layout = layout;
        self.tracker = Some(ComparingUpdateTracker::new());
        self.rendered_cursor_valid = false;
        self.add_changed(&Region::from_rect(Rect::from_size(0, 0, width, height)));

        for client in &mut self.clients {
            client.pixel_buffer_change(width, height, &self.layout);
        }
        Ok(())
    }

    /// Installs `buffer`, keeping as much of the current layout as fits.
    pub fn replace_framebuffer(&mut self, buffer: Box<dyn PixelBuffer>) -> Result<(), SessionError> {
        let layout = self.layout.clipped_to(buffer.width(), buffer.height());
        self.set_framebuffer(Some(buffer), layout)
    }

    /// Replaces the layout of the current framebuffer.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoFramebuffer`] or [`SessionError::InvalidLayout`];
    /// the previous layout stays in place.
    pub fn set_screen_layout(&mut self, layout: ScreenSet) -> Result<(), SessionError> {
        self.store_layout(layout)?;
        for client in &mut self.clients {
            client.screen_layout_change_or_close(&self.layout, LayoutChangeReason::Server);
        }
        Ok(())
    }

    /// Handles a client's request to resize the desktop.
    ///
    /// Rejections the client caused come back as a [`DesktopSizeResult`].
    ///
    /// # Errors
    ///
    /// [`SessionError::LayoutMismatch`] when the backend applied something
    /// other than what it accepted, [`SessionError::UnknownClient`] for a
    /// requester that is not joined.
    pub fn request_desktop_size(
        &mut self,
        requester: ConnectionId,
        width: u32,
        height: u32,
        layout: ScreenSet,
    ) -> Result<DesktopSizeResult, SessionError> {
        let access = self
            .client(requester)
            .ok_or(SessionError::UnknownClient(requester))?
            .access();

        let result = if !access.contains(AccessRights::SET_DESKTOP_SIZE) {
            debug!("{requester}: desktop resize not permitted");
            DesktopSizeResult::Prohibited
        } else if let Err(err) = layout.validate(width, height) {
            debug!("{requester}: rejecting desktop size request: {err}");
            DesktopSizeResult::Invalid
        } else {
            match self.backend.set_screen_layout(width, height, &layout) {
                Ok(outcome) => {
                    match outcome.buffer {
                        Some(buffer) => self.set_framebuffer(Some(buffer), outcome.layout)?,
                        None => self.store_layout(outcome.layout)?,
                    }
                    if self.layout != layout {
                        return Err(SessionError::LayoutMismatch);
                    }
                    for client in self.clients.iter_mut().filter(|c| c.id() != requester) {
                        client.screen_layout_change_or_close(&layout, LayoutChangeReason::OtherClient);
                    }
                    DesktopSizeResult::Success
                }
                Err(err) => {
                    info!("{}: {err}", self.identity);
                    DesktopSizeResult::Refused
                }
            }
        };

        if let Some(client) = self.client_mut(requester) {
            client.desktop_size_reply_or_close(result);
        }
        Ok(result)
    }

    fn store_layout(&mut self, layout: ScreenSet) -> Result<(), SessionError> {
        let fb = self.framebuffer.as_ref().ok_or(SessionError::NoFramebuffer)?;
        layout.validate(fb.width(), fb.height())?;
        self.layout = layout;
        Ok(())
    }

    fn release_framebuffer(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.log_stats();
        }
        self.framebuffer = None;
        self.layout = ScreenSet::new();
        self.rendered_cursor_valid = false;
    }

    fn fb_region(&self) -> Region {
        self.framebuffer
            .as_ref()
            .map(|fb| Region::from_rect(fb.rect()))
            .unwrap_or_default()
    }

    // ── Update blocking ───────────────────────────────────────────────────────

    /// Suspends frame production.  Calls nest.
    pub fn block_updates(&mut self) {
        self.block_counter += 1;
        self.clock.stop();
    }

    /// Undoes one [`DesktopSession::block_updates`].  The frame clock
    /// restarts once the last block is lifted and changes are pending.
    pub fn unblock_updates(&mut self) {
        debug_assert!(
            self.block_counter > 0,
            "unblock_updates without a matching block_updates"
        );
        if self.block_counter == 0 {
            error!("unblock_updates without a matching block_updates");
            return;
        }
        self.block_counter -= 1;
        if self.block_counter == 0 && self.tracker.as_ref().is_some_and(|t| !t.is_empty()) {
            self.start_frame_clock();
        }
    }

    // ── Damage ────────────────────────────────────────────────────────────────

    pub fn add_changed(&mut self, region: &Region) {
        let clipped = region.intersect(&self.fb_region());
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        tracker.add_changed(&clipped);
        self.start_frame_clock();
    }

    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        let fb = self.fb_region();
        let src = dest.intersect(&fb).translate(-delta).intersect(&fb);
        let dest = src.translate(delta);
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        tracker.add_copied(&dest, delta);
        self.start_frame_clock();
    }

    /// Everything a client must not read yet.
    ///
    /// The whole framebuffer while updates are blocked, otherwise the
    /// unflushed damage.
    pub fn pending_region(&self) -> Region {
        let fb = self.fb_region();
        if self.is_blocked() {
            return fb;
        }
        match &self.tracker {
            Some(tracker) if !tracker.is_empty() => tracker.update_info(&fb).touched(),
            _ => Region::new(),
        }
    }

    // ── Cursor ────────────────────────────────────────────────────────────────

    /// Installs a new cursor shape.  Fully transparent borders are cropped.
    pub fn set_cursor(&mut self, mut cursor: Cursor) {
        let old = self.cursor_damage();
        cursor.crop();
        self.cursor = cursor;
        self.rendered_cursor_valid = false;

        let damage = old.union(&self.cursor_damage());
        for client in &mut self.clients {
            client.rendered_cursor_change(&damage);
            client.set_cursor_or_close(&self.cursor);
        }
        self.flush_clients();
    }

    pub fn set_cursor_pos(&mut self, pos: Point) {
        if pos == self.cursor_pos {
            return;
        }
        let old = self.cursor_damage();
        self.cursor_pos = pos;
        self.rendered_cursor_valid = false;

        let damage = old.union(&self.cursor_damage());
        for client in &mut self.clients {
            client.rendered_cursor_change(&damage);
        }
        self.flush_clients();
    }

    /// The cursor composited over the framebuffer, recomputed if stale.
    pub fn rendered_cursor(&mut self) -> &RenderedCursor {
        self.refresh_rendered_cursor();
        &self.rendered_cursor
    }

    fn cursor_damage(&self) -> Region {
        match &self.framebuffer {
            Some(fb) if !self.cursor.is_empty() => {
                Region::from_rect(self.cursor.footprint_at(self.cursor_pos).intersect(&fb.rect()))
            }
            _ => Region::new(),
        }
    }

    fn refresh_rendered_cursor(&mut self) {
        // Reading the framebuffer is not allowed while blocked.
        if self.rendered_cursor_valid || self.is_blocked() {
            return;
        }
        if let Some(fb) = self.framebuffer.as_deref() {
            self.rendered_cursor.update(fb, &self.cursor, self.cursor_pos);
            self.rendered_cursor_valid = true;
        }
    }

    fn needs_rendered_cursor(&self) -> bool {
        !self.cursor.is_empty() && self.clients.iter().any(|c| c.needs_rendered_cursor())
    }

    // ── Broadcasts ────────────────────────────────────────────────────────────

    pub fn set_led_state(&mut self, state: u32) {
        if state == self.led_state {
            return;
        }
        self.led_state = state;
        for client in &mut self.clients {
            client.set_led_state_or_close(state);
        }
    }

    pub fn bell(&mut self) {
        for client in &mut self.clients {
            client.bell_or_close();
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        for client in &mut self.clients {
            client.set_desktop_name_or_close(name);
        }
    }

    // ── Clipboard ─────────────────────────────────────────────────────────────

    /// Asks the client owning the clipboard for its contents.
    pub fn request_clipboard(&mut self) {
        let Some(owner) = self.clipboard_owner else {
            debug!("Got request for client clipboard but no client currently owns the clipboard");
            return;
        };
        if let Some(client) = self.client_mut(owner) {
            client.request_clipboard_or_close();
        }
    }

    /// The desktop clipboard changed.  Pending client requests are dropped.
    pub fn announce_clipboard(&mut self, available: bool) {
        if available {
            self.clipboard_owner = None;
        }
        self.clipboard_requestors.clear();
        if !self.policy.send_cut_text {
            return;
        }
        for client in &mut self.clients {
            client.announce_clipboard_or_close(available);
        }
    }

    /// Delivers desktop clipboard contents to every client that asked.
    ///
    /// Returns the number of clients the data was sent to.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidClipboardData`] if `data` contains a carriage
    /// return; the requestor queue is left untouched.
    pub fn send_clipboard_data(&mut self, data: &str) -> Result<usize, SessionError> {
        if data.contains('\r') {
            return Err(SessionError::InvalidClipboardData);
        }
        let requestors = std::mem::take(&mut self.clipboard_requestors);
        if !self.policy.send_cut_text {
            return Ok(0);
        }
        let mut delivered = 0;
        for id in requestors {
            if let Some(client) = self.client_mut(id) {
                if client.send_clipboard_data_or_close(data) {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// A client asks for the desktop clipboard.
    pub fn handle_clipboard_request(&mut self, client: ConnectionId) {
        if !self.client_may(client, AccessRights::CUT_TEXT) {
            return;
        }
        self.clipboard_requestors.push(client);
        if self.clipboard_requestors.len() == 1 {
            self.backend.request_clipboard();
        }
    }

    /// A client's clipboard changed.
    pub fn handle_clipboard_announce(&mut self, client: ConnectionId, available: bool) {
        if !self.client_may(client, AccessRights::CUT_TEXT) {
            return;
        }
        if available {
            self.clipboard_owner = Some(client);
        } else {
            if self.clipboard_owner != Some(client) {
                return;
            }
            self.clipboard_owner = None;
        }
        self.backend.announce_clipboard(available);
    }

    /// Clipboard contents from a client.  Only the owner is listened to.
    pub fn handle_clipboard_data(&mut self, client: ConnectionId, data: &str) {
        if self.clipboard_owner != Some(client) {
            debug!("Ignoring unexpected clipboard data from {client}");
            return;
        }
        self.backend.clipboard_data(data);
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    /// Forwards a pointer event unless another client is dragging.
    ///
    /// A client holding any button owns the pointer until it releases all
    /// of them.  Returns `false` if the event was dropped.
    pub fn pointer_event(&mut self, client: ConnectionId, pos: Point, button_mask: u8) -> bool {
        if !self.client_may(client, AccessRights::PTR_EVENTS) {
            return false;
        }
        if self.pointer_owner.is_some_and(|owner| owner != client) {
            return false;
        }
        self.pointer_owner = (button_mask != 0).then_some(client);
        self.backend.pointer_event(pos, button_mask);
        true
    }

    /// Forwards a key event after remapping.
    pub fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        let remapped = self.policy.key_remapper.remap(keysym);
        if remapped != keysym {
            debug!("Key remapped to {remapped:#x}");
        }
        self.backend.key_event(remapped, keycode, down);
    }

    /// A key event from a client, normalised against the LED state first.
    pub fn client_key_event(&mut self, client: ConnectionId, keysym: u32, keycode: u32, down: bool) {
        if !self.client_may(client, AccessRights::KEY_EVENTS) {
            return;
        }
        let led_state = self.led_state;
        let Some(conn) = self.client_mut(client) else {
            return;
        };
        let events = conn.process_key(KeyEvent::new(keysym, keycode, down), led_state);
        for event in events {
            self.key_event(event.keysym, event.keycode, event.down);
        }
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    /// Admits an authenticated client that has sent its init message.
    ///
    /// A non-shared request either closes everyone else (when configured
    /// to and the client may) or is refused while others are connected.
    pub fn client_ready(&mut self, mut client: ClientConnection, shared: bool) -> Admission {
        if !shared {
            if self.policy.disconnect_clients && client.has_access(AccessRights::NON_SHARED) {
                debug!("non-shared connection - closing clients");
                self.close_clients(REASON_NON_SHARED, None);
            } else if self.auth_client_count() > 0 {
                client.close(REASON_IN_USE);
                return Admission::Refused(client);
            }
        }

        let (width, height) = self.framebuffer_size().unwrap_or((0, 0));
        client.enter_normal(width, height, &self.layout);
        if !self.cursor.is_empty() {
            client.set_cursor_or_close(&self.cursor);
        }
        if self.led_state != LED_UNKNOWN {
            client.set_led_state_or_close(self.led_state);
        }
        self.clients.push(client);
        Admission::Joined
    }

    /// Unlinks a client whose transport has gone away.
    ///
    /// Ownership and clipboard requests it held are dropped and any keys it
    /// still holds are released.  The desktop keeps running.
    pub fn remove_client(&mut self, id: ConnectionId) -> Option<ClientConnection> {
        let index = self.clients.iter().position(|c| c.id() == id)?;
        if self.pointer_owner == Some(id) {
            self.pointer_owner = None;
        }
        if self.clipboard_owner == Some(id) {
            self.clipboard_owner = None;
        }
        self.clipboard_requestors.retain(|&r| r != id);
        if let Some(tracker) = &self.tracker {
            tracker.log_stats();
        }

        let mut client = self.clients.remove(index);
        for event in client.release_keys() {
            self.key_event(event.keysym, event.keycode, false);
        }
        Some(client)
    }

    /// Closes every joined client except `except`.
    pub fn close_clients(&mut self, reason: &str, except: Option<ConnectionId>) {
        for client in self.clients.iter_mut().filter(|c| Some(c.id()) != except) {
            client.close(reason);
        }
    }

    /// Closes joined clients that have been silent for `timeout`.
    pub fn close_idle_clients(&mut self, now: Instant, timeout: Duration) {
        for client in &mut self.clients {
            if client.is_authenticated() && client.is_idle(now, timeout) {
                client.close(REASON_IDLE_TIMEOUT);
            }
        }
    }

    /// Earliest idle deadline among joined clients.
    pub fn next_client_idle_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.clients
            .iter()
            .filter(|c| c.is_authenticated())
            .map(|c| c.idle_deadline(timeout))
            .min()
    }

    pub fn touch_client(&mut self, id: ConnectionId, now: Instant) {
        if let Some(client) = self.client_mut(id) {
            client.touch(now);
        }
    }

    pub fn set_client_capabilities(&mut self, id: ConnectionId, caps: ClientCapabilities) {
        let led_state = self.led_state;
        let Some(client) = self.clients.iter_mut().find(|c| c.id() == id) else {
            return;
        };
        client.set_capabilities(caps);
        if caps.local_cursor && !self.cursor.is_empty() {
            client.set_cursor_or_close(&self.cursor);
        }
        if caps.led_state && led_state != LED_UNKNOWN {
            client.set_led_state_or_close(led_state);
        }
    }

    /// Records an update request and answers it if nothing blocks it.
    pub fn request_update(&mut self, id: ConnectionId, rect: Rect, incremental: bool) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.request_update(rect, incremental);
        self.flush_clients();
    }

    fn client_mut(&mut self, id: ConnectionId) -> Option<&mut ClientConnection> {
        self.clients.iter_mut().find(|c| c.id() == id)
    }

    fn client_may(&self, id: ConnectionId, rights: AccessRights) -> bool {
        self.client(id)
            .is_some_and(|c| c.is_authenticated() && c.has_access(rights))
    }

    /// Lets every client write whatever it has been asked for.
    fn flush_clients(&mut self) {
        let pending = self.pending_region();
        let need_cursor = self.needs_rendered_cursor();
        if need_cursor {
            self.refresh_rendered_cursor();
        }
        let ctx = FrameContext {
            pending: &pending,
            rendered_cursor: (need_cursor && self.rendered_cursor_valid)
                .then_some(&self.rendered_cursor),
        };
        for client in &mut self.clients {
            client.write_framebuffer_update_or_close(&ctx);
        }
    }

    // ── Frame clock ───────────────────────────────────────────────────────────

    fn start_frame_clock(&mut self) {
        if self.clock.is_running() || self.is_blocked() || !self.started {
            return;
        }
        self.clock.start(Instant::now());
    }

    /// Drives the frame clock.  Returns `true` if a frame was produced.
    pub fn handle_frame_timer(&mut self, now: Instant) -> bool {
        if !self.clock.is_due(now) {
            return false;
        }
        // Keep running until a whole interval passes without damage.
        let idle = self.tracker.as_ref().map_or(true, |t| t.is_empty());
        if idle || self.is_blocked() || !self.started {
            self.clock.stop();
            return false;
        }
        let produced = self.produce_frame();
        if self.clock.rearm(now) {
            debug!("{}: frame clock running at {:?}", self.identity, self.clock.period());
        }
        produced
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.clock.deadline()
    }

    /// How long until a frame could next go out.
    pub fn time_to_next_update(&self, now: Instant) -> Duration {
        self.clock.time_to_next_tick(now)
    }

    /// Whether the comparison pass runs for the next frame.
    pub fn comparer_enabled(&self) -> bool {
        match self.policy.compare_mode {
            CompareMode::Always => true,
            CompareMode::Never => false,
            CompareMode::Auto => self.clients.iter().any(|c| c.wants_comparison()),
        }
    }

    /// Flushes accumulated damage to every joined client.
    ///
    /// Returns `false` if nothing was sent, e.g. because the comparison pass
    /// found no real change.
    pub fn produce_frame(&mut self) -> bool {
        debug_assert!(!self.is_blocked(), "frame produced while updates are blocked");
        debug_assert!(self.started, "frame produced while the desktop is stopped");
        if self.is_blocked() || !self.started {
            error!("{}: refusing to produce a frame while blocked or stopped", self.identity);
            return false;
        }

        let compare = self.comparer_enabled();
        let need_cursor = self.needs_rendered_cursor();
        let (Some(fb), Some(tracker)) = (self.framebuffer.as_deref_mut(), self.tracker.as_mut())
        else {
            return false;
        };

        let fb_region = Region::from_rect(fb.rect());
        let mut info = tracker.update_info(&fb_region);
        let to_check = info.touched();

        let mut cursor_damage = Region::new();
        if need_cursor {
            let footprint = self.cursor.footprint_at(self.cursor_pos).intersect(&fb.rect());
            cursor_damage = Region::from_rect(footprint);
            if to_check.intersects(&cursor_damage) {
                self.rendered_cursor_valid = false;
            } else {
                cursor_damage.clear();
            }
        }

        fb.grab_region(&to_check);

        if compare {
            tracker.enable();
        } else {
            tracker.disable();
        }
        let still_pending = tracker.compare(&*fb);
        if still_pending {
            info = tracker.update_info(&fb_region);
        }
        tracker.clear();
        if !still_pending {
            debug!("{}: nothing changed after comparison, skipping frame", self.identity);
            // Requests deferred behind the vanished damage can be answered now.
            self.flush_clients();
            return false;
        }

        self.frames_produced += 1;
        for client in &mut self.clients {
            client.add_copied(&info.copied, info.copy_delta);
            client.add_changed(&info.changed);
            client.rendered_cursor_change(&cursor_damage);
        }
        self.flush_clients();
        true
    }

    // ── Backend events ────────────────────────────────────────────────────────

    /// Applies everything the backend queued since the last call.
    ///
    /// Every event is applied even if an earlier one failed; the first
    /// failure is returned.
    pub fn process_backend_events(&mut self) -> Result<usize, SessionError> {
        let events = self.backend.poll_events();
        let count = events.len();
        let mut first_error = None;
        for event in events {
            if let Err(err) = self.apply_backend_event(event) {
                warn!("{}: backend event rejected: {err}", self.identity);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    pub fn apply_backend_event(&mut self, event: BackendEvent) -> Result<(), SessionError> {
        match event {
            BackendEvent::Damage(region) => self.add_changed(&region),
            BackendEvent::Copy { dest, delta } => self.add_copied(&dest, delta),
            BackendEvent::Cursor(cursor) => self.set_cursor(cursor),
            BackendEvent::CursorPos(pos) => self.set_cursor_pos(pos),
            BackendEvent::LedState(state) => self.set_led_state(state),
            BackendEvent::ScreenLayout(layout) => self.set_screen_layout(layout)?,
            BackendEvent::Resize(buffer) => self.replace_framebuffer(buffer)?,
            BackendEvent::Bell => self.bell(),
            BackendEvent::Name(name) => self.set_name(&name),
            BackendEvent::ClipboardRequest => self.request_clipboard(),
            BackendEvent::ClipboardAnnounce(available) => self.announce_clipboard(available),
            BackendEvent::ClipboardData(data) => {
                self.send_clipboard_data(&data)?;
            }
        }
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Disconnects every client, stops the desktop and releases the
    /// framebuffer.  Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        debug!("shutting down session {}", self.identity);
        self.torn_down = true;
        self.close_clients(REASON_SERVER_SHUTDOWN, None);
        self.clock.stop();
        self.clients.clear();
        self.pointer_owner = None;
        self.clipboard_owner = None;
        self.clipboard_requestors.clear();
        self.stop_desktop();
        self.release_framebuffer();
    }
}

impl Drop for DesktopSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
