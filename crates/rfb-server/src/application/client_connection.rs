//! ClientConnection: the server-side state of one connected viewer.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! Authenticating ──► Initialising ──► Normal
//!        │                 │             │
//!        └─────────────────┴─────────────┴──► Closing
//! ```
//!
//! - `Authenticating`: the transport is open, security handshake running.
//! - `Initialising`: authenticated, waiting for the client-init message that
//!   says whether the viewer wants a shared session.
//! - `Normal`: joined to a desktop session and receiving updates.
//! - `Closing`: shutdown was requested.  The connection stays around until
//!   the transport confirms the socket is gone, but nothing is sent to it.
//!
//! # Updates
//!
//! Each connection keeps its own [`SimpleUpdateTracker`].  The desktop
//! session pushes every produced frame into all of them; a connection then
//! writes only the part of its backlog that the viewer has *requested*.
//! A request overlapping damage the session has not flushed yet is held
//! back until the next frame, so viewers never see half-captured content.

use std::time::{Duration, Instant};

use rfb_core::{Cursor, Point, Rect, Region, RenderedCursor, ScreenSet};
use tracing::{debug, info};
use uuid::Uuid;

use super::change_tracker::SimpleUpdateTracker;
use super::key_events::{KeyEvent, KeyTracker};
use super::policy::SessionPolicy;
use crate::infrastructure::transport::{
    ClientTransport, DesktopSizeNotice, DesktopSizeResult, FramebufferUpdate, LayoutChangeReason,
    RenderedCursorUpdate, TransportError,
};

/// Stable handle for one client connection.
pub type ConnectionId = Uuid;

pub const REASON_NO_DESKTOP_RESIZE: &str = "Client does not support desktop resize";
pub const REASON_IDLE_TIMEOUT: &str = "Idle timeout";

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Initialising,
    Normal,
    Closing,
}

// ── Access rights ─────────────────────────────────────────────────────────────

/// What an authenticated client is allowed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessRights(u8);

impl AccessRights {
    pub const NONE: AccessRights = AccessRights(0);
    pub const VIEW: AccessRights = AccessRights(0x01);
    pub const KEY_EVENTS: AccessRights = AccessRights(0x02);
    pub const PTR_EVENTS: AccessRights = AccessRights(0x04);
    pub const CUT_TEXT: AccessRights = AccessRights(0x08);
    pub const SET_DESKTOP_SIZE: AccessRights = AccessRights(0x10);
    pub const NON_SHARED: AccessRights = AccessRights(0x20);
    pub const FULL: AccessRights = AccessRights(0x3f);

    pub fn contains(self, other: AccessRights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: AccessRights) -> AccessRights {
        AccessRights(self.0 | other.0)
    }

    pub fn without(self, other: AccessRights) -> AccessRights {
        AccessRights(self.0 & !other.0)
    }

    /// Full access minus whatever the policy switches off.
    pub fn from_policy(policy: &SessionPolicy) -> AccessRights {
        let mut access = AccessRights::FULL;
        if !policy.accept_key_events {
            access = access.without(AccessRights::KEY_EVENTS);
        }
        if !policy.accept_pointer_events {
            access = access.without(AccessRights::PTR_EVENTS);
        }
        if !policy.accept_cut_text {
            access = access.without(AccessRights::CUT_TEXT);
        }
        if !policy.accept_set_desktop_size {
            access = access.without(AccessRights::SET_DESKTOP_SIZE);
        }
        access
    }
}

/// Protocol features the viewer negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub desktop_size: bool,
    pub extended_desktop_size: bool,
    pub led_state: bool,
    /// The viewer draws the cursor itself.
    pub local_cursor: bool,
    pub copy_rect: bool,
    /// The viewer's encoder benefits from the comparison pass.
    pub prefers_comparison: bool,
}

impl ClientCapabilities {
    fn supports_resize(&self) -> bool {
        self.desktop_size || self.extended_desktop_size
    }
}

/// Session state a connection needs when writing an update.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    /// Damage the session has not flushed yet.
    pub pending: &'a Region,
    pub rendered_cursor: Option<&'a RenderedCursor>,
}

// ── ClientConnection ──────────────────────────────────────────────────────────

pub struct ClientConnection {
    id: ConnectionId,
    peer: String,
    transport: Box<dyn ClientTransport>,
    state: ConnectionState,
    access: AccessRights,
    caps: ClientCapabilities,
    width: u32,
    height: u32,
    layout: ScreenSet,
    updates: SimpleUpdateTracker,
    requested: Region,
    keys: KeyTracker,
    close_reason: Option<String>,
    last_activity: Instant,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    pub fn new(id: ConnectionId, transport: Box<dyn ClientTransport>, now: Instant) -> Self {
        let peer = transport.peer_address();
        let mut updates = SimpleUpdateTracker::new();
        updates.set_copy_enabled(false);
        Self {
            id,
            peer,
            transport,
            state: ConnectionState::Authenticating,
            access: AccessRights::NONE,
            caps: ClientCapabilities::default(),
            width: 0,
            height: 0,
            layout: ScreenSet::new(),
            updates,
            requested: Region::new(),
            keys: KeyTracker::new(),
            close_reason: None,
            last_activity: now,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Host part of the peer address, used for blacklisting.
    pub fn peer_host(&self) -> &str {
        match self.peer.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                host.trim_start_matches('[').trim_end_matches(']')
            }
            _ => &self.peer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn access(&self) -> AccessRights {
        self.access
    }

    pub fn has_access(&self, rights: AccessRights) -> bool {
        self.access.contains(rights)
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.caps
    }

    pub fn set_capabilities(&mut self, caps: ClientCapabilities) {
        self.caps = caps;
        self.updates.set_copy_enabled(caps.copy_rect);
    }

    /// Authenticated and not on its way out.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Initialising | ConnectionState::Normal
        )
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn framebuffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn layout(&self) -> &ScreenSet {
        &self.layout
    }

    /// The viewer cannot draw the cursor, so it must be part of the image.
    pub fn needs_rendered_cursor(&self) -> bool {
        self.state == ConnectionState::Normal && !self.caps.local_cursor
    }

    pub fn wants_comparison(&self) -> bool {
        self.caps.prefers_comparison
    }

    /// Damage waiting to be sent.
    pub fn pending_updates(&self) -> Region {
        self.updates.changed().union(self.updates.copied())
    }

    pub fn requested_region(&self) -> &Region {
        &self.requested
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn mark_authenticated(&mut self, access: AccessRights) {
        if self.state != ConnectionState::Authenticating {
            return;
        }
        self.access = access;
        self.state = ConnectionState::Initialising;
    }

    /// Starts normal operation against a `width` x `height` framebuffer.
    /// The whole framebuffer becomes pending.
    pub fn enter_normal(&mut self, width: u32, height: u32, layout: &ScreenSet) {
        if self.state != ConnectionState::Initialising {
            return;
        }
        self.state = ConnectionState::Normal;
        self.reset_framebuffer(width, height, layout);
    }

    /// Requests shutdown.  The connection is removed later, when the
    /// transport reports the socket closed.
    pub fn close(&mut self, reason: &str) {
        if self.state == ConnectionState::Closing {
            return;
        }
        info!("closing {}: {reason}", self.peer);
        self.state = ConnectionState::Closing;
        self.close_reason = Some(reason.to_string());
        self.requested.clear();
        self.transport.shutdown(reason);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// When this client would hit `timeout`.
    pub fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.last_activity + timeout
    }

    // ── Session notifications ─────────────────────────────────────────────────

    /// The session installed a new framebuffer.
    pub fn pixel_buffer_change(&mut self, width: u32, height: u32, layout: &ScreenSet) {
        if self.is_closing() {
            return;
        }
        let resized = (width, height) != (self.width, self.height);
        if self.state == ConnectionState::Normal && resized {
            if !self.caps.supports_resize() {
                self.close(REASON_NO_DESKTOP_RESIZE);
                return;
            }
            let notice = DesktopSizeNotice {
                width,
                height,
                layout: layout.clone(),
                reason: LayoutChangeReason::Server,
                result: DesktopSizeResult::Success,
            };
            if let Err(err) = self.transport.write_desktop_size(&notice) {
                self.fail(&err);
                return;
            }
        }
        self.reset_framebuffer(width, height, layout);
    }

    /// The layout changed without a size change.
    pub fn screen_layout_change_or_close(&mut self, layout: &ScreenSet, reason: LayoutChangeReason) {
        self.layout = layout.clone();
        if self.state != ConnectionState::Normal || !self.caps.extended_desktop_size {
            return;
        }
        let notice = DesktopSizeNotice {
            width: self.width,
            height: self.height,
            layout: layout.clone(),
            reason,
            result: DesktopSizeResult::Success,
        };
        if let Err(err) = self.transport.write_desktop_size(&notice) {
            self.fail(&err);
        }
    }

    /// Answers this client's own desktop-size request.
    pub fn desktop_size_reply_or_close(&mut self, result: DesktopSizeResult) {
        if self.state != ConnectionState::Normal {
            return;
        }
        let notice = DesktopSizeNotice {
            width: self.width,
            height: self.height,
            layout: self.layout.clone(),
            reason: LayoutChangeReason::Client,
            result,
        };
        if let Err(err) = self.transport.write_desktop_size(&notice) {
            self.fail(&err);
        }
    }

    pub fn set_cursor_or_close(&mut self, cursor: &Cursor) {
        if self.state != ConnectionState::Normal || !self.caps.local_cursor {
            return;
        }
        let result = self.transport.write_cursor(cursor);
        self.check(result);
    }

    /// The server-rendered cursor changed over `damage`.
    pub fn rendered_cursor_change(&mut self, damage: &Region) {
        if self.needs_rendered_cursor() {
            self.add_changed(damage);
        }
    }

    pub fn set_led_state_or_close(&mut self, state: u32) {
        if self.state != ConnectionState::Normal || !self.caps.led_state {
            return;
        }
        let result = self.transport.write_led_state(state);
        self.check(result);
    }

    pub fn bell_or_close(&mut self) {
        if self.state != ConnectionState::Normal {
            return;
        }
        let result = self.transport.write_bell();
        self.check(result);
    }

    pub fn set_desktop_name_or_close(&mut self, name: &str) {
        if self.state != ConnectionState::Normal {
            return;
        }
        let result = self.transport.write_desktop_name(name);
        self.check(result);
    }

    pub fn announce_clipboard_or_close(&mut self, available: bool) {
        if !self.may_exchange_clipboard() {
            return;
        }
        let result = self.transport.write_clipboard_announce(available);
        self.check(result);
    }

    pub fn request_clipboard_or_close(&mut self) {
        if !self.may_exchange_clipboard() {
            return;
        }
        let result = self.transport.write_clipboard_request();
        self.check(result);
    }

    /// Returns `true` if the data was handed to the transport.
    pub fn send_clipboard_data_or_close(&mut self, data: &str) -> bool {
        if !self.may_exchange_clipboard() {
            return false;
        }
        match self.transport.write_clipboard_data(data) {
            Ok(()) => true,
            Err(err) => {
                self.fail(&err);
                false
            }
        }
    }

    fn may_exchange_clipboard(&self) -> bool {
        self.state == ConnectionState::Normal && self.access.contains(AccessRights::CUT_TEXT)
    }

    // ── Updates ───────────────────────────────────────────────────────────────

    pub fn add_changed(&mut self, region: &Region) {
        let clipped = region.intersect(&self.fb_region());
        if !clipped.is_empty() {
            self.updates.add_changed(&clipped);
        }
    }

    /// Records a copy, dropping any part whose source or destination lies
    /// outside the framebuffer.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        let fb = self.fb_region();
        let src = dest.intersect(&fb).translate(-delta).intersect(&fb);
        let dest = src.translate(delta);
        if !dest.is_empty() {
            self.updates.add_copied(&dest, delta);
        }
    }

    /// Records an update request.  A non-incremental request marks the area
    /// for a full resend.
    pub fn request_update(&mut self, rect: Rect, incremental: bool) {
        let area = Region::from_rect(rect).intersect(&self.fb_region());
        if !incremental {
            self.updates.add_changed(&area);
        }
        self.requested.assign_union(&area);
    }

    /// Writes whatever part of the backlog the viewer asked for.
    ///
    /// Returns `true` if an update went out.
    pub fn write_framebuffer_update_or_close(&mut self, ctx: &FrameContext<'_>) -> bool {
        if self.state != ConnectionState::Normal || self.requested.is_empty() {
            return false;
        }
        if ctx.pending.intersects(&self.requested) {
            debug!("{}: deferring update until pending damage is flushed", self.peer);
            return false;
        }

        let info = self.updates.update_info(&self.requested);
        let cursor = ctx
            .rendered_cursor
            .filter(|_| self.needs_rendered_cursor())
            .filter(|rc| !rc.rect().is_empty() && info.changed.intersects(&Region::from_rect(rc.rect())))
            .map(|rc| RenderedCursorUpdate {
                region: Region::from_rect(rc.rect()),
                pixels: rc.pixels().to_vec(),
            });
        if info.is_empty() && cursor.is_none() {
            return false;
        }

        let update = FramebufferUpdate {
            changed: info.changed,
            copied: info.copied,
            copy_delta: info.copy_delta,
            cursor,
        };
        if let Err(err) = self.transport.write_framebuffer_update(&update) {
            self.fail(&err);
            return false;
        }
        let sent = std::mem::take(&mut self.requested);
        self.updates.subtract(&sent);
        true
    }

    // ── Keyboard ──────────────────────────────────────────────────────────────

    /// Normalises one key event from this client.
    pub fn process_key(&mut self, event: KeyEvent, led_state: u32) -> Vec<KeyEvent> {
        self.keys.process(event, led_state, self.caps.led_state)
    }

    /// Releases every key this client still holds.
    pub fn release_keys(&mut self) -> Vec<KeyEvent> {
        self.keys.release_all()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn fb_region(&self) -> Region {
        Region::from_rect(Rect::from_size(0, 0, self.width, self.height))
    }

    fn reset_framebuffer(&mut self, width: u32, height: u32, layout: &ScreenSet) {
        self.width = width;
        self.height = height;
        self.layout = layout.clone();
        self.updates.clear();
        let fb = self.fb_region();
        self.updates.add_changed(&fb);
        self.requested.assign_intersect(&fb);
    }

    fn check(&mut self, result: Result<(), TransportError>) {
        if let Err(err) = result {
            self.fail(&err);
        }
    }

    fn fail(&mut self, err: &TransportError) {
        self.close(&err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::mock::{RecordingTransport, TransportProbe};

    fn normal_client(width: u32, height: u32) -> (ClientConnection, TransportProbe) {
        let (transport, probe) = RecordingTransport::new("192.168.1.20:50123");
        let mut client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), Instant::now());
        client.mark_authenticated(AccessRights::FULL);
        client.enter_normal(width, height, &ScreenSet::single(width, height));
        (client, probe)
    }

    fn idle_ctx(pending: &Region) -> FrameContext<'_> {
        FrameContext {
            pending,
            rendered_cursor: None,
        }
    }

    #[test]
    fn test_access_rights_from_policy_drops_disabled_input() {
        let policy = SessionPolicy {
            accept_pointer_events: false,
            accept_cut_text: false,
            ..SessionPolicy::default()
        };

        let access = AccessRights::from_policy(&policy);

        assert!(access.contains(AccessRights::KEY_EVENTS));
        assert!(!access.contains(AccessRights::PTR_EVENTS));
        assert!(!access.contains(AccessRights::CUT_TEXT));
    }

    #[test]
    fn test_peer_host_strips_port_and_brackets() {
        let (transport, _) = RecordingTransport::new("[::1]:5901");
        let client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), Instant::now());
        assert_eq!(client.peer_host(), "::1");
    }

    #[test]
    fn test_lifecycle_reaches_normal_only_after_authentication() {
        // Arrange
        let (transport, _) = RecordingTransport::new("10.0.0.5:4000");
        let mut client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), Instant::now());

        // Act: init before auth is ignored
        client.enter_normal(100, 100, &ScreenSet::single(100, 100));
        assert_eq!(client.state(), ConnectionState::Authenticating);
        assert!(!client.is_authenticated());

        client.mark_authenticated(AccessRights::VIEW);
        client.enter_normal(100, 100, &ScreenSet::single(100, 100));

        // Assert
        assert_eq!(client.state(), ConnectionState::Normal);
        assert!(client.is_authenticated());
        assert_eq!(client.pending_updates(), Region::from_rect(Rect::new(0, 0, 100, 100)));
    }

    #[test]
    fn test_close_is_recorded_once_and_shuts_transport_down() {
        let (mut client, probe) = normal_client(64, 64);

        client.close("Server shutdown");
        client.close("Idle timeout");

        assert!(client.is_closing());
        assert!(!client.is_authenticated());
        assert_eq!(client.close_reason(), Some("Server shutdown"));
        assert_eq!(probe.shutdown_reason().as_deref(), Some("Server shutdown"));
    }

    #[test]
    fn test_update_only_sent_for_requested_area() {
        // Arrange
        let (mut client, probe) = normal_client(100, 100);
        let none = Region::new();

        // Act: nothing requested yet
        assert!(!client.write_framebuffer_update_or_close(&idle_ctx(&none)));
        client.request_update(Rect::new(0, 0, 50, 100), true);
        let sent = client.write_framebuffer_update_or_close(&idle_ctx(&none));

        // Assert
        assert!(sent);
        let update = probe.last_update().expect("an update should be written");
        assert_eq!(update.changed, Region::from_rect(Rect::new(0, 0, 50, 100)));
        assert_eq!(client.pending_updates(), Region::from_rect(Rect::new(50, 0, 100, 100)));
        assert!(client.requested_region().is_empty());
    }

    #[test]
    fn test_update_deferred_while_pending_damage_overlaps_request() {
        let (mut client, probe) = normal_client(100, 100);
        client.request_update(Rect::new(0, 0, 100, 100), true);
        let pending = Region::from_rect(Rect::new(10, 10, 20, 20));

        assert!(!client.write_framebuffer_update_or_close(&idle_ctx(&pending)));
        assert_eq!(probe.update_count(), 0);
        assert!(!client.requested_region().is_empty());
    }

    #[test]
    fn test_resize_closes_client_without_desktop_size_support() {
        // Arrange
        let (mut client, probe) = normal_client(100, 100);

        // Act
        client.pixel_buffer_change(200, 100, &ScreenSet::single(200, 100));

        // Assert
        assert!(client.is_closing());
        assert_eq!(probe.shutdown_reason().as_deref(), Some(REASON_NO_DESKTOP_RESIZE));
    }

    #[test]
    fn test_resize_notifies_client_with_desktop_size_support() {
        let (mut client, probe) = normal_client(100, 100);
        client.set_capabilities(ClientCapabilities {
            desktop_size: true,
            ..ClientCapabilities::default()
        });

        client.pixel_buffer_change(200, 150, &ScreenSet::single(200, 150));

        assert!(!client.is_closing());
        let log = probe.log();
        assert_eq!(log.desktop_sizes.len(), 1);
        assert_eq!(log.desktop_sizes[0].reason, LayoutChangeReason::Server);
        drop(log);
        assert_eq!(client.framebuffer_size(), (200, 150));
        assert_eq!(client.pending_updates(), Region::from_rect(Rect::new(0, 0, 200, 150)));
    }

    #[test]
    fn test_failed_write_closes_with_error_text() {
        let (mut client, probe) = normal_client(10, 10);
        probe.fail_writes(TransportError::Write("broken pipe".to_string()));

        client.bell_or_close();

        assert_eq!(client.close_reason(), Some("write failed: broken pipe"));
    }

    #[test]
    fn test_copy_with_source_outside_framebuffer_is_clipped() {
        let (mut client, _) = normal_client(100, 100);
        client.set_capabilities(ClientCapabilities {
            copy_rect: true,
            ..ClientCapabilities::default()
        });
        client.request_update(Rect::new(0, 0, 100, 100), true);
        client.write_framebuffer_update_or_close(&idle_ctx(&Region::new()));

        // Source of (0,0)-(20,20) shifted by (10,0) starts at x = -10
        client.add_copied(&Region::from_rect(Rect::new(0, 0, 20, 20)), Point::new(10, 0));

        assert_eq!(client.pending_updates(), Region::from_rect(Rect::new(10, 0, 20, 20)));
    }

    #[test]
    fn test_clipboard_needs_cut_text_access() {
        let (transport, probe) = RecordingTransport::new("10.0.0.9:1");
        let mut client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), Instant::now());
        client.mark_authenticated(AccessRights::VIEW);
        client.enter_normal(10, 10, &ScreenSet::single(10, 10));

        client.announce_clipboard_or_close(true);

        assert!(probe.log().clipboard_announces.is_empty());
    }

    #[test]
    fn test_idle_detection_uses_last_activity() {
        let start = Instant::now();
        let (transport, _) = RecordingTransport::new("10.0.0.9:1");
        let mut client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), start);
        let timeout = Duration::from_secs(30);

        client.touch(start + Duration::from_secs(20));

        assert!(!client.is_idle(start + Duration::from_secs(40), timeout));
        assert!(client.is_idle(start + Duration::from_secs(50), timeout));
    }
}
