//! Integration tests for the server front door.
//!
//! Each test plays whole connection journeys through `VncServer`: accept,
//! authenticate, init, messages, backend events, timers and close, checking
//! what the recording transports and backends observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rfb_core::{KeyRemapper, Point, Rect, Region, Screen, ScreenSet};
use rfb_server::application::client_connection::ConnectionId;
use rfb_server::application::desktop_session::SessionError;
use rfb_server::application::policy::SessionPolicy;
use rfb_server::application::server::{ClientMessage, ServerError, ShutdownReason, VncServer};
use rfb_server::application::session_registry::{lock_session, SessionRegistry};
use rfb_server::infrastructure::backend::mock::{BackendProbe, RecordingBackend, ResizeBehaviour};
use rfb_server::infrastructure::backend::{BackendError, BackendEvent, DesktopBackend};
use rfb_server::infrastructure::transport::mock::{RecordingTransport, TransportProbe};
use uuid::Uuid;

type Probes = Arc<Mutex<HashMap<String, BackendProbe>>>;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Harness {
    server: VncServer,
    backends: Probes,
    t0: Instant,
}

impl Harness {
    fn new(policy: SessionPolicy) -> Self {
        let backends: Probes = Arc::default();
        let recorded = Arc::clone(&backends);
        let factory = move |identity: &str| -> Result<Box<dyn DesktopBackend>, BackendError> {
            let (backend, probe) = RecordingBackend::new(320, 200);
            recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(identity.to_string(), probe);
            Ok(Box::new(backend))
        };
        let t0 = Instant::now();
        let server = VncServer::new(SessionRegistry::new(Box::new(factory), policy), t0);
        Self {
            server,
            backends,
            t0,
        }
    }

    fn at(&self, secs: u64) -> Instant {
        self.t0 + Duration::from_secs(secs)
    }

    fn backend(&self, identity: &str) -> BackendProbe {
        self.backends.lock().unwrap_or_else(PoisonError::into_inner)[identity].clone()
    }

    fn accept(&mut self, peer: &str) -> (ConnectionId, TransportProbe) {
        let (transport, probe) = RecordingTransport::new(peer);
        let id = Uuid::new_v4();
        assert!(self.server.add_socket(id, Box::new(transport), self.t0));
        (id, probe)
    }

    /// Accepts, authenticates and joins a client, then syncs it with one
    /// full update and leaves an incremental request outstanding.
    fn join(&mut self, identity: &str, peer: &str) -> (ConnectionId, TransportProbe) {
        let (id, probe) = self.accept(peer);
        self.server.authenticated(id, identity).expect("authenticate");
        assert!(self.server.client_init(id, true).expect("init"));
        let full = Rect::from_size(0, 0, 320, 200);
        self.send(id, ClientMessage::UpdateRequest { rect: full, incremental: false });
        self.send(id, ClientMessage::UpdateRequest { rect: full, incremental: true });
        (id, probe)
    }

    fn send(&mut self, id: ConnectionId, message: ClientMessage) {
        let now = self.t0;
        self.server.handle_message(id, message, now).expect("message accepted");
    }
}

// ── Session routing ───────────────────────────────────────────────────────────

#[test]
fn test_identities_get_isolated_desktops() {
    // Arrange
    let mut h = Harness::new(SessionPolicy::default());
    let (_, alice) = h.join("alice", "10.0.0.1:40001");
    let (_, bob) = h.join("bob", "10.0.0.2:40002");
    let damage = Rect::from_size(0, 0, 16, 16);
    h.backend("alice").push_event(BackendEvent::Damage(Region::from_rect(damage)));

    // Act
    let applied = h.server.process_backend_events();
    h.server.handle_timeouts(h.at(1));

    // Assert
    assert_eq!(applied, 1);
    assert_eq!(h.server.registry().len(), 2);
    assert_eq!(alice.update_count(), 2);
    assert_eq!(alice.last_update().map(|u| u.changed), Some(Region::from_rect(damage)));
    assert_eq!(bob.update_count(), 1);
}

#[test]
fn test_same_identity_shares_one_desktop() {
    let mut h = Harness::new(SessionPolicy::default());
    let (a, _) = h.join("alice", "10.0.0.1:40001");
    let (b, _) = h.join("alice", "10.0.0.3:40003");

    let session_a = h.server.session_for(a).expect("routed");
    let session_b = h.server.session_for(b).expect("routed");

    assert!(Arc::ptr_eq(&session_a, &session_b));
    assert_eq!(lock_session(&session_a).clients().len(), 2);
    assert_eq!(h.backend("alice").start_count(), 1);
}

// ── Input arbitration ─────────────────────────────────────────────────────────

#[test]
fn test_pointer_drag_from_one_viewer_blocks_the_other() {
    // Arrange
    let mut h = Harness::new(SessionPolicy::default());
    let (a, _) = h.join("alice", "10.0.0.1:40001");
    let (b, _) = h.join("alice", "10.0.0.3:40003");

    // Act
    h.send(a, ClientMessage::Pointer { pos: Point::new(5, 5), button_mask: 1 });
    h.send(b, ClientMessage::Pointer { pos: Point::new(50, 50), button_mask: 0 });
    h.send(a, ClientMessage::Pointer { pos: Point::new(6, 6), button_mask: 0 });
    h.send(b, ClientMessage::Pointer { pos: Point::new(51, 51), button_mask: 0 });

    // Assert
    let positions: Vec<Point> = h.backend("alice").log().pointer.iter().map(|(p, _)| *p).collect();
    assert_eq!(positions, vec![Point::new(5, 5), Point::new(6, 6), Point::new(51, 51)]);
}

#[test]
fn test_key_events_are_remapped_before_reaching_backend() {
    let remapper = KeyRemapper::parse("0x22->0x40").expect("valid mapping");
    let mut h = Harness::new(SessionPolicy {
        key_remapper: remapper,
        ..SessionPolicy::default()
    });
    let (id, _) = h.join("alice", "10.0.0.1:40001");

    h.send(id, ClientMessage::Key { keysym: 0x22, keycode: 0, down: true });
    h.send(id, ClientMessage::Key { keysym: 0x22, keycode: 0, down: false });

    assert_eq!(h.backend("alice").log().keys, vec![(0x40, 0, true), (0x40, 0, false)]);
}

#[test]
fn test_input_is_dropped_when_policy_disables_it() {
    let mut h = Harness::new(SessionPolicy {
        accept_pointer_events: false,
        accept_key_events: false,
        ..SessionPolicy::default()
    });
    let (id, _) = h.join("alice", "10.0.0.1:40001");

    h.send(id, ClientMessage::Pointer { pos: Point::new(1, 1), button_mask: 1 });
    h.send(id, ClientMessage::Key { keysym: 0x61, keycode: 0, down: true });

    let backend = h.backend("alice");
    assert!(backend.log().pointer.is_empty());
    assert!(backend.log().keys.is_empty());
}

// ── Clipboard ─────────────────────────────────────────────────────────────────

#[test]
fn test_desktop_clipboard_reaches_every_requesting_viewer() {
    // Arrange
    let mut h = Harness::new(SessionPolicy::default());
    let (a, probe_a) = h.join("alice", "10.0.0.1:40001");
    let (b, probe_b) = h.join("alice", "10.0.0.3:40003");
    h.send(a, ClientMessage::ClipboardRequest);
    h.send(b, ClientMessage::ClipboardRequest);

    // Act
    h.backend("alice")
        .push_event(BackendEvent::ClipboardData("copied text".to_string()));
    h.server.process_backend_events();

    // Assert
    assert_eq!(h.backend("alice").log().clipboard_requests, 1);
    assert_eq!(probe_a.log().clipboard_data, vec!["copied text".to_string()]);
    assert_eq!(probe_b.log().clipboard_data, vec!["copied text".to_string()]);
}

#[test]
fn test_viewer_clipboard_flows_to_backend_after_announce() {
    let mut h = Harness::new(SessionPolicy::default());
    let (id, _) = h.join("alice", "10.0.0.1:40001");

    h.send(id, ClientMessage::ClipboardAnnounce(true));
    h.send(id, ClientMessage::ClipboardData("from viewer".to_string()));

    let backend = h.backend("alice");
    assert_eq!(backend.log().clipboard_announces, vec![true]);
    assert_eq!(backend.log().clipboard_data, vec!["from viewer".to_string()]);
}

// ── Desktop size ──────────────────────────────────────────────────────────────

#[test]
fn test_backend_applying_other_layout_is_reported_as_error() {
    // Arrange
    let mut h = Harness::new(SessionPolicy::default());
    let (id, _) = h.join("alice", "10.0.0.1:40001");
    h.backend("alice")
        .set_resize_behaviour(ResizeBehaviour::Substitute(ScreenSet::single(160, 200)));
    let mut requested = ScreenSet::new();
    requested.add_screen(Screen::new(0, 0, 0, 320, 200, 0));

    // Act
    let result = h.server.handle_message(
        id,
        ClientMessage::SetDesktopSize {
            width: 320,
            height: 200,
            layout: requested,
        },
        h.t0,
    );

    // Assert
    assert!(matches!(
        result,
        Err(ServerError::Session(SessionError::LayoutMismatch))
    ));
}

// ── Timers ────────────────────────────────────────────────────────────────────

#[test]
fn test_disconnect_timer_restarts_after_every_last_disconnect() {
    // Arrange
    let mut h = Harness::new(SessionPolicy {
        max_disconnection_time: Some(Duration::from_secs(30)),
        ..SessionPolicy::default()
    });
    let (id, _) = h.join("alice", "10.0.0.1:40001");

    // Act / Assert
    assert_eq!(h.server.handle_timeouts(h.at(40)), None);
    assert!(h.server.remove_socket(id, h.at(50)));
    assert_eq!(h.server.handle_timeouts(h.at(79)), None);
    assert_eq!(
        h.server.handle_timeouts(h.at(80)),
        Some(ShutdownReason::MaxDisconnectionTime)
    );
}

#[test]
fn test_idle_viewer_is_closed_but_active_viewer_stays() {
    let mut h = Harness::new(SessionPolicy {
        idle_timeout: Some(Duration::from_secs(60)),
        ..SessionPolicy::default()
    });
    let (idle, idle_probe) = h.join("alice", "10.0.0.1:40001");
    let (active, active_probe) = h.join("alice", "10.0.0.3:40003");
    h.server
        .handle_message(
            active,
            ClientMessage::Pointer { pos: Point::new(1, 1), button_mask: 0 },
            h.at(30),
        )
        .expect("pointer");

    h.server.handle_timeouts(h.at(60));

    assert_eq!(idle_probe.shutdown_reason().as_deref(), Some("Idle timeout"));
    assert!(!active_probe.is_shut_down());
    assert!(h.server.session_for(idle).is_some());
}

#[test]
fn test_rejoining_after_last_leave_restarts_desktop() {
    let mut h = Harness::new(SessionPolicy::default());
    let (first, _) = h.join("alice", "10.0.0.1:40001");
    h.server.remove_socket(first, h.at(1));

    let (second, _) = h.join("alice", "10.0.0.1:40005");

    let backend = h.backend("alice");
    assert_eq!(backend.start_count(), 2);
    assert_eq!(backend.stop_count(), 1);
    let handle = h.server.session_for(second).expect("routed");
    assert!(lock_session(&handle).is_started());
}

#[test]
fn test_leaving_keeps_desktop_for_viewer_still_initialising() {
    // Arrange: a second viewer authenticates but has not sent its init yet
    let mut h = Harness::new(SessionPolicy::default());
    let (first, _) = h.join("alice", "10.0.0.1:40001");
    let (second, _) = h.accept("10.0.0.3:40003");
    h.server.authenticated(second, "alice").expect("authenticate");

    // Act
    assert!(h.server.remove_socket(first, h.at(1)));
    let joined = h.server.client_init(second, true).expect("init");

    // Assert
    assert!(joined);
    assert_eq!(h.backend("alice").stop_count(), 0);
    let handle = h.server.session_for(second).expect("routed");
    let session = lock_session(&handle);
    assert!(session.is_started());
    assert_eq!(session.framebuffer_size(), Some((320, 200)));
    assert_eq!(session.client(second).map(|c| c.framebuffer_size()), Some((320, 200)));
}

#[test]
fn test_refused_viewer_does_not_hold_desktop_open() {
    let mut h = Harness::new(SessionPolicy::default());
    let (first, _) = h.join("alice", "10.0.0.1:40001");
    let (second, _) = h.accept("10.0.0.3:40003");
    h.server.authenticated(second, "alice").expect("authenticate");
    h.server.authentication_failed(second, "Authentication failure");

    h.server.remove_socket(first, h.at(1));

    assert_eq!(h.backend("alice").stop_count(), 1);
}
