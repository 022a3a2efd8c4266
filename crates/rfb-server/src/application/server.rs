//! VncServer: the front door shared by every desktop session.
//!
//! The server sees each connection from accept to close.  Until a connection
//! has authenticated *and* sent its init message it is "pending" and lives
//! here; after that it belongs to the desktop session of its identity and
//! the server only remembers which session to route its messages to.
//!
//! # Connection journey (for beginners)
//!
//! ```text
//!  add_socket ──► authenticated ──► client_init ──► (messages) ──► remove_socket
//!      │               │                 │
//!   pending         pending +          joined to
//!                   routed             the session
//! ```
//!
//! The server also owns the three process-wide deadline timers: terminate
//! after too long without input (`max_idle_time`), too long without any
//! connection (`max_disconnection_time`), or too long after the first
//! connection (`max_connection_time`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rfb_core::{Point, Rect, ScreenSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::blacklist::Blacklist;
use super::client_connection::{
    AccessRights, ClientCapabilities, ClientConnection, ConnectionId, REASON_IDLE_TIMEOUT,
};
use super::desktop_session::{Admission, SessionError, REASON_SERVER_SHUTDOWN};
use super::policy::SessionPolicy;
use super::session_registry::{lock_session, SessionHandle, SessionRegistry};
use super::timers::DeadlineTimer;
use crate::infrastructure::transport::ClientTransport;

pub const REASON_BLACKLISTED: &str = "Too many security failures";
/// Sent when authentication succeeds but the desktop is never shared and
/// already has a viewer.  A refused init message uses
/// [`REASON_IN_USE`](super::desktop_session::REASON_IN_USE) instead.
pub const REASON_ALREADY_IN_USE: &str = "The server is already in use";

/// Unauthenticated connections get at least this long before timing out.
pub const PENDING_CLIENT_MIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Why the server asks to be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    MaxIdleTime,
    MaxDisconnectionTime,
    MaxConnectionTime,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MaxIdleTime => "MaxIdleTime",
            Self::MaxDisconnectionTime => "MaxDisconnectionTime",
            Self::MaxConnectionTime => "MaxConnectionTime",
        };
        write!(f, "{name} reached, exiting")
    }
}

/// A decoded message from a connected viewer.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    SetCapabilities(ClientCapabilities),
    UpdateRequest { rect: Rect, incremental: bool },
    Pointer { pos: Point, button_mask: u8 },
    Key { keysym: u32, keycode: u32, down: bool },
    SetDesktopSize { width: u32, height: u32, layout: ScreenSet },
    ClipboardRequest,
    ClipboardAnnounce(bool),
    ClipboardData(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} has not authenticated")]
    NotAuthenticated(ConnectionId),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct VncServer {
    policy: SessionPolicy,
    registry: SessionRegistry,
    /// Connections not yet joined to a session.
    pending: HashMap<ConnectionId, ClientConnection>,
    /// Session of every authenticated connection, joined or not.
    routes: HashMap<ConnectionId, SessionHandle>,
    blacklist: Blacklist,
    idle_timer: DeadlineTimer,
    disconnect_timer: DeadlineTimer,
    connect_timer: DeadlineTimer,
}

impl VncServer {
    pub fn new(registry: SessionRegistry, now: Instant) -> Self {
        let policy = registry.policy().clone();
        let mut server = Self {
            policy,
            registry,
            pending: HashMap::new(),
            routes: HashMap::new(),
            blacklist: Blacklist::default(),
            idle_timer: DeadlineTimer::new(),
            disconnect_timer: DeadlineTimer::new(),
            connect_timer: DeadlineTimer::new(),
        };
        if let Some(limit) = server.policy.max_idle_time {
            server.idle_timer.start(now, limit);
        }
        if let Some(limit) = server.policy.max_disconnection_time {
            server.disconnect_timer.start(now, limit);
        }
        server
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Every open connection, pending or joined.
    pub fn connection_count(&self) -> usize {
        let joined = self
            .routes
            .keys()
            .filter(|id| !self.pending.contains_key(id))
            .count();
        self.pending.len() + joined
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.contains_key(&id)
    }

    /// The session an authenticated connection is routed to.
    pub fn session_for(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.routes.get(&id).cloned()
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Takes ownership of a freshly accepted connection.
    ///
    /// Returns `false` if the peer is blacklisted; its transport has then
    /// already been asked to shut down.
    pub fn add_socket(
        &mut self,
        id: ConnectionId,
        transport: Box<dyn ClientTransport>,
        now: Instant,
    ) -> bool {
        let mut client = ClientConnection::new(id, transport, now);
        if self.blacklist.is_blackmarked(client.peer_host(), now) {
            error!("blacklisted: {}", client.peer());
            client.close(REASON_BLACKLISTED);
            return false;
        }

        info!("accepted: {}", client.peer());
        if self.connection_count() == 0 {
            if let Some(limit) = self.policy.max_connection_time {
                self.connect_timer.start(now, limit);
            }
        }
        self.disconnect_timer.stop();
        self.pending.insert(id, client);
        true
    }

    /// The connection proved it may act as `identity`.
    ///
    /// Resolves and starts that identity's desktop.  Failures close the
    /// connection with the error text and are returned.
    pub fn authenticated(&mut self, id: ConnectionId, identity: &str) -> Result<(), ServerError> {
        let host = self
            .pending
            .get(&id)
            .ok_or(ServerError::UnknownConnection(id))?
            .peer_host()
            .to_string();
        self.blacklist.clear_blackmark(&host);

        let resolved = self.registry.get_or_create(identity).and_then(|handle| {
            let mut session = lock_session(&handle);
            session.start_desktop()?;
            let in_use = self.policy.never_shared
                && !self.policy.disconnect_clients
                && session.auth_client_count() > 0;
            drop(session);
            Ok((handle, in_use))
        });

        let Some(client) = self.pending.get_mut(&id) else {
            return Err(ServerError::UnknownConnection(id));
        };
        match resolved {
            Ok((_, true)) => {
                client.close(REASON_ALREADY_IN_USE);
                Ok(())
            }
            Ok((handle, false)) => {
                client.mark_authenticated(AccessRights::from_policy(&self.policy));
                self.routes.insert(id, handle);
                Ok(())
            }
            Err(err) => {
                client.close(&err.to_string());
                Err(err.into())
            }
        }
    }

    /// The connection failed to authenticate.
    pub fn authentication_failed(&mut self, id: ConnectionId, reason: &str) {
        let Some(client) = self.pending.get_mut(&id) else {
            return;
        };
        self.blacklist.add_blackmark(client.peer_host());
        client.close(reason);
    }

    /// The viewer sent its init message: join it to its session.
    ///
    /// Returns `false` if the session refused it; the connection is then
    /// closing and stays here until its socket goes away.
    pub fn client_init(&mut self, id: ConnectionId, shared: bool) -> Result<bool, ServerError> {
        let handle = self
            .routes
            .get(&id)
            .cloned()
            .ok_or(ServerError::NotAuthenticated(id))?;
        let client = self
            .pending
            .remove(&id)
            .ok_or(ServerError::UnknownConnection(id))?;

        let mut shared = shared || self.policy.always_shared;
        if !client.has_access(AccessRights::NON_SHARED) {
            shared = true;
        }
        if self.policy.never_shared {
            shared = false;
        }

        let admission = lock_session(&handle).client_ready(client, shared);
        match admission {
            Admission::Joined => Ok(true),
            Admission::Refused(client) => {
                self.routes.remove(&id);
                self.pending.insert(id, client);
                Ok(false)
            }
        }
    }

    /// The transport confirmed the socket is gone.
    ///
    /// Returns `false` for connections that were never tracked, such as a
    /// refused blacklisted peer.
    pub fn remove_socket(&mut self, id: ConnectionId, now: Instant) -> bool {
        let mut client = None;
        if let Some(handle) = self.routes.remove(&id) {
            let waiting = self.awaiting_init(&handle);
            let mut session = lock_session(&handle);
            client = session.remove_client(id);
            if session.auth_client_count() == 0 && waiting == 0 {
                session.stop_desktop();
            }
        }
        if let Some(pending) = self.pending.remove(&id) {
            client = Some(pending);
        }
        let Some(client) = client else {
            return false;
        };
        info!("closed: {}", client.peer());

        if self.connection_count() == 0 {
            self.connect_timer.stop();
            if let Some(limit) = self.policy.max_disconnection_time {
                self.disconnect_timer.start(now, limit);
            }
        }
        true
    }

    /// Authenticated connections routed to `handle` that have not sent
    /// their init message yet.
    fn awaiting_init(&self, handle: &SessionHandle) -> usize {
        self.routes
            .iter()
            .filter(|(_, routed)| Arc::ptr_eq(routed, handle))
            .filter(|(id, _)| self.pending.get(id).is_some_and(|c| !c.is_closing()))
            .count()
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Routes one viewer message to its session.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotAuthenticated`] for connections without a session,
    /// [`ServerError::Session`] for invariant violations reported by the
    /// session (e.g. a backend that applied a different layout).
    pub fn handle_message(
        &mut self,
        id: ConnectionId,
        message: ClientMessage,
        now: Instant,
    ) -> Result<(), ServerError> {
        let handle = self
            .routes
            .get(&id)
            .cloned()
            .ok_or(ServerError::NotAuthenticated(id))?;
        let mut session = lock_session(&handle);
        session.touch_client(id, now);

        match message {
            ClientMessage::SetCapabilities(caps) => session.set_client_capabilities(id, caps),
            ClientMessage::UpdateRequest { rect, incremental } => {
                session.request_update(id, rect, incremental)
            }
            ClientMessage::Pointer { pos, button_mask } => {
                self.note_user_input(now);
                session.pointer_event(id, pos, button_mask);
            }
            ClientMessage::Key {
                keysym,
                keycode,
                down,
            } => {
                self.note_user_input(now);
                session.client_key_event(id, keysym, keycode, down);
            }
            ClientMessage::SetDesktopSize {
                width,
                height,
                layout,
            } => {
                let result = session.request_desktop_size(id, width, height, layout)?;
                debug!("{id}: desktop size request answered with {result:?}");
            }
            ClientMessage::ClipboardRequest => session.handle_clipboard_request(id),
            ClientMessage::ClipboardAnnounce(available) => {
                session.handle_clipboard_announce(id, available)
            }
            ClientMessage::ClipboardData(data) => session.handle_clipboard_data(id, &data),
        }
        Ok(())
    }

    fn note_user_input(&mut self, now: Instant) {
        if let Some(limit) = self.policy.max_idle_time {
            self.idle_timer.start(now, limit);
        }
    }

    // ── Backend events and timers ─────────────────────────────────────────────

    /// Drains backend events of every session.  Returns how many were applied.
    pub fn process_backend_events(&mut self) -> usize {
        let mut applied = 0;
        for handle in self.registry.sessions() {
            let mut session = lock_session(&handle);
            match session.process_backend_events() {
                Ok(count) => applied += count,
                Err(err) => warn!("{}: {err}", session.identity()),
            }
        }
        applied
    }

    /// Fires everything due at `now`.
    ///
    /// Returns the reason to terminate if a process-wide timer expired.
    pub fn handle_timeouts(&mut self, now: Instant) -> Option<ShutdownReason> {
        for handle in self.registry.sessions() {
            let mut session = lock_session(&handle);
            session.handle_frame_timer(now);
            if let Some(timeout) = self.policy.idle_timeout {
                session.close_idle_clients(now, timeout);
            }
        }

        if let Some(timeout) = self.pending_timeout() {
            for client in self.pending.values_mut() {
                if !client.is_closing() && client.is_idle(now, timeout) {
                    client.close(REASON_IDLE_TIMEOUT);
                }
            }
        }

        let expired = [
            (&mut self.idle_timer, ShutdownReason::MaxIdleTime),
            (&mut self.disconnect_timer, ShutdownReason::MaxDisconnectionTime),
            (&mut self.connect_timer, ShutdownReason::MaxConnectionTime),
        ]
        .into_iter()
        .find_map(|(timer, reason)| {
            timer.is_expired(now).then(|| {
                timer.stop();
                reason
            })
        });
        if let Some(reason) = expired {
            info!("{reason}");
        }
        expired
    }

    /// The earliest instant at which [`VncServer::handle_timeouts`] has
    /// something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines: Vec<Instant> = [
            self.idle_timer.deadline(),
            self.disconnect_timer.deadline(),
            self.connect_timer.deadline(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for handle in self.registry.sessions() {
            let session = lock_session(&handle);
            deadlines.extend(session.next_deadline());
            if let Some(timeout) = self.policy.idle_timeout {
                deadlines.extend(session.next_client_idle_deadline(timeout));
            }
        }
        if let Some(timeout) = self.pending_timeout() {
            deadlines.extend(
                self.pending
                    .values()
                    .filter(|c| !c.is_closing())
                    .map(|c| c.idle_deadline(timeout)),
            );
        }
        deadlines.into_iter().min()
    }

    fn pending_timeout(&self) -> Option<Duration> {
        self.policy
            .idle_timeout
            .map(|timeout| timeout.max(PENDING_CLIENT_MIN_TIMEOUT))
    }

    /// Closes every connection and tears down every session.
    pub fn shutdown(&mut self) {
        for client in self.pending.values_mut() {
            client.close(REASON_SERVER_SHUTDOWN);
        }
        self.pending.clear();
        self.routes.clear();
        self.registry.shutdown_all();
        self.idle_timer.stop();
        self.disconnect_timer.stop();
        self.connect_timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::backend::mock::{BackendProbe, RecordingBackend};
    use crate::infrastructure::backend::{BackendError, DesktopBackend};
    use crate::infrastructure::transport::mock::{RecordingTransport, TransportProbe};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    type Probes = Arc<Mutex<HashMap<String, BackendProbe>>>;

    fn server(policy: SessionPolicy, now: Instant) -> (VncServer, Probes) {
        let probes: Probes = Arc::default();
        let recorded = Arc::clone(&probes);
        let factory = move |identity: &str| -> Result<Box<dyn DesktopBackend>, BackendError> {
            let (backend, probe) = RecordingBackend::new(64, 64);
            recorded.lock().unwrap().insert(identity.to_string(), probe);
            Ok(Box::new(backend))
        };
        let registry = SessionRegistry::new(Box::new(factory), policy);
        (VncServer::new(registry, now), probes)
    }

    fn connect(server: &mut VncServer, peer: &str, now: Instant) -> (ConnectionId, TransportProbe) {
        let (transport, probe) = RecordingTransport::new(peer);
        let id = Uuid::new_v4();
        assert!(server.add_socket(id, Box::new(transport), now));
        (id, probe)
    }

    fn join(server: &mut VncServer, identity: &str, now: Instant) -> (ConnectionId, TransportProbe) {
        let (id, probe) = connect(server, "10.0.0.1:40000", now);
        server.authenticated(id, identity).expect("authenticate");
        assert!(server.client_init(id, true).expect("init"));
        (id, probe)
    }

    #[test]
    fn test_authenticated_client_joins_started_desktop() {
        // Arrange
        let now = Instant::now();
        let (mut server, probes) = server(SessionPolicy::default(), now);

        // Act
        let (id, _) = join(&mut server, "alice", now);

        // Assert
        let handle = server.session_for(id).expect("routed");
        let session = lock_session(&handle);
        assert!(session.is_started());
        assert_eq!(session.clients().len(), 1);
        assert!(!server.is_pending(id));
        assert_eq!(probes.lock().unwrap()["alice"].start_count(), 1);
    }

    #[test]
    fn test_message_before_authentication_is_rejected() {
        let now = Instant::now();
        let (mut server, _) = server(SessionPolicy::default(), now);
        let (id, _) = connect(&mut server, "10.0.0.1:40000", now);

        let result = server.handle_message(id, ClientMessage::ClipboardRequest, now);

        assert!(matches!(result, Err(ServerError::NotAuthenticated(_))));
    }

    #[test]
    fn test_repeated_failures_blacklist_the_host() {
        // Arrange
        let now = Instant::now();
        let (mut server, _) = server(SessionPolicy::default(), now);
        for _ in 0..5 {
            let (id, _) = connect(&mut server, "10.9.9.9:1234", now);
            server.authentication_failed(id, "Authentication failure");
            server.remove_socket(id, now);
        }

        // Act
        let (transport, probe) = RecordingTransport::new("10.9.9.9:1235");
        let accepted = server.add_socket(Uuid::new_v4(), Box::new(transport), now);

        // Assert
        assert!(!accepted);
        assert_eq!(probe.shutdown_reason().as_deref(), Some(REASON_BLACKLISTED));
    }

    #[test]
    fn test_never_shared_refuses_second_authentication() {
        let now = Instant::now();
        let policy = SessionPolicy {
            never_shared: true,
            disconnect_clients: false,
            ..SessionPolicy::default()
        };
        let (mut server, _) = server(policy, now);
        join(&mut server, "alice", now);
        let (second, probe) = connect(&mut server, "10.0.0.2:40000", now);

        server.authenticated(second, "alice").expect("resolves");

        assert_eq!(probe.shutdown_reason().as_deref(), Some("The server is already in use"));
        assert!(server.session_for(second).is_none());
    }

    #[test]
    fn test_last_client_leaving_stops_desktop_and_arms_disconnect_timer() {
        // Arrange
        let now = Instant::now();
        let policy = SessionPolicy {
            max_disconnection_time: Some(Duration::from_secs(30)),
            ..SessionPolicy::default()
        };
        let (mut server, probes) = server(policy, now);
        let (id, _) = join(&mut server, "alice", now);
        assert_eq!(server.next_deadline().filter(|d| *d > now + Duration::from_secs(1)), None);

        // Act
        let later = now + Duration::from_secs(5);
        assert!(server.remove_socket(id, later));

        // Assert
        assert_eq!(probes.lock().unwrap()["alice"].stop_count(), 1);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.next_deadline(), Some(later + Duration::from_secs(30)));
        assert_eq!(
            server.handle_timeouts(later + Duration::from_secs(30)),
            Some(ShutdownReason::MaxDisconnectionTime)
        );
    }

    #[test]
    fn test_max_connection_time_counts_from_first_connection() {
        let now = Instant::now();
        let policy = SessionPolicy {
            max_connection_time: Some(Duration::from_secs(60)),
            ..SessionPolicy::default()
        };
        let (mut server, _) = server(policy, now);
        connect(&mut server, "10.0.0.1:40000", now);
        connect(&mut server, "10.0.0.2:40000", now + Duration::from_secs(10));

        assert_eq!(server.handle_timeouts(now + Duration::from_secs(59)), None);
        assert_eq!(
            server.handle_timeouts(now + Duration::from_secs(60)),
            Some(ShutdownReason::MaxConnectionTime)
        );
    }

    #[test]
    fn test_user_input_restarts_max_idle_timer() {
        // Arrange
        let now = Instant::now();
        let policy = SessionPolicy {
            max_idle_time: Some(Duration::from_secs(20)),
            ..SessionPolicy::default()
        };
        let (mut server, _) = server(policy, now);
        let (id, _) = join(&mut server, "alice", now);

        // Act
        let input_at = now + Duration::from_secs(15);
        let message = ClientMessage::Pointer {
            pos: Point::new(1, 1),
            button_mask: 0,
        };
        server.handle_message(id, message, input_at).expect("routed");

        // Assert
        assert_eq!(server.handle_timeouts(now + Duration::from_secs(20)), None);
        assert_eq!(
            server.handle_timeouts(input_at + Duration::from_secs(20)),
            Some(ShutdownReason::MaxIdleTime)
        );
    }

    #[test]
    fn test_pending_client_gets_minimum_idle_timeout() {
        let now = Instant::now();
        let policy = SessionPolicy {
            idle_timeout: Some(Duration::from_secs(5)),
            ..SessionPolicy::default()
        };
        let (mut server, _) = server(policy, now);
        let (_, probe) = connect(&mut server, "10.0.0.1:40000", now);

        server.handle_timeouts(now + Duration::from_secs(10));
        assert!(!probe.is_shut_down());

        server.handle_timeouts(now + PENDING_CLIENT_MIN_TIMEOUT);
        assert_eq!(probe.shutdown_reason().as_deref(), Some(REASON_IDLE_TIMEOUT));
    }

    #[test]
    fn test_shutdown_closes_pending_and_joined_connections() {
        let now = Instant::now();
        let (mut server, _) = server(SessionPolicy::default(), now);
        let (_, joined) = join(&mut server, "alice", now);
        let (_, pending) = connect(&mut server, "10.0.0.3:40000", now);

        server.shutdown();

        assert_eq!(joined.shutdown_reason().as_deref(), Some(REASON_SERVER_SHUTDOWN));
        assert_eq!(pending.shutdown_reason().as_deref(), Some(REASON_SERVER_SHUTDOWN));
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_shutdown_reason_display_matches_log_text() {
        assert_eq!(
            ShutdownReason::MaxIdleTime.to_string(),
            "MaxIdleTime reached, exiting"
        );
    }
}
