//! The event loop that drives a [`VncServer`].
//!
//! # How the loop works (for beginners)
//!
//! Every session operation is synchronous and must never run concurrently
//! with another.  The reactor gets that for free by being a single task:
//!
//! ```text
//!   transport tasks ──ReactorEvent──► mpsc channel ──► run() ──► VncServer
//!                                                       ▲
//!                   backend poll interval ──────────────┤
//!                   next timer deadline  ───────────────┘
//! ```
//!
//! `tokio::select!` waits for whichever comes first: an event from the
//! channel, the backend poll tick, or the earliest deadline the server
//! reported.  After each wake-up the server's timers are checked, so frame
//! production and idle timeouts happen on time even without traffic.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::application::client_connection::ConnectionId;
use crate::application::desktop_session::SessionError;
use crate::application::server::{ClientMessage, ServerError, ShutdownReason, VncServer};
use crate::infrastructure::transport::ClientTransport;

/// How often backend events are drained.
pub const BACKEND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest sleep when no deadline is pending.
const IDLE_WAKEUP: Duration = Duration::from_secs(1);

/// Everything the transport side can tell the server.
pub enum ReactorEvent {
    Accepted {
        id: ConnectionId,
        transport: Box<dyn ClientTransport>,
    },
    Authenticated {
        id: ConnectionId,
        identity: String,
    },
    AuthenticationFailed {
        id: ConnectionId,
        reason: String,
    },
    ClientInit {
        id: ConnectionId,
        shared: bool,
    },
    Message {
        id: ConnectionId,
        message: ClientMessage,
    },
    /// The socket is fully shut down.
    Closed {
        id: ConnectionId,
    },
    Shutdown,
}

impl fmt::Debug for ReactorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted { id, transport } => f
                .debug_struct("Accepted")
                .field("id", id)
                .field("peer", &transport.peer_address())
                .finish(),
            Self::Authenticated { id, identity } => f
                .debug_struct("Authenticated")
                .field("id", id)
                .field("identity", identity)
                .finish(),
            Self::AuthenticationFailed { id, .. } => {
                f.debug_struct("AuthenticationFailed").field("id", id).finish()
            }
            Self::ClientInit { id, shared } => f
                .debug_struct("ClientInit")
                .field("id", id)
                .field("shared", shared)
                .finish(),
            Self::Message { id, message } => f
                .debug_struct("Message")
                .field("id", id)
                .field("message", message)
                .finish(),
            Self::Closed { id } => f.debug_struct("Closed").field("id", id).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A [`ReactorEvent::Shutdown`] arrived.
    Requested,
    /// Every sender was dropped.
    ChannelClosed,
    /// A process-wide timer expired.
    Timeout(ShutdownReason),
}

/// Drives `server` until shutdown.
///
/// Every session is torn down before returning.
///
/// # Errors
///
/// Returns an error only when the server reports a broken invariant that
/// cannot be contained to one client, such as a backend applying a layout
/// other than the one it accepted.
pub async fn run(
    mut server: VncServer,
    mut events: mpsc::Receiver<ReactorEvent>,
) -> anyhow::Result<ExitReason> {
    let mut poll = time::interval(BACKEND_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("reactor started");

    let exit = loop {
        let wake_at = server
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

        tokio::select! {
            event = events.recv() => match event {
                None => break ExitReason::ChannelClosed,
                Some(ReactorEvent::Shutdown) => break ExitReason::Requested,
                Some(event) => {
                    if let Err(err) = dispatch(&mut server, event) {
                        server.shutdown();
                        return Err(err);
                    }
                }
            },
            _ = poll.tick() => {
                server.process_backend_events();
            }
            _ = time::sleep_until(time::Instant::from_std(wake_at)) => {}
        }

        if let Some(reason) = server.handle_timeouts(Instant::now()) {
            break ExitReason::Timeout(reason);
        }
    };

    info!("reactor stopping: {exit:?}");
    server.shutdown();
    Ok(exit)
}

/// Applies one event.  Per-connection failures are logged and contained.
fn dispatch(server: &mut VncServer, event: ReactorEvent) -> anyhow::Result<()> {
    debug!("event: {event:?}");
    let now = Instant::now();
    let (id, result) = match event {
        ReactorEvent::Accepted { id, transport } => {
            server.add_socket(id, transport, now);
            (id, Ok(()))
        }
        ReactorEvent::Authenticated { id, identity } => (id, server.authenticated(id, &identity)),
        ReactorEvent::AuthenticationFailed { id, reason } => {
            server.authentication_failed(id, &reason);
            (id, Ok(()))
        }
        ReactorEvent::ClientInit { id, shared } => (id, server.client_init(id, shared).map(|_| ())),
        ReactorEvent::Message { id, message } => (id, server.handle_message(id, message, now)),
        ReactorEvent::Closed { id } => {
            server.remove_socket(id, now);
            (id, Ok(()))
        }
        ReactorEvent::Shutdown => return Ok(()),
    };

    match result {
        Ok(()) => Ok(()),
        Err(err @ ServerError::Session(SessionError::LayoutMismatch)) => {
            error!("{id}: {err}");
            Err(err).with_context(|| format!("while handling connection {id}"))
        }
        Err(err) => {
            warn!("{id}: {err}");
            Ok(())
        }
    }
}
