//! Application layer: the session core.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure value types in `rfb-core`) and the infrastructure (capture
//! backends, sockets, files).  Code here:
//!
//! - **Orchestrates** domain objects: regions, screen layouts, cursors.
//! - **Depends on traits** (`DesktopBackend`, `ClientTransport`) rather than
//!   concrete platform code, so every rule can be tested with recording
//!   doubles.
//! - **Performs no I/O** and never sleeps; time is passed in as `Instant`.
//!
//! # Sub-modules
//!
//! - **`change_tracker`** – accumulates changed and copied regions between
//!   frames, with an optional pixel comparison pass.
//! - **`timers`** / **`frame_clock`** – deadline timers and the frame-rate
//!   bounded clock that decides when damage is flushed.
//! - **`key_events`** – per-client keyboard normalisation.
//! - **`client_connection`** – one viewer's state machine and update queue.
//! - **`desktop_session`** – one shared desktop and its joined clients.
//! - **`session_registry`** – identity to session mapping.
//! - **`blacklist`** – lockout after repeated authentication failures.
//! - **`server`** – the multi-session front door and process-wide timers.
//! - **`policy`** – the settings every session is built with.

pub mod blacklist;
pub mod change_tracker;
pub mod client_connection;
pub mod desktop_session;
pub mod frame_clock;
pub mod key_events;
pub mod policy;
pub mod server;
pub mod session_registry;
pub mod timers;
