//! Infrastructure layer for the session core.
//!
//! Contains the seams to the outside world: the capture backend and client
//! transport traits (with recording doubles), TOML configuration, logging
//! set-up and the tokio event loop.
//!
//! **Dependency rule**: the application layer talks to backends and
//! transports only through the traits defined here; nothing in this layer
//! reaches into session internals.

pub mod backend;
pub mod logging;
pub mod reactor;
pub mod storage;
pub mod transport;
