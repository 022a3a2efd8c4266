//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the TOML server configuration
//! and turns it into the `SessionPolicy` the application layer consumes.
//! Sessions never see the file format.

pub mod config;
