//! Recording transport for tests.
//!
//! The transport is moved into its `ClientConnection`, so the recorded log
//! lives behind an `Arc<Mutex<_>>` that a [`TransportProbe`] keeps a handle
//! to.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rfb_core::Cursor;

use super::{ClientTransport, DesktopSizeNotice, FramebufferUpdate, TransportError};

/// Every message written to one [`RecordingTransport`].
#[derive(Debug, Default)]
pub struct TransportLog {
    pub updates: Vec<FramebufferUpdate>,
    pub desktop_sizes: Vec<DesktopSizeNotice>,
    pub cursors: Vec<Cursor>,
    pub led_states: Vec<u32>,
    pub bells: usize,
    pub names: Vec<String>,
    pub clipboard_announces: Vec<bool>,
    pub clipboard_requests: usize,
    pub clipboard_data: Vec<String>,
    /// Reason passed to the first `shutdown` call.
    pub shutdown_reason: Option<String>,
    /// When set, every write fails with this error.
    pub fail_writes: Option<TransportError>,
}

/// A [`ClientTransport`] that records instead of sending.
pub struct RecordingTransport {
    peer: String,
    log: Arc<Mutex<TransportLog>>,
}

/// Read access to a [`RecordingTransport`]'s log after it has been moved.
#[derive(Clone)]
pub struct TransportProbe {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    /// Creates a transport for `peer` and the probe observing it.
    pub fn new(peer: &str) -> (Self, TransportProbe) {
        let log = Arc::new(Mutex::new(TransportLog::default()));
        let transport = Self {
            peer: peer.to_string(),
            log: Arc::clone(&log),
        };
        (transport, TransportProbe { log })
    }

    fn record(&self, write: impl FnOnce(&mut TransportLog)) -> Result<(), TransportError> {
        let mut log = lock(&self.log);
        if let Some(err) = log.fail_writes.clone() {
            return Err(err);
        }
        write(&mut log);
        Ok(())
    }
}

impl TransportProbe {
    pub fn log(&self) -> MutexGuard<'_, TransportLog> {
        lock(&self.log)
    }

    pub fn is_shut_down(&self) -> bool {
        self.log().shutdown_reason.is_some()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.log().shutdown_reason.clone()
    }

    pub fn update_count(&self) -> usize {
        self.log().updates.len()
    }

    pub fn last_update(&self) -> Option<FramebufferUpdate> {
        self.log().updates.last().cloned()
    }

    /// Makes every later write fail with `err`.
    pub fn fail_writes(&self, err: TransportError) {
        self.log().fail_writes = Some(err);
    }
}

fn lock(log: &Mutex<TransportLog>) -> MutexGuard<'_, TransportLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientTransport for RecordingTransport {
    fn peer_address(&self) -> String {
        self.peer.clone()
    }

    fn shutdown(&mut self, reason: &str) {
        let mut log = lock(&self.log);
        if log.shutdown_reason.is_none() {
            log.shutdown_reason = Some(reason.to_string());
        }
    }

    fn write_framebuffer_update(&mut self, update: &FramebufferUpdate) -> Result<(), TransportError> {
        self.record(|log| log.updates.push(update.clone()))
    }

    fn write_desktop_size(&mut self, notice: &DesktopSizeNotice) -> Result<(), TransportError> {
        self.record(|log| log.desktop_sizes.push(notice.clone()))
    }

    fn write_cursor(&mut self, cursor: &Cursor) -> Result<(), TransportError> {
        self.record(|log| log.cursors.push(cursor.clone()))
    }

    fn write_led_state(&mut self, state: u32) -> Result<(), TransportError> {
        self.record(|log| log.led_states.push(state))
    }

    fn write_bell(&mut self) -> Result<(), TransportError> {
        self.record(|log| log.bells += 1)
    }

    fn write_desktop_name(&mut self, name: &str) -> Result<(), TransportError> {
        self.record(|log| log.names.push(name.to_string()))
    }

    fn write_clipboard_announce(&mut self, available: bool) -> Result<(), TransportError> {
        self.record(|log| log.clipboard_announces.push(available))
    }

    fn write_clipboard_request(&mut self) -> Result<(), TransportError> {
        self.record(|log| log.clipboard_requests += 1)
    }

    fn write_clipboard_data(&mut self, data: &str) -> Result<(), TransportError> {
        self.record(|log| log.clipboard_data.push(data.to_string()))
    }
}
