//! Recording backend for tests.
//!
//! [`RecordingBackend`] simulates a desktop whose "physical screen" is a
//! shared [`ManagedPixelBuffer`].  The framebuffer it hands to the session is
//! a [`RecordingPixelBuffer`] that copies from that screen whenever the
//! session grabs a region, exactly like a real capture backend would.  Tests
//! paint on the screen, queue events and inspect calls through a
//! [`BackendProbe`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rfb_core::{ManagedPixelBuffer, PixelBuffer, Point, Rect, Region, ScreenSet};

use super::{
    BackendCapability, BackendError, BackendEvent, DesktopBackend, DesktopFrame, ResizeOutcome,
};

/// How the backend answers a layout request.
#[derive(Debug, Clone, Default)]
pub enum ResizeBehaviour {
    /// Apply exactly what was asked.
    #[default]
    Accept,
    /// Fail with [`BackendError::LayoutRejected`].
    Refuse,
    /// Report this layout instead of the requested one.
    Substitute(ScreenSet),
}

/// Everything the backend has been asked to do.
#[derive(Debug, Default)]
pub struct BackendLog {
    pub starts: usize,
    pub stops: usize,
    pub layout_requests: Vec<(u32, u32, ScreenSet)>,
    pub keys: Vec<(u32, u32, bool)>,
    pub pointer: Vec<(Point, u8)>,
    pub clipboard_requests: usize,
    pub clipboard_announces: Vec<bool>,
    pub clipboard_data: Vec<String>,
    /// Every region grabbed from any framebuffer this backend produced.
    pub grabs: Vec<Region>,
}

#[derive(Debug)]
struct BackendState {
    log: BackendLog,
    screen: Arc<Mutex<ManagedPixelBuffer>>,
    events: VecDeque<BackendEvent>,
    resize: ResizeBehaviour,
    start_error: Option<String>,
    missing: Vec<BackendCapability>,
}

type Shared = Arc<Mutex<BackendState>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── RecordingPixelBuffer ──────────────────────────────────────────────────────

/// A framebuffer refreshed from the simulated screen on every grab.
pub struct RecordingPixelBuffer {
    local: ManagedPixelBuffer,
    screen: Arc<Mutex<ManagedPixelBuffer>>,
    state: Shared,
}

impl PixelBuffer for RecordingPixelBuffer {
    fn width(&self) -> u32 {
        self.local.width()
    }

    fn height(&self) -> u32 {
        self.local.height()
    }

    fn pixels(&self) -> &[u8] {
        self.local.pixels()
    }

    fn grab_region(&mut self, region: &Region) {
        {
            let screen = lock(&self.screen);
            for rect in region.rects() {
                self.local.image_rect(&*screen, rect);
            }
        }
        lock(&self.state).log.grabs.push(region.clone());
    }
}

// ── RecordingBackend ──────────────────────────────────────────────────────────

/// A [`DesktopBackend`] driven entirely by the test.
pub struct RecordingBackend {
    state: Shared,
}

/// Test-side handle to a [`RecordingBackend`].
#[derive(Clone)]
pub struct BackendProbe {
    state: Shared,
}

impl RecordingBackend {
    /// Creates a backend with a black `width` x `height` screen.
    pub fn new(width: u32, height: u32) -> (Self, BackendProbe) {
        let state = Arc::new(Mutex::new(BackendState {
            log: BackendLog::default(),
            screen: Arc::new(Mutex::new(ManagedPixelBuffer::new(width, height))),
            events: VecDeque::new(),
            resize: ResizeBehaviour::default(),
            start_error: None,
            missing: Vec::new(),
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            BackendProbe { state },
        )
    }

    fn frame(state: &Shared, layout: ScreenSet) -> DesktopFrame {
        let screen = Arc::clone(&lock(state).screen);
        let local = ManagedPixelBuffer::snapshot_of(&*lock(&screen));
        DesktopFrame {
            buffer: Box::new(RecordingPixelBuffer {
                local,
                screen,
                state: Arc::clone(state),
            }),
            layout,
        }
    }
}

impl BackendProbe {
    pub fn log(&self) -> MappedLog<'_> {
        MappedLog(lock(&self.state))
    }

    pub fn start_count(&self) -> usize {
        self.log().starts
    }

    pub fn stop_count(&self) -> usize {
        self.log().stops
    }

    /// Paints `rect` on the simulated screen.  The session sees it only
    /// after grabbing.
    pub fn paint(&self, rect: &Rect, pixel: [u8; 4]) {
        let screen = Arc::clone(&lock(&self.state).screen);
        lock(&screen).fill_rect(rect, pixel);
    }

    /// Queues an event for the next `poll_events`.
    pub fn push_event(&self, event: BackendEvent) {
        lock(&self.state).events.push_back(event);
    }

    /// Queues a backend-side resize to `width` x `height`.
    pub fn push_resize(&self, width: u32, height: u32) {
        let screen = Arc::new(Mutex::new(ManagedPixelBuffer::new(width, height)));
        lock(&self.state).screen = screen;
        let frame = RecordingBackend::frame(&self.state, ScreenSet::single(width, height));
        self.push_event(BackendEvent::Resize(frame.buffer));
    }

    pub fn set_resize_behaviour(&self, behaviour: ResizeBehaviour) {
        lock(&self.state).resize = behaviour;
    }

    pub fn fail_start(&self, message: &str) {
        lock(&self.state).start_error = Some(message.to_string());
    }

    pub fn set_missing_capabilities(&self, missing: Vec<BackendCapability>) {
        lock(&self.state).missing = missing;
    }
}

/// Guarded view of a [`BackendLog`].
pub struct MappedLog<'a>(MutexGuard<'a, BackendState>);

impl std::ops::Deref for MappedLog<'_> {
    type Target = BackendLog;

    fn deref(&self) -> &BackendLog {
        &self.0.log
    }
}

impl DesktopBackend for RecordingBackend {
    fn start(&mut self) -> Result<DesktopFrame, BackendError> {
        let (width, height) = {
            let mut state = lock(&self.state);
            if let Some(message) = state.start_error.clone() {
                return Err(BackendError::Start(message));
            }
            state.log.starts += 1;
            let screen = lock(&state.screen);
            (screen.width(), screen.height())
        };
        Ok(Self::frame(&self.state, ScreenSet::single(width, height)))
    }

    fn stop(&mut self) {
        lock(&self.state).log.stops += 1;
    }

    fn set_screen_layout(
        &mut self,
        width: u32,
        height: u32,
        layout: &ScreenSet,
    ) -> Result<ResizeOutcome, BackendError> {
        let (behaviour, resized) = {
            let mut state = lock(&self.state);
            state
                .log
                .layout_requests
                .push((width, height, layout.clone()));
            let resized = {
                let screen = lock(&state.screen);
                screen.width() != width || screen.height() != height
            };
            (state.resize.clone(), resized)
        };

        let applied = match behaviour {
            ResizeBehaviour::Accept => layout.clone(),
            ResizeBehaviour::Refuse => {
                return Err(BackendError::LayoutRejected(format!(
                    "{width}x{height} is not supported"
                )))
            }
            ResizeBehaviour::Substitute(other) => other,
        };

        let buffer = if resized {
            lock(&self.state).screen = Arc::new(Mutex::new(ManagedPixelBuffer::new(width, height)));
            Some(Self::frame(&self.state, applied.clone()).buffer)
        } else {
            None
        };
        Ok(ResizeOutcome {
            buffer,
            layout: applied,
        })
    }

    fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        lock(&self.state).log.keys.push((keysym, keycode, down));
    }

    fn pointer_event(&mut self, pos: Point, button_mask: u8) {
        lock(&self.state).log.pointer.push((pos, button_mask));
    }

    fn request_clipboard(&mut self) {
        lock(&self.state).log.clipboard_requests += 1;
    }

    fn announce_clipboard(&mut self, available: bool) {
        lock(&self.state).log.clipboard_announces.push(available);
    }

    fn clipboard_data(&mut self, data: &str) {
        lock(&self.state).log.clipboard_data.push(data.to_string());
    }

    fn poll_events(&mut self) -> Vec<BackendEvent> {
        lock(&self.state).events.drain(..).collect()
    }

    fn missing_capabilities(&self) -> Vec<BackendCapability> {
        lock(&self.state).missing.clone()
    }
}
