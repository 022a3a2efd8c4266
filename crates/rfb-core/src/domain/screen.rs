//! Multi-monitor screen layout.
//!
//! A desktop framebuffer may be shown on several physical monitors.  Each
//! monitor is a [`Screen`]: a rectangle inside the framebuffer with an opaque
//! id that stays stable while the layout is reconfigured.  The whole layout is
//! a [`ScreenSet`].
//!
//! A layout is only ever installed after [`ScreenSet::validate`] has accepted
//! it for the framebuffer's dimensions.  Screens may overlap (mirrored
//! monitors are legal) but none may stick out of the framebuffer.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::geometry::Rect;

/// Largest framebuffer edge a layout may describe.
pub const MAX_FRAMEBUFFER_DIMENSION: u32 = 16384;

/// Reasons a screen layout is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScreenLayoutError {
    /// A layout must contain at least one screen.
    #[error("screen layout contains no screens")]
    Empty,

    /// The framebuffer itself has an unusable size.
    #[error("invalid framebuffer size {width}x{height}")]
    InvalidFramebufferSize { width: u32, height: u32 },

    /// A screen covers no pixels.
    #[error("screen {0} has an empty area")]
    EmptyScreen(u32),

    /// A screen lies partly or fully outside the framebuffer.
    #[error("screen {id} ({rect}) does not fit inside a {width}x{height} framebuffer")]
    OutOfBounds {
        id: u32,
        rect: Rect,
        width: u32,
        height: u32,
    },

    /// Two screens share an id.
    #[error("duplicate screen id {0}")]
    DuplicateId(u32),
}

/// One monitor's area within the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    /// Opaque id, stable across reconfiguration.
    pub id: u32,
    pub rect: Rect,
    /// Protocol-defined flags, carried through untouched.
    pub flags: u32,
}

impl Screen {
    pub fn new(id: u32, x: i32, y: i32, width: u32, height: u32, flags: u32) -> Self {
        Self {
            id,
            rect: Rect::from_size(x, y, width, height),
            flags,
        }
    }
}

/// An ordered collection of screens.
///
/// Equality ignores ordering: two sets with the same screens listed in a
/// different order describe the same layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenSet {
    screens: Vec<Screen>,
}

impl ScreenSet {
    /// Creates an empty layout (only valid while no framebuffer exists).
    pub fn new() -> Self {
        Self::default()
    }

    /// A single screen covering the whole framebuffer.
    pub fn single(width: u32, height: u32) -> Self {
        Self {
            screens: vec![Screen::new(0, 0, 0, width, height, 0)],
        }
    }

    pub fn add_screen(&mut self, screen: Screen) {
        self.screens.push(screen);
    }

    /// Removes the screen with `id`; returns `false` if there was none.
    pub fn remove_screen(&mut self, id: u32) -> bool {
        let before = self.screens.len();
        self.screens.retain(|s| s.id != id);
        self.screens.len() != before
    }

    pub fn screens(&self) -> &[Screen] {
        &self.screens
    }

    pub fn num_screens(&self) -> usize {
        self.screens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    /// Checks that the layout may be installed on a `width` x `height`
    /// framebuffer.
    ///
    /// # Errors
    ///
    /// Returns the first [`ScreenLayoutError`] found: no screens, a framebuffer
    /// size of zero or above [`MAX_FRAMEBUFFER_DIMENSION`], an empty screen, a
    /// screen outside the framebuffer, or a repeated id.
    pub fn validate(&self, width: u32, height: u32) -> Result<(), ScreenLayoutError> {
        if width == 0
            || height == 0
            || width > MAX_FRAMEBUFFER_DIMENSION
            || height > MAX_FRAMEBUFFER_DIMENSION
        {
            return Err(ScreenLayoutError::InvalidFramebufferSize { width, height });
        }
        if self.screens.is_empty() {
            return Err(ScreenLayoutError::Empty);
        }

        let fb_rect = Rect::from_size(0, 0, width, height);
        let mut seen = HashSet::with_capacity(self.screens.len());
        for screen in &self.screens {
            if screen.rect.is_empty() {
                return Err(ScreenLayoutError::EmptyScreen(screen.id));
            }
            if !screen.rect.enclosed_by(&fb_rect) {
                return Err(ScreenLayoutError::OutOfBounds {
                    id: screen.id,
                    rect: screen.rect,
                    width,
                    height,
                });
            }
            if !seen.insert(screen.id) {
                return Err(ScreenLayoutError::DuplicateId(screen.id));
            }
        }
        Ok(())
    }

    /// Convenience wrapper around [`ScreenSet::validate`].
    pub fn is_valid(&self, width: u32, height: u32) -> bool {
        self.validate(width, height).is_ok()
    }

    /// Reconciles the layout with new framebuffer dimensions.
    ///
    /// Screens are clipped to the framebuffer; a screen left with no area is
    /// dropped.  If nothing survives, a single full-framebuffer screen with id
    /// 0 takes their place, so the result always validates for a usable size.
    pub fn clipped_to(&self, width: u32, height: u32) -> ScreenSet {
        let fb_rect = Rect::from_size(0, 0, width, height);
        let mut clipped = ScreenSet::new();

        for screen in &self.screens {
            let rect = screen.rect.intersect(&fb_rect);
            if rect.is_empty() {
                info!(
                    "Removing screen {} ({:#x}) as it is completely outside the new framebuffer",
                    screen.id, screen.flags
                );
                continue;
            }
            clipped.add_screen(Screen { rect, ..*screen });
        }

        if clipped.is_empty() {
            clipped.add_screen(Screen::new(0, 0, 0, width, height, 0));
        }
        clipped
    }
}

impl PartialEq for ScreenSet {
    fn eq(&self, other: &ScreenSet) -> bool {
        let mut mine = self.screens.clone();
        let mut theirs = other.screens.clone();
        mine.sort_by_key(|s| s.id);
        theirs.sort_by_key(|s| s.id);
        mine == theirs
    }
}

impl Eq for ScreenSet {}

// ── Tests ─────────────────────────────────────────────────────────────────────
