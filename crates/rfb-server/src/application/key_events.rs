//! Per-client keyboard normalisation.
//!
//! Viewers and the desktop can disagree about lock-key state, send keysyms
//! the desktop cannot type directly, or disconnect while holding keys.  A
//! [`KeyTracker`] sits between one client and the session and turns each
//! incoming key event into the events the desktop should actually see.
//!
//! Rules, in order:
//!
//! 1. Lock keys are dropped while the desktop's LED state is unknown.
//! 2. For clients that cannot receive LED state, Scroll Lock is dropped and
//!    a fake Caps Lock / Num Lock tap is injected when a letter or keypad key
//!    reveals that the client's lock state differs from the desktop's.
//! 3. `ISO_Left_Tab` is sent as Tab with Shift held.
//! 4. Held keys are remembered by keycode (or by keysym when the client sent
//!    no keycode).  A repeat press keeps the keysym of the original press, a
//!    release with no matching press is dropped, and everything still held is
//!    released when the client goes away.

use std::collections::HashMap;

use rfb_core::keymap::keysym::{
    is_keypad_key, is_keypad_number, is_latin_letter, is_lock_key, LED_CAPS_LOCK, LED_NUM_LOCK,
    LED_UNKNOWN, XK_CAPS_LOCK, XK_ISO_LEFT_TAB, XK_NUM_LOCK, XK_SCROLL_LOCK, XK_SHIFT_L,
    XK_SHIFT_R, XK_TAB, XK_UPPER_A, XK_UPPER_Z,
};
use tracing::debug;

/// Marks a tracking key derived from a keysym rather than a keycode.
const KEYSYM_LOOKUP_FLAG: u32 = 0x8000_0000;

/// A key press or release headed for the desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub keysym: u32,
    /// Hardware keycode, or 0 when the client did not provide one.
    pub keycode: u32,
    pub down: bool,
}

impl KeyEvent {
    pub fn new(keysym: u32, keycode: u32, down: bool) -> Self {
        Self {
            keysym,
            keycode,
            down,
        }
    }

    fn tap(keysym: u32) -> [KeyEvent; 2] {
        [KeyEvent::new(keysym, 0, true), KeyEvent::new(keysym, 0, false)]
    }
}

/// Remembers which keys one client is holding down.
#[derive(Debug, Default)]
pub struct KeyTracker {
    /// Tracking key -> keysym sent on press.
    pressed: HashMap<u32, u32>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pressed_count(&self) -> usize {
        self.pressed.len()
    }

    pub fn is_shift_pressed(&self) -> bool {
        self.pressed
            .values()
            .any(|&keysym| keysym == XK_SHIFT_L || keysym == XK_SHIFT_R)
    }

    /// Turns one client key event into the events to deliver, in order.
    ///
    /// `led_state` is the desktop's current LED mask and `client_has_leds`
    /// whether the client is told about LED changes.
    pub fn process(&mut self, event: KeyEvent, led_state: u32, client_has_leds: bool) -> Vec<KeyEvent> {
        let mut out = Vec::new();
        let KeyEvent {
            mut keysym,
            keycode,
            down,
        } = event;

        if led_state == LED_UNKNOWN && is_lock_key(keysym) {
            debug!("Ignoring lock key {keysym:#x} while the lock state is unknown");
            return out;
        }

        if !client_has_leds {
            if keysym == XK_SCROLL_LOCK {
                debug!("Ignoring Scroll Lock from a client without LED state");
                return out;
            }
            if down && led_state != LED_UNKNOWN {
                self.sync_lock_keys(keysym, led_state, &mut out);
            }
        }

        let mut fake_shift = false;
        if keysym == XK_ISO_LEFT_TAB {
            if !self.is_shift_pressed() {
                debug!("Pressing fake Shift_L");
                out.push(KeyEvent::new(XK_SHIFT_L, 0, true));
                fake_shift = true;
            }
            keysym = XK_TAB;
        }

        let lookup = if keycode == 0 {
            KEYSYM_LOOKUP_FLAG | keysym
        } else {
            keycode
        };

        if let Some(&held) = self.pressed.get(&lookup) {
            keysym = held;
        }

        let deliver = if down {
            self.pressed.insert(lookup, keysym);
            true
        } else {
            self.pressed.remove(&lookup).is_some()
        };
        if deliver {
            out.push(KeyEvent::new(keysym, keycode, down));
        }

        if fake_shift {
            debug!("Releasing fake Shift_L");
            out.push(KeyEvent::new(XK_SHIFT_L, 0, false));
        }
        out
    }

    /// Releases every key still held, e.g. when the client disconnects.
    pub fn release_all(&mut self) -> Vec<KeyEvent> {
        self.pressed
            .drain()
            .map(|(lookup, keysym)| {
                let keycode = if lookup & KEYSYM_LOOKUP_FLAG != 0 { 0 } else { lookup };
                KeyEvent::new(keysym, keycode, false)
            })
            .collect()
    }

    /// Injects lock taps so the desktop's Caps/Num Lock matches what the
    /// client's keysyms imply.
    fn sync_lock_keys(&self, keysym: u32, led_state: u32, out: &mut Vec<KeyEvent>) {
        let shift = self.is_shift_pressed();

        if is_latin_letter(keysym) {
            let uppercase = (XK_UPPER_A..=XK_UPPER_Z).contains(&keysym);
            let lock = led_state & LED_CAPS_LOCK != 0;
            if lock == (uppercase == shift) {
                debug!("Inserting fake CapsLock to get in sync with client");
                out.extend(KeyEvent::tap(XK_CAPS_LOCK));
            }
        }

        // With Shift held the expected Num Lock state differs between
        // platforms, so leave it alone.
        if is_keypad_key(keysym) && !shift {
            let number = is_keypad_number(keysym);
            let lock = led_state & LED_NUM_LOCK != 0;
            if lock != number {
                debug!("Inserting fake NumLock to get in sync with client");
                out.extend(KeyEvent::tap(XK_NUM_LOCK));
            }
        }
    }
}
