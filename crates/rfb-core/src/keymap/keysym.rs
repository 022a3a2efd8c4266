//! X11 keysym values used by the session core.
//!
//! RFB key events carry X11 keysyms (see `X11/keysymdef.h`).  Only the
//! symbols the server has to reason about are listed here: lock keys, Shift,
//! Tab and the ranges used by the lock-state heuristics.
//!
//! # What is an X11 keysym? (for beginners)
//!
//! A keysym names the *symbol* a key produces rather than its physical
//! position.  Letters use their ASCII values (`XK_A` = 0x41, `XK_a` = 0x61),
//! while function and modifier keys live in the 0xFFxx range.

pub const XK_TAB: u32 = 0xff09;
pub const XK_ISO_LEFT_TAB: u32 = 0xfe20;

pub const XK_SCROLL_LOCK: u32 = 0xff14;
pub const XK_NUM_LOCK: u32 = 0xff7f;
pub const XK_CAPS_LOCK: u32 = 0xffe5;

pub const XK_SHIFT_L: u32 = 0xffe1;
pub const XK_SHIFT_R: u32 = 0xffe2;

pub const XK_KP_HOME: u32 = 0xff95;
pub const XK_KP_DELETE: u32 = 0xff9f;
pub const XK_KP_SEPARATOR: u32 = 0xffac;
pub const XK_KP_DECIMAL: u32 = 0xffae;
pub const XK_KP_0: u32 = 0xffb0;
pub const XK_KP_9: u32 = 0xffb9;

pub const XK_UPPER_A: u32 = 0x0041;
pub const XK_UPPER_Z: u32 = 0x005a;
pub const XK_LOWER_A: u32 = 0x0061;
pub const XK_LOWER_Z: u32 = 0x007a;

// ── Keyboard LED state bits ───────────────────────────────────────────────────

pub const LED_SCROLL_LOCK: u32 = 1 << 0;
pub const LED_NUM_LOCK: u32 = 1 << 1;
pub const LED_CAPS_LOCK: u32 = 1 << 2;

/// LED state before the backend has reported one.
pub const LED_UNKNOWN: u32 = u32::MAX;

/// Returns `true` for Caps Lock, Num Lock and Scroll Lock.
pub fn is_lock_key(keysym: u32) -> bool {
    matches!(keysym, XK_CAPS_LOCK | XK_NUM_LOCK | XK_SCROLL_LOCK)
}

/// Returns `true` for A-Z and a-z.
pub fn is_latin_letter(keysym: u32) -> bool {
    (XK_UPPER_A..=XK_UPPER_Z).contains(&keysym) || (XK_LOWER_A..=XK_LOWER_Z).contains(&keysym)
}

/// Returns `true` for keypad keys whose meaning depends on Num Lock.
pub fn is_keypad_key(keysym: u32) -> bool {
    (XK_KP_HOME..=XK_KP_DELETE).contains(&keysym) || is_keypad_number(keysym)
}

/// Returns `true` for keypad digits and the keypad decimal/separator keys.
pub fn is_keypad_number(keysym: u32) -> bool {
    (XK_KP_0..=XK_KP_9).contains(&keysym) || keysym == XK_KP_SEPARATOR || keysym == XK_KP_DECIMAL
}
