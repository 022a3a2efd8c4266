//! Keysym remapping.
//!
//! Administrators can rewrite keysyms before they reach the desktop, e.g. to
//! swap two keys on an unusual keyboard.  A mapping is written as a
//! comma-separated list of entries:
//!
//! - `0x22->0x40` maps keysym 0x22 to 0x40;
//! - `0x24<>0x25` swaps 0x24 and 0x25.
//!
//! Keysyms without an entry pass through unchanged.

use std::collections::HashMap;

use thiserror::Error;

pub mod keysym;

/// Errors raised while parsing a remapping list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemapError {
    #[error("bad key mapping entry `{0}`: expected `0xFROM->0xTO` or `0xA<>0xB`")]
    BadEntry(String),

    #[error("bad keysym `{0}`: expected a hexadecimal value such as 0x41")]
    BadKeysym(String),
}

/// Lookup table rewriting keysyms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRemapper {
    mapping: HashMap<u32, u32>,
}

impl KeyRemapper {
    /// Creates a remapper that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a mapping list such as `"0x22->0x40,0x24<>0x25"`.
    ///
    /// Whitespace around entries is ignored and an empty string gives the
    /// identity mapping.
    ///
    /// # Errors
    ///
    /// Returns [`RemapError`] for an entry without a recognised arrow or with
    /// a keysym that is not `0x`-prefixed hexadecimal.
    pub fn parse(list: &str) -> Result<Self, RemapError> {
        let mut mapping = HashMap::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((from, to)) = entry.split_once("<>") {
                let (a, b) = (parse_keysym(from)?, parse_keysym(to)?);
                mapping.insert(a, b);
                mapping.insert(b, a);
            } else if let Some((from, to)) = entry.split_once("->") {
                mapping.insert(parse_keysym(from)?, parse_keysym(to)?);
            } else {
                return Err(RemapError::BadEntry(entry.to_string()));
            }
        }
        Ok(Self { mapping })
    }

    /// Returns the keysym `keysym` should be delivered as.
    pub fn remap(&self, keysym: u32) -> u32 {
        self.mapping.get(&keysym).copied().unwrap_or(keysym)
    }

    pub fn is_identity(&self) -> bool {
        self.mapping.is_empty()
    }
}

fn parse_keysym(text: &str) -> Result<u32, RemapError> {
    let text = text.trim();
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| RemapError::BadKeysym(text.to_string()))
}
