//! The server's key layout, distilled into flat lookup tables.
//!
//! [`KeyLayout`] is built from the X server's modifier and keyboard mappings
//! and answers three questions for the dispatcher: what role a key code plays
//! (regular modifier, other modifier, cursor key, plain key), which key code
//! canonically produces a given modifier, and how chord literals from the
//! configuration file map to key codes. It is rebuilt whenever the server's
//! mapping changes.
//!
//! All key codes in the tables are evdev codes; X keycodes are converted on
//! the way in (X keycode = evdev code + 8).

use std::collections::HashMap;

use log::{debug, error, warn};
use thiserror::Error;
use xkbcommon::xkb;
use xkbcommon::xkb::keysyms;

use crate::chord::{Chord, Modifier, Mods};
use crate::keymap::KeySeq;

/// Offset between X keycodes and evdev key codes.
pub const EVDEV_OFFSET: u8 = 8;

/// Keysyms treated as cursor motion for selection mode.
const CURSOR_KEYSYMS: [u32; 9] = [
    keysyms::KEY_Home,
    keysyms::KEY_Left,
    keysyms::KEY_Up,
    keysyms::KEY_Right,
    keysyms::KEY_Down,
    keysyms::KEY_Prior,
    keysyms::KEY_Next,
    keysyms::KEY_End,
    keysyms::KEY_Begin,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown modifier `{0}`")]
    UnknownModifier(String),
    #[error("unknown key `{0}`")]
    UnknownKey(String),
    #[error("no key is bound for {0}")]
    UnboundKey(String),
}

/// Classification of one key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyKind {
    #[default]
    Plain,
    /// A key bound to one of the six recognized modifiers.
    Modifier(Modifier),
    /// A modifier key outside the six recognized slots (e.g. Lock).
    OtherModifier,
    Cursor,
}

/// Raw mapping tables fetched from the X server, kept as plain data so the
/// layout can be built (and tested) without a live connection.
#[derive(Debug, Clone)]
pub struct ServerTables {
    pub min_keycode: u8,
    pub keysyms_per_keycode: u8,
    /// Keysym rows for keycodes `min_keycode..`, `keysyms_per_keycode` each.
    pub keysyms: Vec<u32>,
    /// The modifier map: 8 rows of `keycodes_per_modifier` X keycodes.
    pub modmap: Vec<u8>,
    pub keycodes_per_modifier: u8,
}

impl ServerTables {
    fn syms_for(&self, x_code: u8) -> &[u32] {
        if x_code < self.min_keycode {
            return &[];
        }
        let per = usize::from(self.keysyms_per_keycode);
        let start = usize::from(x_code - self.min_keycode) * per;
        self.keysyms.get(start..start + per).unwrap_or(&[])
    }

    fn modmap_row(&self, row: usize) -> &[u8] {
        let per = usize::from(self.keycodes_per_modifier);
        self.modmap.get(row * per..(row + 1) * per).unwrap_or(&[])
    }
}

pub struct KeyLayout {
    kinds: [KeyKind; 256],
    /// Canonical key code per modifier slot, used when synthesizing events.
    modifier_keys: [Option<u8>; 6],
    keysym_to_code: HashMap<u32, u8>,
    /// Primary keysym per key code, for diagnostics and chord formatting.
    primary_syms: [u32; 256],
}

fn evdev_code(x_code: u8) -> Option<u8> {
    x_code.checked_sub(EVDEV_OFFSET).filter(|&code| code != 0)
}

/// Maps a key's bound keysyms to one of the four free modifier slots.
fn classify_modifier_syms(syms: &[u32]) -> Option<Modifier> {
    for &sym in syms {
        let modifier = match sym {
            keysyms::KEY_Meta_L | keysyms::KEY_Meta_R => Some(Modifier::Meta),
            keysyms::KEY_Alt_L | keysyms::KEY_Alt_R => Some(Modifier::Alt),
            keysyms::KEY_Hyper_L | keysyms::KEY_Hyper_R => Some(Modifier::Hyper),
            keysyms::KEY_Super_L | keysyms::KEY_Super_R => Some(Modifier::Super),
            _ => None,
        };
        if modifier.is_some() {
            return modifier;
        }
    }
    None
}

impl KeyLayout {
    /// Builds the lookup tables from the server's mapping data.
    ///
    /// Modifier rows: row 0 is Shift and row 2 is Control by definition;
    /// rows 3..7 are classified by the keysyms bound to their keys. A
    /// modifier claimed by more than one row keeps the first row and logs a
    /// warning. Modifier keys outside the six slots become
    /// [`KeyKind::OtherModifier`].
    pub fn from_tables(tables: &ServerTables) -> KeyLayout {
        let mut layout = KeyLayout {
            kinds: [KeyKind::Plain; 256],
            modifier_keys: [None; 6],
            keysym_to_code: HashMap::new(),
            primary_syms: [0; 256],
        };

        let mut row_owner: [Option<Modifier>; 8] = [None; 8];
        row_owner[0] = Some(Modifier::Shift);
        row_owner[2] = Some(Modifier::Control);
        let mut claimed = [false; 6];
        claimed[Modifier::Shift as usize] = true;
        claimed[Modifier::Control as usize] = true;

        for (row, modifier) in [(0, Modifier::Shift), (2, Modifier::Control)] {
            if tables.modmap_row(row).iter().all(|&code| code == 0) {
                error!("No key is bound for modifier: {}", modifier.name());
            }
        }

        for row in 3..8 {
            let classified = tables
                .modmap_row(row)
                .iter()
                .filter(|&&x_code| x_code != 0)
                .find_map(|&x_code| classify_modifier_syms(tables.syms_for(x_code)));
            let Some(modifier) = classified else {
                continue;
            };
            if claimed[modifier as usize] {
                warn!(
                    "{} corresponds to multiple modifier rows; ignoring row {}",
                    modifier.name(),
                    row
                );
                continue;
            }
            claimed[modifier as usize] = true;
            row_owner[row] = Some(modifier);
            debug!("found modifier={} row={}", modifier.name(), row);
        }

        // Every key on the modifier map is at least an "other" modifier;
        // keys on a classified row are upgraded below.
        for row in 0..8 {
            for &x_code in tables.modmap_row(row) {
                if x_code == 0 {
                    continue;
                }
                if let Some(code) = evdev_code(x_code) {
                    layout.kinds[usize::from(code)] = KeyKind::OtherModifier;
                }
            }
        }
        for row in 0..8 {
            let Some(modifier) = row_owner[row] else {
                continue;
            };
            for &x_code in tables.modmap_row(row) {
                if x_code == 0 {
                    continue;
                }
                let Some(code) = evdev_code(x_code) else {
                    continue;
                };
                layout.kinds[usize::from(code)] = KeyKind::Modifier(modifier);
                let slot = &mut layout.modifier_keys[modifier as usize];
                if slot.is_none() {
                    *slot = Some(code);
                }
            }
        }

        for x_code in tables.min_keycode..=u8::MAX {
            let syms = tables.syms_for(x_code);
            let Some(code) = evdev_code(x_code) else {
                continue;
            };
            if let Some(&primary) = syms.iter().find(|&&sym| sym != 0) {
                layout.primary_syms[usize::from(code)] = primary;
            }
            if layout.kinds[usize::from(code)] == KeyKind::Plain
                && syms.iter().any(|sym| CURSOR_KEYSYMS.contains(sym))
            {
                layout.kinds[usize::from(code)] = KeyKind::Cursor;
            }
        }

        // First binding wins, scanning primary columns before alternates.
        let per = usize::from(tables.keysyms_per_keycode);
        for column in 0..per {
            for x_code in tables.min_keycode..=u8::MAX {
                let syms = tables.syms_for(x_code);
                let Some(&sym) = syms.get(column) else {
                    continue;
                };
                if sym == 0 {
                    continue;
                }
                if let Some(code) = evdev_code(x_code) {
                    layout.keysym_to_code.entry(sym).or_insert(code);
                }
            }
        }

        layout
    }

    pub fn kind(&self, code: u16) -> KeyKind {
        usize::try_from(code)
            .ok()
            .and_then(|index| self.kinds.get(index).copied())
            .unwrap_or(KeyKind::Plain)
    }

    /// True for any key on the modifier map, recognized slot or not.
    pub fn is_modifier(&self, code: u16) -> bool {
        matches!(
            self.kind(code),
            KeyKind::Modifier(_) | KeyKind::OtherModifier
        )
    }

    /// True only for keys bound to one of the six recognized modifiers.
    pub fn is_regular_modifier(&self, code: u16) -> bool {
        matches!(self.kind(code), KeyKind::Modifier(_))
    }

    pub fn is_cursor(&self, code: u16) -> bool {
        self.kind(code) == KeyKind::Cursor
    }

    /// The canonical key code for a modifier slot (the first key found on
    /// the slot's modifier-map row).
    pub fn modifier_key(&self, modifier: Modifier) -> Option<u8> {
        self.modifier_keys[modifier as usize]
    }

    /// Whether `keys` holds a key bound to `modifier`.
    pub fn contains_modifier(&self, keys: &[u16], modifier: Modifier) -> bool {
        keys.iter()
            .any(|&code| self.kind(code) == KeyKind::Modifier(modifier))
    }

    /// Forms the chord for a freshly pressed key: the OR of the modifier
    /// bits of every *other* currently pressed regular modifier.
    pub fn compose_chord(&self, code: u8, pressing: &[u16]) -> Chord {
        let mut mods = Mods::empty();
        for &pressed in pressing {
            if pressed == u16::from(code) {
                continue;
            }
            if let KeyKind::Modifier(modifier) = self.kind(pressed) {
                mods |= modifier.mask();
            }
        }
        Chord::new(code, mods)
    }

    /// Checks that a requested modifier has a bound key, permitting the
    /// historical Alt/Meta swap when only one of the two exists.
    fn resolve_modifier(&self, modifier: Modifier) -> Result<Modifier, ParseError> {
        if self.modifier_key(modifier).is_some() {
            return Ok(modifier);
        }
        let fallback = match modifier {
            Modifier::Alt => Some(Modifier::Meta),
            Modifier::Meta => Some(Modifier::Alt),
            _ => None,
        };
        if let Some(fallback) = fallback {
            if self.modifier_key(fallback).is_some() {
                debug!(
                    "{} is not bound; falling back to {}",
                    modifier.name(),
                    fallback.name()
                );
                return Ok(fallback);
            }
        }
        Err(ParseError::UnboundKey(modifier.name().to_string()))
    }

    fn key_code_for_name(&self, name: &str) -> Result<u8, ParseError> {
        let sym = xkb::keysym_from_name(name, xkb::KEYSYM_NO_FLAGS);
        if sym.raw() == keysyms::KEY_NoSymbol {
            return Err(ParseError::UnknownKey(name.to_string()));
        }
        self.keysym_to_code
            .get(&sym.raw())
            .copied()
            .ok_or_else(|| ParseError::UnboundKey(format!("`{name}`")))
    }

    fn split_tags<'a>(&self, token: &'a str) -> Result<(Mods, &'a str), ParseError> {
        let mut parts: Vec<&str> = token.split('-').collect();
        let name = parts.pop().filter(|name| !name.is_empty());
        let Some(name) = name else {
            return Err(ParseError::UnknownKey(token.to_string()));
        };

        let mut mods = Mods::empty();
        for part in parts {
            let mut chars = part.chars();
            let tag = chars.next().filter(|_| chars.next().is_none());
            let modifier = tag
                .and_then(Modifier::from_tag)
                .ok_or_else(|| ParseError::UnknownModifier(part.to_string()))?;
            mods |= self.resolve_modifier(modifier)?.mask();
        }
        Ok((mods, name))
    }

    /// Parses a chord literal such as `C-x` or `C-M-Return`.
    pub fn parse_chord(&self, token: &str) -> Result<Chord, ParseError> {
        let (mods, name) = self.split_tags(token)?;
        let code = self.key_code_for_name(name)?;
        Ok(Chord::new(code, mods))
    }

    /// Parses an output token into the key codes to press around the final
    /// key, e.g. `C-s` becomes `[control, s]`.
    pub fn parse_key_seq(&self, token: &str) -> Result<KeySeq, ParseError> {
        let (mods, name) = self.split_tags(token)?;
        let mut keys = KeySeq::new();
        for modifier in Modifier::ALL {
            if !mods.contains(modifier.mask()) {
                continue;
            }
            let code = self
                .modifier_key(modifier)
                .ok_or_else(|| ParseError::UnboundKey(modifier.name().to_string()))?;
            keys.push(u16::from(code));
        }
        keys.push(u16::from(self.key_code_for_name(name)?));
        Ok(keys)
    }

    /// Renders a chord back into its literal form, for log messages.
    pub fn format_chord(&self, chord: Chord) -> String {
        let mut text = String::new();
        for modifier in Modifier::ALL {
            if chord.mods.contains(modifier.mask()) {
                text.push(modifier.tag());
                text.push('-');
            }
        }
        let sym = self.primary_syms[usize::from(chord.code)];
        if sym == 0 {
            text.push_str(&format!("<{}>", chord.code));
        } else {
            text.push_str(&xkb::keysym_get_name(xkb::Keysym::new(sym)));
        }
        text
    }
}
