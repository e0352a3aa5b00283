//! Core value types for key chords.
//!
//! A [`Chord`] is a single evdev key code together with the set of abstract
//! modifiers that must be held when it is pressed. Chords are the keys of the
//! keymap trie, so they carry a total order derived from their packed 16-bit
//! representation (modifier bits in the high byte, key code in the low byte).

use bitflags::bitflags;

/// The largest evdev key code the dispatcher will interpret. Codes outside
/// `1..=MAX_KEY_CODE` pass through untouched.
pub const MAX_KEY_CODE: u16 = 254;

/// A chord sequence never grows beyond this many strokes.
pub const MAX_SEQUENCE_LEN: usize = 8;

/// The abstract modifiers a chord can require, in the order of their bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Alt = 0,
    Control = 1,
    Hyper = 2,
    Meta = 3,
    Shift = 4,
    Super = 5,
}

impl Modifier {
    pub const ALL: [Modifier; 6] = [
        Modifier::Alt,
        Modifier::Control,
        Modifier::Hyper,
        Modifier::Meta,
        Modifier::Shift,
        Modifier::Super,
    ];

    pub fn mask(self) -> Mods {
        Mods::from_bits_truncate(1 << self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Modifier::Alt => "alt",
            Modifier::Control => "control",
            Modifier::Hyper => "hyper",
            Modifier::Meta => "meta",
            Modifier::Shift => "shift",
            Modifier::Super => "super",
        }
    }

    /// The one-letter tag used in chord literals. Shift and Super share a
    /// letter and are distinguished by case.
    pub fn tag(self) -> char {
        match self {
            Modifier::Alt => 'A',
            Modifier::Control => 'C',
            Modifier::Hyper => 'H',
            Modifier::Meta => 'M',
            Modifier::Shift => 'S',
            Modifier::Super => 's',
        }
    }

    pub fn from_tag(tag: char) -> Option<Modifier> {
        match tag {
            'A' | 'a' => Some(Modifier::Alt),
            'C' | 'c' => Some(Modifier::Control),
            'H' | 'h' => Some(Modifier::Hyper),
            'M' | 'm' => Some(Modifier::Meta),
            'S' => Some(Modifier::Shift),
            's' => Some(Modifier::Super),
            _ => None,
        }
    }
}

bitflags! {
    /// Bitmask of [`Modifier`]s held together with a key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mods: u8 {
        const ALT = 1 << 0;
        const CONTROL = 1 << 1;
        const HYPER = 1 << 2;
        const META = 1 << 3;
        const SHIFT = 1 << 4;
        const SUPER = 1 << 5;
    }
}

impl Mods {
    /// Modifier letters in canonical order, e.g. `"CM"` for Control+Meta.
    pub fn tags(self) -> String {
        Modifier::ALL
            .iter()
            .filter(|m| self.contains(m.mask()))
            .map(|m| m.tag())
            .collect()
    }
}

/// One stroke of a key binding: an evdev key code plus required modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chord {
    pub code: u8,
    pub mods: Mods,
}

impl Chord {
    pub fn new(code: u8, mods: Mods) -> Chord {
        Chord { code, mods }
    }

    /// The packed representation that defines the chord ordering.
    fn packed(self) -> u16 {
        u16::from(self.mods.bits()) << 8 | u16::from(self.code)
    }
}

impl PartialOrd for Chord {
    fn partial_cmp(&self, other: &Chord) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Chord {
    fn cmp(&self, other: &Chord) -> std::cmp::Ordering {
        self.packed().cmp(&other.packed())
    }
}

/// An ordered multi-stroke trigger, parsed from the left side of a config
/// line.
pub type ChordSequence = Vec<Chord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_should_follow_packed_representation() {
        let plain = Chord::new(30, Mods::empty());
        let ctrl = Chord::new(30, Mods::CONTROL);
        let ctrl_higher_code = Chord::new(31, Mods::CONTROL);

        assert!(plain < ctrl);
        assert!(ctrl < ctrl_higher_code);
    }

    #[test]
    fn tags_should_list_modifiers_in_canonical_order() {
        let mods = Mods::SHIFT | Mods::CONTROL | Mods::META;
        assert_eq!(mods.tags(), "CMS");
    }

    #[test]
    fn from_tag_should_distinguish_shift_and_super_by_case() {
        assert_eq!(Modifier::from_tag('S'), Some(Modifier::Shift));
        assert_eq!(Modifier::from_tag('s'), Some(Modifier::Super));
        assert_eq!(Modifier::from_tag('x'), None);
    }

    #[test]
    fn mask_should_round_trip_through_modifier_bits() {
        for modifier in Modifier::ALL {
            let mask = modifier.mask();
            assert_eq!(mask.bits().count_ones(), 1);
            assert_eq!(mask.bits(), 1 << modifier as u8);
        }
    }
}
