//! The keymap trie: an ordered map from chords to actions.
//!
//! Each binding is inserted under its full chord sequence. Single-stroke
//! bindings become leaves at the root; multi-stroke bindings create
//! [`Action::MultiStroke`] edges owning a nested keymap per prefix stroke.
//! The dispatcher walks this trie one chord at a time.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::chord::Chord;

/// Evdev key codes emitted as one nested press/release group; the last code
/// is the key itself, the ones before it are modifiers held around it.
pub type KeySeq = Vec<u16>;

/// The right side of an ordinary remap line: each inner sequence is one tap.
pub type OutputProgram = Vec<KeySeq>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeymapError {
    /// A chord sequence collides with an existing binding, either exactly or
    /// as a prefix of it.
    #[error("duplicate input")]
    DuplicateInput,
    /// Insertion was attempted with an empty chord sequence.
    #[error("empty input sequence")]
    EmptyInput,
}

/// What happens when a chord (sequence) fires.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Synthesize the key events of the program on the virtual device.
    Emit(OutputProgram),
    /// Descend into a nested keymap; the next chord is looked up there.
    MultiStroke(Keymap),
    /// Flip selection mode.
    ToggleSelection,
    /// Enter (`is_start == false`) or leave (`is_start == true`) pass-through
    /// mode.
    ToggleStopped { is_start: bool },
}

/// An ordered chord-to-action map. Maps are small (dozens of entries), so a
/// `BTreeMap` gives the required ordering without any tuning.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Keymap {
    entries: BTreeMap<Chord, Action>,
}

impl Keymap {
    pub fn new() -> Keymap {
        Keymap::default()
    }

    /// Inserts `action` under the chord sequence `input`.
    ///
    /// Intermediate strokes reuse an existing `MultiStroke` edge or create a
    /// fresh one; any other collision is a [`KeymapError::DuplicateInput`].
    pub fn insert(&mut self, input: &[Chord], action: Action) -> Result<(), KeymapError> {
        let (&first, rest) = input.split_first().ok_or(KeymapError::EmptyInput)?;

        if rest.is_empty() {
            if self.entries.contains_key(&first) {
                return Err(KeymapError::DuplicateInput);
            }
            self.entries.insert(first, action);
            return Ok(());
        }

        let child = self
            .entries
            .entry(first)
            .or_insert_with(|| Action::MultiStroke(Keymap::new()));
        match child {
            Action::MultiStroke(map) => map.insert(rest, action),
            _ => Err(KeymapError::DuplicateInput),
        }
    }

    pub fn lookup(&self, chord: Chord) -> Option<&Action> {
        self.entries.get(&chord)
    }

    /// Follows `MultiStroke` edges along `path`; `None` when the path no
    /// longer exists (e.g. after a reload replaced the trie).
    pub fn descend(&self, path: &[Chord]) -> Option<&Keymap> {
        let mut map = self;
        for &chord in path {
            match map.lookup(chord) {
                Some(Action::MultiStroke(child)) => map = child,
                _ => return None,
            }
        }
        Some(map)
    }

    /// Number of entries at this level of the trie.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::Mods;

    fn chord(code: u8) -> Chord {
        Chord::new(code, Mods::CONTROL)
    }

    fn emit(code: u16) -> Action {
        Action::Emit(vec![vec![code]])
    }

    #[test]
    fn insert_should_store_single_stroke_binding() {
        let mut map = Keymap::new();
        map.insert(&[chord(23)], emit(15))
            .expect("Insertion into an empty keymap should succeed.");

        assert_eq!(map.lookup(chord(23)), Some(&emit(15)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_should_reject_exact_duplicate() {
        let mut map = Keymap::new();
        map.insert(&[chord(23)], emit(15)).unwrap();

        let result = map.insert(&[chord(23)], emit(16));
        assert_eq!(result, Err(KeymapError::DuplicateInput));
    }

    #[test]
    fn insert_should_reject_sequence_through_terminal_binding() {
        let mut map = Keymap::new();
        map.insert(&[chord(45)], emit(15)).unwrap();

        // `C-x C-s` after `C-x` terminates: the prefix is already taken.
        let result = map.insert(&[chord(45), chord(31)], emit(31));
        assert_eq!(result, Err(KeymapError::DuplicateInput));
    }

    #[test]
    fn insert_should_reject_terminal_over_existing_prefix() {
        let mut map = Keymap::new();
        map.insert(&[chord(45), chord(31)], emit(31)).unwrap();

        let result = map.insert(&[chord(45)], emit(15));
        assert_eq!(result, Err(KeymapError::DuplicateInput));
    }

    #[test]
    fn lookup_along_inserted_path_should_return_the_action() {
        // Property: for every inserted sequence, walking the trie along the
        // sequence ends at exactly the inserted action, and every strict
        // prefix resolves to a multi-stroke edge.
        let sequences: [&[Chord]; 3] = [
            &[chord(45), chord(31)],
            &[chord(45), chord(46), chord(47)],
            &[chord(50)],
        ];

        let mut map = Keymap::new();
        for (index, sequence) in sequences.iter().enumerate() {
            map.insert(sequence, emit(index as u16 + 1))
                .expect("Disjoint sequences should insert cleanly.");
        }

        for (index, sequence) in sequences.iter().enumerate() {
            let (last, prefix) = sequence.split_last().unwrap();
            let parent = map
                .descend(prefix)
                .expect("Every strict prefix should resolve to a nested keymap.");
            assert_eq!(parent.lookup(*last), Some(&emit(index as u16 + 1)));
        }
    }

    #[test]
    fn descend_should_return_none_for_unknown_path() {
        let mut map = Keymap::new();
        map.insert(&[chord(45), chord(31)], emit(31)).unwrap();

        assert!(map.descend(&[chord(99)]).is_none());
        assert!(map.descend(&[chord(45), chord(31)]).is_none());
    }

    #[test]
    fn shared_prefixes_should_branch_within_one_edge() {
        let mut map = Keymap::new();
        map.insert(&[chord(45), chord(31)], emit(1)).unwrap();
        map.insert(&[chord(45), chord(32)], emit(2)).unwrap();

        let child = map.descend(&[chord(45)]).unwrap();
        assert_eq!(child.len(), 2);
        assert_eq!(map.len(), 1);
    }
}
