//! The dispatch state machine.
//!
//! Every event read from the grabbed keyboard lands here exactly once and is
//! consumed, transformed or forwarded to the virtual device. The dispatcher
//! tracks the position inside a multi-stroke sequence, selection and stopped
//! mode, the physically held keys, and the autorepeat timing used to decide
//! when a held remap fires again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use evdev::{EventType, InputEvent};
use log::{debug, info, warn};

use crate::chord::{Chord, Modifier, MAX_KEY_CODE};
use crate::events::EventWriter;
use crate::keymap::{Action, Keymap, OutputProgram};
use crate::layout::KeyLayout;
use crate::uinput::VirtualOutput;

/// The server's autorepeat parameters, refreshed on every mapping change.
#[derive(Debug, Clone, Copy)]
pub struct RepeatTiming {
    pub delay: Duration,
    pub interval: Duration,
}

impl RepeatTiming {
    pub fn from_millis(delay: u16, interval: u16) -> RepeatTiming {
        RepeatTiming {
            delay: Duration::from_millis(delay.into()),
            interval: Duration::from_millis(interval.into()),
        }
    }
}

impl Default for RepeatTiming {
    fn default() -> RepeatTiming {
        // The X server's defaults.
        RepeatTiming::from_millis(660, 25)
    }
}

/// Exclusion state shared between the dispatcher and the watchers. The
/// input-method watcher writes from its own thread; everything else runs on
/// the reactor thread.
#[derive(Clone, Default)]
pub struct ExclusionFlags {
    focus: Arc<AtomicBool>,
    input_method: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
}

impl ExclusionFlags {
    pub fn new() -> ExclusionFlags {
        ExclusionFlags::default()
    }

    pub fn is_excluded(&self) -> bool {
        self.focus.load(Ordering::SeqCst) || self.input_method.load(Ordering::SeqCst)
    }

    pub fn set_focus_excluded(&self, excluded: bool) {
        if excluded && !self.is_excluded() {
            self.reset.store(true, Ordering::SeqCst);
        }
        self.focus.store(excluded, Ordering::SeqCst);
    }

    pub fn set_im_excluded(&self, excluded: bool) {
        if excluded && !self.is_excluded() {
            self.reset.store(true, Ordering::SeqCst);
        }
        self.input_method.store(excluded, Ordering::SeqCst);
    }

    /// True once after an exclusion transition requested a state reset.
    pub fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }
}

/// Outcome of handling one key press or repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handle {
    Consumed,
    Unconsumed,
}

pub struct Dispatcher<W> {
    layout: KeyLayout,
    keymap: Keymap,
    timing: RepeatTiming,
    output: VirtualOutput<W>,
    exclusion: ExclusionFlags,
    /// Position inside a multi-stroke sequence, as a path from the root.
    current_path: Vec<Chord>,
    selection_mode: bool,
    stopped_mode: bool,
    press_start: Option<SystemTime>,
    /// Keys physically held on the grabbed keyboard.
    kbd_pressing: Vec<u16>,
}

impl<W: EventWriter> Dispatcher<W> {
    pub fn new(
        layout: KeyLayout,
        keymap: Keymap,
        timing: RepeatTiming,
        output: VirtualOutput<W>,
        exclusion: ExclusionFlags,
    ) -> Dispatcher<W> {
        Dispatcher {
            layout,
            keymap,
            timing,
            output,
            exclusion,
            current_path: Vec::new(),
            selection_mode: false,
            stopped_mode: false,
            press_start: None,
            kbd_pressing: Vec::new(),
        }
    }

    /// Installs freshly built tables after a mapping change or reload.
    pub fn install(&mut self, layout: KeyLayout, keymap: Keymap, timing: RepeatTiming) {
        self.layout = layout;
        self.keymap = keymap;
        self.timing = timing;
        self.reset_state();
    }

    /// Cancels any in-flight sequence and leaves selection mode.
    pub fn reset_state(&mut self) {
        self.current_path.clear();
        self.selection_mode = false;
    }

    pub fn exclusion(&self) -> ExclusionFlags {
        self.exclusion.clone()
    }

    pub fn output_mut(&mut self) -> &mut VirtualOutput<W> {
        &mut self.output
    }

    /// Entry point for every event read from the keyboard device.
    pub fn handle_event(&mut self, event: &InputEvent) -> Result<()> {
        match event.event_type() {
            // Scan codes and friends carry no information we keep.
            EventType::MISC => Ok(()),
            EventType::KEY => self.handle_key(event.code(), event.value(), event.timestamp()),
            _ => self.output.send_event(event, false),
        }
    }

    /// Handles one key event; split out from [`handle_event`] so tests can
    /// control the timestamp.
    ///
    /// [`handle_event`]: Dispatcher::handle_event
    pub fn handle_key(&mut self, code: u16, value: i32, timestamp: SystemTime) -> Result<()> {
        if !(1..=MAX_KEY_CODE).contains(&code) {
            return self.forward_key(code, value);
        }

        match value {
            0 => {
                self.kbd_pressing.retain(|&pressed| pressed != code);
                self.forward_key(code, value)
            }
            1 => {
                if !self.kbd_pressing.contains(&code) {
                    self.kbd_pressing.push(code);
                }
                self.press_start = Some(timestamp);
                match self.handle_press(code)? {
                    Handle::Consumed => Ok(()),
                    Handle::Unconsumed => self.forward_key(code, value),
                }
            }
            _ => {
                let after_delay = self.is_after_repeat_delay(timestamp);
                match self.handle_repeat(code, after_delay)? {
                    Handle::Consumed => Ok(()),
                    Handle::Unconsumed => self.forward_key(code, value),
                }
            }
        }
    }

    fn forward_key(&mut self, code: u16, value: i32) -> Result<()> {
        self.output
            .send_event(&InputEvent::new(EventType::KEY, code, value), false)
    }

    fn handle_press(&mut self, code: u16) -> Result<Handle> {
        let chord = self.layout.compose_chord(code as u8, &self.kbd_pressing);

        if self.stopped_mode {
            // Only the chord that leaves pass-through mode is recognized.
            let action = self.lookup(chord);
            if matches!(action, Some(Action::ToggleStopped { is_start: true })) {
                self.run_matched_action(chord)?;
                return Ok(Handle::Consumed);
            }
            return Ok(Handle::Unconsumed);
        }
        if self.exclusion.is_excluded() {
            return Ok(Handle::Unconsumed);
        }

        if self.run_matched_action(chord)? {
            return Ok(Handle::Consumed);
        }

        if !self.layout.is_modifier(code) {
            if !self.current_path.is_empty() {
                self.current_path.clear();
                warn!("Key sequence canceled");
            }
            if self.selection_mode {
                return self.selection_press(code);
            }
        }
        Ok(Handle::Unconsumed)
    }

    /// Autorepeat. The kernel only repeats while the key is physically held;
    /// what we do depends on whether the original press was forwarded (the
    /// key is logically down) or consumed by an action.
    fn handle_repeat(&mut self, code: u16, after_delay: bool) -> Result<Handle> {
        if self.output.is_pressed(code) {
            if self.stopped_mode || self.exclusion.is_excluded() {
                return Ok(Handle::Unconsumed);
            }
            let chord = self.layout.compose_chord(code as u8, &self.kbd_pressing);
            if self.lookup(chord).is_none() {
                if self.selection_mode {
                    return self.selection_press(code);
                }
                return Ok(Handle::Unconsumed);
            }
            if !after_delay {
                return Ok(Handle::Consumed);
            }
            // The chord gained an action while the key was already down
            // (a modifier joined): release the key, then run the action.
            self.output.send_key(code, false, false)?;
            self.run_matched_action(chord)?;
            return Ok(Handle::Consumed);
        }

        if !after_delay {
            // Hide the kernel's early repeats of a consumed press.
            return Ok(Handle::Consumed);
        }
        match self.handle_press(code)? {
            Handle::Unconsumed => {
                // The press was consumed originally, so the repeat has to
                // manufacture the press the applications never saw.
                self.output.send_key(code, true, false)?;
                Ok(Handle::Consumed)
            }
            result => Ok(result),
        }
    }

    fn lookup(&self, chord: Chord) -> Option<&Action> {
        self.keymap
            .descend(&self.current_path)
            .and_then(|map| map.lookup(chord))
    }

    /// Looks up `chord` at the current trie position and executes the bound
    /// action. Returns false when nothing is bound.
    fn run_matched_action(&mut self, chord: Chord) -> Result<bool> {
        let action = self
            .keymap
            .descend(&self.current_path)
            .and_then(|map| map.lookup(chord));
        let Some(action) = action else {
            return Ok(false);
        };

        match action {
            Action::MultiStroke(_) => {
                debug!("Multi stroke prefix");
                self.current_path.push(chord);
            }
            Action::Emit(program) => {
                self.current_path.clear();
                Self::run_emit(&self.layout, &mut self.output, self.selection_mode, program)?;
            }
            Action::ToggleSelection => {
                self.current_path.clear();
                self.selection_mode = !self.selection_mode;
                debug!(
                    "{} selection mode",
                    if self.selection_mode { "Enter" } else { "Exit" }
                );
            }
            Action::ToggleStopped { is_start } => {
                let is_start = *is_start;
                self.current_path.clear();
                self.stopped_mode = !is_start;
                self.selection_mode = false;
                info!(
                    "{} pass-through mode",
                    if is_start { "Leaving" } else { "Entering" }
                );
            }
        }
        Ok(true)
    }

    /// Emits an output program: held regular modifiers are lifted around the
    /// whole program, every inner sequence is pressed nested, and selection
    /// mode wraps cursor taps in Shift. All events are temporary.
    fn run_emit(
        layout: &KeyLayout,
        output: &mut VirtualOutput<W>,
        selection_mode: bool,
        program: &OutputProgram,
    ) -> Result<()> {
        if program.is_empty() {
            debug!("Empty key action");
            return Ok(());
        }

        let held: Vec<u16> = output.pressing_keys().to_vec();
        for &code in &held {
            if layout.is_regular_modifier(code) {
                output.send_key(code, false, true)?;
            }
        }

        for sequence in program {
            let wants_shift = selection_mode
                && sequence
                    .last()
                    .is_some_and(|&code| layout.is_cursor(code))
                && !layout.contains_modifier(sequence, Modifier::Shift)
                && !layout.contains_modifier(output.pressing_keys(), Modifier::Shift);
            let added_shift = if wants_shift {
                let shift = layout.modifier_key(Modifier::Shift).map(u16::from);
                if shift.is_none() {
                    warn!("No key is bound for shift; selection not extended");
                }
                shift
            } else {
                None
            };

            if let Some(shift) = added_shift {
                output.send_key(shift, true, true)?;
            }
            for &code in sequence {
                output.send_key(code, true, true)?;
            }
            for &code in sequence.iter().rev() {
                output.send_key(code, false, true)?;
            }
            if let Some(shift) = added_shift {
                output.send_key(shift, false, true)?;
            }
        }

        for &code in &held {
            if layout.is_regular_modifier(code) {
                output.send_key(code, true, true)?;
            }
        }
        Ok(())
    }

    /// A non-modifier key pressed while selection mode is on.
    fn selection_press(&mut self, code: u16) -> Result<Handle> {
        if !self.layout.is_cursor(code) {
            if !self.layout.is_modifier(code) {
                warn!("Selection mode canceled");
                self.selection_mode = false;
            }
            return Ok(Handle::Unconsumed);
        }
        if self
            .layout
            .contains_modifier(self.output.pressing_keys(), Modifier::Shift)
        {
            // The user already holds Shift; nothing to add.
            return Ok(Handle::Unconsumed);
        }

        let Some(shift) = self.layout.modifier_key(Modifier::Shift).map(u16::from) else {
            warn!("No key is bound for shift; selection not extended");
            return Ok(Handle::Unconsumed);
        };

        if self.output.is_pressed(code) {
            // The original press was forwarded before the modifier state
            // settled; take it back so the Shift wrap is clean.
            self.output.send_key(code, false, false)?;
        }
        self.output.send_key(shift, true, true)?;
        self.output.send_key(code, true, true)?;
        self.output.send_key(code, false, true)?;
        self.output.send_key(shift, false, true)?;
        Ok(Handle::Consumed)
    }

    /// True once the repeat timestamp has passed the server's repeat delay;
    /// each firing pushes the reference point forward by one repeat interval
    /// so the action repeats at the server's rate, not the kernel's.
    fn is_after_repeat_delay(&mut self, timestamp: SystemTime) -> bool {
        let start = *self.press_start.get_or_insert(timestamp);
        let elapsed = timestamp.duration_since(start).unwrap_or_default();
        if elapsed > self.timing.delay {
            self.press_start = Some(start + self.timing.interval);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn kbd_pressing(&self) -> &[u16] {
        &self.kbd_pressing
    }

    #[cfg(test)]
    fn output(&self) -> &VirtualOutput<W> {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    use crate::events::test_support::Recorder;
    use crate::layout::tests::{
        test_layout, CAPS, CTRL, KEY_A, KEY_I, KEY_S, KEY_X, LEFT, RIGHT, SHIFT, SPACE, TAB,
    };
    use crate::user_config;

    fn dispatcher(config: &str) -> Dispatcher<Recorder> {
        let layout = test_layout();
        let keymap = user_config::parse(config, &layout).expect("Test config should parse.");
        Dispatcher::new(
            test_layout(),
            keymap,
            RepeatTiming::default(),
            VirtualOutput::new(Recorder::default()),
            ExclusionFlags::new(),
        )
    }

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn press(dispatcher: &mut Dispatcher<Recorder>, code: u8) {
        dispatcher
            .handle_key(code.into(), 1, at(0))
            .expect("Press should not fail.");
    }

    fn release(dispatcher: &mut Dispatcher<Recorder>, code: u8) {
        dispatcher
            .handle_key(code.into(), 0, at(0))
            .expect("Release should not fail.");
    }

    fn key_events(dispatcher: &Dispatcher<Recorder>) -> Vec<(u16, i32)> {
        dispatcher.output().writer_ref().key_events()
    }

    #[test]
    fn remap_should_lift_and_restore_held_modifiers() {
        let mut d = dispatcher("C-i :: Tab\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_I);

        assert_eq!(
            key_events(&d),
            vec![
                (CTRL.into(), 1), // forwarded press
                (CTRL.into(), 0), // lifted around the emit
                (TAB.into(), 1),
                (TAB.into(), 0),
                (CTRL.into(), 1), // restored
            ]
        );
    }

    #[test]
    fn multi_stroke_should_consume_prefix_and_emit_once() {
        let mut d = dispatcher("C-x C-s :: C-s\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_X);
        release(&mut d, KEY_X);
        release(&mut d, CTRL);
        press(&mut d, CTRL);
        press(&mut d, KEY_S);

        let events = key_events(&d);
        let s_code = u16::from(KEY_S);
        assert_eq!(
            events.iter().filter(|&&e| e == (s_code, 1)).count(),
            1,
            "Ctrl-s must be emitted exactly once: {events:?}"
        );
        assert!(
            !events.contains(&(KEY_X.into(), 1)),
            "The prefix stroke must not leak: {events:?}"
        );
    }

    #[test]
    fn foreign_key_should_cancel_a_sequence() {
        let mut d = dispatcher("C-x C-s :: C-s\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_X);
        release(&mut d, KEY_X);
        release(&mut d, CTRL);
        press(&mut d, KEY_A);

        assert!(key_events(&d).contains(&(KEY_A.into(), 1)));
        assert!(d.current_path.is_empty());

        // The sequence is gone: C-s alone has no binding and forwards.
        press(&mut d, CTRL);
        press(&mut d, KEY_S);
        assert!(key_events(&d).contains(&(KEY_S.into(), 1)));
        assert!(!key_events(&d).contains(&(KEY_X.into(), 1)));
    }

    #[test]
    fn modifier_press_should_not_advance_a_sequence() {
        let mut d = dispatcher("C-x C-s :: C-s\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_X);
        release(&mut d, KEY_X);

        // Releasing and re-pressing modifiers keeps the prefix alive.
        release(&mut d, CTRL);
        press(&mut d, CTRL);
        assert_eq!(d.current_path.len(), 1);
    }

    #[test]
    fn selection_mode_should_wrap_cursor_keys_in_shift() {
        let mut d = dispatcher("C-space :: $select\n");

        press(&mut d, CTRL);
        press(&mut d, SPACE);
        release(&mut d, SPACE);
        release(&mut d, CTRL);
        press(&mut d, RIGHT);

        let events = key_events(&d);
        assert_eq!(
            events[events.len() - 4..],
            [
                (SHIFT.into(), 1),
                (RIGHT.into(), 1),
                (RIGHT.into(), 0),
                (SHIFT.into(), 0),
            ]
        );
    }

    #[test]
    fn selection_mode_should_leave_cursor_alone_when_shift_held() {
        let mut d = dispatcher("C-space :: $select\n");

        press(&mut d, CTRL);
        press(&mut d, SPACE);
        release(&mut d, CTRL);
        press(&mut d, SHIFT);
        press(&mut d, LEFT);

        let events = key_events(&d);
        assert_eq!(
            events.last(),
            Some(&(LEFT.into(), 1)),
            "A cursor key with Shift already held forwards unchanged: {events:?}"
        );
    }

    #[test]
    fn selection_mode_should_end_on_a_normal_key() {
        let mut d = dispatcher("C-space :: $select\n");

        press(&mut d, CTRL);
        press(&mut d, SPACE);
        release(&mut d, CTRL);
        press(&mut d, KEY_A);
        release(&mut d, KEY_A);
        press(&mut d, RIGHT);

        let events = key_events(&d);
        assert!(!d.selection_mode);
        assert_eq!(
            events.last(),
            Some(&(RIGHT.into(), 1)),
            "After leaving selection mode cursor keys forward plainly: {events:?}"
        );
        assert!(!events.contains(&(SHIFT.into(), 1)));
    }

    #[test]
    fn stopped_mode_should_pass_everything_until_start() {
        let mut d = dispatcher("C-a :: $stop\nC-s :: $start\nC-i :: Tab\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_A); // $stop, consumed
        press(&mut d, KEY_I); // would remap, but passes through
        release(&mut d, KEY_I);
        press(&mut d, KEY_S); // $start, consumed
        press(&mut d, KEY_I); // remaps again

        let events = key_events(&d);
        assert!(events.contains(&(KEY_I.into(), 1)));
        assert!(events.contains(&(TAB.into(), 1)));
        assert!(!events.contains(&(KEY_A.into(), 1)));
        assert!(!events.contains(&(KEY_S.into(), 1)));
    }

    #[test]
    fn exclusion_should_pass_bindings_through_and_request_reset() {
        let d = dispatcher("C-i :: Tab\n");
        let flags = d.exclusion();
        let mut d = d;

        flags.set_focus_excluded(true);
        assert!(flags.take_reset());

        press(&mut d, CTRL);
        press(&mut d, KEY_I);
        let events = key_events(&d);
        assert!(events.contains(&(KEY_I.into(), 1)));
        assert!(!events.contains(&(TAB.into(), 1)));
    }

    #[test]
    fn pressed_sets_should_balance_after_replay() {
        // Property: after a replay, both pressed sets hold exactly the keys
        // whose press was not balanced by a release.
        let mut d = dispatcher("C-x C-s :: C-s\n");

        let script: &[(u8, i32)] = &[
            (CTRL, 1),
            (KEY_A, 1),
            (KEY_A, 0),
            (CTRL, 0),
            (SHIFT, 1),
            (KEY_I, 1),
            (KEY_I, 0),
            (CAPS, 1),
        ];
        for &(code, value) in script {
            d.handle_key(code.into(), value, at(0)).unwrap();
        }

        let mut expected = vec![u16::from(SHIFT), u16::from(CAPS)];
        expected.sort_unstable();

        let mut kbd: Vec<u16> = d.kbd_pressing().to_vec();
        kbd.sort_unstable();
        assert_eq!(kbd, expected);

        let mut uinput: Vec<u16> = d.output().pressing_keys().to_vec();
        uinput.sort_unstable();
        assert_eq!(uinput, expected);
    }

    #[test]
    fn repeat_should_be_swallowed_before_the_delay() {
        let mut d = dispatcher("C-i :: Tab\n");

        d.handle_key(CTRL.into(), 1, at(0)).unwrap();
        d.handle_key(KEY_I.into(), 1, at(0)).unwrap();
        let tab_presses = |d: &Dispatcher<Recorder>| {
            key_events(d)
                .iter()
                .filter(|&&e| e == (u16::from(TAB), 1))
                .count()
        };
        assert_eq!(tab_presses(&d), 1);

        // Kernel repeats before the server's delay stay hidden.
        d.handle_key(KEY_I.into(), 2, at(100)).unwrap();
        d.handle_key(KEY_I.into(), 2, at(400)).unwrap();
        assert_eq!(tab_presses(&d), 1);

        // Past the delay the remap repeats.
        d.handle_key(KEY_I.into(), 2, at(700)).unwrap();
        assert_eq!(tab_presses(&d), 2);
    }

    #[test]
    fn repeat_of_forwarded_key_should_forward() {
        let mut d = dispatcher("C-i :: Tab\n");

        d.handle_key(KEY_A.into(), 1, at(0)).unwrap();
        d.handle_key(KEY_A.into(), 2, at(100)).unwrap();
        d.handle_key(KEY_A.into(), 2, at(800)).unwrap();

        let events = key_events(&d);
        assert_eq!(
            events,
            vec![(KEY_A.into(), 1), (KEY_A.into(), 2), (KEY_A.into(), 2)]
        );
    }

    #[test]
    fn repeat_gaining_a_modifier_should_release_then_remap() {
        let mut d = dispatcher("C-i :: Tab\n");

        // Plain `i` forwards, then Ctrl joins while `i` is held.
        d.handle_key(KEY_I.into(), 1, at(0)).unwrap();
        d.handle_key(CTRL.into(), 1, at(10)).unwrap();
        d.handle_key(KEY_I.into(), 2, at(800)).unwrap();

        let events = key_events(&d);
        let i_code = u16::from(KEY_I);
        let release_index = events
            .iter()
            .position(|&e| e == (i_code, 0))
            .expect("The stale `i` press must be released.");
        let tab_index = events
            .iter()
            .position(|&e| e == (u16::from(TAB), 1))
            .expect("The remap must fire after the release.");
        assert!(release_index < tab_index);
    }

    #[test]
    fn misc_events_should_be_dropped_and_syn_forwarded() {
        let mut d = dispatcher("C-i :: Tab\n");

        d.handle_event(&InputEvent::new(EventType::MISC, 4, 458756))
            .unwrap();
        assert!(d.output().writer_ref().events.is_empty());

        d.handle_event(&InputEvent::new(EventType::KEY, KEY_A.into(), 1))
            .unwrap();
        d.handle_event(&InputEvent::new(EventType::SYNCHRONIZATION, 0, 0))
            .unwrap();
        let written = d.output().writer_ref().written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].0, EventType::SYNCHRONIZATION.0);
    }

    #[test]
    fn out_of_range_codes_should_pass_through_untouched() {
        let mut d = dispatcher("C-i :: Tab\n");

        d.handle_key(300, 1, at(0)).unwrap();
        assert_eq!(key_events(&d), vec![(300, 1)]);
        assert!(d.kbd_pressing().is_empty());
    }

    #[test]
    fn install_should_reset_sequence_and_selection() {
        let mut d = dispatcher("C-x C-s :: C-s\n");

        press(&mut d, CTRL);
        press(&mut d, KEY_X);
        assert_eq!(d.current_path.len(), 1);

        let layout = test_layout();
        let keymap = user_config::parse("C-i :: Tab\n", &layout).unwrap();
        d.install(layout, keymap, RepeatTiming::default());

        assert!(d.current_path.is_empty());
        assert!(!d.selection_mode);
    }
}
