//! Watches the X server for focus changes and keyboard-mapping changes.
//!
//! Focus changes drive the window-class exclusion flag. Mapping changes come
//! in two flavors: a full layout switch (rules change followed by keymap and
//! modmap changes), which is *undone* by writing the saved mapping back so
//! runtime modifier rebinds cannot break the grab; and a bare modifier-map
//! change, which refreshes the snapshot and asks the daemon to rebuild its
//! own tables instead.

use anyhow::{bail, Result};
use log::{debug, warn};
use x11rb::protocol::xproto::Mapping;
use x11rb::protocol::Event;

use crate::dispatcher::ExclusionFlags;
use crate::events::EventWriter;
use crate::uinput::VirtualOutput;
use crate::xserver::{KeyboardSnapshot, XContext};

/// How long to wait for the mapping events that follow a rules change.
const MAPPING_SETTLE_MS: u16 = 200;

/// Windows the server reports for "no focus" states.
fn is_valid_window(window: u32) -> bool {
    // 0 is None, 1 is PointerRoot.
    window > 1
}

#[derive(Default)]
struct ChangeFlags {
    rules_changed: bool,
    mapping_changed: bool,
    modifier_changed: bool,
}

/// What the daemon must do after a batch of X events.
#[derive(Default)]
pub struct WatchEffect {
    /// Rebuild the key layout and reload the configuration.
    pub reload: bool,
}

pub struct XWatcher {
    excluded_classes: Vec<String>,
    focus_window: u32,
    snapshot: Option<KeyboardSnapshot>,
    /// Latched after a failed restore so we never save a bad state.
    snapshot_failed: bool,
}

impl XWatcher {
    pub fn new(
        x: &XContext,
        excluded_classes: Vec<String>,
        flags: &ExclusionFlags,
    ) -> Result<XWatcher> {
        x.select_property_events()?;

        let focus_window = x.focused_window()?;
        if !is_valid_window(focus_window) {
            bail!("X reported a special input focus window");
        }

        let mut watcher = XWatcher {
            excluded_classes,
            focus_window,
            snapshot: None,
            snapshot_failed: false,
        };

        let excluded = match watcher.class_excluded(x, focus_window) {
            Ok(excluded) => excluded,
            Err(error) => {
                warn!("Failed to get class of the focus window: {error:#}");
                false
            }
        };
        debug!("Input focus window exclusion: {excluded}");
        flags.set_focus_excluded(excluded);

        watcher.take_snapshot(x);
        Ok(watcher)
    }

    /// Drains and reacts to everything the X connection has queued.
    pub fn process<W: EventWriter>(
        &mut self,
        x: &XContext,
        output: &mut VirtualOutput<W>,
        flags: &ExclusionFlags,
    ) -> Result<WatchEffect> {
        let mut changes = ChangeFlags::default();
        self.drain_events(x, flags, &mut changes)?;

        let mut effect = WatchEffect::default();
        if changes.rules_changed && self.snapshot.is_some() {
            // The server sends the rules change first and the new keymap and
            // modmap shortly after; wait the batch out before undoing it.
            if !x.wait_readable(MAPPING_SETTLE_MS)? {
                debug!("Timed out waiting for the mapping change batch");
            }
            let mut follow_up = ChangeFlags::default();
            self.drain_events(x, flags, &mut follow_up)?;
            if follow_up.mapping_changed && !follow_up.rules_changed {
                if !x.wait_readable(MAPPING_SETTLE_MS)? {
                    debug!("Timed out waiting for the modifier change");
                }
                self.drain_events(x, flags, &mut follow_up)?;
            }

            let held: Vec<u16> = output.pressing_keys().to_vec();
            for &code in &held {
                output.send_key(code, false, true)?;
            }
            self.restore_snapshot(x);
            for &code in &held {
                output.send_key(code, true, true)?;
            }

            let mut aftermath = ChangeFlags::default();
            self.drain_events(x, flags, &mut aftermath)?;
        } else if changes.modifier_changed {
            if self.snapshot.is_some() {
                warn!("Modifier mapping changed without an XKB rules change");
                self.snapshot = None;
                self.take_snapshot(x);
            }
            effect.reload = true;
        }

        Ok(effect)
    }

    /// Re-saves the server state so the shutdown restore sees the newest
    /// mapping. Called right before the run is torn down.
    pub fn pre_finalize(&mut self, x: &XContext) {
        self.take_snapshot(x);
    }

    /// Restores the saved mapping on clean shutdown; a restart discards it
    /// so a later user-initiated keymap is never overwritten.
    pub fn finalize(&mut self, x: &XContext, restore: bool) {
        if restore {
            self.restore_snapshot(x);
        }
    }

    fn drain_events(
        &mut self,
        x: &XContext,
        flags: &ExclusionFlags,
        changes: &mut ChangeFlags,
    ) -> Result<()> {
        while let Some(event) = x.poll_event()? {
            match event {
                Event::PropertyNotify(event) => {
                    if event.atom == x.net_active_window {
                        self.update_focus(x, flags);
                    } else if event.atom == x.xkb_rules_names {
                        debug!("XKB rules changed");
                        changes.rules_changed = true;
                    }
                }
                Event::MappingNotify(event) => {
                    if event.request == Mapping::KEYBOARD {
                        debug!("MappingKeyboard");
                        changes.mapping_changed = true;
                    } else if event.request == Mapping::MODIFIER {
                        debug!("MappingModifier");
                        changes.modifier_changed = true;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn update_focus(&mut self, x: &XContext, flags: &ExclusionFlags) {
        let window = match x.focused_window() {
            Ok(window) => window,
            Err(error) => {
                warn!("Failed to look up the focus window: {error:#}");
                return;
            }
        };
        if window == self.focus_window {
            return;
        }
        if !is_valid_window(window) {
            warn!("X reported a special input focus window");
            return;
        }
        self.focus_window = window;

        match self.class_excluded(x, window) {
            Ok(excluded) => {
                debug!("Input focus window exclusion: {excluded}");
                flags.set_focus_excluded(excluded);
            }
            // Skip this focus change; the exclusion state keeps its value.
            Err(error) => warn!("Failed to get class of the focus window: {error:#}"),
        }
    }

    /// Walks up from `window` until a WM_CLASS is found and matches it
    /// against the excluded class names.
    fn class_excluded(&self, x: &XContext, mut window: u32) -> Result<bool> {
        if self.excluded_classes.is_empty() {
            return Ok(false);
        }
        loop {
            if let Some((instance, class)) = x.window_class(window)? {
                return Ok(self
                    .excluded_classes
                    .iter()
                    .any(|name| *name == instance || *name == class));
            }
            let (root, parent) = x.window_parent(window)?;
            if window == root || parent == root || parent == 0 {
                bail!("no window class found up to the root");
            }
            window = parent;
        }
    }

    fn take_snapshot(&mut self, x: &XContext) {
        if self.snapshot.is_some() || self.snapshot_failed {
            return;
        }
        match x.take_snapshot() {
            Ok(snapshot) => self.snapshot = Some(snapshot),
            Err(error) => warn!("Failed to save the keyboard mapping: {error:#}"),
        }
    }

    fn restore_snapshot(&mut self, x: &XContext) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };
        if let Err(error) = x.restore_snapshot(&snapshot) {
            self.snapshot_failed = true;
            warn!("Failed to restore the keyboard mapping: {error:#}");
        }
    }
}
