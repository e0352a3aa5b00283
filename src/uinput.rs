//! The virtual output device and the bookkeeping around writes to it.
//!
//! [`VirtualKeyboard`] creates a uinput device mirroring the physical
//! keyboard's key capabilities. [`VirtualOutput`] wraps the write side and
//! owns the two invariants every write must respect: redundant SYN_REPORTs
//! are coalesced, and the set of logically pressed keys tracks exactly the
//! non-temporary press/release traffic. Synthesized ("temporary") events
//! bypass both, so a remap in flight never disturbs what the dispatcher
//! believes the applications can see.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{BusType, EventType, InputEvent, InputId};
use log::trace;

use crate::chord::MAX_KEY_CODE;
use crate::events::{self, EventWriter};
use crate::keyboard::KeyboardDevice;

const DEVICE_NAME: &str = "chordd";

/// The uinput device node. Dropping it destroys the kernel device.
pub struct VirtualKeyboard {
    device: VirtualDevice,
    /// Duplicated fd for the loopback read path.
    io: File,
}

impl VirtualKeyboard {
    /// Creates the uinput device, mirroring every key of the real keyboard.
    pub fn create(keyboard: &KeyboardDevice) -> Result<VirtualKeyboard> {
        let keys = keyboard
            .device()
            .supported_keys()
            .context("Keyboard device reports no keys")?;

        let device = VirtualDeviceBuilder::new()
            .context("Failed to open uinput. Maybe the uinput module is not loaded.")?
            .name(DEVICE_NAME)
            .input_id(InputId::new(BusType::BUS_VIRTUAL, 1, 1, 1))
            .with_keys(keys)
            .context("Failed to set key bits on uinput device")?
            .build()
            .context("Failed to create uinput device")?;

        let fd = device.as_raw_fd();
        let io = events::dup_file(unsafe { BorrowedFd::borrow_raw(fd) })
            .context("Failed to duplicate uinput fd")?;

        Ok(VirtualKeyboard { device, io })
    }

    /// Events the kernel echoes back on the uinput fd (LED state and other
    /// downstream traffic); the caller forwards them to the real device.
    pub fn read_loopback(&mut self) -> Result<Vec<InputEvent>> {
        events::read_events(&mut self.io).context("Failed to read uinput device")
    }

    /// A raw-write handle for the dispatcher's output path.
    pub fn writer(&self) -> Result<UinputWriter> {
        let fd = self.device.as_raw_fd();
        let io = events::dup_file(unsafe { BorrowedFd::borrow_raw(fd) })
            .context("Failed to duplicate uinput fd")?;
        Ok(UinputWriter { io })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

/// Writes events to the uinput device fd.
pub struct UinputWriter {
    io: File,
}

impl EventWriter for UinputWriter {
    fn write_event(&mut self, event: &InputEvent) -> Result<()> {
        events::write_event(&mut self.io, event).context("Failed to write uinput device")
    }
}

/// The stateful write side of the device pair.
pub struct VirtualOutput<W> {
    writer: W,
    pressing: Vec<u16>,
    last_event_type: u16,
}

impl<W: EventWriter> VirtualOutput<W> {
    pub fn new(writer: W) -> VirtualOutput<W> {
        VirtualOutput {
            writer,
            pressing: Vec::new(),
            last_event_type: 0,
        }
    }

    /// Key codes currently pressed from the applications' point of view.
    pub fn pressing_keys(&self) -> &[u16] {
        &self.pressing
    }

    pub fn is_pressed(&self, code: u16) -> bool {
        self.pressing.contains(&code)
    }

    /// Writes one event. Non-temporary events update the pressed-key
    /// bookkeeping, drop releases of keys that are not logically pressed,
    /// and coalesce consecutive SYN_REPORTs. Temporary events skip all of
    /// that.
    pub fn send_event(&mut self, event: &InputEvent, temporary: bool) -> Result<()> {
        if !temporary {
            match event.event_type() {
                EventType::SYNCHRONIZATION => {
                    if self.last_event_type == EventType::SYNCHRONIZATION.0 {
                        return Ok(());
                    }
                }
                EventType::KEY if valid_key_code(event.code()) => match event.value() {
                    0 => {
                        let Some(index) =
                            self.pressing.iter().position(|&code| code == event.code())
                        else {
                            return Ok(());
                        };
                        self.pressing.remove(index);
                    }
                    1 => {
                        if !self.pressing.contains(&event.code()) {
                            self.pressing.push(event.code());
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        self.last_event_type = event.event_type().0;
        trace!(
            "Write to uinput: type={:02x} code={} value={} temporary={}",
            event.event_type().0,
            event.code(),
            event.value(),
            temporary
        );
        self.writer.write_event(event)
    }

    /// Writes a key press or release followed by a SYN_REPORT.
    pub fn send_key(&mut self, code: u16, press: bool, temporary: bool) -> Result<()> {
        let value = i32::from(press);
        self.send_event(&InputEvent::new(EventType::KEY, code, value), temporary)?;
        self.send_event(
            &InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            temporary,
        )
    }

    #[cfg(test)]
    pub fn writer_ref(&self) -> &W {
        &self.writer
    }
}

fn valid_key_code(code: u16) -> bool {
    (1..=MAX_KEY_CODE).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::Recorder;

    fn output() -> VirtualOutput<Recorder> {
        VirtualOutput::new(Recorder::default())
    }

    #[test]
    fn send_key_should_track_pressing_keys() {
        let mut out = output();

        out.send_key(30, true, false).unwrap();
        assert!(out.is_pressed(30));

        out.send_key(30, false, false).unwrap();
        assert!(!out.is_pressed(30));
    }

    #[test]
    fn send_event_should_swallow_release_of_unpressed_key() {
        let mut out = output();

        out.send_key(30, false, false).unwrap();
        // The release never reaches the device.
        assert!(out.writer_ref().key_events().is_empty());
    }

    #[test]
    fn temporary_events_should_not_disturb_bookkeeping() {
        let mut out = output();

        out.send_key(30, true, true).unwrap();
        assert!(!out.is_pressed(30));

        out.send_key(30, true, false).unwrap();
        out.send_key(30, false, true).unwrap();
        assert!(out.is_pressed(30), "A temporary release must not unpress.");
    }

    #[test]
    fn consecutive_syns_should_be_coalesced() {
        let mut out = output();

        out.send_key(30, true, false).unwrap();
        out.send_event(&InputEvent::new(EventType::SYNCHRONIZATION, 0, 0), false)
            .unwrap();
        out.send_event(&InputEvent::new(EventType::SYNCHRONIZATION, 0, 0), false)
            .unwrap();
        out.send_key(31, true, false).unwrap();

        let written = out.writer_ref().written();
        let syn = EventType::SYNCHRONIZATION.0;
        for pair in written.windows(2) {
            assert!(
                !(pair[0].0 == syn && pair[1].0 == syn),
                "No two consecutive SYN_REPORTs may be written: {written:?}"
            );
        }
    }

    #[test]
    fn autorepeat_values_should_pass_through_untracked() {
        let mut out = output();

        out.send_event(&InputEvent::new(EventType::KEY, 30, 2), false)
            .unwrap();
        assert!(!out.is_pressed(30));
        assert_eq!(out.writer_ref().key_events(), vec![(30, 2)]);
    }
}
