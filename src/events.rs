//! Raw evdev event I/O shared by the keyboard and uinput sides.
//!
//! The `evdev` crate handles device setup and timestamped reads from the
//! grabbed keyboard, but event *writes* (and the loopback reads from the
//! uinput fd) need byte-level control, so both run over plain duplicated
//! file descriptors here. Reads retry on EINTR; writes loop until every
//! byte is consumed.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::os::fd::BorrowedFd;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use evdev::{EventType, InputEvent};

pub const EVENT_SIZE: usize = mem::size_of::<libc::input_event>();

/// Enough room for one kernel burst per wakeup.
const READ_BATCH: usize = 64;

/// Sink for synthesized and forwarded events. The production implementation
/// writes to the uinput device; tests substitute a recorder.
pub trait EventWriter {
    fn write_event(&mut self, event: &InputEvent) -> Result<()>;
}

/// Duplicates a device fd into a `File` usable for raw reads and writes.
pub fn dup_file(fd: BorrowedFd<'_>) -> std::io::Result<File> {
    Ok(File::from(fd.try_clone_to_owned()?))
}

fn to_raw(event: &InputEvent) -> libc::input_event {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    libc::input_event {
        time: libc::timeval {
            tv_sec: now.as_secs() as libc::time_t,
            tv_usec: now.subsec_micros() as libc::suseconds_t,
        },
        type_: event.event_type().0,
        code: event.code(),
        value: event.value(),
    }
}

/// Writes one event, stamped with the current time.
pub fn write_event(file: &mut File, event: &InputEvent) -> std::io::Result<()> {
    let raw = to_raw(event);
    // A plain struct of integers; viewing it as bytes is sound.
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::addr_of!(raw).cast::<u8>(), EVENT_SIZE)
    };

    let mut rest = bytes;
    while !rest.is_empty() {
        match file.write(rest) {
            Ok(written) => rest = &rest[written..],
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// Reads whatever events are currently available (at most one batch).
pub fn read_events(file: &mut File) -> std::io::Result<Vec<InputEvent>> {
    let mut buffer = [0u8; EVENT_SIZE * READ_BATCH];
    let length = loop {
        match file.read(&mut buffer) {
            Ok(length) => break length,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    };

    let mut events = Vec::with_capacity(length / EVENT_SIZE);
    for chunk in buffer[..length].chunks_exact(EVENT_SIZE) {
        let raw: libc::input_event =
            unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast()) };
        events.push(InputEvent::new(EventType(raw.type_), raw.code, raw.value));
    }
    Ok(events)
}

/// A capturing [`EventWriter`] so the dispatch pipeline can be exercised
/// without a kernel device.
#[cfg(test)]
pub mod test_support {
    use super::*;

    #[derive(Default)]
    pub struct Recorder {
        pub events: Vec<InputEvent>,
    }

    impl EventWriter for Recorder {
        fn write_event(&mut self, event: &InputEvent) -> Result<()> {
            self.events
                .push(InputEvent::new(event.event_type(), event.code(), event.value()));
            Ok(())
        }
    }

    impl Recorder {
        /// The `(type, code, value)` triples written so far.
        pub fn written(&self) -> Vec<(u16, u16, i32)> {
            self.events
                .iter()
                .map(|event| (event.event_type().0, event.code(), event.value()))
                .collect()
        }

        /// Key events only, as `(code, value)` pairs.
        pub fn key_events(&self) -> Vec<(u16, i32)> {
            self.events
                .iter()
                .filter(|event| event.event_type() == EventType::KEY)
                .map(|event| (event.code(), event.value()))
                .collect()
        }
    }
}
