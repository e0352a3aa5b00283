//! The physical keyboard: autodetection, exclusive grab, reads and the
//! loopback write path.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use evdev::{Device, EventType, InputEvent, Key};
use log::{debug, info};

use crate::events;

/// Opens, probes and exclusively grabs one keyboard device.
pub struct KeyboardDevice {
    device: Device,
    /// Duplicated fd for raw writes (stuck-key releases, loopback forwards).
    io: File,
    path: PathBuf,
}

impl KeyboardDevice {
    /// Opens `path` if given, otherwise scans `/dev/input/event0..31` for
    /// the first node that looks like a keyboard. The device is grabbed
    /// exclusively after a release has been written for every key it
    /// supports, so no key stays logically stuck in the kernel.
    pub fn open(path: Option<&Path>) -> Result<KeyboardDevice> {
        let (device, path) = match path {
            Some(path) => {
                let device = Device::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                (device, path.to_path_buf())
            }
            None => find_keyboard().context(
                "Can not find keyboard device. Maybe you need root privilege to run chordd.",
            )?,
        };

        info!(
            "Using keyboard device {} ({})",
            path.display(),
            device.name().unwrap_or("unnamed")
        );

        let fd = device.as_raw_fd();
        let io = events::dup_file(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) })
            .context("Failed to duplicate keyboard fd")?;

        let mut keyboard = KeyboardDevice { device, io, path };
        keyboard.release_all_keys()?;
        keyboard
            .device
            .grab()
            .context("Failed to grab keyboard device")?;
        Ok(keyboard)
    }

    /// Writes a release for every supported key, then one SYN_REPORT.
    fn release_all_keys(&mut self) -> Result<()> {
        let keys: Vec<u16> = self
            .device
            .supported_keys()
            .map(|keys| keys.iter().map(|key| key.code()).collect())
            .unwrap_or_default();
        debug!("Releasing {} keys before grab", keys.len());

        for code in keys {
            events::write_event(&mut self.io, &InputEvent::new(EventType::KEY, code, 0))
                .context("Failed to write release to keyboard device")?;
        }
        events::write_event(
            &mut self.io,
            &InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        )
        .context("Failed to write SYN to keyboard device")?;
        Ok(())
    }

    /// Drains the events currently readable on the device.
    pub fn read_events(&mut self) -> Result<Vec<InputEvent>> {
        let events = self
            .device
            .fetch_events()
            .context("Failed to read keyboard device")?
            .collect();
        Ok(events)
    }

    /// Forwards an event (uinput loopback, e.g. LED state) to the device.
    pub fn write_event(&mut self, event: &InputEvent) -> Result<()> {
        events::write_event(&mut self.io, event).context("Failed to write keyboard device")
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.device.as_raw_fd()
    }
}

impl Drop for KeyboardDevice {
    fn drop(&mut self) {
        if let Err(error) = self.device.ungrab() {
            debug!("Failed to ungrab keyboard device: {error}");
        }
    }
}

fn find_keyboard() -> Result<(Device, PathBuf)> {
    for index in 0..32 {
        let path = PathBuf::from(format!("/dev/input/event{index}"));
        let Ok(device) = Device::open(&path) else {
            continue;
        };
        if is_keyboard(&device) {
            info!("Found keyboard device: {}", path.display());
            return Ok((device, path));
        }
    }
    bail!("no suitable device under /dev/input");
}

/// A keyboard for our purposes: produces key events, is not a pointing
/// device, and covers the main letter row.
fn is_keyboard(device: &Device) -> bool {
    let Some(keys) = device.supported_keys() else {
        return false;
    };
    let has_rel = device
        .supported_relative_axes()
        .is_some_and(|axes| axes.iter().next().is_some());
    let has_abs = device
        .supported_absolute_axes()
        .is_some_and(|axes| axes.iter().next().is_some());
    if has_rel || has_abs {
        return false;
    }
    (Key::KEY_Q.code()..=Key::KEY_P.code()).all(|code| keys.contains(Key::new(code)))
}
