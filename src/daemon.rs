//! One initialize→run→finalize cycle of the remapper.
//!
//! [`run`] wires the X connection, the device pair, the dispatcher and the
//! watchers together and drives them from a single poll loop. It returns
//! how the run ended; the caller decides whether to restart. Any error
//! escaping the loop tears the run down (devices are released by drop) and
//! is retried by the outer loop in `main`.

use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::info;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::dispatcher::{Dispatcher, ExclusionFlags};
use crate::events::EventWriter;
use crate::keyboard::KeyboardDevice;
use crate::layout::KeyLayout;
use crate::signals::Signals;
use crate::uinput::{VirtualKeyboard, VirtualOutput};
use crate::user_config;
use crate::x_watcher::XWatcher;
use crate::xserver::XContext;

/// Command line switches the daemon cares about.
pub struct Options {
    pub config_file: PathBuf,
    pub device_file: Option<PathBuf>,
    pub exclude_focus_class: Vec<String>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// SIGINT/SIGTERM: restore the saved mapping and exit.
    Shutdown,
    /// SIGHUP: rebuild everything, not counted against the retry budget.
    Restart,
}

#[derive(Debug, Error)]
pub enum RunError {
    /// Not worth retrying (no display, broken configuration).
    #[error(transparent)]
    Fatal(anyhow::Error),
    /// Transient (device churn, X restart); retried with backoff.
    #[error(transparent)]
    Retry(anyhow::Error),
}

pub fn run(
    options: &Options,
    signals: &Signals,
    exclusion: &ExclusionFlags,
) -> Result<Outcome, RunError> {
    let x = XContext::connect().map_err(RunError::Fatal)?;
    let mut watcher =
        XWatcher::new(&x, options.exclude_focus_class.clone(), exclusion).map_err(RunError::Retry)?;

    let layout = KeyLayout::from_tables(&x.server_tables().map_err(RunError::Retry)?);
    let keymap = user_config::load(&options.config_file, &layout).map_err(RunError::Fatal)?;
    let timing = x.repeat_timing().map_err(RunError::Retry)?;

    let mut keyboard = KeyboardDevice::open(options.device_file.as_deref()).map_err(RunError::Retry)?;
    let mut virtual_kbd = VirtualKeyboard::create(&keyboard).map_err(RunError::Retry)?;
    let writer = virtual_kbd.writer().map_err(RunError::Retry)?;

    let mut dispatcher = Dispatcher::new(
        layout,
        keymap,
        timing,
        VirtualOutput::new(writer),
        exclusion.clone(),
    );

    info!("Remapping started");
    let outcome = event_loop(
        options,
        signals,
        exclusion,
        &x,
        &mut watcher,
        &mut keyboard,
        &mut virtual_kbd,
        &mut dispatcher,
    )
    .map_err(RunError::Retry)?;

    info!(
        "{}",
        match outcome {
            Outcome::Shutdown => "Initiating shutdown",
            Outcome::Restart => "Initiating restart",
        }
    );

    watcher.pre_finalize(&x);
    // Destroy the virtual device and release the grab before the mapping
    // is written back.
    drop(virtual_kbd);
    drop(keyboard);
    watcher.finalize(&x, outcome == Outcome::Shutdown);

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn event_loop<W: EventWriter>(
    options: &Options,
    signals: &Signals,
    exclusion: &ExclusionFlags,
    x: &XContext,
    watcher: &mut XWatcher,
    keyboard: &mut KeyboardDevice,
    virtual_kbd: &mut VirtualKeyboard,
    dispatcher: &mut Dispatcher<W>,
) -> Result<Outcome> {
    loop {
        if let Some(signal) = signals.shutdown() {
            info!("Caught {signal}");
            return Ok(Outcome::Shutdown);
        }
        if signals.take_restart() {
            info!("Caught SIGHUP");
            return Ok(Outcome::Restart);
        }
        if signals.take_reload() {
            reload(options, x, dispatcher)?;
        }
        if exclusion.take_reset() {
            dispatcher.reset_state();
        }

        let keyboard_fd = unsafe { BorrowedFd::borrow_raw(keyboard.as_raw_fd()) };
        let uinput_fd = unsafe { BorrowedFd::borrow_raw(virtual_kbd.as_raw_fd()) };
        let mut fds = [
            PollFd::new(signals.wake_fd(), PollFlags::POLLIN),
            PollFd::new(x.poll_fd(), PollFlags::POLLIN),
            PollFd::new(uinput_fd, PollFlags::POLLIN),
            PollFd::new(keyboard_fd, PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => return Err(error).context("poll failed"),
        }
        let state: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        let trouble = PollFlags::POLLHUP | PollFlags::POLLERR;
        if state[2].intersects(trouble) {
            bail!("Hang up on uinput device");
        }
        if state[3].intersects(trouble) {
            bail!("Hang up on keyboard device");
        }

        if state[0].intersects(PollFlags::POLLIN) {
            signals.drain();
            // Re-check the flags before touching any device.
            continue;
        }

        // The X connection may have buffered events regardless of fd
        // readability, so the watcher always gets a chance to drain it.
        let effect = watcher.process(x, dispatcher.output_mut(), exclusion)?;
        if effect.reload {
            info!("Keyboard mapping changed");
            reload(options, x, dispatcher)?;
        }

        if state[2].intersects(PollFlags::POLLIN) {
            for event in virtual_kbd.read_loopback()? {
                keyboard.write_event(&event)?;
            }
        }

        if state[3].intersects(PollFlags::POLLIN) {
            for event in keyboard.read_events()? {
                dispatcher.handle_event(&event)?;
            }
        }
    }
}

/// Rebuilds the layout from the server and re-reads the configuration.
/// Used for SIGUSR1 and after a modifier-mapping change.
fn reload<W: EventWriter>(
    options: &Options,
    x: &XContext,
    dispatcher: &mut Dispatcher<W>,
) -> Result<()> {
    info!("Reloading key layout and configuration");
    let layout = KeyLayout::from_tables(&x.server_tables()?);
    let keymap = user_config::load(&options.config_file, &layout)?;
    let timing = x.repeat_timing()?;
    dispatcher.install(layout, keymap, timing);
    Ok(())
}
