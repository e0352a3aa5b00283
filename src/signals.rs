//! Signal handling for the poll loop.
//!
//! Each signal sets a flag and writes a byte into a self-pipe registered
//! with the reactor, so a signal arriving mid-poll wakes it immediately.
//! SIGINT/SIGTERM request shutdown, SIGHUP a full restart, SIGUSR1 a
//! keymap and configuration reload.

use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::{flag, low_level::pipe};

pub struct Signals {
    sigint: Arc<AtomicBool>,
    sigterm: Arc<AtomicBool>,
    sighup: Arc<AtomicBool>,
    sigusr1: Arc<AtomicBool>,
    wake: UnixStream,
}

impl Signals {
    pub fn install() -> Result<Signals> {
        let (read, write) = UnixStream::pair().context("Failed to create signal pipe")?;
        read.set_nonblocking(true)
            .context("Failed to make signal pipe non-blocking")?;
        write
            .set_nonblocking(true)
            .context("Failed to make signal pipe non-blocking")?;

        let signals = Signals {
            sigint: Arc::new(AtomicBool::new(false)),
            sigterm: Arc::new(AtomicBool::new(false)),
            sighup: Arc::new(AtomicBool::new(false)),
            sigusr1: Arc::new(AtomicBool::new(false)),
            wake: read,
        };

        for (signal, caught) in [
            (SIGINT, &signals.sigint),
            (SIGTERM, &signals.sigterm),
            (SIGHUP, &signals.sighup),
            (SIGUSR1, &signals.sigusr1),
        ] {
            flag::register(signal, Arc::clone(caught))
                .with_context(|| format!("Failed to register handler for signal {signal}"))?;
            pipe::register(signal, write.try_clone()?)
                .with_context(|| format!("Failed to register wake pipe for signal {signal}"))?;
        }

        Ok(signals)
    }

    /// The shutdown signal caught so far, if any. Not cleared; shutdown is
    /// terminal.
    pub fn shutdown(&self) -> Option<&'static str> {
        if self.sigint.load(Ordering::SeqCst) {
            Some("SIGINT")
        } else if self.sigterm.load(Ordering::SeqCst) {
            Some("SIGTERM")
        } else {
            None
        }
    }

    pub fn take_restart(&self) -> bool {
        self.sighup.swap(false, Ordering::SeqCst)
    }

    pub fn take_reload(&self) -> bool {
        self.sigusr1.swap(false, Ordering::SeqCst)
    }

    /// The fd the reactor polls for signal wakeups.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }

    /// Empties the wake pipe after a wakeup.
    pub fn drain(&self) {
        let mut buffer = [0u8; 64];
        while let Ok(length) = (&self.wake).read(&mut buffer) {
            if length == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, Instant};

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for {what}.");
            std::thread::yield_now();
        }
    }

    #[test]
    fn raise_should_set_flag_and_wake_the_pipe() {
        let signals = Signals::install().expect("Signal installation should succeed.");

        signal_hook::low_level::raise(SIGUSR1).expect("Failed to raise SIGUSR1.");

        wait_for("the SIGUSR1 flag", || signals.take_reload());
        assert!(!signals.take_reload(), "take_reload must clear the flag.");

        let mut buffer = [0u8; 8];
        wait_for("a byte on the wake pipe", || {
            (&signals.wake).read(&mut buffer).is_ok()
        });
        signals.drain();
    }

    #[test]
    fn shutdown_should_stay_latched() {
        let signals = Signals::install().expect("Signal installation should succeed.");

        signal_hook::low_level::raise(SIGTERM).expect("Failed to raise SIGTERM.");
        wait_for("the SIGTERM flag", || signals.shutdown().is_some());
        assert_eq!(signals.shutdown(), Some("SIGTERM"));
        signals.drain();
    }
}
