use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use chordd::daemon::{self, Options, Outcome, RunError};
use chordd::dispatcher::ExclusionFlags;
use chordd::im_monitor::ImMonitor;
use chordd::signals::Signals;
use clap::Parser;
use log::{error, info, warn};

/// Consecutive error restarts tolerated before giving up.
const MAX_ERROR_RETRIES: u32 = 10;

#[derive(Parser, Debug)]
#[command(version, about = "An editor-style key chord remapper daemon for X11.", long_about = None)]
struct Args {
    /// Keyboard device file (autodetected when omitted).
    #[arg(short = 'd', long = "device-file", value_name = "devicefile")]
    device_file: Option<PathBuf>,

    /// Exclude a class of input focus window (can be given multiple times).
    #[arg(short = 'e', long = "exclude-focus-class", value_name = "classname")]
    exclude_focus_class: Vec<String>,

    /// Exclude an input method of fcitx (can be given multiple times).
    #[arg(short = 'f', long = "exclude-fcitx-im", value_name = "inputmethod")]
    exclude_fcitx_im: Vec<String>,

    /// Path to the configuration file.
    #[arg(value_name = "configuration-file")]
    config_file: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Init info logging; RUST_LOG overrides.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let signals = Signals::install()?;
    let exclusion = ExclusionFlags::new();

    // The input method watcher spans restarts; losing it degrades the
    // daemon, it does not stop it.
    let _im_monitor = if args.exclude_fcitx_im.is_empty() {
        None
    } else {
        match ImMonitor::start(args.exclude_fcitx_im.clone(), exclusion.clone()) {
            Ok(monitor) => Some(monitor),
            Err(error) => {
                warn!("Input method watcher disabled: {error:#}");
                None
            }
        }
    };

    let options = Options {
        config_file: args.config_file,
        device_file: args.device_file,
        exclude_focus_class: args.exclude_focus_class,
    };

    let mut error_retries = 0u32;
    loop {
        match daemon::run(&options, &signals, &exclusion) {
            Ok(Outcome::Shutdown) => break,
            Ok(Outcome::Restart) => {
                error_retries = 0;
            }
            Err(RunError::Fatal(error)) => return Err(error),
            Err(RunError::Retry(error)) => {
                error!("{error:#}");
                error_retries += 1;
                if error_retries > MAX_ERROR_RETRIES {
                    bail!("Maximum error retry count exceeded");
                }
                std::thread::sleep(Duration::from_secs(1));
                if signals.shutdown().is_some() {
                    break;
                }
            }
        }
        info!("Restarting");
    }

    info!("Exiting");
    Ok(())
}
