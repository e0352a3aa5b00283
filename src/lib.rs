//! chordd grabs one physical keyboard, interprets every key event through a
//! user-defined keymap of chords and multi-stroke prefixes, and replays
//! either the original event or a synthesized sequence onto a virtual
//! uinput device. On top of plain remapping it layers an editor-style
//! grammar: Emacs-like sequences (`C-x C-s`), a selection mode that wraps
//! cursor motions in Shift, and exclusion by focused window class or active
//! Fcitx input method, while keeping the X server's own keyboard mapping
//! safe from runtime rebinds.

pub mod chord;
pub mod daemon;
pub mod dispatcher;
pub mod events;
pub mod im_monitor;
pub mod keyboard;
pub mod keymap;
pub mod layout;
pub mod signals;
pub mod uinput;
pub mod user_config;
pub mod x_watcher;
pub mod xserver;
