//! Loading of the user's binding configuration.
//!
//! The format is line oriented: `<chord>+ :: <output>+`, where the left side
//! is a chord sequence (multi-stroke bindings list several chords) and the
//! right side is either a list of key tokens to emit or one of the
//! directives `$select`, `$start`, `$stop`. `#` starts a comment, blank
//! lines are ignored. Parsing resolves every token against the current
//! [`KeyLayout`], so a configuration is reloaded whenever the server's
//! mapping changes.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::chord::{ChordSequence, MAX_SEQUENCE_LEN};
use crate::keymap::{Action, Keymap, OutputProgram};
use crate::layout::KeyLayout;

const SEPARATOR: &str = "::";

/// Reads and parses the configuration file into a fresh keymap.
pub fn load(path: &Path, layout: &KeyLayout) -> Result<Keymap> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file at {path:?}"))?;
    parse(&content, layout).with_context(|| format!("Configuration file error in {path:?}"))
}

/// Parses configuration text against a key layout.
pub fn parse(content: &str, layout: &KeyLayout) -> Result<Keymap> {
    let mut keymap = Keymap::new();

    for (index, line) in content.lines().enumerate() {
        parse_line(&mut keymap, layout, line)
            .with_context(|| format!("error at line {}", index + 1))?;
    }

    if keymap.is_empty() {
        bail!("no bindings defined");
    }
    Ok(keymap)
}

fn parse_line(keymap: &mut Keymap, layout: &KeyLayout, line: &str) -> Result<()> {
    let line = line.split('#').next().unwrap_or("");
    let mut tokens = line.split_whitespace();

    let mut inputs = ChordSequence::new();
    let mut saw_separator = false;
    for token in tokens.by_ref() {
        if token == SEPARATOR {
            saw_separator = true;
            break;
        }
        inputs.push(layout.parse_chord(token)?);
    }

    if inputs.is_empty() {
        if saw_separator {
            bail!("missing input sequence before `{SEPARATOR}`");
        }
        // Blank line or pure comment.
        return Ok(());
    }
    if !saw_separator {
        bail!("missing `{SEPARATOR}` separator");
    }
    if inputs.len() > MAX_SEQUENCE_LEN {
        bail!("input sequence longer than {MAX_SEQUENCE_LEN} chords");
    }

    let outputs: Vec<&str> = tokens.collect();
    let action = match outputs.first() {
        None => bail!("missing output after `{SEPARATOR}`"),
        Some(&directive) if directive.starts_with('$') => {
            if outputs.len() > 1 {
                bail!("unexpected token after `{directive}`");
            }
            match directive {
                "$select" => Action::ToggleSelection,
                "$start" => Action::ToggleStopped { is_start: true },
                "$stop" => Action::ToggleStopped { is_start: false },
                _ => bail!("unknown directive `{directive}`"),
            }
        }
        Some(_) => {
            let program = outputs
                .iter()
                .map(|token| layout.parse_key_seq(token))
                .collect::<Result<OutputProgram, _>>()?;
            Action::Emit(program)
        }
    };

    debug!("parsed binding: {}", line.trim());
    keymap.insert(&inputs, action)?;
    Ok(())
}
