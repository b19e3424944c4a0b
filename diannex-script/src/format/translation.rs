//! Line-oriented translation files.
//!
//! One table entry per line, in file order. Comment lines (`#`), marker
//! lines (`@`) and blank lines are skipped; everything else lands in the
//! table verbatim, minus the line terminator.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub fn parse_translation_text(text: &str) -> Vec<String> {
    let mut table = Vec::new();
    for raw in text.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.starts_with('#') || line.starts_with('@') || line.trim().is_empty() {
            continue;
        }
        table.push(line.to_owned());
    }
    table
}

pub fn load_translation_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("read translation file {:?}", path.as_ref()))?;
    Ok(parse_translation_text(&text))
}
