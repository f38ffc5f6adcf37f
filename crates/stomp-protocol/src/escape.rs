//! Version-aware header escaping.
//!
//! STOMP 1.1 introduced backslash escape sequences for header names and
//! values; 1.2 extended the table. CONNECT and CONNECTED frames are exempt
//! in every version, and 1.0 has no escaping at all: a backslash there is
//! literal content.

use std::borrow::Cow;

use crate::error::FrameError;
use crate::spec::{self, ESCAPE_CHARACTER, Version};

/// Rewrite every escapable character in `text` as `\` + its escape letter.
///
/// Returns the input untouched when the version has no escape table or the
/// command is exempt.
pub fn escape<'a>(version: Version, command: &str, text: &'a str) -> Cow<'a, str> {
    let table = spec::escaped_characters(version);
    if table.is_empty() || spec::escape_excluded(command) {
        return Cow::Borrowed(text);
    }
    if !text.chars().any(|c| table.iter().any(|(raw, _)| *raw == c)) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 4);
    for c in text.chars() {
        match table.iter().find(|(raw, _)| *raw == c) {
            Some((_, letter)) => {
                out.push(ESCAPE_CHARACTER);
                out.push(*letter);
            }
            None => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Rewrite every `\X` sequence in `text` back to its raw character.
///
/// An `X` outside the version's table is a hard error in 1.1+; 1.0 (no
/// escaping) passes backslashes through literally.
pub fn unescape<'a>(
    version: Version,
    command: &str,
    text: &'a str,
) -> Result<Cow<'a, str>, FrameError> {
    let table = spec::escaped_characters(version);
    if table.is_empty() || spec::escape_excluded(command) {
        return Ok(Cow::Borrowed(text));
    }
    if !text.contains(ESCAPE_CHARACTER) {
        return Ok(Cow::Borrowed(text));
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE_CHARACTER {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(letter) => match table.iter().find(|(_, l)| *l == letter) {
                Some((raw, _)) => out.push(*raw),
                None => return Err(FrameError::Escape(letter)),
            },
            None => return Err(FrameError::Escape(ESCAPE_CHARACTER)),
        }
    }
    Ok(Cow::Owned(out))
}
