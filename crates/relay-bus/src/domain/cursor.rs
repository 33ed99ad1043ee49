//! # Cursors
//!
//! A cursor is the opaque resume position handed to clients.
//!
//! ```text
//! per-topic:  chat,1f|room\,42,3      key "room,42" → next id 3
//! scale-out:  #2a                     last mapping consumed = 0x2a
//!             #                       nothing consumed yet
//! ```
//!
//! Keys escape `\`, `,`, `|` and `#`, so an unescaped leading `#` always
//! means the scale-out form.

use crate::error::CursorError;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;

const ENTRY_SEPARATOR: char = '|';
const ID_SEPARATOR: char = ',';
const ESCAPE: char = '\\';
const SCALEOUT_PREFIX: char = '#';

/// Resume position of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Next local id to read, per topic key.
    Topics(BTreeMap<String, u64>),

    /// Last global mapping id consumed.
    Scaleout(Option<u64>),
}

impl Default for Cursor {
    fn default() -> Self {
        Self::Topics(BTreeMap::new())
    }
}

impl Cursor {
    #[must_use]
    pub fn is_scaleout(&self) -> bool {
        matches!(self, Self::Scaleout(_))
    }

    /// Offset stored for `key` in a per-topic cursor.
    #[must_use]
    pub fn offset(&self, key: &str) -> Option<u64> {
        match self {
            Self::Topics(offsets) => offsets.get(key).copied(),
            Self::Scaleout(_) => None,
        }
    }

    /// Start tracking `key` at `next` unless it is already tracked.
    pub(crate) fn track(&mut self, key: &str, next: u64) {
        if let Self::Topics(offsets) = self {
            offsets.entry(key.to_string()).or_insert(next);
        }
    }

    pub(crate) fn untrack(&mut self, key: &str) {
        if let Self::Topics(offsets) = self {
            offsets.remove(key);
        }
    }

    /// Apply the positions reached by a delivery pass.
    ///
    /// Keys removed while the pass was in flight are not re-added.
    pub(crate) fn advance(&mut self, advance: &CursorAdvance) {
        match (self, advance) {
            (Self::Topics(offsets), CursorAdvance::Topics(reached)) => {
                for (key, next) in reached {
                    if let Some(offset) = offsets.get_mut(key) {
                        *offset = (*offset).max(*next);
                    }
                }
            }
            (Self::Scaleout(last), CursorAdvance::Scaleout(Some(reached))) => {
                *last = Some(last.map_or(*reached, |current| current.max(*reached)));
            }
            _ => {}
        }
    }
}

/// Positions reached by one delivery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CursorAdvance {
    Topics(Vec<(String, u64)>),
    Scaleout(Option<u64>),
}

impl CursorAdvance {
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Topics(reached) => reached.is_empty(),
            Self::Scaleout(reached) => reached.is_none(),
        }
    }
}

fn escape_key(key: &str, out: &mut String) {
    for c in key.chars() {
        if matches!(c, ESCAPE | ID_SEPARATOR | ENTRY_SEPARATOR | SCALEOUT_PREFIX) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

fn parse_hex(cursor: &str, digits: &str) -> Result<u64, CursorError> {
    if digits.is_empty() {
        return Err(CursorError::malformed(cursor, "missing id"));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| CursorError::malformed(cursor, format!("bad id {digits:?}: {e}")))
}

fn parse_topics(cursor: &str) -> Result<BTreeMap<String, u64>, CursorError> {
    let mut offsets = BTreeMap::new();
    if cursor.is_empty() {
        return Ok(offsets);
    }

    let mut key = String::new();
    let mut digits = String::new();
    let mut in_id = false;
    let mut chars = cursor.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE if !in_id => match chars.next() {
                Some(escaped) => key.push(escaped),
                None => return Err(CursorError::malformed(cursor, "dangling escape")),
            },
            ID_SEPARATOR if !in_id => in_id = true,
            ENTRY_SEPARATOR => {
                if !in_id {
                    return Err(CursorError::malformed(cursor, "entry without id"));
                }
                offsets.insert(std::mem::take(&mut key), parse_hex(cursor, &digits)?);
                digits.clear();
                in_id = false;
            }
            _ if in_id => digits.push(c),
            _ => key.push(c),
        }
    }

    if !in_id {
        return Err(CursorError::malformed(cursor, "entry without id"));
    }
    offsets.insert(key, parse_hex(cursor, &digits)?);
    Ok(offsets)
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scaleout(None) => f.write_char(SCALEOUT_PREFIX),
            Self::Scaleout(Some(id)) => write!(f, "{}{:x}", SCALEOUT_PREFIX, id),
            Self::Topics(offsets) => {
                let mut out = String::new();
                for (i, (key, next)) in offsets.iter().enumerate() {
                    if i > 0 {
                        out.push(ENTRY_SEPARATOR);
                    }
                    escape_key(key, &mut out);
                    out.push(ID_SEPARATOR);
                    let _ = write!(out, "{next:x}");
                }
                f.write_str(&out)
            }
        }
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(SCALEOUT_PREFIX) {
            Some("") => Ok(Self::Scaleout(None)),
            Some(digits) => parse_hex(s, digits).map(|id| Self::Scaleout(Some(id))),
            None => parse_topics(s).map(Self::Topics),
        }
    }
}
