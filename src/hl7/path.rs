//! Terser-style field paths.
//!
//! Grammar: `[/GROUP[(rep)]/...]SEG[(rep)]-FIELD[(rep)][-COMPONENT[-SUBCOMPONENT]]`.
//! Group and segment repetitions and the field repetition are 0-based; field,
//! component and subcomponent numbers are 1-based, as in HL7 documentation.

use std::fmt;

use crate::error::AddressError;

/// Largest repetition or position a path may name. Writes grow the message
/// up to the addressed slot, so unbounded numbers are refused.
pub const MAX_INDEX: usize = 9_999;

/// A group step in a terser path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStep {
    pub name: String,
    pub repetition: usize,
}

/// A parsed terser path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerserPath {
    pub raw: String,
    pub groups: Vec<GroupStep>,
    pub segment: String,
    pub segment_repetition: usize,
    pub field: usize,
    pub field_repetition: usize,
    pub component: usize,
    pub subcomponent: usize,
}

impl TerserPath {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let invalid = |reason: &str| AddressError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
        let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(invalid("empty path"));
        }

        let mut parts: Vec<&str> = trimmed.split('/').collect();
        let last = parts.pop().ok_or_else(|| invalid("empty path"))?;

        let mut groups = Vec::with_capacity(parts.len());
        for part in parts {
            let (name, repetition) = split_repetition(part).ok_or_else(|| invalid("bad group step"))?;
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
                return Err(invalid("bad group name"));
            }
            groups.push(GroupStep {
                name: name.to_string(),
                repetition,
            });
        }

        let mut pieces = last.split('-');
        let segment_part = pieces.next().ok_or_else(|| invalid("missing segment"))?;
        let (segment, segment_repetition) =
            split_repetition(segment_part).ok_or_else(|| invalid("bad segment repetition"))?;
        if segment.len() != 3
            || !segment.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(invalid("segment name must be three characters"));
        }

        let field_part = pieces.next().ok_or_else(|| invalid("missing field number"))?;
        let (field_text, field_repetition) =
            split_repetition(field_part).ok_or_else(|| invalid("bad field repetition"))?;
        let field = parse_position(field_text).ok_or_else(|| invalid("bad field number"))?;

        let component = match pieces.next() {
            Some(text) => parse_position(text).ok_or_else(|| invalid("bad component number"))?,
            None => 1,
        };
        let subcomponent = match pieces.next() {
            Some(text) => {
                parse_position(text).ok_or_else(|| invalid("bad subcomponent number"))?
            }
            None => 1,
        };
        if pieces.next().is_some() {
            return Err(invalid("too many path levels"));
        }

        Ok(Self {
            raw: raw.to_string(),
            groups,
            segment: segment.to_string(),
            segment_repetition,
            field,
            field_repetition,
            component,
            subcomponent,
        })
    }
}

impl fmt::Display for TerserPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Split `NAME(3)` into `("NAME", 3)`; a bare `NAME` has repetition 0.
fn split_repetition(part: &str) -> Option<(&str, usize)> {
    match part.find('(') {
        Some(open) => {
            let close = part.strip_suffix(')')?;
            let number = close[open + 1..]
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n <= MAX_INDEX)?;
            Some((&part[..open], number))
        }
        None => Some((part, 0)),
    }
}

fn parse_position(text: &str) -> Option<usize> {
    text.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=MAX_INDEX).contains(n))
}
