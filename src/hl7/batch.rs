//! HL7 batch framing.
//!
//! A batch blob is `FHS`, `BHS`, any number of messages each starting with
//! `MSH`, then the `BTS`/`FTS` trailer. Splitting only looks at the
//! three-character segment name at the start of each line; it never parses
//! message content.

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

use super::segment::{Delimiters, DEFAULT_ENCODING_CHARACTERS};
use super::{split_segments, Hl7Message};

/// Errors raised by [`split`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("blank content with non-empty indices {0:?}")]
    BlankWithIndices(Vec<usize>),

    #[error("a single message can only be addressed as [0], got {0:?}")]
    SingleMessageIndex(Vec<usize>),

    #[error("index {index} is out of range for a batch of {count} messages")]
    OutOfRange { index: usize, count: usize },

    #[error("content must start with MSH or FHS, found '{0}'")]
    UnknownLead(String),
}

/// Values placed in the FHS/BHS header pair by [`join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub created: DateTime<FixedOffset>,
}

impl BatchHeader {
    /// Take the sender and receiver identities from a message's MSH-3..6.
    pub fn from_message(message: &Hl7Message, created: DateTime<FixedOffset>) -> Self {
        let delimiters = message.delimiters();
        let field = |n| {
            message
                .segments_named("MSH")
                .next()
                .map(|msh| msh.encoded_field(n, delimiters))
                .unwrap_or_default()
        };
        Self {
            sending_application: field(3),
            sending_facility: field(4),
            receiving_application: field(5),
            receiving_facility: field(6),
            created,
        }
    }

    fn header_line(&self, name: &str) -> String {
        format!(
            "{name}|{DEFAULT_ENCODING_CHARACTERS}|{}|{}|{}|{}|{}",
            self.sending_application,
            self.sending_facility,
            self.receiving_application,
            self.receiving_facility,
            self.created.format("%Y%m%d%H%M%S%z"),
        )
    }
}

/// Extract the messages at `indices` from a blob.
///
/// A single message (`MSH` lead) passes through unchanged when `indices == [0]`.
/// A batch (`FHS` lead) is re-framed with its original header, the selected
/// messages in the requested order and a trailer counting only those messages.
pub fn split(blob: &str, indices: &[usize]) -> Result<String, FramingError> {
    let lines = split_segments(blob);
    let Some(first) = lines.first() else {
        if indices.is_empty() {
            return Ok(String::new());
        }
        return Err(FramingError::BlankWithIndices(indices.to_vec()));
    };

    match first.get(..3).unwrap_or(first) {
        "MSH" => {
            if indices == [0] {
                Ok(blob.to_string())
            } else {
                Err(FramingError::SingleMessageIndex(indices.to_vec()))
            }
        }
        "FHS" => split_batch(&lines, indices),
        other => Err(FramingError::UnknownLead(other.to_string())),
    }
}

fn split_batch(lines: &[&str], indices: &[usize]) -> Result<String, FramingError> {
    let mut starts = Vec::new();
    let mut trailer = lines.len();
    for (position, line) in lines.iter().enumerate() {
        match line.get(..3).unwrap_or(line) {
            "MSH" => starts.push(position),
            "BTS" | "FTS" => {
                trailer = position;
                break;
            }
            _ => {}
        }
    }

    let header_end = starts.first().copied().unwrap_or(trailer);
    let count = starts.len();
    let field = Delimiters::from_header(lines[0])
        .map(|d| d.field)
        .unwrap_or('|');

    let mut out: Vec<&str> = lines[..header_end].to_vec();
    for &index in indices {
        if index >= count {
            return Err(FramingError::OutOfRange { index, count });
        }
        let end = starts.get(index + 1).copied().unwrap_or(trailer);
        out.extend_from_slice(&lines[starts[index]..end]);
    }

    let bts = format!("BTS{field}{}", indices.len());
    let fts = format!("FTS{field}1");
    let mut framed = out.join("\r");
    for line in [bts, fts] {
        if !framed.is_empty() {
            framed.push('\r');
        }
        framed.push_str(&line);
    }
    Ok(framed)
}

/// Wrap messages in a batch envelope.
pub fn join<S: AsRef<str>>(messages: &[S], header: &BatchHeader) -> String {
    let mut lines = vec![header.header_line("FHS"), header.header_line("BHS")];
    for message in messages {
        lines.extend(split_segments(message.as_ref()).into_iter().map(str::to_string));
    }
    lines.push(format!("BTS|{}", messages.len()));
    lines.push("FTS|1".to_string());
    lines.join("\r")
}
