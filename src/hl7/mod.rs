//! HL7v2 wire format: segments, flat messages, structured message building
//! and batch framing.

pub mod batch;
pub mod builder;
pub mod message;
pub mod path;
pub mod segment;
pub mod structure;

use thiserror::Error;

pub use batch::{join, split, BatchHeader, FramingError};
pub use builder::{StructuredMessage, StructuredMessageBuilder};
pub use message::{Hl7Document, Hl7Message};
pub use path::TerserPath;
pub use segment::{Delimiters, Segment};
pub use structure::MessageStructure;

/// Media type for HL7v2 ER7 content.
pub const HL7_CONTENT_TYPE: &str = "application/hl7-v2";

/// HL7 version stamped into MSH-12 of built messages.
pub const HL7_VERSION: &str = "2.5.1";

/// Errors raised while parsing ER7 text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Hl7ParseError {
    #[error("no HL7 message found")]
    Empty,

    #[error("expected a single message, found {0}")]
    MultipleMessages(usize),

    #[error("segment {0} appears before any MSH segment")]
    MissingMsh(String),

    #[error("{0} header does not declare its delimiters")]
    MissingDelimiters(String),

    #[error("invalid segment: {0}")]
    InvalidSegment(String),
}

/// Split a blob into segment lines. Accepts `\r`, `\n` and `\r\n` separators and
/// drops blank lines.
pub fn split_segments(blob: &str) -> Vec<&str> {
    blob.split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .collect()
}
