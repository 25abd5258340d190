//! Flat HL7v2 message: an ordered segment list plus its delimiters.

use serde_json::{json, Value};

use super::path::TerserPath;
use super::segment::{Delimiters, Segment};
use super::{split_segments, Hl7ParseError};
use crate::fhirpath::Document;

/// A parsed HL7v2 message without group structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
}

impl Hl7Message {
    pub fn from_segments(delimiters: Delimiters, segments: Vec<Segment>) -> Self {
        Self {
            delimiters,
            segments,
        }
    }

    /// Parse exactly one message. The text must start with MSH.
    pub fn parse(text: &str) -> Result<Self, Hl7ParseError> {
        let mut messages = Self::parse_all(text)?;
        match messages.len() {
            0 => Err(Hl7ParseError::Empty),
            1 => Ok(messages.remove(0)),
            n => Err(Hl7ParseError::MultipleMessages(n)),
        }
    }

    /// Parse every message in a blob, skipping batch envelope segments.
    pub fn parse_all(blob: &str) -> Result<Vec<Self>, Hl7ParseError> {
        let lines = split_segments(blob);
        let mut messages = Vec::new();
        let mut current: Option<Hl7Message> = None;

        for line in lines {
            let name = line.get(..3).unwrap_or(line);
            match name {
                "FHS" | "BHS" | "BTS" | "FTS" => {
                    if let Some(message) = current.take() {
                        messages.push(message);
                    }
                }
                "MSH" => {
                    if let Some(message) = current.take() {
                        messages.push(message);
                    }
                    let delimiters = Delimiters::from_header(line)?;
                    let msh = Segment::parse(line, &delimiters)?;
                    current = Some(Hl7Message {
                        delimiters,
                        segments: vec![msh],
                    });
                }
                _ => match current.as_mut() {
                    Some(message) => {
                        let segment = Segment::parse(line, &message.delimiters)?;
                        message.segments.push(segment);
                    }
                    None => return Err(Hl7ParseError::MissingMsh(name.to_string())),
                },
            }
        }
        if let Some(message) = current {
            messages.push(message);
        }
        Ok(messages)
    }

    /// True when the blob is wrapped in a batch or file envelope.
    pub fn is_batch(blob: &str) -> bool {
        let trimmed = blob.trim_start();
        trimmed.starts_with("FHS") || trimmed.starts_with("BHS")
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name == name)
    }

    /// Read a value by a flat terser path (`SEG(rep)-field(rep)-component-subcomponent`).
    /// Group steps, if any, are ignored.
    pub fn get(&self, path: &str) -> Option<&str> {
        let path = TerserPath::parse(path).ok()?;
        self.segments
            .iter()
            .filter(|s| s.name == path.segment)
            .nth(path.segment_repetition)?
            .value(
                path.field,
                path.field_repetition,
                path.component,
                path.subcomponent,
            )
    }

    /// MSH-10.
    pub fn control_id(&self) -> Option<&str> {
        self.get("MSH-10")
    }

    /// MSH-15, the accept acknowledgment type.
    pub fn accept_ack_type(&self) -> Option<&str> {
        self.get("MSH-15")
    }

    /// MSH-9 as `TYPE^TRIGGER`.
    pub fn message_type(&self) -> Option<String> {
        let code = self.get("MSH-9-1")?;
        Some(match self.get("MSH-9-2") {
            Some(trigger) if !trigger.is_empty() => format!("{code}^{trigger}"),
            _ => code.to_string(),
        })
    }

    /// Encode as ER7, segments separated by carriage returns.
    pub fn encode(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.encode(&self.delimiters))
            .collect::<Vec<_>>()
            .join("\r")
    }

    /// Expose the message to the expression evaluator.
    ///
    /// The document root is `{"resourceType": "Hl7Message", "segment": [...]}` where
    /// each segment is `{"resourceType": "Segment", "name", "position", "fields"}` and
    /// `fields` nests repetitions, components and subcomponents as arrays.
    pub fn to_document(&self) -> Hl7Document {
        let segments: Vec<Value> = self
            .segments
            .iter()
            .enumerate()
            .map(|(position, segment)| {
                let fields: Vec<Value> = segment
                    .fields
                    .iter()
                    .map(|field| {
                        Value::Array(
                            field
                                .0
                                .iter()
                                .map(|rep| {
                                    Value::Array(
                                        rep.0
                                            .iter()
                                            .map(|comp| json!(comp.0))
                                            .collect(),
                                    )
                                })
                                .collect(),
                        )
                    })
                    .collect();
                json!({
                    "resourceType": "Segment",
                    "name": segment.name,
                    "position": position,
                    "fields": fields,
                })
            })
            .collect();

        Hl7Document {
            root: json!({
                "resourceType": "Hl7Message",
                "segment": segments,
            }),
        }
    }
}

/// JSON view of an [`Hl7Message`] for selector evaluation.
#[derive(Debug, Clone)]
pub struct Hl7Document {
    root: Value,
}

impl Document for Hl7Document {
    fn root(&self) -> &Value {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORU: &str = "MSH|^~\\&|LAB^1.2.3^ISO|FAC|RCV|RFAC|20230105101500-0500||ORU^R01^ORU_R01|CTRL-1|P|2.5.1|||AL|NE\r\
PID|1||MRN-1^^^FAC^MR||Doe^Jane\r\
OBR|1|||94500-6^SARS-CoV-2 RNA^LN\r\
OBX|1|CWE|94500-6^SARS-CoV-2 RNA^LN||260373001^Detected^SCT\r\
OBX|2|NM|1234-5^Other^LN||42";

    #[test]
    fn test_parse_single_message() {
        let message = Hl7Message::parse(ORU).unwrap();

        assert_eq!(message.segments().len(), 5);
        assert_eq!(message.control_id(), Some("CTRL-1"));
        assert_eq!(message.accept_ack_type(), Some("AL"));
        assert_eq!(message.message_type().as_deref(), Some("ORU^R01"));
        assert_eq!(message.get("OBX(1)-5"), Some("42"));
        assert_eq!(message.get("PID-5-2"), Some("Jane"));
        assert_eq!(message.encode(), ORU);
    }

    fn obx_field(message: &Hl7Message, field: usize) -> Option<&str> {
        message.get(&format!("OBX-{field}"))
    }

    #[test]
    fn test_get_borrows_only_from_message() {
        let message = Hl7Message::parse(ORU).unwrap();
        let values: Vec<&str> = [2, 5].into_iter().filter_map(|f| obx_field(&message, f)).collect();
        assert_eq!(values, ["CWE", "260373001"]);
    }

    #[test]
    fn test_parse_all_skips_envelope() {
        let blob = format!("FHS|^~\\&\rBHS|^~\\&\r{ORU}\r{ORU}\rBTS|2\rFTS|1");
        let messages = Hl7Message::parse_all(&blob).unwrap();

        assert_eq!(messages.len(), 2);
        assert!(Hl7Message::is_batch(&blob));
        assert!(!Hl7Message::is_batch(ORU));
        assert!(matches!(
            Hl7Message::parse(&blob),
            Err(Hl7ParseError::MultipleMessages(2))
        ));
    }

    #[test]
    fn test_parse_requires_msh() {
        assert!(matches!(
            Hl7Message::parse("PID|1"),
            Err(Hl7ParseError::MissingMsh(_))
        ));
        assert!(matches!(Hl7Message::parse(""), Err(Hl7ParseError::Empty)));
    }

    #[test]
    fn test_accepts_newline_separators() {
        let text = ORU.replace('\r', "\r\n");
        let message = Hl7Message::parse(&text).unwrap();
        assert_eq!(message.segments().len(), 5);
    }

    #[test]
    fn test_document_shape() {
        let message = Hl7Message::parse(ORU).unwrap();
        let document = message.to_document();
        let root = document.root();

        assert_eq!(root["segment"].as_array().unwrap().len(), 5);
        assert_eq!(root["segment"][3]["name"], "OBX");
        assert_eq!(root["segment"][3]["fields"][2][0][0][0], "94500-6");
    }
}
