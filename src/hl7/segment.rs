//! HL7v2 segment model and ER7 encoding.
//!
//! A segment is a named list of fields; each field holds repetitions, each
//! repetition holds components, each component holds subcomponents. Leaf
//! values are stored unescaped and escaped again on encode.

use std::fmt;

use super::Hl7ParseError;

/// Default encoding characters carried in MSH-2.
pub const DEFAULT_ENCODING_CHARACTERS: &str = "^~\\&";

/// The five HL7 delimiter characters of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// Read the delimiters declared by an MSH, FHS or BHS header line.
    pub fn from_header(line: &str) -> Result<Self, Hl7ParseError> {
        let mut chars = line.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| Hl7ParseError::MissingDelimiters(line.chars().take(3).collect()))?;
        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        if encoding.len() < 4 {
            return Err(Hl7ParseError::MissingDelimiters(
                line.chars().take(3).collect(),
            ));
        }
        Ok(Self {
            field,
            component: encoding[0],
            repetition: encoding[1],
            escape: encoding[2],
            subcomponent: encoding[3],
        })
    }

    /// MSH-2 representation of these delimiters.
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    pub fn escape(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if c == self.escape {
                out.push(self.escape);
                out.push('E');
                out.push(self.escape);
            } else if c == self.field {
                out.push(self.escape);
                out.push('F');
                out.push(self.escape);
            } else if c == self.component {
                out.push(self.escape);
                out.push('S');
                out.push(self.escape);
            } else if c == self.subcomponent {
                out.push(self.escape);
                out.push('T');
                out.push(self.escape);
            } else if c == self.repetition {
                out.push(self.escape);
                out.push('R');
                out.push(self.escape);
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Reverse of [`Delimiters::escape`]. Unrecognized escape sequences are kept verbatim.
    pub fn unescape(&self, value: &str) -> String {
        if !value.contains(self.escape) {
            return value.to_string();
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find(self.escape) {
            out.push_str(&rest[..start]);
            let after = &rest[start + self.escape.len_utf8()..];
            match after.find(self.escape) {
                Some(end) => {
                    let sequence = &after[..end];
                    match sequence {
                        "E" => out.push(self.escape),
                        "F" => out.push(self.field),
                        "S" => out.push(self.component),
                        "T" => out.push(self.subcomponent),
                        "R" => out.push(self.repetition),
                        other => {
                            out.push(self.escape);
                            out.push_str(other);
                            out.push(self.escape);
                        }
                    }
                    rest = &after[end + self.escape.len_utf8()..];
                }
                None => {
                    out.push(self.escape);
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// One component: its subcomponents in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Component(pub Vec<String>);

/// One repetition of a field: its components in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repetition(pub Vec<Component>);

/// A field with all of its repetitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Field(pub Vec<Repetition>);

impl Field {
    fn is_empty(&self) -> bool {
        self.0
            .iter()
            .all(|rep| rep.0.iter().all(|c| c.0.iter().all(|s| s.is_empty())))
    }
}

/// A single HL7 segment. `fields[0]` is field number 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Whether this segment is a header carrying its own delimiters in field 2.
    pub fn is_header(&self) -> bool {
        matches!(self.name.as_str(), "MSH" | "FHS" | "BHS")
    }

    /// Parse one ER7 line.
    pub fn parse(line: &str, delimiters: &Delimiters) -> Result<Self, Hl7ParseError> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(Hl7ParseError::InvalidSegment(line.to_string()));
        }
        let name = &line[..3];
        if !name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(Hl7ParseError::InvalidSegment(line.to_string()));
        }
        let mut segment = Segment::new(name);
        let body = &line[3..];
        if body.is_empty() {
            return Ok(segment);
        }
        if !body.starts_with(delimiters.field) {
            return Err(Hl7ParseError::InvalidSegment(line.to_string()));
        }
        let mut raw_fields: Vec<&str> = body[delimiters.field.len_utf8()..]
            .split(delimiters.field)
            .collect();

        if segment.is_header() {
            // Field 1 is the field separator itself and field 2 the encoding
            // characters; neither is split on delimiters.
            segment.fields.push(leaf_field(delimiters.field.to_string()));
            let encoding = if raw_fields.is_empty() {
                String::new()
            } else {
                raw_fields.remove(0).to_string()
            };
            segment.fields.push(leaf_field(encoding));
        }

        for raw in raw_fields {
            segment.fields.push(parse_field(raw, delimiters));
        }
        Ok(segment)
    }

    /// Value at `field[repetition]-component-subcomponent`. Field, component and
    /// subcomponent are 1-based, repetition is 0-based.
    pub fn value(
        &self,
        field: usize,
        repetition: usize,
        component: usize,
        subcomponent: usize,
    ) -> Option<&str> {
        if field == 0 || component == 0 || subcomponent == 0 {
            return None;
        }
        self.fields
            .get(field - 1)?
            .0
            .get(repetition)?
            .0
            .get(component - 1)?
            .0
            .get(subcomponent - 1)
            .map(String::as_str)
    }

    /// Set a leaf value, growing the field/repetition/component lists as needed.
    pub fn set_value(
        &mut self,
        field: usize,
        repetition: usize,
        component: usize,
        subcomponent: usize,
        value: impl Into<String>,
    ) {
        debug_assert!(field > 0 && component > 0 && subcomponent > 0);
        if self.fields.len() < field {
            self.fields.resize_with(field, Field::default);
        }
        let reps = &mut self.fields[field - 1].0;
        if reps.len() <= repetition {
            reps.resize_with(repetition + 1, Repetition::default);
        }
        let comps = &mut reps[repetition].0;
        if comps.len() < component {
            comps.resize_with(component, Component::default);
        }
        let subs = &mut comps[component - 1].0;
        if subs.len() < subcomponent {
            subs.resize_with(subcomponent, String::new);
        }
        subs[subcomponent - 1] = value.into();
    }

    /// Number of repetitions present in a field.
    pub fn repetition_count(&self, field: usize) -> usize {
        field
            .checked_sub(1)
            .and_then(|i| self.fields.get(i))
            .map(|f| f.0.len())
            .unwrap_or(0)
    }

    /// One field in its encoded wire form, or an empty string when absent.
    pub fn encoded_field(&self, field: usize, delimiters: &Delimiters) -> String {
        match field.checked_sub(1).and_then(|i| self.fields.get(i)) {
            Some(f) if self.is_header() && field <= 2 => {
                f.0.first()
                    .and_then(|r| r.0.first())
                    .and_then(|c| c.0.first())
                    .cloned()
                    .unwrap_or_default()
            }
            Some(f) => encode_field(f, delimiters),
            None => String::new(),
        }
    }

    /// Encode to a single ER7 line, trimming trailing empty fields and components.
    pub fn encode(&self, delimiters: &Delimiters) -> String {
        let mut out = self.name.clone();
        let mut fields: &[Field] = &self.fields;
        while let Some((last, rest)) = fields.split_last() {
            if last.is_empty() {
                fields = rest;
            } else {
                break;
            }
        }

        let skip = if self.is_header() {
            out.push(delimiters.field);
            out.push_str(&delimiters.encoding_characters());
            2
        } else {
            0
        };

        for field in fields.iter().skip(skip) {
            out.push(delimiters.field);
            out.push_str(&encode_field(field, delimiters));
        }
        out
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode(&Delimiters::default()))
    }
}

fn leaf_field(value: String) -> Field {
    Field(vec![Repetition(vec![Component(vec![value])])])
}

fn parse_field(raw: &str, delimiters: &Delimiters) -> Field {
    if raw.is_empty() {
        return Field::default();
    }
    Field(
        raw.split(delimiters.repetition)
            .map(|rep| {
                Repetition(
                    rep.split(delimiters.component)
                        .map(|comp| {
                            Component(
                                comp.split(delimiters.subcomponent)
                                    .map(|sub| delimiters.unescape(sub))
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}

fn encode_field(field: &Field, delimiters: &Delimiters) -> String {
    let reps: Vec<String> = field
        .0
        .iter()
        .map(|rep| {
            let mut comps: Vec<String> = rep
                .0
                .iter()
                .map(|comp| {
                    let mut subs: Vec<String> =
                        comp.0.iter().map(|s| delimiters.escape(s)).collect();
                    trim_trailing_empty(&mut subs);
                    subs.join(&delimiters.subcomponent.to_string())
                })
                .collect();
            trim_trailing_empty(&mut comps);
            comps.join(&delimiters.component.to_string())
        })
        .collect();
    reps.join(&delimiters.repetition.to_string())
}

fn trim_trailing_empty(values: &mut Vec<String>) {
    while values.last().is_some_and(|v| v.is_empty()) {
        values.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_components_and_repetitions() {
        let d = Delimiters::default();
        let seg = Segment::parse("PID|1||123^^^MRN~456^^^SSN||Smith^John", &d).unwrap();

        assert_eq!(seg.name, "PID");
        assert_eq!(seg.value(1, 0, 1, 1), Some("1"));
        assert_eq!(seg.value(3, 0, 1, 1), Some("123"));
        assert_eq!(seg.value(3, 1, 4, 1), Some("SSN"));
        assert_eq!(seg.value(5, 0, 2, 1), Some("John"));
        assert_eq!(seg.repetition_count(3), 2);
        assert_eq!(seg.value(9, 0, 1, 1), None);
    }

    #[test]
    fn test_header_fields_are_not_split() {
        let d = Delimiters::default();
        let seg = Segment::parse("MSH|^~\\&|APP^1.2.3^ISO", &d).unwrap();

        assert_eq!(seg.value(1, 0, 1, 1), Some("|"));
        assert_eq!(seg.value(2, 0, 1, 1), Some("^~\\&"));
        assert_eq!(seg.value(3, 0, 2, 1), Some("1.2.3"));
        assert_eq!(seg.encode(&d), "MSH|^~\\&|APP^1.2.3^ISO");
    }

    #[test]
    fn test_escape_round_trip() {
        let d = Delimiters::default();
        let raw = "a|b^c&d~e\\f";
        let escaped = d.escape(raw);
        assert_eq!(escaped, "a\\F\\b\\S\\c\\T\\d\\R\\e\\E\\f");
        assert_eq!(d.unescape(&escaped), raw);
        assert_eq!(d.unescape("keep \\H\\ this"), "keep \\H\\ this");
    }

    #[test]
    fn test_set_value_and_trim() {
        let d = Delimiters::default();
        let mut seg = Segment::new("OBX");
        seg.set_value(3, 0, 1, 1, "94500-6");
        seg.set_value(3, 0, 3, 1, "LN");
        seg.set_value(10, 0, 1, 1, "");

        assert_eq!(seg.encode(&d), "OBX|||94500-6^^LN");
    }

    #[test]
    fn test_delimiters_from_header() {
        let d = Delimiters::from_header("FHS|^~\\&|X").unwrap();
        assert_eq!(d, Delimiters::default());
        assert!(Delimiters::from_header("MSH").is_err());
    }
}
