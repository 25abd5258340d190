//! Text templates with embedded selector expressions and filters.
//!
//! A template is literal text with `{{ head | filter: arg, ... }}` blocks. The
//! head is a selector expression evaluated with `%resource` as focus when it is
//! bound, otherwise the document root. Filters are separated by `|` at the top
//! level; a union inside the head must be parenthesized.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};
use thiserror::Error;

use super::code_systems::CodeSystemTable;
use crate::fhirpath::{self, Bindings, Document, EvaluationError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template '{template}': {reason}")]
    Syntax { template: String, reason: String },

    #[error("failed to evaluate '{expression}': {source}")]
    Evaluation {
        expression: String,
        #[source]
        source: EvaluationError,
    },

    #[error("'{expression}' produced {count} values, expected at most one")]
    MultipleValues { expression: String, count: usize },

    #[error("'{expression}' produced a structured value, expected a primitive")]
    NotScalar { expression: String },

    #[error("{filter} expects a timestamp, got {actual}")]
    NotATimestamp { filter: String, actual: String },

    #[error("{filter} expects text, got {actual}")]
    NotText { filter: String, actual: String },

    #[error("'{value}' is not a recognized date/time")]
    InvalidDateTime { value: String },

    #[error("invalid date format pattern '{pattern}'")]
    InvalidPattern { pattern: String },

    #[error("unknown filter '{name}'")]
    UnknownFilter { name: String },

    #[error("{filter} takes {expected} argument(s), got {actual}")]
    FilterArguments {
        filter: String,
        expected: usize,
        actual: usize,
    },
}

/// How much of a date/time was actually given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    /// Any time of day; missing minutes and seconds read as zero
    Time,
}

/// An instant plus the precision it was written with. Fields below the
/// precision are placeholders and never rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub instant: DateTime<FixedOffset>,
    pub precision: DatePrecision,
}

impl Timestamp {
    pub fn new(instant: DateTime<FixedOffset>, precision: DatePrecision) -> Self {
        Self { instant, precision }
    }

    /// Format with a chrono pattern cut down to this precision.
    pub fn format(&self, pattern: &str) -> Result<String, RenderError> {
        let pattern = pattern_for(pattern, self.precision);
        let mut out = String::new();
        write!(out, "{}", self.instant.format(&pattern))
            .map_err(|_| RenderError::InvalidPattern { pattern })?;
        Ok(out)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.precision {
            DatePrecision::Year => write!(f, "{}", self.instant.format("%Y")),
            DatePrecision::Month => write!(f, "{}", self.instant.format("%Y-%m")),
            DatePrecision::Day => write!(f, "{}", self.instant.format("%Y-%m-%d")),
            DatePrecision::Time => {
                f.write_str(&self.instant.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
        }
    }
}

/// Precision a chrono conversion character needs, `None` for literals.
fn specifier_precision(conversion: char) -> Option<DatePrecision> {
    match conversion {
        'Y' | 'C' | 'y' | 'G' | 'g' => Some(DatePrecision::Year),
        'm' | 'b' | 'B' | 'h' => Some(DatePrecision::Month),
        'd' | 'e' | 'a' | 'A' | 'w' | 'u' | 'U' | 'W' | 'V' | 'j' | 'D' | 'x' | 'F' | 'v' => {
            Some(DatePrecision::Day)
        }
        '%' | 't' | 'n' => None,
        _ => Some(DatePrecision::Time),
    }
}

/// Drop everything from the first specifier finer than `precision`, along
/// with the literal separator in front of it.
fn pattern_for(pattern: &str, precision: DatePrecision) -> String {
    if precision == DatePrecision::Time {
        return pattern.to_string();
    }
    let mut kept = String::new();
    let mut pending = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            pending.push(c);
            continue;
        }
        let mut spec = String::from('%');
        while let Some(&flag) = chars.peek() {
            if matches!(flag, '-' | '_' | '0' | ':' | '.' | '#') || flag.is_ascii_digit() {
                spec.push(flag);
                chars.next();
            } else {
                break;
            }
        }
        let Some(conversion) = chars.next() else {
            pending.push_str(&spec);
            break;
        };
        spec.push(conversion);
        match specifier_precision(conversion) {
            None => pending.push_str(&spec),
            Some(needed) if needed <= precision => {
                kept.push_str(&pending);
                kept.push_str(&spec);
                pending.clear();
            }
            Some(_) => return kept,
        }
    }
    kept.push_str(&pending);
    kept
}

/// A rendered value before it is turned into text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    Absent,
    Text(String),
    Boolean(bool),
    Number(Number),
    Timestamp(Timestamp),
}

impl TemplateValue {
    fn describe(&self) -> String {
        match self {
            TemplateValue::Absent => "nothing".to_string(),
            TemplateValue::Text(s) => format!("text '{s}'"),
            TemplateValue::Boolean(b) => format!("boolean {b}"),
            TemplateValue::Number(n) => format!("number {n}"),
            TemplateValue::Timestamp(ts) => format!("timestamp {ts}"),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, TemplateValue::Absent)
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Absent => Ok(()),
            TemplateValue::Text(s) => f.write_str(s),
            TemplateValue::Boolean(b) => write!(f, "{b}"),
            TemplateValue::Number(n) => write!(f, "{n}"),
            TemplateValue::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FilterCall {
    name: String,
    args: Vec<TemplateValue>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Block { head: String, filters: Vec<FilterCall> },
}

/// A template split into literal text and expression blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    source: String,
    parts: Vec<Part>,
}

impl CompiledTemplate {
    /// Split the template and check every head expression parses.
    pub fn parse(template: &str) -> Result<Self, RenderError> {
        let syntax = |reason: &str| RenderError::Syntax {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| syntax("unclosed '{{'"))?;
            let body = after[..close].trim();
            if body.is_empty() {
                return Err(syntax("empty '{{ }}' block"));
            }

            let mut pieces = split_top_level(body, '|').into_iter();
            let head = pieces.next().unwrap_or_default().trim().to_string();
            fhirpath::validate(&head).map_err(|source| RenderError::Evaluation {
                expression: head.clone(),
                source,
            })?;
            let filters = pieces
                .map(|piece| parse_filter(piece.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            parts.push(Part::Block { head, filters });
            rest = &after[close + 2..];
        }
        if rest.contains("}}") {
            return Err(syntax("'}}' without a matching '{{'"));
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Ok(Self {
            source: template.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn parse_filter(piece: &str) -> Result<FilterCall, RenderError> {
    let (name, args) = match piece.split_once(':') {
        Some((name, args)) => (name.trim(), args.trim()),
        None => (piece, ""),
    };
    let args = if args.is_empty() {
        Vec::new()
    } else {
        split_top_level(args, ',')
            .into_iter()
            .map(|arg| literal_argument(arg.trim()))
            .collect()
    };
    let expected = match name {
        "datetime" | "codeSystemLookup" | "codeSystemUri" | "upcase" | "downcase" => 0,
        "formatDate" | "default" | "truncate" => 1,
        other => {
            return Err(RenderError::UnknownFilter {
                name: other.to_string(),
            })
        }
    };
    if args.len() != expected {
        return Err(RenderError::FilterArguments {
            filter: name.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(FilterCall {
        name: name.to_string(),
        args,
    })
}

fn literal_argument(arg: &str) -> TemplateValue {
    for quote in ['\'', '"'] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return TemplateValue::Text(arg[1..arg.len() - 1].to_string());
        }
    }
    match arg.parse::<i64>() {
        Ok(n) => TemplateValue::Number(n.into()),
        Err(_) => TemplateValue::Text(arg.to_string()),
    }
}

/// Split on `separator` outside quotes and brackets.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, c) if c == separator && depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Renders templates against documents. Holds the code-system table used by
/// the lookup filters.
#[derive(Debug, Clone)]
pub struct Renderer {
    code_systems: Arc<CodeSystemTable>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(CodeSystemTable::standard())
    }
}

impl Renderer {
    pub fn new(code_systems: Arc<CodeSystemTable>) -> Self {
        Self { code_systems }
    }

    pub fn code_systems(&self) -> &CodeSystemTable {
        &self.code_systems
    }

    /// Render a template string to text. Absent values render as empty text.
    pub fn render<'a>(
        &self,
        template: &str,
        document: &'a dyn Document,
        bindings: &Bindings<'a>,
    ) -> Result<String, RenderError> {
        let compiled = CompiledTemplate::parse(template)?;
        self.render_compiled(&compiled, document, bindings)
    }

    pub fn render_compiled<'a>(
        &self,
        template: &CompiledTemplate,
        document: &'a dyn Document,
        bindings: &Bindings<'a>,
    ) -> Result<String, RenderError> {
        let mut out = String::new();
        for part in &template.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Block { head, filters } => {
                    let value = self.block(head, filters, document, bindings)?;
                    let _ = write!(out, "{value}");
                }
            }
        }
        Ok(out)
    }

    /// Render a template that is a single `{{ }}` block to its typed value.
    /// Text around or between blocks is concatenated into a `Text` value.
    pub fn render_value<'a>(
        &self,
        template: &str,
        document: &'a dyn Document,
        bindings: &Bindings<'a>,
    ) -> Result<TemplateValue, RenderError> {
        let compiled = CompiledTemplate::parse(template)?;
        match compiled.parts.as_slice() {
            [Part::Block { head, filters }] => self.block(head, filters, document, bindings),
            _ => self
                .render_compiled(&compiled, document, bindings)
                .map(TemplateValue::Text),
        }
    }

    fn block<'a>(
        &self,
        head: &str,
        filters: &[FilterCall],
        document: &'a dyn Document,
        bindings: &Bindings<'a>,
    ) -> Result<TemplateValue, RenderError> {
        let focus = bindings.resource().unwrap_or_else(|| document.root());
        let result = fhirpath::evaluate_with_focus(document, head, focus, bindings).map_err(
            |source| RenderError::Evaluation {
                expression: head.to_string(),
                source,
            },
        )?;

        let mut value = match result.as_slice() {
            [] => TemplateValue::Absent,
            [single] => match single.as_ref() {
                Value::String(s) => TemplateValue::Text(s.clone()),
                Value::Bool(b) => TemplateValue::Boolean(*b),
                Value::Number(n) => TemplateValue::Number(n.clone()),
                Value::Null => TemplateValue::Absent,
                Value::Array(_) | Value::Object(_) => {
                    return Err(RenderError::NotScalar {
                        expression: head.to_string(),
                    })
                }
            },
            many => {
                return Err(RenderError::MultipleValues {
                    expression: head.to_string(),
                    count: many.len(),
                })
            }
        };

        for filter in filters {
            value = self.apply(filter, value)?;
        }
        Ok(value)
    }

    fn apply(&self, filter: &FilterCall, value: TemplateValue) -> Result<TemplateValue, RenderError> {
        let name = filter.name.as_str();
        let not_text = |value: &TemplateValue| RenderError::NotText {
            filter: name.to_string(),
            actual: value.describe(),
        };

        match name {
            "datetime" => match value {
                TemplateValue::Absent | TemplateValue::Timestamp(_) => Ok(value),
                TemplateValue::Text(text) => parse_datetime(&text).map(TemplateValue::Timestamp),
                other => Err(RenderError::NotATimestamp {
                    filter: name.to_string(),
                    actual: other.describe(),
                }),
            },
            "formatDate" => match value {
                TemplateValue::Absent => Ok(value),
                TemplateValue::Timestamp(ts) => {
                    ts.format(&filter.args[0].to_string()).map(TemplateValue::Text)
                }
                other => Err(RenderError::NotATimestamp {
                    filter: name.to_string(),
                    actual: other.describe(),
                }),
            },
            "codeSystemLookup" | "codeSystemUri" => match &value {
                TemplateValue::Absent => Ok(TemplateValue::Absent),
                TemplateValue::Text(text) => {
                    let found = if name == "codeSystemLookup" {
                        self.code_systems.code_for(text)
                    } else {
                        self.code_systems.uri_for(text)
                    };
                    Ok(found
                        .map(|s| TemplateValue::Text(s.to_string()))
                        .unwrap_or(TemplateValue::Absent))
                }
                other => Err(not_text(other)),
            },
            "default" => Ok(match value {
                TemplateValue::Absent => filter.args[0].clone(),
                TemplateValue::Text(ref s) if s.is_empty() => filter.args[0].clone(),
                other => other,
            }),
            "upcase" | "downcase" => match value {
                TemplateValue::Absent => Ok(value),
                TemplateValue::Text(text) => Ok(TemplateValue::Text(if name == "upcase" {
                    text.to_uppercase()
                } else {
                    text.to_lowercase()
                })),
                other => Err(not_text(&other)),
            },
            "truncate" => match value {
                TemplateValue::Absent => Ok(value),
                TemplateValue::Text(text) => {
                    let limit = match &filter.args[0] {
                        TemplateValue::Number(n) => n.as_u64().unwrap_or(0) as usize,
                        other => return Err(not_text(other)),
                    };
                    Ok(TemplateValue::Text(text.chars().take(limit).collect()))
                }
                other => Err(not_text(&other)),
            },
            other => Err(RenderError::UnknownFilter {
                name: other.to_string(),
            }),
        }
    }
}

static YEAR_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("Invalid year-month regex"));

static HL7_DTM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4})(\d{2})?(\d{2})?(\d{2})?(\d{2})?(\d{2})?(?:\.(\d{1,4}))?([+-]\d{4})?$",
    )
    .expect("Invalid HL7 DTM regex")
});

/// Parse an instant keeping its own offset and precision.
///
/// Accepts RFC 3339 (`2023-01-05T10:15:00-05:00`), local date-times, FHIR
/// partial dates (`2023`, `2023-01`, `2023-01-05`, read as UTC) and HL7 `DTM`
/// values (`20230105101500-0500`, any precision).
pub fn parse_datetime(text: &str) -> Result<Timestamp, RenderError> {
    let text = text.trim();
    let invalid = || RenderError::InvalidDateTime {
        value: text.to_string(),
    };
    let utc = |naive: NaiveDateTime| Utc.fix().from_utc_datetime(&naive);

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(Timestamp::new(ts, DatePrecision::Time));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Timestamp::new(utc(naive), DatePrecision::Time));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(Timestamp::new(utc(midnight), DatePrecision::Day));
    }
    if let Some(caps) = YEAR_MONTH.captures(text) {
        let year = caps[1].parse::<i32>().map_err(|_| invalid())?;
        let month = caps[2].parse::<u32>().map_err(|_| invalid())?;
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(invalid)?;
        return Ok(Timestamp::new(utc(first), DatePrecision::Month));
    }

    let caps = HL7_DTM.captures(text).ok_or_else(invalid)?;
    let precision = if caps.get(2).is_none() {
        DatePrecision::Year
    } else if caps.get(3).is_none() {
        DatePrecision::Month
    } else if caps.get(4).is_none() {
        DatePrecision::Day
    } else {
        DatePrecision::Time
    };
    let number = |i: usize, default: u32| -> u32 {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };
    let year = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .ok_or_else(invalid)?;
    let fraction = caps
        .get(7)
        .map(|m| {
            let digits = m.as_str();
            let value: u32 = digits.parse().unwrap_or(0);
            value * 10u32.pow(9 - digits.len() as u32)
        })
        .unwrap_or(0);
    let naive = NaiveDate::from_ymd_opt(year, number(2, 1), number(3, 1))
        .and_then(|d| d.and_hms_nano_opt(number(4, 0), number(5, 0), number(6, 0), fraction))
        .ok_or_else(invalid)?;

    let offset = match caps.get(8) {
        Some(m) => {
            let raw = m.as_str();
            let sign = if raw.starts_with('-') { -1 } else { 1 };
            let hours: i32 = raw[1..3].parse().map_err(|_| invalid())?;
            let minutes: i32 = raw[3..5].parse().map_err(|_| invalid())?;
            FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)?
        }
        None => Utc.fix(),
    };
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|instant| Timestamp::new(instant, precision))
        .ok_or_else(invalid)
}
