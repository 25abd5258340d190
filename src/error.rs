//! Crate-level error types.
//!
//! Each module owns its error enum; [`HubError`] gathers them for callers that
//! drive a whole report through the hub.

use thiserror::Error;

use crate::fhir::BundleError;
use crate::fhirpath::EvaluationError;
use crate::hl7::{FramingError, Hl7ParseError};
use crate::mapping::MappingError;
use crate::settings::{ReportFormat, SettingsError};
use crate::template::{RenderError, TemplateError};
use crate::translation::TranslationError;

/// A destination path that does not address anything in the target message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("unknown element '{name}' in {parent}")]
    UnknownElement { name: String, parent: String },

    #[error("{name} does not repeat, repetition {repetition} requested")]
    NotRepeating { name: String, repetition: usize },

    #[error("{segment} has {max} fields, field {field} requested")]
    FieldOutOfRange {
        segment: String,
        field: usize,
        max: usize,
    },

    #[error("{field} is managed by the encoder and cannot be set")]
    Reserved { field: String },

    #[error("path '{path}' conflicts with existing content: {reason}")]
    Conflict { path: String, reason: String },

    #[error("cannot coerce '{value}' to {kind}")]
    Coercion { value: String, kind: String },
}

/// A mapping that could not be applied to the message under construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to set {field} = '{value}': {source}")]
pub struct BuildError {
    pub field: String,
    pub value: String,
    #[source]
    pub source: AddressError,
}

/// Any failure while processing a report.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Parse(#[from] Hl7ParseError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("unknown receiver '{0}'")]
    UnknownReceiver(String),

    #[error("unknown sender '{0}'")]
    UnknownSender(String),

    #[error("sender '{0}' submits HL7 but names no schema")]
    MissingSchema(String),

    #[error("{0:?} submissions are not supported")]
    UnsupportedFormat(ReportFormat),
}

pub type Result<T> = std::result::Result<T, HubError>;
