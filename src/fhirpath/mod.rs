//! Selector expressions over FHIR bundles and HL7 documents.
//!
//! A FHIRPath subset: member navigation with array flattening, `where`/`select`
//! style functions, boolean three-valued logic, comparison and arithmetic
//! operators, reference resolution, and `field`/`component`/`subcomponent`
//! helpers for HL7 segment documents. Evaluation is a pure function of the
//! document, the expression and the bindings.

pub mod error;
pub mod evaluator;
pub mod parser;
pub mod tokenizer;

pub use error::{EvaluationError, EvaluationResult, ParseError};
pub use evaluator::{
    evaluate, evaluate_condition, evaluate_parsed, evaluate_with_focus, validate, Bindings,
    Collection, Document,
};
pub use parser::{parse, Expression};
