// Error types for selector parsing and evaluation

use thiserror::Error;

pub type ParseResult<T> = Result<T, ParseError>;

pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Errors raised while turning an expression string into an AST.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { character: char, position: usize },

    #[error("unexpected token {token} at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unterminated string starting at position {position}")]
    UnterminatedString { position: usize },

    #[error("invalid number '{text}'")]
    InvalidNumber { text: String },

    #[error("empty expression")]
    Empty,
}

/// Errors raised while evaluating a parsed expression against a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("failed to parse '{expression}': {source}")]
    Parse {
        expression: String,
        #[source]
        source: ParseError,
    },

    #[error("unknown function {name}()")]
    UnknownFunction { name: String },

    #[error("{function}() takes {expected} argument(s), got {actual}")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    #[error("variable %{name} is not bound")]
    VariableNotFound { name: String },

    #[error("{context} expects a single item, got {size}")]
    SingletonExpected { context: String, size: usize },

    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },
}

impl EvaluationError {
    pub(crate) fn type_error(expected: &str, actual: &serde_json::Value) -> Self {
        EvaluationError::TypeError {
            expected: expected.to_string(),
            actual: type_name(actual).to_string(),
        }
    }
}

pub(crate) fn type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "Boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Integer",
        Value::Number(_) => "Decimal",
        Value::String(_) => "String",
        Value::Array(_) => "Collection",
        Value::Object(_) => "Object",
    }
}
