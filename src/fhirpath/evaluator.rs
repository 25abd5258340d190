//! Expression evaluation over JSON documents.
//!
//! Every value is a collection. Navigation flattens arrays, missing members
//! yield the empty collection and boolean operators follow three-valued logic.

use std::borrow::Cow;
use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Number, Value};

use super::error::{type_name, EvaluationError, EvaluationResult};
use super::parser::{
    parse, BinaryOperator, Expression, Literal, TypeOperator, UnaryOperator,
};

/// A document that selector expressions can navigate.
pub trait Document {
    /// The value bound to `%context` and used as the initial focus.
    fn root(&self) -> &Value;

    /// Resolve a reference string (`Patient/123`, a fullUrl) to a resource.
    fn resolve(&self, reference: &str) -> Option<&Value> {
        let _ = reference;
        None
    }
}

impl Document for Value {
    fn root(&self) -> &Value {
        self
    }
}

pub type Collection<'a> = Vec<Cow<'a, Value>>;

/// Environment variables available to an expression besides `%context`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bindings<'a> {
    index: Option<usize>,
    resource: Option<&'a Value>,
}

impl<'a> Bindings<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_resource(mut self, resource: &'a Value) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn resource(&self) -> Option<&'a Value> {
        self.resource
    }
}

fn parse_expression(expression: &str) -> EvaluationResult<Expression> {
    parse(expression).map_err(|source| EvaluationError::Parse {
        expression: expression.to_string(),
        source,
    })
}

/// Evaluate an expression with the document root as focus.
pub fn evaluate<'a>(
    document: &'a dyn Document,
    expression: &str,
    bindings: &Bindings<'a>,
) -> EvaluationResult<Collection<'a>> {
    evaluate_with_focus(document, expression, document.root(), bindings)
}

/// Evaluate an expression against an explicit focus value.
pub fn evaluate_with_focus<'a>(
    document: &'a dyn Document,
    expression: &str,
    focus: &'a Value,
    bindings: &Bindings<'a>,
) -> EvaluationResult<Collection<'a>> {
    let parsed = parse_expression(expression)?;
    evaluate_parsed(document, &parsed, focus, bindings)
}

/// Evaluate an already parsed expression.
pub fn evaluate_parsed<'a>(
    document: &'a dyn Document,
    expression: &Expression,
    focus: &'a Value,
    bindings: &Bindings<'a>,
) -> EvaluationResult<Collection<'a>> {
    let context = Context {
        document,
        bindings: *bindings,
    };
    context.eval(expression, &[Cow::Borrowed(focus)], None)
}

/// Evaluate an expression as a boolean condition.
///
/// Empty is `false`, a single boolean is its value, any other single item is
/// `true`; more than one item is an error.
pub fn evaluate_condition<'a>(
    document: &'a dyn Document,
    expression: &str,
    bindings: &Bindings<'a>,
) -> EvaluationResult<bool> {
    let result = evaluate(document, expression, bindings)?;
    Ok(to_boolean(&result, expression)?.unwrap_or(false))
}

/// Check that an expression parses, without evaluating it.
pub fn validate(expression: &str) -> EvaluationResult<()> {
    parse_expression(expression).map(|_| ())
}

struct Context<'a> {
    document: &'a dyn Document,
    bindings: Bindings<'a>,
}

impl<'a> Context<'a> {
    fn eval(
        &self,
        expression: &Expression,
        focus: &[Cow<'a, Value>],
        index: Option<usize>,
    ) -> EvaluationResult<Collection<'a>> {
        match expression {
            Expression::Literal(literal) => Ok(literal_value(literal).into_iter().collect()),
            Expression::This => Ok(focus.to_vec()),
            Expression::Index => Ok(index
                .map(|i| Cow::Owned(Value::from(i as u64)))
                .into_iter()
                .collect()),
            Expression::Variable(name) => self.variable(name),
            Expression::Identifier(name) => Ok(navigate(focus, name)),
            Expression::Member { target, name } => {
                let base = self.eval(target, focus, index)?;
                Ok(navigate(&base, name))
            }
            Expression::Indexer { target, index: at } => {
                let base = self.eval(target, focus, index)?;
                let position = self.eval(at, focus, index)?;
                let position = singleton_integer(&position, "indexer")?;
                Ok(match position {
                    Some(p) if p >= 0 => base.into_iter().nth(p as usize).into_iter().collect(),
                    _ => Vec::new(),
                })
            }
            Expression::Function { target, name, args } => {
                let base = match target {
                    Some(target) => self.eval(target, focus, index)?,
                    None => focus.to_vec(),
                };
                self.function(name, base, args, focus, index)
            }
            Expression::Unary { op, operand } => {
                let value = self.eval(operand, focus, index)?;
                match op {
                    UnaryOperator::Plus => Ok(value),
                    UnaryOperator::Minus => {
                        let Some(number) = singleton_number(&value, "unary minus")? else {
                            return Ok(Vec::new());
                        };
                        Ok(vec![Cow::Owned(negate(&number))])
                    }
                }
            }
            Expression::Binary { op, left, right } => {
                let lhs = self.eval(left, focus, index)?;
                let rhs = self.eval(right, focus, index)?;
                binary(*op, lhs, rhs)
            }
            Expression::Type {
                op,
                operand,
                type_name,
            } => {
                let value = self.eval(operand, focus, index)?;
                match op {
                    TypeOperator::Is => {
                        if value.len() > 1 {
                            return Err(EvaluationError::SingletonExpected {
                                context: "is".to_string(),
                                size: value.len(),
                            });
                        }
                        Ok(value
                            .first()
                            .map(|v| boolean(is_type(v, type_name)))
                            .into_iter()
                            .collect())
                    }
                    TypeOperator::As => Ok(value
                        .into_iter()
                        .filter(|v| is_type(v, type_name))
                        .collect()),
                }
            }
        }
    }

    fn variable(&self, name: &str) -> EvaluationResult<Collection<'a>> {
        match name {
            "context" => Ok(vec![Cow::Borrowed(self.document.root())]),
            "resource" => match self.bindings.resource {
                Some(resource) => Ok(vec![Cow::Borrowed(resource)]),
                None => Err(EvaluationError::VariableNotFound {
                    name: name.to_string(),
                }),
            },
            "index" => match self.bindings.index {
                Some(index) => Ok(vec![Cow::Owned(Value::from(index as u64))]),
                None => Err(EvaluationError::VariableNotFound {
                    name: name.to_string(),
                }),
            },
            other => Err(EvaluationError::VariableNotFound {
                name: other.to_string(),
            }),
        }
    }

    /// Evaluate `criteria` once per item with that item as `$this`.
    fn per_item(
        &self,
        base: &[Cow<'a, Value>],
        criteria: &Expression,
    ) -> EvaluationResult<Vec<Collection<'a>>> {
        base.iter()
            .enumerate()
            .map(|(i, item)| self.eval(criteria, std::slice::from_ref(item), Some(i)))
            .collect()
    }

    fn function(
        &self,
        name: &str,
        base: Collection<'a>,
        args: &[Expression],
        focus: &[Cow<'a, Value>],
        index: Option<usize>,
    ) -> EvaluationResult<Collection<'a>> {
        let arity = |expected: &str, allowed: &[usize]| {
            if allowed.contains(&args.len()) {
                Ok(())
            } else {
                Err(EvaluationError::Arity {
                    function: name.to_string(),
                    expected: expected.to_string(),
                    actual: args.len(),
                })
            }
        };
        // Arguments that are plain values are evaluated against the outer focus.
        let argument = |position: usize| -> EvaluationResult<Collection<'a>> {
            self.eval(&args[position], focus, index)
        };

        match name {
            "where" => {
                arity("1", &[1])?;
                let results = self.per_item(&base, &args[0])?;
                let mut kept = Vec::new();
                for (item, result) in base.into_iter().zip(results) {
                    if to_boolean(&result, "where")? == Some(true) {
                        kept.push(item);
                    }
                }
                Ok(kept)
            }
            "select" => {
                arity("1", &[1])?;
                Ok(self.per_item(&base, &args[0])?.into_iter().flatten().collect())
            }
            "exists" => {
                arity("0 or 1", &[0, 1])?;
                let present = if args.is_empty() {
                    !base.is_empty()
                } else {
                    let mut any = false;
                    for result in self.per_item(&base, &args[0])? {
                        if to_boolean(&result, "exists")? == Some(true) {
                            any = true;
                            break;
                        }
                    }
                    any
                };
                Ok(vec![boolean(present)])
            }
            "all" => {
                arity("1", &[1])?;
                let mut all = true;
                for result in self.per_item(&base, &args[0])? {
                    if to_boolean(&result, "all")? != Some(true) {
                        all = false;
                        break;
                    }
                }
                Ok(vec![boolean(all)])
            }
            "empty" => {
                arity("0", &[0])?;
                Ok(vec![boolean(base.is_empty())])
            }
            "count" => {
                arity("0", &[0])?;
                Ok(vec![Cow::Owned(Value::from(base.len() as u64))])
            }
            "first" => {
                arity("0", &[0])?;
                Ok(base.into_iter().take(1).collect())
            }
            "last" => {
                arity("0", &[0])?;
                Ok(base.into_iter().last().into_iter().collect())
            }
            "tail" => {
                arity("0", &[0])?;
                Ok(base.into_iter().skip(1).collect())
            }
            "skip" | "take" => {
                arity("1", &[1])?;
                let n = singleton_integer(&argument(0)?, name)?.unwrap_or(0).max(0) as usize;
                Ok(if name == "skip" {
                    base.into_iter().skip(n).collect()
                } else {
                    base.into_iter().take(n).collect()
                })
            }
            "single" => {
                arity("0", &[0])?;
                if base.len() > 1 {
                    return Err(EvaluationError::SingletonExpected {
                        context: "single()".to_string(),
                        size: base.len(),
                    });
                }
                Ok(base)
            }
            "distinct" => {
                arity("0", &[0])?;
                let mut out: Collection<'a> = Vec::new();
                for item in base {
                    if !out.iter().any(|existing| existing.as_ref() == item.as_ref()) {
                        out.push(item);
                    }
                }
                Ok(out)
            }
            "not" => {
                arity("0", &[0])?;
                Ok(to_boolean(&base, "not()")?
                    .map(|b| boolean(!b))
                    .into_iter()
                    .collect())
            }
            "hasValue" => {
                arity("0", &[0])?;
                let has = base.len() == 1 && !matches!(base[0].as_ref(), Value::Object(_) | Value::Null);
                Ok(vec![boolean(has)])
            }
            "ofType" => {
                arity("1", &[1])?;
                let type_name = type_argument(&args[0])?;
                Ok(base.into_iter().filter(|v| is_type(v, &type_name)).collect())
            }
            "iif" => {
                arity("2 or 3", &[2, 3])?;
                let condition = argument(0)?;
                if to_boolean(&condition, "iif")? == Some(true) {
                    argument(1)
                } else if args.len() == 3 {
                    argument(2)
                } else {
                    Ok(Vec::new())
                }
            }
            "resolve" => {
                arity("0", &[0])?;
                Ok(self.resolve_references(&base))
            }
            "extension" => {
                arity("1", &[1])?;
                let url = singleton_string(&argument(0)?, "extension")?;
                let extensions = navigate(&base, "extension");
                Ok(match url {
                    Some(url) => extensions
                        .into_iter()
                        .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(url.as_str()))
                        .collect(),
                    None => Vec::new(),
                })
            }
            "startsWith" | "endsWith" | "contains" | "matches" => {
                arity("1", &[1])?;
                let Some(text) = singleton_string(&base, name)? else {
                    return Ok(Vec::new());
                };
                let Some(pattern) = singleton_string(&argument(0)?, name)? else {
                    return Ok(Vec::new());
                };
                let result = match name {
                    "startsWith" => text.starts_with(pattern.as_str()),
                    "endsWith" => text.ends_with(pattern.as_str()),
                    "contains" => text.contains(pattern.as_str()),
                    _ => compile_regex(&pattern)?.is_match(&text),
                };
                Ok(vec![boolean(result)])
            }
            "replace" => {
                arity("2", &[2])?;
                let Some(text) = singleton_string(&base, name)? else {
                    return Ok(Vec::new());
                };
                let pattern = singleton_string(&argument(0)?, name)?.unwrap_or_default();
                let replacement = singleton_string(&argument(1)?, name)?.unwrap_or_default();
                Ok(vec![string(text.replace(&pattern, &replacement))])
            }
            "length" | "upper" | "lower" | "trim" => {
                arity("0", &[0])?;
                let Some(text) = singleton_string(&base, name)? else {
                    return Ok(Vec::new());
                };
                Ok(vec![match name {
                    "length" => Cow::Owned(Value::from(text.chars().count() as u64)),
                    "upper" => string(text.to_uppercase()),
                    "lower" => string(text.to_lowercase()),
                    _ => string(text.trim().to_string()),
                }])
            }
            "substring" => {
                arity("1 or 2", &[1, 2])?;
                let Some(text) = singleton_string(&base, name)? else {
                    return Ok(Vec::new());
                };
                let start = singleton_integer(&argument(0)?, name)?.unwrap_or(0);
                let chars: Vec<char> = text.chars().collect();
                if start < 0 || start as usize >= chars.len() {
                    return Ok(Vec::new());
                }
                let start = start as usize;
                let end = if args.len() == 2 {
                    let length = singleton_integer(&argument(1)?, name)?.unwrap_or(0).max(0);
                    (start + length as usize).min(chars.len())
                } else {
                    chars.len()
                };
                Ok(vec![string(chars[start..end].iter().collect())])
            }
            "toString" => {
                arity("0", &[0])?;
                Ok(base
                    .first()
                    .and_then(|v| primitive_text(v))
                    .map(string)
                    .into_iter()
                    .collect())
            }
            "toInteger" => {
                arity("0", &[0])?;
                let converted = match base.first().map(|v| v.as_ref()) {
                    Some(Value::Number(n)) if n.is_i64() => Some(Value::Number(n.clone())),
                    Some(Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
                    Some(Value::Bool(b)) => Some(Value::from(i64::from(*b))),
                    _ => None,
                };
                Ok(converted.map(Cow::Owned).into_iter().collect())
            }
            "field" | "component" | "subcomponent" => {
                let (expected, count) = match name {
                    "field" => ("1", 1),
                    "component" => ("2", 2),
                    _ => ("3", 3),
                };
                arity(expected, &[count])?;
                let mut positions = [1i64; 3];
                for (slot, position) in positions.iter_mut().enumerate().take(count) {
                    *position = singleton_integer(&argument(slot)?, name)?.unwrap_or(0);
                }
                Ok(hl7_values(&base, positions))
            }
            other => Err(EvaluationError::UnknownFunction {
                name: other.to_string(),
            }),
        }
    }

    fn resolve_references(&self, base: &[Cow<'a, Value>]) -> Collection<'a> {
        base.iter()
            .filter_map(|item| {
                let reference = match item.as_ref() {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(map) => map.get("reference").and_then(Value::as_str),
                    _ => None,
                }?;
                self.document.resolve(reference).map(Cow::Borrowed)
            })
            .collect()
    }
}

/// Member navigation with array flattening.
///
/// An identifier equal to an object's `resourceType` selects the object itself.
/// A member that is missing but has a typed variant (`value` for `valueQuantity`)
/// selects that variant.
fn navigate<'a>(base: &[Cow<'a, Value>], name: &str) -> Collection<'a> {
    let mut out = Vec::new();
    for item in base {
        match item {
            Cow::Borrowed(value) => {
                out.extend(member(*value, name).into_iter().map(Cow::Borrowed));
            }
            Cow::Owned(value) => {
                out.extend(member(value, name).into_iter().map(|v| Cow::Owned(v.clone())));
            }
        }
    }
    out
}

fn member<'v>(value: &'v Value, name: &str) -> Vec<&'v Value> {
    let Value::Object(map) = value else {
        return Vec::new();
    };
    if starts_uppercase(name) && map.get("resourceType").and_then(Value::as_str) == Some(name) {
        return vec![value];
    }
    let found = map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| {
                key.len() > name.len()
                    && key.starts_with(name)
                    && key[name.len()..].starts_with(|c: char| c.is_ascii_uppercase())
            })
            .map(|(_, v)| v)
    });
    match found {
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn starts_uppercase(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Values from HL7 segment objects at `[field, component, subcomponent]`, first repetition.
fn hl7_values<'a>(base: &[Cow<'a, Value>], positions: [i64; 3]) -> Collection<'a> {
    let [field, component, subcomponent] = positions;
    if field < 1 || component < 1 || subcomponent < 1 {
        return Vec::new();
    }
    base.iter()
        .filter_map(|segment| {
            let leaf = segment
                .get("fields")?
                .get(field as usize - 1)?
                .get(0)?
                .get(component as usize - 1)?
                .get(subcomponent as usize - 1)?
                .as_str()?;
            (!leaf.is_empty()).then(|| string(leaf.to_string()))
        })
        .collect()
}

fn literal_value(literal: &Literal) -> Option<Cow<'static, Value>> {
    let value = match literal {
        Literal::Empty => return None,
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Integer(i) => Value::from(*i),
        Literal::Decimal(d) => Value::Number(Number::from_f64(*d)?),
        Literal::String(s) => Value::String(s.clone()),
        Literal::DateTime(s) => Value::String(s.clone()),
    };
    Some(Cow::Owned(value))
}

fn boolean<'a>(value: bool) -> Cow<'a, Value> {
    Cow::Owned(Value::Bool(value))
}

fn string<'a>(value: String) -> Cow<'a, Value> {
    Cow::Owned(Value::String(value))
}

/// Collection to three-valued boolean.
fn to_boolean(collection: &[Cow<'_, Value>], context: &str) -> EvaluationResult<Option<bool>> {
    match collection {
        [] => Ok(None),
        [single] => Ok(Some(match single.as_ref() {
            Value::Bool(b) => *b,
            _ => true,
        })),
        many => Err(EvaluationError::SingletonExpected {
            context: context.to_string(),
            size: many.len(),
        }),
    }
}

fn singleton<'c, 'a>(
    collection: &'c [Cow<'a, Value>],
    context: &str,
) -> EvaluationResult<Option<&'c Value>> {
    match collection {
        [] => Ok(None),
        [single] => Ok(Some(single.as_ref())),
        many => Err(EvaluationError::SingletonExpected {
            context: context.to_string(),
            size: many.len(),
        }),
    }
}

fn singleton_string(collection: &[Cow<'_, Value>], context: &str) -> EvaluationResult<Option<String>> {
    match singleton(collection, context)? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(EvaluationError::type_error("String", other)),
    }
}

fn singleton_integer(collection: &[Cow<'_, Value>], context: &str) -> EvaluationResult<Option<i64>> {
    match singleton(collection, context)? {
        None => Ok(None),
        Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64()),
        Some(other) => Err(EvaluationError::type_error("Integer", other)),
    }
}

fn singleton_number(collection: &[Cow<'_, Value>], context: &str) -> EvaluationResult<Option<Number>> {
    match singleton(collection, context)? {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n.clone())),
        Some(other) => Err(EvaluationError::type_error("Number", other)),
    }
}

fn negate(number: &Number) -> Value {
    match number.as_i64() {
        Some(i) => Value::from(-i),
        None => number
            .as_f64()
            .and_then(|f| Number::from_f64(-f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}

fn primitive_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn type_argument(expression: &Expression) -> EvaluationResult<String> {
    match expression {
        Expression::Identifier(name) => Ok(name.clone()),
        Expression::Member { name, .. } => Ok(name.clone()),
        other => Err(EvaluationError::InvalidOperation {
            message: format!("expected a type name, got {other:?}"),
        }),
    }
}

fn is_type(value: &Value, type_name: &str) -> bool {
    match (value, type_name) {
        (Value::String(_), "String" | "string" | "code" | "uri" | "id" | "dateTime" | "date") => {
            true
        }
        (Value::Bool(_), "Boolean" | "boolean") => true,
        (Value::Number(n), "Integer" | "integer") => n.is_i64(),
        (Value::Number(_), "Decimal" | "decimal") => true,
        (Value::Object(map), name) => {
            map.get("resourceType").and_then(Value::as_str) == Some(name)
        }
        _ => false,
    }
}

fn compile_regex(pattern: &str) -> EvaluationResult<Regex> {
    Regex::new(pattern).map_err(|e| EvaluationError::InvalidRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn binary<'a>(
    op: BinaryOperator,
    lhs: Collection<'a>,
    rhs: Collection<'a>,
) -> EvaluationResult<Collection<'a>> {
    use BinaryOperator::*;

    match op {
        And | Or | Xor | Implies => {
            let left = to_boolean(&lhs, "logical operator")?;
            let right = to_boolean(&rhs, "logical operator")?;
            let result = match op {
                And => match (left, right) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                },
                Or => match (left, right) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                },
                Xor => match (left, right) {
                    (Some(a), Some(b)) => Some(a != b),
                    _ => None,
                },
                _ => match (left, right) {
                    (Some(false), _) | (_, Some(true)) => Some(true),
                    (Some(true), Some(false)) => Some(false),
                    _ => None,
                },
            };
            Ok(result.map(boolean).into_iter().collect())
        }
        Union => {
            let mut out: Collection<'a> = Vec::new();
            for item in lhs.into_iter().chain(rhs) {
                if !out.iter().any(|existing| existing.as_ref() == item.as_ref()) {
                    out.push(item);
                }
            }
            Ok(out)
        }
        In | Contains => {
            let (needle, haystack) = if op == In { (lhs, rhs) } else { (rhs, lhs) };
            let Some(needle) = singleton(&needle, "membership")? else {
                return Ok(Vec::new());
            };
            let found = haystack.iter().any(|v| values_equal(v, needle));
            Ok(vec![boolean(found)])
        }
        Equal | NotEqual => {
            if lhs.is_empty() || rhs.is_empty() {
                return Ok(Vec::new());
            }
            let equal = lhs.len() == rhs.len()
                && lhs.iter().zip(&rhs).all(|(a, b)| values_equal(a, b));
            Ok(vec![boolean(if op == Equal { equal } else { !equal })])
        }
        Equivalent | NotEquivalent => {
            let equivalent = lhs.len() == rhs.len()
                && lhs.iter().zip(&rhs).all(|(a, b)| values_equivalent(a, b));
            Ok(vec![boolean(if op == Equivalent {
                equivalent
            } else {
                !equivalent
            })])
        }
        LessThan | LessThanOrEqual | GreaterThan | GreaterThanOrEqual => {
            let (Some(a), Some(b)) = (singleton(&lhs, "comparison")?, singleton(&rhs, "comparison")?)
            else {
                return Ok(Vec::new());
            };
            let ordering = compare(a, b)?;
            let result = match op {
                LessThan => ordering == Ordering::Less,
                LessThanOrEqual => ordering != Ordering::Greater,
                GreaterThan => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(vec![boolean(result)])
        }
        Concatenate => {
            let a = singleton(&lhs, "&")?.and_then(primitive_text).unwrap_or_default();
            let b = singleton(&rhs, "&")?.and_then(primitive_text).unwrap_or_default();
            Ok(vec![string(a + &b)])
        }
        Add | Subtract | Multiply | Divide | IntegerDivide | Modulo => {
            let (Some(a), Some(b)) = (singleton(&lhs, "arithmetic")?, singleton(&rhs, "arithmetic")?)
            else {
                return Ok(Vec::new());
            };
            arithmetic(op, a, b).map(|v| v.map(Cow::Owned).into_iter().collect())
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn values_equivalent(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            normalize(x) == normalize(y)
        }
        _ => values_equal(a, b),
    }
}

fn compare(a: &Value, b: &Value) -> EvaluationResult<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).ok_or_else(|| EvaluationError::InvalidOperation {
                message: "numbers are not comparable".to_string(),
            })
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(EvaluationError::TypeError {
            expected: type_name(a).to_string(),
            actual: type_name(b).to_string(),
        }),
    }
}

fn arithmetic(op: BinaryOperator, a: &Value, b: &Value) -> EvaluationResult<Option<Value>> {
    use BinaryOperator::*;

    if let (Value::String(x), Value::String(y), Add) = (a, b, op) {
        return Ok(Some(Value::String(format!("{x}{y}"))));
    }
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(EvaluationError::TypeError {
            expected: "Number".to_string(),
            actual: format!("{} and {}", type_name(a), type_name(b)),
        });
    };

    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        let result = match op {
            Add => x.checked_add(y),
            Subtract => x.checked_sub(y),
            Multiply => x.checked_mul(y),
            IntegerDivide => x.checked_div(y),
            Modulo => x.checked_rem(y),
            _ => None,
        };
        if op != Divide {
            return Ok(result.map(Value::from));
        }
    }

    let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        Add => x + y,
        Subtract => x - y,
        Multiply => x * y,
        Divide if y != 0.0 => x / y,
        IntegerDivide if y != 0.0 => return Ok(Some(Value::from((x / y).trunc() as i64))),
        Modulo if y != 0.0 => x % y,
        _ => return Ok(None),
    };
    Ok(Number::from_f64(result).map(Value::Number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle() -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "message",
            "entry": [
                {"fullUrl": "Patient/p1", "resource": {
                    "resourceType": "Patient", "id": "p1",
                    "name": [{"family": "Doe", "given": ["Jane", "Q"]}],
                    "address": [{"state": "CO"}]
                }},
                {"fullUrl": "Observation/o1", "resource": {
                    "resourceType": "Observation", "id": "o1",
                    "subject": {"reference": "Patient/p1"},
                    "code": {"coding": [{"system": "http://loinc.org", "code": "94500-6"}]},
                    "valueQuantity": {"value": 4.5, "unit": "mg"}
                }},
                {"fullUrl": "Observation/o2", "resource": {
                    "resourceType": "Observation", "id": "o2",
                    "valueString": "positive"
                }}
            ]
        })
    }

    fn eval(root: &Value, expression: &str) -> Vec<Value> {
        evaluate(root, expression, &Bindings::new())
            .unwrap()
            .into_iter()
            .map(Cow::into_owned)
            .collect()
    }

    #[test]
    fn test_navigation_flattens_and_filters_by_type() {
        let root = bundle();
        assert_eq!(
            eval(&root, "Bundle.entry.resource.ofType(Observation).id"),
            vec![json!("o1"), json!("o2")]
        );
        assert_eq!(
            eval(&root, "entry.resource.name.given"),
            vec![json!("Jane"), json!("Q")]
        );
        assert!(eval(&root, "entry.resource.missing").is_empty());
    }

    #[test]
    fn test_choice_type_navigation() {
        let root = bundle();
        assert_eq!(
            eval(&root, "entry.resource.where(id = 'o1').value.value"),
            vec![json!(4.5)]
        );
        assert_eq!(
            eval(&root, "entry.resource.value.ofType(string)"),
            vec![json!("positive")]
        );
    }

    #[test]
    fn test_where_and_index_bindings() {
        let root = bundle();
        let matches = evaluate(&root, "entry.resource.where(resourceType = 'Observation')", &Bindings::new())
            .unwrap();
        assert_eq!(matches.len(), 2);

        let resource = matches[1].as_ref().clone();
        let bindings = Bindings::new().with_index(1).with_resource(&resource);
        let id = evaluate(&root, "%resource.id & '-' & %index.toString()", &bindings).unwrap();
        assert_eq!(id[0].as_ref(), &json!("o2-1"));
    }

    #[test]
    fn test_three_valued_logic() {
        let root = bundle();
        assert_eq!(eval(&root, "true and {}"), Vec::<Value>::new());
        assert_eq!(eval(&root, "false and {}"), vec![json!(false)]);
        assert_eq!(eval(&root, "true or {}"), vec![json!(true)]);
        assert_eq!(eval(&root, "{} implies false"), Vec::<Value>::new());
        assert_eq!(eval(&root, "false implies {}"), vec![json!(true)]);
        assert_eq!(eval(&root, "true xor false"), vec![json!(true)]);
    }

    #[test]
    fn test_conditions() {
        let root = bundle();
        let condition = |e: &str| evaluate_condition(&root, e, &Bindings::new());

        assert!(condition("entry.resource.address.state = 'CO'").unwrap());
        assert!(!condition("entry.resource.address.state = 'NY'").unwrap());
        assert!(!condition("entry.resource.address.missing = 'NY'").unwrap());
        assert!(condition("entry.resource.ofType(Patient).exists()").unwrap());
        assert!(condition("entry.resource.ofType(Patient).name.family").unwrap());
        assert!(matches!(
            condition("entry.resource.id"),
            Err(EvaluationError::SingletonExpected { size: 3, .. })
        ));
    }

    #[test]
    fn test_functions_and_arithmetic() {
        let root = bundle();
        assert_eq!(eval(&root, "entry.count() * 2 + 1"), vec![json!(7)]);
        assert_eq!(eval(&root, "7 div 2"), vec![json!(3)]);
        assert_eq!(eval(&root, "7 mod 2"), vec![json!(1)]);
        assert_eq!(eval(&root, "'Jane'.upper().substring(1, 2)"), vec![json!("AN")]);
        assert_eq!(eval(&root, "'94500-6'.matches('^[0-9]+-[0-9]$')"), vec![json!(true)]);
        assert_eq!(eval(&root, "iif(entry.exists(), 'yes', 'no')"), vec![json!("yes")]);
        assert_eq!(eval(&root, "'2' in ('1' | '2')"), vec![json!(true)]);
        assert_eq!(eval(&root, "entry.resource.id.last()"), vec![json!("o2")]);
        assert_eq!(eval(&root, "'Abc' ~ 'aBC'"), vec![json!(true)]);
        assert_eq!(eval(&root, "'12'.toInteger() + 1"), vec![json!(13)]);
    }

    #[test]
    fn test_unknown_variable_and_function() {
        let root = bundle();
        assert!(matches!(
            evaluate(&root, "%resource", &Bindings::new()),
            Err(EvaluationError::VariableNotFound { .. })
        ));
        assert!(matches!(
            evaluate(&root, "entry.frobnicate()", &Bindings::new()),
            Err(EvaluationError::UnknownFunction { .. })
        ));
        assert!(matches!(
            evaluate(&root, "entry.(", &Bindings::new()),
            Err(EvaluationError::Parse { .. })
        ));
    }

    #[test]
    fn test_hl7_field_helpers() {
        let segment = json!({
            "resourceType": "Segment",
            "name": "OBX",
            "fields": [
                [[["1"]]],
                [[["CWE"]]],
                [[["94500-6"], ["SARS"]], [["ignored"]]],
                [],
                [[["260373001"], ["Detected"], ["SCT"]]]
            ]
        });
        assert_eq!(eval(&segment, "field(3)"), vec![json!("94500-6")]);
        assert_eq!(eval(&segment, "component(5, 3)"), vec![json!("SCT")]);
        assert!(eval(&segment, "field(4)").is_empty());
        assert!(eval(&segment, "subcomponent(5, 1, 2)").is_empty());
    }
}
