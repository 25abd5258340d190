//! Building FHIR message bundles from mappings.
//!
//! Destination paths address an element inside a keyed resource:
//!
//! * `Patient(patient).name[0].given[1]`
//! * `Observation(obx-0).valueQuantity.value::decimal`
//! * `Bundle.timestamp` for fields of the bundle itself
//!
//! The key becomes the resource id and the entry's `fullUrl` is `Type/key`.
//! The optional `::decimal`, `::integer` or `::boolean` suffix coerces the
//! rendered text; without it values are stored as strings.

use indexmap::IndexMap;
use serde_json::{json, Map, Number, Value};
use tracing::debug;

use super::bundle::{Bundle, BundleError, ResourceType};
use crate::error::{AddressError, BuildError};
use crate::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coercion {
    Text,
    Decimal,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    name: String,
    index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Bundle,
    Resource { resource_type: ResourceType, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElementPath {
    target: Target,
    steps: Vec<Step>,
    coercion: Coercion,
}

impl ElementPath {
    fn parse(raw: &str) -> Result<Self, AddressError> {
        let invalid = |reason: &str| AddressError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let (body, coercion) = match raw.split_once("::") {
            Some((body, kind)) => {
                let coercion = match kind {
                    "decimal" => Coercion::Decimal,
                    "integer" => Coercion::Integer,
                    "boolean" => Coercion::Boolean,
                    "string" => Coercion::Text,
                    _ => return Err(invalid("unknown coercion")),
                };
                (body, coercion)
            }
            None => (raw, Coercion::Text),
        };

        let (head, rest) = body.split_once('.').ok_or_else(|| invalid("no element path"))?;
        let target = if head == "Bundle" {
            Target::Bundle
        } else {
            let (type_name, key) = head
                .strip_suffix(')')
                .and_then(|h| h.split_once('('))
                .ok_or_else(|| invalid("expected Type(key)"))?;
            if key.is_empty() || key.contains('/') {
                return Err(invalid("resource key must be non-empty and contain no '/'"));
            }
            let resource_type =
                type_name
                    .parse::<ResourceType>()
                    .map_err(|name| AddressError::UnknownElement {
                        name,
                        parent: "FHIR resource types".to_string(),
                    })?;
            if resource_type == ResourceType::Bundle {
                return Err(invalid("nested bundles are not supported"));
            }
            Target::Resource {
                resource_type,
                key: key.to_string(),
            }
        };

        let mut steps = Vec::new();
        for part in rest.split('.') {
            let (name, index) = match part.split_once('[') {
                Some((name, index)) => {
                    let index = index
                        .strip_suffix(']')
                        .and_then(|i| i.parse().ok())
                        .ok_or_else(|| invalid("bad array index"))?;
                    (name, Some(index))
                }
                None => (part, None),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("bad element name"));
            }
            if name == "resourceType" || (name == "id" && steps.is_empty()) {
                return Err(AddressError::Reserved {
                    field: raw.to_string(),
                });
            }
            steps.push(Step {
                name: name.to_string(),
                index,
            });
        }

        Ok(Self {
            target,
            steps,
            coercion,
        })
    }
}

fn coerce(value: &str, coercion: Coercion) -> Result<Value, AddressError> {
    let fail = |kind: &str| AddressError::Coercion {
        value: value.to_string(),
        kind: kind.to_string(),
    };
    match coercion {
        Coercion::Text => Ok(Value::String(value.to_string())),
        Coercion::Integer => value
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| fail("integer")),
        Coercion::Decimal => value
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| fail("decimal")),
        Coercion::Boolean => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "y" | "1" => Ok(Value::Bool(true)),
            "false" | "n" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail("boolean")),
        },
    }
}

/// Incremental builder for a FHIR message bundle.
///
/// Like the HL7 builder, `set` consumes the builder so a failed mapping
/// never leaves a partially populated bundle behind.
#[derive(Debug, Clone)]
pub struct FhirBundleBuilder {
    bundle: Map<String, Value>,
    resources: IndexMap<(ResourceType, String), Value>,
}

impl Default for FhirBundleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FhirBundleBuilder {
    pub fn new() -> Self {
        let mut bundle = Map::new();
        bundle.insert("resourceType".to_string(), json!("Bundle"));
        bundle.insert("type".to_string(), json!("message"));
        Self {
            bundle,
            resources: IndexMap::new(),
        }
    }

    /// Build a bundle from mappings, failing on the first bad path or value.
    pub fn build(mappings: &[Mapping]) -> Result<Bundle, BuildError> {
        mappings
            .iter()
            .try_fold(Self::new(), |builder, mapping| builder.apply(mapping))?
            .finish()
            .map_err(|e| BuildError {
                field: "Bundle".to_string(),
                value: String::new(),
                source: AddressError::Conflict {
                    path: "Bundle".to_string(),
                    reason: e.to_string(),
                },
            })
    }

    pub fn apply(self, mapping: &Mapping) -> Result<Self, BuildError> {
        self.set(&mapping.destination_field, &mapping.value)
    }

    pub fn set(mut self, field: &str, value: &str) -> Result<Self, BuildError> {
        let wrap = |source: AddressError| BuildError {
            field: field.to_string(),
            value: value.to_string(),
            source,
        };

        let path = ElementPath::parse(field).map_err(wrap)?;
        if value.is_empty() {
            return Ok(self);
        }
        let leaf = coerce(value, path.coercion).map_err(wrap)?;

        let root = match &path.target {
            Target::Bundle => &mut self.bundle,
            Target::Resource { resource_type, key } => {
                let resource = self
                    .resources
                    .entry((*resource_type, key.clone()))
                    .or_insert_with(|| {
                        json!({
                            "resourceType": resource_type.as_str(),
                            "id": key,
                        })
                    });
                match resource {
                    Value::Object(map) => map,
                    _ => return Err(wrap(conflict(field, "resource is not an object"))),
                }
            }
        };
        insert(root, &path.steps, leaf, field).map_err(wrap)?;
        debug!(field, value, "set FHIR element");
        Ok(self)
    }

    /// Assemble the bundle. Resources appear in the order they were first addressed.
    pub fn finish(self) -> Result<Bundle, BundleError> {
        let mut root = self.bundle;
        let entries: Vec<Value> = self
            .resources
            .into_iter()
            .map(|((resource_type, key), mut resource)| {
                prune(&mut resource);
                json!({
                    "fullUrl": format!("{resource_type}/{key}"),
                    "resource": resource,
                })
            })
            .collect();
        root.insert("entry".to_string(), Value::Array(entries));
        let mut root = Value::Object(root);
        prune(&mut root);
        Bundle::from_value(root)
    }
}

fn conflict(path: &str, reason: &str) -> AddressError {
    AddressError::Conflict {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn insert(
    root: &mut Map<String, Value>,
    steps: &[Step],
    leaf: Value,
    path: &str,
) -> Result<(), AddressError> {
    let Some((last, parents)) = steps.split_last() else {
        return Err(conflict(path, "empty element path"));
    };

    let mut current = root;
    for step in parents {
        let slot = current
            .entry(step.name.clone())
            .or_insert_with(|| match step.index {
                Some(_) => Value::Array(Vec::new()),
                None => Value::Object(Map::new()),
            });
        let next = match (slot, step.index) {
            (Value::Object(map), None) => map,
            (Value::Array(items), Some(index)) => {
                if items.len() <= index {
                    items.resize(index + 1, Value::Object(Map::new()));
                }
                let item = &mut items[index];
                if item.is_null() {
                    *item = Value::Object(Map::new());
                }
                match item {
                    Value::Object(map) => map,
                    _ => return Err(conflict(path, &format!("{} holds a primitive", step.name))),
                }
            }
            (Value::Array(_), None) => {
                return Err(conflict(path, &format!("{} is a list, index required", step.name)))
            }
            (_, Some(_)) => return Err(conflict(path, &format!("{} is not a list", step.name))),
            (_, None) => return Err(conflict(path, &format!("{} holds a primitive", step.name))),
        };
        current = next;
    }

    match last.index {
        None => {
            if let Some(Value::Object(_) | Value::Array(_)) = current.get(&last.name) {
                return Err(conflict(path, &format!("{} already holds structure", last.name)));
            }
            current.insert(last.name.clone(), leaf);
        }
        Some(index) => {
            let slot = current
                .entry(last.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = slot else {
                return Err(conflict(path, &format!("{} is not a list", last.name)));
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            items[index] = leaf;
        }
    }
    Ok(())
}

/// Drop nulls from lists and empty containers left by sparse indices.
fn prune(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune(child);
            }
            map.retain(|_, v| !is_empty_container(v));
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                prune(child);
            }
            items.retain(|v| !v.is_null() && !is_empty_container(v));
        }
        _ => {}
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhirpath::Document;

    fn mapping(field: &str, value: &str) -> Mapping {
        Mapping::new(field, value)
    }

    #[test]
    fn test_build_message_bundle() {
        let bundle = FhirBundleBuilder::build(&[
            mapping("Bundle.identifier.value", "CTRL-1"),
            mapping("Patient(patient).name[0].family", "Doe"),
            mapping("Patient(patient).name[0].given[1]", "Q"),
            mapping("Patient(patient).name[0].given[0]", "Jane"),
            mapping("Observation(obx-0).valueQuantity.value::decimal", "4.5"),
            mapping("Observation(obx-0).subject.reference", "Patient/patient"),
            mapping("Observation(obx-0).status", ""),
        ])
        .unwrap();
        let root = bundle.root();

        assert_eq!(root["type"], "message");
        assert_eq!(root["identifier"]["value"], "CTRL-1");
        assert_eq!(root["entry"][0]["fullUrl"], "Patient/patient");
        assert_eq!(root["entry"][0]["resource"]["id"], "patient");
        assert_eq!(
            root["entry"][0]["resource"]["name"][0]["given"],
            json!(["Jane", "Q"])
        );
        assert_eq!(root["entry"][1]["resource"]["valueQuantity"]["value"], json!(4.5));
        assert!(root["entry"][1]["resource"].get("status").is_none());
        assert_eq!(bundle.resolve("Patient/patient").unwrap()["name"][0]["family"], "Doe");
    }

    #[test]
    fn test_sparse_lists_are_compacted() {
        let bundle = FhirBundleBuilder::build(&[mapping("Patient(p).identifier[2].value", "X")])
            .unwrap();
        assert_eq!(
            bundle.root()["entry"][0]["resource"]["identifier"],
            json!([{"value": "X"}])
        );
    }

    #[test]
    fn test_path_errors_carry_context() {
        let err = FhirBundleBuilder::build(&[mapping("Widget(w).name", "x")]).unwrap_err();
        assert_eq!(err.field, "Widget(w).name");
        assert!(matches!(err.source, AddressError::UnknownElement { .. }));

        let err = FhirBundleBuilder::build(&[mapping("Patient.name", "x")]).unwrap_err();
        assert!(matches!(err.source, AddressError::InvalidPath { .. }));

        let err = FhirBundleBuilder::build(&[mapping("Patient(p).id", "x")]).unwrap_err();
        assert!(matches!(err.source, AddressError::Reserved { .. }));

        // Empty values still validate their path.
        let err = FhirBundleBuilder::build(&[mapping("Nope(p).x", "")]).unwrap_err();
        assert!(matches!(err.source, AddressError::UnknownElement { .. }));
    }

    #[test]
    fn test_coercion_and_conflicts() {
        let err = FhirBundleBuilder::build(&[mapping("Observation(o).valueInteger::integer", "4.5")])
            .unwrap_err();
        assert!(matches!(err.source, AddressError::Coercion { .. }));

        let err = FhirBundleBuilder::build(&[
            mapping("Patient(p).gender", "female"),
            mapping("Patient(p).gender.code", "F"),
        ])
        .unwrap_err();
        assert_eq!(err.field, "Patient(p).gender.code");
        assert!(matches!(err.source, AddressError::Conflict { .. }));

        let bundle =
            FhirBundleBuilder::build(&[mapping("Patient(p).active::boolean", "Y")]).unwrap();
        assert_eq!(bundle.root()["entry"][0]["resource"]["active"], json!(true));
    }
}
