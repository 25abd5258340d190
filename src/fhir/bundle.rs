//! FHIR Bundle document.
//!
//! The bundle keeps its JSON tree as parsed and adds a reference index so
//! selectors can follow `Reference.reference` values to other entries. Only
//! the resource types the hub exchanges are accepted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::fhirpath::Document;

/// Media type for FHIR JSON content.
pub const FHIR_CONTENT_TYPE: &str = "application/fhir+json";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a Bundle, got {0}")]
    NotABundle(String),

    #[error("entry {index} has no resourceType")]
    MissingResourceType { index: usize },

    #[error("entry {index} has unsupported resource type '{resource_type}'")]
    UnknownResourceType { index: usize, resource_type: String },
}

/// Resource types a bundle may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Bundle,
    MessageHeader,
    Provenance,
    Patient,
    RelatedPerson,
    Organization,
    Practitioner,
    PractitionerRole,
    Location,
    Device,
    Encounter,
    ServiceRequest,
    DiagnosticReport,
    Observation,
    Specimen,
    Condition,
    Immunization,
}

impl ResourceType {
    pub const ALL: &'static [ResourceType] = &[
        ResourceType::Bundle,
        ResourceType::MessageHeader,
        ResourceType::Provenance,
        ResourceType::Patient,
        ResourceType::RelatedPerson,
        ResourceType::Organization,
        ResourceType::Practitioner,
        ResourceType::PractitionerRole,
        ResourceType::Location,
        ResourceType::Device,
        ResourceType::Encounter,
        ResourceType::ServiceRequest,
        ResourceType::DiagnosticReport,
        ResourceType::Observation,
        ResourceType::Specimen,
        ResourceType::Condition,
        ResourceType::Immunization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Bundle => "Bundle",
            ResourceType::MessageHeader => "MessageHeader",
            ResourceType::Provenance => "Provenance",
            ResourceType::Patient => "Patient",
            ResourceType::RelatedPerson => "RelatedPerson",
            ResourceType::Organization => "Organization",
            ResourceType::Practitioner => "Practitioner",
            ResourceType::PractitionerRole => "PractitionerRole",
            ResourceType::Location => "Location",
            ResourceType::Device => "Device",
            ResourceType::Encounter => "Encounter",
            ResourceType::ServiceRequest => "ServiceRequest",
            ResourceType::DiagnosticReport => "DiagnosticReport",
            ResourceType::Observation => "Observation",
            ResourceType::Specimen => "Specimen",
            ResourceType::Condition => "Condition",
            ResourceType::Immunization => "Immunization",
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bundle.type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
    History,
    Searchset,
    Collection,
}

/// A parsed, read-only FHIR bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: Value,
    bundle_type: Option<BundleType>,
    /// Entry position by fullUrl and by `Type/id`
    references: HashMap<String, usize>,
}

impl Bundle {
    pub fn from_json(text: &str) -> Result<Self, BundleError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Validate the resource types and build the reference index.
    pub fn from_value(root: Value) -> Result<Self, BundleError> {
        match root.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            Some(other) => return Err(BundleError::NotABundle(other.to_string())),
            None => return Err(BundleError::NotABundle("a value without resourceType".to_string())),
        }
        let bundle_type = root
            .get("type")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok());

        let mut references = HashMap::new();
        let entries = root.get("entry").and_then(Value::as_array);
        for (index, entry) in entries.into_iter().flatten().enumerate() {
            let Some(resource) = entry.get("resource") else {
                continue;
            };
            let resource_type = resource
                .get("resourceType")
                .and_then(Value::as_str)
                .ok_or(BundleError::MissingResourceType { index })?;
            resource_type
                .parse::<ResourceType>()
                .map_err(|resource_type| BundleError::UnknownResourceType {
                    index,
                    resource_type,
                })?;

            if let Some(full_url) = entry.get("fullUrl").and_then(Value::as_str) {
                references.insert(full_url.to_string(), index);
            }
            if let Some(id) = resource.get("id").and_then(Value::as_str) {
                references.entry(format!("{resource_type}/{id}")).or_insert(index);
            }
        }

        Ok(Self {
            root,
            bundle_type,
            references,
        })
    }

    pub fn bundle_type(&self) -> Option<BundleType> {
        self.bundle_type
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn to_json_pretty(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }

    /// Entry resources in bundle order.
    pub fn resources(&self) -> impl Iterator<Item = &Value> {
        self.root
            .get("entry")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.get("resource"))
    }

    pub fn resources_of(&self, resource_type: ResourceType) -> impl Iterator<Item = &Value> {
        self.resources().filter(move |r| {
            r.get("resourceType").and_then(Value::as_str) == Some(resource_type.as_str())
        })
    }

    pub fn message_header(&self) -> Option<&Value> {
        self.resources_of(ResourceType::MessageHeader).next()
    }

    pub fn len(&self) -> usize {
        self.resources().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_resource(&self, index: usize) -> Option<&Value> {
        self.root.get("entry")?.get(index)?.get("resource")
    }
}

impl Document for Bundle {
    fn root(&self) -> &Value {
        &self.root
    }

    /// Accepts fullUrls, relative `Type/id` references and absolute URLs whose
    /// last two path segments are `Type/id`.
    fn resolve(&self, reference: &str) -> Option<&Value> {
        if let Some(index) = self.references.get(reference) {
            return self.entry_resource(*index);
        }
        let mut parts = reference.trim_end_matches('/').rsplit('/');
        let id = parts.next()?;
        let resource_type = parts.next()?;
        let index = self.references.get(&format!("{resource_type}/{id}"))?;
        self.entry_resource(*index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhirpath::{evaluate, Bindings};
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "message",
            "entry": [
                {"fullUrl": "urn:uuid:1111", "resource": {"resourceType": "Patient", "id": "p1"}},
                {"fullUrl": "Observation/o1", "resource": {
                    "resourceType": "Observation", "id": "o1",
                    "subject": {"reference": "urn:uuid:1111"},
                    "performer": [{"reference": "http://example.org/fhir/Organization/org1"}]
                }},
                {"resource": {"resourceType": "Organization", "id": "org1", "name": "Lab"}}
            ]
        })
    }

    #[test]
    fn test_parse_and_index() {
        let bundle = Bundle::from_value(sample()).unwrap();
        assert_eq!(bundle.bundle_type(), Some(BundleType::Message));
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.resources_of(ResourceType::Observation).count(), 1);
        assert_eq!(bundle.resolve("Patient/p1").unwrap()["id"], "p1");
        assert_eq!(bundle.resolve("urn:uuid:1111").unwrap()["id"], "p1");
        assert_eq!(
            bundle
                .resolve("http://example.org/fhir/Organization/org1")
                .unwrap()["name"],
            "Lab"
        );
        assert!(bundle.resolve("Patient/missing").is_none());
    }

    #[test]
    fn test_selectors_follow_references() {
        let bundle = Bundle::from_value(sample()).unwrap();
        let names = evaluate(
            &bundle,
            "Bundle.entry.resource.ofType(Observation).performer.resolve().name",
            &Bindings::new(),
        )
        .unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].as_ref(), &json!("Lab"));

        let subject = evaluate(
            &bundle,
            "Bundle.entry.resource.ofType(Observation).subject.resolve().id",
            &Bindings::new(),
        )
        .unwrap();
        assert_eq!(subject[0].as_ref(), &json!("p1"));
    }

    #[test]
    fn test_rejects_unknown_types() {
        let mut value = sample();
        value["entry"][2]["resource"]["resourceType"] = json!("Basic");
        assert!(matches!(
            Bundle::from_value(value),
            Err(BundleError::UnknownResourceType { index: 2, .. })
        ));
        assert!(matches!(
            Bundle::from_json(r#"{"resourceType": "Patient"}"#),
            Err(BundleError::NotABundle(_))
        ));
        assert!(matches!(Bundle::from_json("{"), Err(BundleError::Json(_))));
    }
}
