//! Coding-system URI to HL7 table code lookup.

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;

/// Bidirectional map between canonical coding-system URIs and the short codes
/// HL7v2 carries in coded-element "name of coding system" components.
#[derive(Debug, Clone, Default)]
pub struct CodeSystemTable {
    by_uri: IndexMap<String, String>,
}

static STANDARD: Lazy<Arc<CodeSystemTable>> = Lazy::new(|| {
    Arc::new(CodeSystemTable::from_pairs([
        ("http://loinc.org", "LN"),
        ("http://snomed.info/sct", "SCT"),
        ("http://hl7.org/fhir/sid/icd-10-cm", "I10C"),
        ("http://hl7.org/fhir/sid/icd-10", "I10"),
        ("http://unitsofmeasure.org", "UCUM"),
        ("http://terminology.hl7.org/CodeSystem/v2-0203", "HL70203"),
        ("http://terminology.hl7.org/CodeSystem/v2-0136", "HL70136"),
        ("http://terminology.hl7.org/CodeSystem/v2-0078", "HL70078"),
        ("http://terminology.hl7.org/CodeSystem/v2-0125", "HL70125"),
        ("http://terminology.hl7.org/CodeSystem/v3-NullFlavor", "NULLFL"),
        ("urn:oid:2.16.840.1.113883.6.238", "CDCREC"),
    ]))
});

impl CodeSystemTable {
    /// The process-wide table of systems the hub knows about.
    pub fn standard() -> Arc<CodeSystemTable> {
        Arc::clone(&STANDARD)
    }

    pub fn from_pairs<I, U, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, C)>,
        U: Into<String>,
        C: Into<String>,
    {
        Self {
            by_uri: pairs
                .into_iter()
                .map(|(uri, code)| (uri.into(), code.into()))
                .collect(),
        }
    }

    /// Short code for a system URI.
    pub fn code_for(&self, uri: &str) -> Option<&str> {
        self.by_uri.get(uri).map(String::as_str)
    }

    /// System URI for a short code (case-insensitive).
    pub fn uri_for(&self, code: &str) -> Option<&str> {
        self.by_uri
            .iter()
            .find(|(_, c)| c.eq_ignore_ascii_case(code))
            .map(|(uri, _)| uri.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_uri.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uri.is_empty()
    }
}
