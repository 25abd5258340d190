//! Schema-driven translation between HL7v2 and FHIR.
//!
//! A schema's output format decides the builder: `hl7v2` schemas feed the
//! structured HL7 builder, `fhir` schemas feed the bundle builder. The source
//! document can be anything the evaluator understands, so the same machinery
//! runs in both directions.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::error::BuildError;
use crate::fhir::{Bundle, BundleError, FhirBundleBuilder, FHIR_CONTENT_TYPE};
use crate::fhirpath::Document;
use crate::hl7::{Hl7Message, Hl7ParseError, MessageStructure, StructuredMessage, HL7_CONTENT_TYPE};
use crate::mapping::{MappingError, MappingGenerator};
use crate::template::{MappingSchema, OutputFormat, TemplateError, TemplateStore};

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("schema '{schema}' renders {actual}, expected {expected}")]
    FormatMismatch {
        schema: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("schema '{schema}': {source}")]
    Mapping {
        schema: String,
        #[source]
        source: MappingError,
    },

    #[error("schema '{schema}': {source}")]
    Build {
        schema: String,
        #[source]
        source: BuildError,
    },

    #[error("schema '{schema}' produced an invalid bundle: {source}")]
    Bundle {
        schema: String,
        #[source]
        source: BundleError,
    },

    #[error(transparent)]
    Parse(#[from] Hl7ParseError),
}

/// The output of a translation.
#[derive(Debug, Clone)]
pub enum Translated {
    Hl7(StructuredMessage),
    Fhir(Bundle),
}

impl Translated {
    pub fn content_type(&self) -> &'static str {
        match self {
            Translated::Hl7(_) => HL7_CONTENT_TYPE,
            Translated::Fhir(_) => FHIR_CONTENT_TYPE,
        }
    }

    /// Wire form: ER7 for HL7, compact JSON for FHIR.
    pub fn encode(&self) -> String {
        match self {
            Translated::Hl7(message) => message.encode(),
            Translated::Fhir(bundle) => bundle.as_value().to_string(),
        }
    }
}

fn format_name(output: &OutputFormat) -> &'static str {
    match output {
        OutputFormat::Hl7v2 { .. } => "hl7v2",
        OutputFormat::Fhir => "fhir",
    }
}

fn mismatch(schema: &MappingSchema, expected: &'static str) -> TranslationError {
    TranslationError::FormatMismatch {
        schema: schema.name.clone(),
        expected,
        actual: format_name(&schema.output),
    }
}

/// Renders documents through named schemas from a shared store.
#[derive(Debug, Clone)]
pub struct Translator {
    store: Arc<TemplateStore>,
    generator: MappingGenerator,
}

impl Translator {
    pub fn new(store: Arc<TemplateStore>) -> Self {
        Self {
            store,
            generator: MappingGenerator::default(),
        }
    }

    pub fn with_generator(store: Arc<TemplateStore>, generator: MappingGenerator) -> Self {
        Self { store, generator }
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    /// Render a document through the named schema.
    pub fn translate(
        &self,
        document: &dyn Document,
        schema_name: &str,
    ) -> Result<Translated, TranslationError> {
        let schema = self.store.get(schema_name)?;
        self.translate_with(document, &schema)
    }

    pub fn translate_with(
        &self,
        document: &dyn Document,
        schema: &MappingSchema,
    ) -> Result<Translated, TranslationError> {
        let mappings = self
            .generator
            .generate(&schema.templates, document)
            .map_err(|source| TranslationError::Mapping {
                schema: schema.name.clone(),
                source,
            })?;
        debug!(schema = %schema.name, mappings = mappings.len(), "generated mappings");

        match &schema.output {
            OutputFormat::Hl7v2 { structure } => {
                // Validated when the schema was loaded.
                let structure = MessageStructure::by_name(structure).ok_or_else(|| {
                    TemplateError::UnknownStructure {
                        schema: schema.name.clone(),
                        structure: structure.clone(),
                    }
                })?;
                let message = StructuredMessage::build(structure, &mappings).map_err(|source| {
                    TranslationError::Build {
                        schema: schema.name.clone(),
                        source,
                    }
                })?;
                Ok(Translated::Hl7(message))
            }
            OutputFormat::Fhir => {
                let builder = mappings
                    .iter()
                    .try_fold(FhirBundleBuilder::new(), |builder, mapping| {
                        builder.apply(mapping)
                    })
                    .map_err(|source| TranslationError::Build {
                        schema: schema.name.clone(),
                        source,
                    })?;
                let bundle = builder.finish().map_err(|source| TranslationError::Bundle {
                    schema: schema.name.clone(),
                    source,
                })?;
                Ok(Translated::Fhir(bundle))
            }
        }
    }

    /// FHIR bundle to HL7 through an `hl7v2` schema.
    pub fn fhir_to_hl7(
        &self,
        bundle: &Bundle,
        schema_name: &str,
    ) -> Result<StructuredMessage, TranslationError> {
        let schema = self.schema_for(schema_name, "hl7v2")?;
        match self.translate_with(bundle, &schema)? {
            Translated::Hl7(message) => Ok(message),
            Translated::Fhir(_) => Err(mismatch(&schema, "hl7v2")),
        }
    }

    /// HL7 message to a FHIR bundle through a `fhir` schema.
    pub fn hl7_to_fhir(
        &self,
        message: &Hl7Message,
        schema_name: &str,
    ) -> Result<Bundle, TranslationError> {
        let schema = self.schema_for(schema_name, "fhir")?;
        match self.translate_with(&message.to_document(), &schema)? {
            Translated::Fhir(bundle) => Ok(bundle),
            Translated::Hl7(_) => Err(mismatch(&schema, "fhir")),
        }
    }

    fn schema_for(
        &self,
        schema_name: &str,
        expected: &'static str,
    ) -> Result<Arc<MappingSchema>, TranslationError> {
        let schema = self.store.get(schema_name)?;
        if format_name(&schema.output) != expected {
            return Err(mismatch(&schema, expected));
        }
        Ok(schema)
    }

    /// Parse ER7 text and translate it to FHIR.
    pub fn hl7_text_to_fhir(&self, text: &str, schema_name: &str) -> Result<Bundle, TranslationError> {
        let message = Hl7Message::parse(text)?;
        self.hl7_to_fhir(&message, schema_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MappingTemplate;
    use serde_json::json;

    fn store() -> Arc<TemplateStore> {
        let store = TemplateStore::new("does-not-exist");
        store
            .insert(MappingSchema {
                name: "to-hl7".to_string(),
                description: None,
                output: OutputFormat::Hl7v2 {
                    structure: "ORU_R01".to_string(),
                },
                templates: vec![
                    MappingTemplate::new("Bundle.identifier", "{{ value }}", "MSH-10"),
                    MappingTemplate::new(
                        "Bundle.entry.resource.ofType(Patient)",
                        "{{ name.first().family }}",
                        "PID-5-1",
                    ),
                ],
            })
            .unwrap();
        store
            .insert(MappingSchema {
                name: "to-fhir".to_string(),
                description: None,
                output: OutputFormat::Fhir,
                templates: vec![MappingTemplate::new(
                    "segment.where(name = 'PID')",
                    "{{ component(5, 1) }}",
                    "Patient(patient).name[0].family",
                )],
            })
            .unwrap();
        Arc::new(store)
    }

    fn bundle() -> Bundle {
        Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "message",
            "identifier": {"value": "MSG-9"},
            "entry": [{"resource": {"resourceType": "Patient", "name": [{"family": "Doe"}]}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_both_directions() {
        let translator = Translator::new(store());
        let message = translator.fhir_to_hl7(&bundle(), "to-hl7").unwrap();
        assert_eq!(message.get("MSH-10"), Some("MSG-9"));
        assert_eq!(message.get("PID-5-1"), Some("Doe"));

        let back = translator
            .hl7_text_to_fhir(&message.encode(), "to-fhir")
            .unwrap();
        assert_eq!(
            back.resolve("Patient/patient").unwrap()["name"][0]["family"],
            "Doe"
        );
    }

    #[test]
    fn test_format_mismatch() {
        let translator = Translator::new(store());
        let err = translator.fhir_to_hl7(&bundle(), "to-fhir").unwrap_err();
        assert!(matches!(err, TranslationError::FormatMismatch { expected: "hl7v2", .. }));

        let message = translator.fhir_to_hl7(&bundle(), "to-hl7").unwrap().to_message();
        let err = translator.hl7_to_fhir(&message, "to-hl7").unwrap_err();
        assert!(matches!(err, TranslationError::FormatMismatch { actual: "hl7v2", .. }));
    }

    #[test]
    fn test_errors_name_the_schema() {
        let translator = Translator::new(store());
        let empty = Bundle::from_value(json!({"resourceType": "Bundle", "type": "message"})).unwrap();
        let err = translator.fhir_to_hl7(&empty, "to-hl7").unwrap_err();
        assert_eq!(
            err.to_string(),
            "schema 'to-hl7': no elements for Bundle.identifier"
        );
        assert!(matches!(
            translator.fhir_to_hl7(&empty, "missing"),
            Err(TranslationError::Template(TemplateError::NotFound { .. }))
        ));
    }
}
