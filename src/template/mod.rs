//! Declarative mapping templates and the store that loads them.
//!
//! One YAML file per schema, resolved by name from the template directory:
//!
//! ```yaml
//! name: oru-r01
//! output:
//!   format: hl7v2
//!   structure: ORU_R01
//! templates:
//!   - source: "Bundle.entry.resource.ofType(Observation)"
//!     value: "{{ code.coding.first().code }}"
//!     destination: "/PATIENT_RESULT/ORDER_OBSERVATION/OBSERVATION({{ %index }})/OBX-3-1"
//! ```

pub mod code_systems;
pub mod render;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fhirpath::{self, EvaluationError};
use crate::hl7::MessageStructure;

pub use code_systems::CodeSystemTable;
pub use render::{
    parse_datetime, CompiledTemplate, DatePrecision, RenderError, Renderer, TemplateValue, Timestamp,
};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse template file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no schema named '{name}' in {dir}")]
    NotFound { name: String, dir: PathBuf },

    #[error("schema '{schema}' template {index}: invalid source selector: {source}")]
    InvalidSelector {
        schema: String,
        index: usize,
        #[source]
        source: EvaluationError,
    },

    #[error("schema '{schema}' template {index}: {source}")]
    InvalidTemplate {
        schema: String,
        index: usize,
        #[source]
        source: RenderError,
    },

    #[error("schema '{schema}' targets unknown message structure '{structure}'")]
    UnknownStructure { schema: String, structure: String },
}

/// One selector-driven mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTemplate {
    /// Selector whose matches drive this template (must match at least once)
    #[serde(rename = "source")]
    pub source_selector: String,

    /// Template producing the value, rendered with `%index` and `%resource`
    #[serde(rename = "value")]
    pub value_expr: String,

    /// Template producing the destination field path, rendered with `%index`
    #[serde(rename = "destination")]
    pub destination_expr: String,

    #[serde(skip)]
    compiled: OnceCell<CompiledMapping>,
}

/// The value and destination templates of a rule, parsed.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub value: CompiledTemplate,
    pub destination: CompiledTemplate,
}

impl MappingTemplate {
    pub fn new(
        source_selector: impl Into<String>,
        value_expr: impl Into<String>,
        destination_expr: impl Into<String>,
    ) -> Self {
        Self {
            source_selector: source_selector.into(),
            value_expr: value_expr.into(),
            destination_expr: destination_expr.into(),
            compiled: OnceCell::new(),
        }
    }

    /// Parsed templates, compiled on first use and kept afterwards.
    pub fn compiled(&self) -> Result<&CompiledMapping, RenderError> {
        self.compiled.get_or_try_init(|| {
            Ok(CompiledMapping {
                value: CompiledTemplate::parse(&self.value_expr)?,
                destination: CompiledTemplate::parse(&self.destination_expr)?,
            })
        })
    }
}

impl PartialEq for MappingTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.source_selector == other.source_selector
            && self.value_expr == other.value_expr
            && self.destination_expr == other.destination_expr
    }
}

impl Eq for MappingTemplate {}

/// What a schema renders to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum OutputFormat {
    /// HL7v2 ER7 with the named message structure (`ORU_R01`)
    Hl7v2 { structure: String },
    /// FHIR message bundle (JSON)
    Fhir,
}

/// A named, ordered list of templates with its output format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSchema {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub output: OutputFormat,

    pub templates: Vec<MappingTemplate>,
}

impl MappingSchema {
    /// Parse a schema from YAML text and validate it.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, TemplateError> {
        let schema: MappingSchema =
            serde_yaml::from_str(text).map_err(|source| TemplateError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check every selector parses, every template compiles and the output
    /// structure exists. Compiled templates stay on the schema for rendering.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if let OutputFormat::Hl7v2 { structure } = &self.output {
            if MessageStructure::by_name(structure).is_none() {
                return Err(TemplateError::UnknownStructure {
                    schema: self.name.clone(),
                    structure: structure.clone(),
                });
            }
        }
        for (index, template) in self.templates.iter().enumerate() {
            fhirpath::validate(&template.source_selector).map_err(|source| {
                TemplateError::InvalidSelector {
                    schema: self.name.clone(),
                    index,
                    source,
                }
            })?;
            template
                .compiled()
                .map_err(|source| TemplateError::InvalidTemplate {
                    schema: self.name.clone(),
                    index,
                    source,
                })?;
        }
        Ok(())
    }
}

/// Loads schemas from a directory on first use and keeps them for the life of
/// the process. Entries are immutable once loaded.
#[derive(Debug)]
pub struct TemplateStore {
    dir: PathBuf,
    cache: DashMap<String, Arc<MappingSchema>>,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a schema by name, loading `<dir>/<name>.yaml` on first access.
    ///
    /// # Errors
    /// Returns `NotFound` when no file exists for the name, or a parse or
    /// validation error for a malformed file.
    ///
    /// # Example
    /// ```ignore
    /// let store = TemplateStore::new("templates");
    /// let schema = store.get("fhir-to-oru-r01")?;
    /// ```
    pub fn get(&self, name: &str) -> Result<Arc<MappingSchema>, TemplateError> {
        if let Some(schema) = self.cache.get(name) {
            return Ok(Arc::clone(&schema));
        }

        let path = ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| TemplateError::NotFound {
                name: name.to_string(),
                dir: self.dir.clone(),
            })?;

        let text = fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;
        let schema = Arc::new(MappingSchema::from_yaml(&text, &path)?);
        debug!(
            schema = name,
            templates = schema.templates.len(),
            path = %path.display(),
            "loaded mapping schema"
        );

        let entry = self
            .cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&schema));
        Ok(Arc::clone(&entry))
    }

    /// Register a schema built in code, replacing any cached copy.
    pub fn insert(&self, schema: MappingSchema) -> Result<Arc<MappingSchema>, TemplateError> {
        schema.validate()?;
        let schema = Arc::new(schema);
        self.cache.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Load every schema file in the directory, failing on the first bad one.
    pub fn preload(&self) -> Result<usize, TemplateError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| TemplateError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut loaded = 0;
        for entry in entries {
            let entry = entry.map_err(|source| TemplateError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|s| s.to_str())) {
                self.get(stem)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"
name: sample
description: sample schema
output:
  format: hl7v2
  structure: ORU_R01
templates:
  - source: "Bundle.entry.resource.ofType(Observation)"
    value: "{{ id }}"
    destination: "/PATIENT_RESULT/ORDER_OBSERVATION/OBSERVATION({{ %index }})/OBX-3-1"
"#;

    #[test]
    fn test_load_and_cache() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("sample.yaml"), SCHEMA).unwrap();

        let store = TemplateStore::new(dir.path());
        let first = store.get("sample").unwrap();
        assert_eq!(
            first.output,
            OutputFormat::Hl7v2 {
                structure: "ORU_R01".to_string()
            }
        );
        assert_eq!(first.templates.len(), 1);
        assert_eq!(first.templates[0].value_expr, "{{ id }}");
        let compiled = first.templates[0].compiled.get().unwrap();
        assert_eq!(compiled.value.source(), "{{ id }}");

        // Cached entries survive the file going away.
        fs::remove_file(dir.path().join("sample.yaml")).unwrap();
        let second = store.get("sample").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_schema() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());
        assert!(matches!(store.get("nope"), Err(TemplateError::NotFound { .. })));
    }

    #[test]
    fn test_invalid_selector_rejected_at_load() {
        let dir = TempDir::new().unwrap();
        let bad = SCHEMA.replace("ofType(Observation)", "ofType(");
        fs::write(dir.path().join("bad.yaml"), bad).unwrap();

        let store = TemplateStore::new(dir.path());
        assert!(matches!(
            store.get("bad"),
            Err(TemplateError::InvalidSelector { index: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_structure_and_filter() {
        let schema = MappingSchema {
            name: "x".to_string(),
            description: None,
            output: OutputFormat::Hl7v2 {
                structure: "ADT_A01".to_string(),
            },
            templates: Vec::new(),
        };
        assert!(matches!(
            schema.validate(),
            Err(TemplateError::UnknownStructure { .. })
        ));

        let schema = MappingSchema {
            name: "y".to_string(),
            description: None,
            output: OutputFormat::Fhir,
            templates: vec![MappingTemplate::new("segment", "{{ name | shout }}", "x")],
        };
        assert!(matches!(
            schema.validate(),
            Err(TemplateError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_preload_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yaml"), SCHEMA.replace("sample", "a")).unwrap();
        fs::write(dir.path().join("b.yml"), SCHEMA.replace("sample", "b")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TemplateStore::new(dir.path());
        assert_eq!(store.preload().unwrap(), 2);
        assert_eq!(store.len(), 2);
    }
}
