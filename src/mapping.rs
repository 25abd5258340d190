//! Mapping generation: templates × document → ordered `(field, value)` pairs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fhirpath::{self, Bindings, Document, EvaluationError};
use crate::template::{MappingTemplate, RenderError, Renderer};

/// One destination assignment produced by a template match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub destination_field: String,
    pub value: String,
}

impl Mapping {
    pub fn new(destination_field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            destination_field: destination_field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("no elements for {selector}")]
    NoElements { selector: String },

    #[error("failed to resolve selector {selector}: {source}")]
    Selector {
        selector: String,
        #[source]
        source: EvaluationError,
    },

    #[error("template for {selector} at index {index}: {source}")]
    Render {
        selector: String,
        index: usize,
        #[source]
        source: RenderError,
    },
}

/// Produces mappings from templates using a shared renderer.
#[derive(Debug, Clone, Default)]
pub struct MappingGenerator {
    renderer: Renderer,
}

impl MappingGenerator {
    pub fn new(renderer: Renderer) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Resolve each template's selector against the document and render one
    /// mapping per match.
    ///
    /// Templates are processed in declaration order and matches in selector
    /// order, so repeating destinations keep the relative order of their
    /// sources. A selector with no matches fails the whole generation.
    pub fn generate(
        &self,
        templates: &[MappingTemplate],
        document: &dyn Document,
    ) -> Result<Vec<Mapping>, MappingError> {
        let mut mappings = Vec::new();
        for template in templates {
            let selector = template.source_selector.as_str();
            let matches = fhirpath::evaluate(document, selector, &Bindings::new()).map_err(
                |source| MappingError::Selector {
                    selector: selector.to_string(),
                    source,
                },
            )?;
            if matches.is_empty() {
                return Err(MappingError::NoElements {
                    selector: selector.to_string(),
                });
            }

            let compiled = template.compiled().map_err(|source| MappingError::Render {
                selector: selector.to_string(),
                index: 0,
                source,
            })?;
            for (index, element) in matches.iter().enumerate() {
                let render_error = |source| MappingError::Render {
                    selector: selector.to_string(),
                    index,
                    source,
                };
                let field_bindings = Bindings::new().with_index(index);
                let destination_field = self
                    .renderer
                    .render_compiled(&compiled.destination, document, &field_bindings)
                    .map_err(render_error)?;

                let value_bindings = Bindings::new()
                    .with_index(index)
                    .with_resource(element.as_ref());
                let value = self
                    .renderer
                    .render_compiled(&compiled.value, document, &value_bindings)
                    .map_err(render_error)?;

                debug!(selector, index, field = %destination_field, value = %value, "mapped");
                mappings.push(Mapping {
                    destination_field,
                    value,
                });
            }
        }
        Ok(mappings)
    }
}
