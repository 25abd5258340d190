//! FHIR R4 bundles: reading them as documents and building them from
//! generated mappings.

pub mod builder;
pub mod bundle;

pub use builder::FhirBundleBuilder;
pub use bundle::{Bundle, BundleError, BundleType, ResourceType, FHIR_CONTENT_TYPE};
