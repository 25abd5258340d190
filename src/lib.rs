//! # Reportwire: HL7v2 / FHIR report routing hub
//!
//! Reportwire accepts lab reports as HL7v2 or FHIR, converts them with
//! declarative YAML mapping templates, decides which receivers get each
//! report and delivers it over REST, file drop or NATS JetStream.
//!
//! ## Features
//!
//! - **Template-driven translation**: FHIRPath selectors and `{{ }}` value
//!   templates map one format onto the other (see [`template`])
//! - **Structured HL7 building**: messages are built against their declared
//!   group structure, with terser-style destination paths
//! - **Batch framing**: split and join `FHS`/`BHS` batches by message index
//! - **Receiver filters**: jurisdictional, quality, routing and processing
//!   mode expressions, with quality reversal
//! - **Delivery with retry tokens**: partial failures resend only the
//!   messages a receiver rejected
//! - **Lineage**: every derived report points at its parent and root
//!
//! ## Example: mapping template
//!
//! ```yaml
//! name: fhir-to-oru-r01
//! output:
//!   format: hl7v2
//!   structure: ORU_R01
//! templates:
//!   - source: "Bundle.entry.resource.ofType(Patient)"
//!     value: "{{ name.first().family }}"
//!     destination: "/PATIENT_RESULT/PATIENT/PID-5-1"
//! ```
//!
//! ## Example: receiver settings
//!
//! ```yaml
//! receivers:
//!   - name: elr
//!     organization_name: co-phd
//!     topic: covid-19
//!     jurisdictional_filter:
//!       - "Bundle.entry.resource.ofType(Patient).address.state = 'CO'"
//!     translation:
//!       schema: fhir-to-oru-r01
//!       format: HL7
//!     transport:
//!       type: rest
//!       url: https://elr.example.org/reports
//! ```

// Expression language and templates
pub mod fhirpath;
pub mod mapping;
pub mod template;

// Wire formats
pub mod fhir;
pub mod hl7;
pub mod translation;

// Hub
pub mod ack;
pub mod error;
pub mod lineage;
pub mod pipeline;
pub mod routing;
pub mod settings;
pub mod transport;

pub use error::{AddressError, BuildError, HubError, Result};

pub use fhir::{Bundle, FhirBundleBuilder};
pub use hl7::{join, split, BatchHeader, Hl7Message, StructuredMessage, StructuredMessageBuilder};
pub use mapping::{Mapping, MappingGenerator};
pub use template::{MappingSchema, MappingTemplate, TemplateStore};
pub use translation::{Translated, Translator};

pub use ack::{AckDecision, AckResponse, ReportResponse};
pub use lineage::{LineageRecorder, MemoryRecorder, NdjsonRecorder, ReportLineage};
pub use pipeline::{Hub, ReceiverDelivery, Submission};
pub use routing::{FilterCategory, FilterReport};
pub use settings::{HubSettings, ReceiverSettings, SenderSettings};
pub use transport::{Dispatcher, PendingRetry, RetryPolicy, RetryToken, TransportConfig};
