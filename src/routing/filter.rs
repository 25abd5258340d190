//! Receiver eligibility.
//!
//! A receiver carries four lists of boolean expressions. Within a list any
//! true expression passes it, and an empty list always passes. The receiver
//! is eligible when all four lists pass. A non-empty quality list alone can
//! be inverted with `reverse_the_quality_filter`, which lets a receiver take
//! exactly the reports that fail quality checks.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fhirpath::{self, Bindings, Document};
use crate::settings::{CustomerStatus, ReceiverSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Jurisdictional,
    Quality,
    Routing,
    ProcessingMode,
}

/// An expression that could not be evaluated and was counted as false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterFailure {
    pub category: FilterCategory,
    pub expression: String,
    pub error: String,
}

/// Per-category outcome of evaluating a receiver's filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub receiver: String,
    pub active: bool,
    pub jurisdictional: bool,
    /// Quality result after any reversal
    pub quality: bool,
    pub routing: bool,
    pub processing_mode: bool,
    pub failures: Vec<FilterFailure>,
}

impl FilterReport {
    pub fn is_eligible(&self) -> bool {
        self.active && self.jurisdictional && self.quality && self.routing && self.processing_mode
    }

    /// Categories that excluded the receiver.
    pub fn rejected_by(&self) -> Vec<FilterCategory> {
        [
            (FilterCategory::Jurisdictional, self.jurisdictional),
            (FilterCategory::Quality, self.quality),
            (FilterCategory::Routing, self.routing),
            (FilterCategory::ProcessingMode, self.processing_mode),
        ]
        .into_iter()
        .filter_map(|(category, passed)| (!passed).then_some(category))
        .collect()
    }
}

/// OR over a category's expressions; empty passes.
fn any_passes(
    document: &dyn Document,
    receiver: &str,
    category: FilterCategory,
    expressions: &[String],
    failures: &mut Vec<FilterFailure>,
) -> bool {
    if expressions.is_empty() {
        return true;
    }
    let mut passed = false;
    for expression in expressions {
        match fhirpath::evaluate_condition(document, expression, &Bindings::new()) {
            Ok(true) => passed = true,
            Ok(false) => {}
            Err(error) => {
                warn!(receiver, ?category, expression = %expression, %error, "filter evaluation failed");
                failures.push(FilterFailure {
                    category,
                    expression: expression.clone(),
                    error: error.to_string(),
                });
            }
        }
    }
    passed
}

/// Evaluate every filter category for a receiver.
///
/// All expressions are evaluated, even after a category is decided, so the
/// report lists every failing expression.
pub fn evaluate(document: &dyn Document, receiver: &ReceiverSettings) -> FilterReport {
    let name = receiver.full_name();
    let mut failures = Vec::new();

    let jurisdictional = any_passes(
        document,
        &name,
        FilterCategory::Jurisdictional,
        &receiver.jurisdictional_filter,
        &mut failures,
    );
    // An empty quality list is unrestricted and is not reversed.
    let quality = receiver.quality_filter.is_empty()
        || any_passes(
            document,
            &name,
            FilterCategory::Quality,
            &receiver.quality_filter,
            &mut failures,
        ) ^ receiver.reverse_the_quality_filter;
    let routing = any_passes(
        document,
        &name,
        FilterCategory::Routing,
        &receiver.routing_filter,
        &mut failures,
    );
    let processing_mode = any_passes(
        document,
        &name,
        FilterCategory::ProcessingMode,
        &receiver.processing_mode_filter,
        &mut failures,
    );

    FilterReport {
        receiver: name,
        active: receiver.customer_status != CustomerStatus::Inactive,
        jurisdictional,
        quality,
        routing,
        processing_mode,
        failures,
    }
}

/// Whether a receiver should get this document.
pub fn is_eligible(document: &dyn Document, receiver: &ReceiverSettings) -> bool {
    evaluate(document, receiver).is_eligible()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ReportFormat, TranslationSettings};
    use crate::transport::TransportConfig;
    use serde_json::{json, Value};

    const PASS: &str = "Bundle.entry.resource.ofType(Patient).exists()";
    const FAIL: &str = "Bundle.entry.resource.ofType(Specimen).exists()";

    fn receiver() -> ReceiverSettings {
        ReceiverSettings {
            name: "elr".to_string(),
            organization_name: "st".to_string(),
            topic: "covid-19".to_string(),
            customer_status: CustomerStatus::Active,
            jurisdictional_filter: Vec::new(),
            quality_filter: Vec::new(),
            routing_filter: Vec::new(),
            processing_mode_filter: Vec::new(),
            reverse_the_quality_filter: false,
            translation: TranslationSettings {
                schema: "fhir-to-oru-r01".to_string(),
                format: ReportFormat::Hl7,
                use_batching: false,
            },
            transport: TransportConfig::Null,
            timing: None,
        }
    }

    fn bundle() -> Value {
        json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"resourceType": "Patient", "id": "p"}}]
        })
    }

    #[test]
    fn test_empty_filters_never_exclude() {
        assert!(is_eligible(&bundle(), &receiver()));
    }

    #[test]
    fn test_or_within_and_across() {
        let mut r = receiver();
        r.jurisdictional_filter = vec![FAIL.to_string(), PASS.to_string()];
        r.routing_filter = vec![PASS.to_string()];
        assert!(is_eligible(&bundle(), &r));

        r.processing_mode_filter = vec![FAIL.to_string()];
        let report = evaluate(&bundle(), &r);
        assert!(!report.is_eligible());
        assert_eq!(report.rejected_by(), vec![FilterCategory::ProcessingMode]);
    }

    #[test]
    fn test_reversal_only_affects_quality() {
        let mut r = receiver();
        r.quality_filter = vec![FAIL.to_string()];
        assert!(!is_eligible(&bundle(), &r));
        r.reverse_the_quality_filter = true;
        assert!(is_eligible(&bundle(), &r));

        // A failing jurisdictional filter is not rescued by reversal.
        r.jurisdictional_filter = vec![FAIL.to_string()];
        let report = evaluate(&bundle(), &r);
        assert!(report.quality);
        assert!(!report.jurisdictional);
        assert!(!report.is_eligible());

        // An empty quality list never excludes, reversed or not.
        let mut r = receiver();
        r.reverse_the_quality_filter = true;
        assert!(is_eligible(&bundle(), &r));

        // A passing quality filter excludes once reversed.
        r.quality_filter = vec![PASS.to_string()];
        let report = evaluate(&bundle(), &r);
        assert_eq!(report.rejected_by(), vec![FilterCategory::Quality]);
    }

    #[test]
    fn test_evaluation_errors_count_as_false() {
        let mut r = receiver();
        r.routing_filter = vec!["Bundle.entry.resource.undefinedFn()".to_string(), PASS.to_string()];
        let report = evaluate(&bundle(), &r);
        assert!(report.routing);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].category, FilterCategory::Routing);

        r.routing_filter = vec!["Bundle.entry.resource.undefinedFn()".to_string()];
        assert!(!is_eligible(&bundle(), &r));
    }

    #[test]
    fn test_inactive_receivers_are_ineligible() {
        let mut r = receiver();
        r.customer_status = CustomerStatus::Inactive;
        let report = evaluate(&bundle(), &r);
        assert!(!report.active);
        assert!(!report.is_eligible());
        assert!(report.rejected_by().is_empty());

        r.customer_status = CustomerStatus::Testing;
        assert!(is_eligible(&bundle(), &r));
    }
}
