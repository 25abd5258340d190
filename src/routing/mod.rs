//! Selecting receivers for a report.

pub mod filter;

use tracing::debug;

use crate::fhirpath::Document;
use crate::settings::ReceiverSettings;

pub use filter::{evaluate, is_eligible, FilterCategory, FilterFailure, FilterReport};

/// Evaluate every receiver on `topic` and return each with its report, in
/// declaration order.
pub fn route<'r>(
    document: &dyn Document,
    topic: &str,
    receivers: &'r [ReceiverSettings],
) -> Vec<(&'r ReceiverSettings, FilterReport)> {
    receivers
        .iter()
        .filter(|receiver| receiver.topic == topic)
        .map(|receiver| {
            let report = evaluate(document, receiver);
            debug!(
                receiver = %report.receiver,
                eligible = report.is_eligible(),
                rejected_by = ?report.rejected_by(),
                "evaluated receiver filters"
            );
            (receiver, report)
        })
        .collect()
}

/// Receivers on `topic` that should get this document.
pub fn eligible_receivers<'r>(
    document: &dyn Document,
    topic: &str,
    receivers: &'r [ReceiverSettings],
) -> Vec<&'r ReceiverSettings> {
    route(document, topic, receivers)
        .into_iter()
        .filter_map(|(receiver, report)| report.is_eligible().then_some(receiver))
        .collect()
}
