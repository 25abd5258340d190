//! Acknowledging a submission.
//!
//! A sender that asked for HL7 acknowledgments and submitted exactly one HL7
//! message with MSH-15 `AL` gets an HL7 `ACK` back. Everyone else gets a JSON
//! report response.

use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::BuildError;
use crate::hl7::structure::ACK;
use crate::hl7::{Hl7Message, StructuredMessage, StructuredMessageBuilder, HL7_CONTENT_TYPE};

/// What the ingestion layer knows about one submission.
#[derive(Debug, Clone, Copy)]
pub struct AckRequest<'a> {
    pub report_id: Uuid,
    /// Sender setting `hl7_ack_enabled`
    pub ack_enabled: bool,
    /// Outcome the submission is answered with
    pub status: StatusCode,
    pub content_type: &'a str,
    pub body: &'a str,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Accepted,
    Failed,
}

/// JSON body returned when no HL7 acknowledgment applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub id: Uuid,
    pub status: ReportStatus,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ReportResponse {
    pub fn new(report_id: Uuid, status: StatusCode, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: report_id,
            status: if status.is_success() {
                ReportStatus::Accepted
            } else {
                ReportStatus::Failed
            },
            timestamp,
            location: history_location(report_id),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// Where a report's delivery history can be fetched.
pub fn history_location(report_id: Uuid) -> String {
    format!("/api/waters/report/{report_id}/history")
}

#[derive(Debug, Clone)]
pub enum AckDecision {
    WireFormatAck(StructuredMessage),
    StructuredResponse(ReportResponse),
}

fn is_hl7(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|media| media.eq_ignore_ascii_case(HL7_CONTENT_TYPE))
}

/// The single message an HL7 acknowledgment would answer, if every
/// condition for one holds.
fn ack_candidate(request: &AckRequest<'_>) -> Option<Hl7Message> {
    if !request.ack_enabled || !request.status.is_success() || !is_hl7(request.content_type) {
        return None;
    }
    if Hl7Message::is_batch(request.body) {
        return None;
    }
    let message = Hl7Message::parse(request.body).ok()?;
    (message.accept_ack_type() == Some("AL")).then_some(message)
}

/// Decide how to answer a submission.
pub fn decide(request: &AckRequest<'_>) -> AckDecision {
    let structured = || {
        AckDecision::StructuredResponse(ReportResponse::new(
            request.report_id,
            request.status,
            request.received_at,
        ))
    };

    let Some(original) = ack_candidate(request) else {
        return structured();
    };
    match build_ack(&original, request.report_id, request.received_at) {
        Ok(ack) => AckDecision::WireFormatAck(ack),
        Err(error) => {
            warn!(report_id = %request.report_id, %error, "could not build HL7 acknowledgment");
            structured()
        }
    }
}

/// Build a commit-accept `ACK` for `original`, addressed back to its sender.
pub fn build_ack(
    original: &Hl7Message,
    control_id: Uuid,
    now: DateTime<Utc>,
) -> Result<StructuredMessage, BuildError> {
    let mut builder = StructuredMessageBuilder::new(&ACK);

    // Sending and receiving application/facility trade places.
    for (to, from) in [(3, 5), (4, 6), (5, 3), (6, 4)] {
        for component in 1..=3 {
            if let Some(value) = original.get(&format!("MSH-{from}-{component}")) {
                builder = builder.set(&format!("MSH-{to}-{component}"), value)?;
            }
        }
    }

    let trigger = original.get("MSH-9-2").unwrap_or_default();
    builder = builder
        .set("MSH-7", &now.format("%Y%m%d%H%M%S%z").to_string())?
        .set("MSH-9-2", trigger)?
        .set("MSH-9-3", if trigger.is_empty() { "" } else { "ACK" })?
        .set("MSH-10", &control_id.simple().to_string())?
        .set("MSH-11", original.get("MSH-11").unwrap_or_default())?
        .set("MSH-15", "NE")?
        .set("MSH-16", "NE")?
        .set("MSA-1", "CA")?
        .set("MSA-2", original.control_id().unwrap_or_default())?;
    Ok(builder.finish())
}

/// An acknowledgment decision paired with the HTTP status it answers with.
#[derive(Debug, Clone)]
pub struct AckResponse {
    pub status: StatusCode,
    pub decision: AckDecision,
}

impl AckResponse {
    pub fn for_request(request: &AckRequest<'_>) -> Self {
        Self {
            status: request.status,
            decision: decide(request),
        }
    }
}

impl IntoResponse for AckResponse {
    fn into_response(self) -> Response {
        match self.decision {
            AckDecision::WireFormatAck(message) => {
                (self.status, [(CONTENT_TYPE, HL7_CONTENT_TYPE)], message.encode()).into_response()
            }
            AckDecision::StructuredResponse(body) => (self.status, Json(body)).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SINGLE: &str = "MSH|^~\\&|LAB^1.2.3^ISO|FAC|HUB|HUBFAC|20240301101500-0500||ORU^R01^ORU_R01|CTRL-7|P|2.5.1|||AL|NE\rPID|1||MRN-1";

    fn request<'a>(status: StatusCode, content_type: &'a str, body: &'a str) -> AckRequest<'a> {
        AckRequest {
            report_id: Uuid::nil(),
            ack_enabled: true,
            status,
            content_type,
            body,
            received_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, 15, 0).unwrap(),
        }
    }

    #[test]
    fn test_hl7_ack_for_single_al_message() {
        let decision = decide(&request(StatusCode::CREATED, HL7_CONTENT_TYPE, SINGLE));
        let AckDecision::WireFormatAck(ack) = decision else {
            panic!("expected an HL7 ACK, got {decision:?}");
        };
        assert_eq!(ack.get("MSA-1"), Some("CA"));
        assert_eq!(ack.get("MSA-2"), Some("CTRL-7"));
        assert_eq!(ack.get("MSH-3-1"), Some("HUB"));
        assert_eq!(ack.get("MSH-5-1"), Some("LAB"));
        assert_eq!(ack.get("MSH-5-2"), Some("1.2.3"));
        assert_eq!(ack.get("MSH-6"), Some("FAC"));
        assert_eq!(ack.get("MSH-9-1"), Some("ACK"));
        assert_eq!(ack.get("MSH-9-2"), Some("R01"));
        assert_eq!(ack.get("MSH-11"), Some("P"));
        assert!(ack.encode().starts_with("MSH|^~\\&|HUB|HUBFAC|LAB^1.2.3^ISO|FAC|20240301151500+0000||ACK^R01^ACK|"));
    }

    #[test]
    fn test_structured_response_cases() {
        let ne = SINGLE.replace("|AL|NE", "|NE|NE");
        let batch = format!("FHS|^~\\&\rBHS|^~\\&\r{SINGLE}\rBTS|1\rFTS|1");
        let two = format!("{SINGLE}\r{SINGLE}");
        let cases = [
            request(StatusCode::CREATED, HL7_CONTENT_TYPE, &ne),
            request(StatusCode::BAD_REQUEST, HL7_CONTENT_TYPE, SINGLE),
            request(StatusCode::CREATED, "application/fhir+json", SINGLE),
            request(StatusCode::CREATED, HL7_CONTENT_TYPE, &batch),
            request(StatusCode::CREATED, HL7_CONTENT_TYPE, &two),
            AckRequest {
                ack_enabled: false,
                ..request(StatusCode::CREATED, HL7_CONTENT_TYPE, SINGLE)
            },
        ];
        for case in &cases {
            assert!(
                matches!(decide(case), AckDecision::StructuredResponse(_)),
                "expected JSON response for {case:?}"
            );
        }
    }

    #[test]
    fn test_content_type_parameters_are_ignored() {
        let decision = decide(&request(
            StatusCode::OK,
            "application/hl7-v2; charset=utf-8",
            SINGLE,
        ));
        assert!(matches!(decision, AckDecision::WireFormatAck(_)));
    }

    #[test]
    fn test_response_body() {
        let AckDecision::StructuredResponse(body) =
            decide(&request(StatusCode::BAD_REQUEST, HL7_CONTENT_TYPE, SINGLE))
        else {
            panic!("expected a JSON response");
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(
            json["location"],
            "/api/waters/report/00000000-0000-0000-0000-000000000000/history"
        );
        assert!(json.get("errors").is_none());
    }

    #[test]
    fn test_into_response() {
        let response =
            AckResponse::for_request(&request(StatusCode::CREATED, HL7_CONTENT_TYPE, SINGLE))
                .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], HL7_CONTENT_TYPE);

        let response =
            AckResponse::for_request(&request(StatusCode::CREATED, "application/fhir+json", "{}"))
                .into_response();
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
