//! The hub's per-report flow.
//!
//! ```text
//! submission -> ingest (FHIR as is, HL7 through the sender's schema)
//!            -> per receiver on the topic: filters -> translation
//!               -> optional batch framing -> dispatch -> lineage
//! ```
//!
//! Each receiver is handled independently: a filter miss, translation error
//! or failed send for one receiver never affects another.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ack::{AckRequest, AckResponse};
use crate::error::{HubError, Result};
use crate::fhir::Bundle;
use crate::hl7::{join, BatchHeader, Hl7Message};
use crate::lineage::{
    ActionOutcome, LineageEvent, LineageRecorder, ReportAction, ReportLineage,
};
use crate::routing::{self, FilterReport};
use crate::settings::{HubSettings, ReceiverSettings, ReportFormat, SenderSettings};
use crate::template::TemplateStore;
use crate::translation::{Translated, Translator};
use crate::transport::{Dispatcher, PendingRetry, RetryToken, SendRequest};

/// One submitted payload as handed over by the ingestion layer.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub report_id: Uuid,
    /// Sender as `organization.name`
    pub sender: &'a str,
    pub content: &'a str,
    pub content_type: &'a str,
}

/// What happened for one receiver.
#[derive(Debug, Clone)]
pub struct ReceiverDelivery {
    pub receiver: String,
    pub filter: FilterReport,
    /// Id of the report produced for this receiver, when one was produced
    pub report_id: Option<Uuid>,
    pub content: Option<String>,
    pub content_type: Option<&'static str>,
    pub token: Option<RetryToken>,
    pub outcome: ActionOutcome,
    pub retry: Option<PendingRetry>,
}

impl ReceiverDelivery {
    fn not_sent(receiver: String, filter: FilterReport, outcome: ActionOutcome) -> Self {
        Self {
            receiver,
            filter,
            report_id: None,
            content: None,
            content_type: None,
            token: None,
            outcome,
            retry: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Delivered)
    }
}

fn outcome_for(token: &RetryToken) -> ActionOutcome {
    match token {
        RetryToken::None => ActionOutcome::Delivered,
        RetryToken::AllItems => ActionOutcome::Failed,
        RetryToken::Items(items) => ActionOutcome::PartiallyDelivered {
            failed_items: items.iter().copied().collect(),
        },
    }
}

pub struct Hub {
    settings: HubSettings,
    translator: Translator,
    dispatcher: Dispatcher,
    recorder: Arc<dyn LineageRecorder>,
}

impl Hub {
    /// Build a hub whose templates come from `settings.templates_dir`.
    pub fn new(settings: HubSettings, recorder: Arc<dyn LineageRecorder>) -> Self {
        let store = Arc::new(TemplateStore::new(settings.templates_dir.clone()));
        let dispatcher = Dispatcher::new(settings.nats_url.clone());
        Self::from_parts(settings, Translator::new(store), dispatcher, recorder)
    }

    pub fn from_parts(
        settings: HubSettings,
        translator: Translator,
        dispatcher: Dispatcher,
        recorder: Arc<dyn LineageRecorder>,
    ) -> Self {
        Self {
            settings,
            translator,
            dispatcher,
            recorder,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    fn sender(&self, name: &str) -> Result<&SenderSettings> {
        self.settings
            .sender(name)
            .ok_or_else(|| HubError::UnknownSender(name.to_string()))
    }

    /// Answer a submission: an HL7 ACK when the sender and message ask for
    /// one, a JSON report response otherwise.
    pub fn acknowledge(
        &self,
        submission: &Submission<'_>,
        status: axum::http::StatusCode,
    ) -> AckResponse {
        let ack_enabled = self
            .settings
            .sender(submission.sender)
            .is_some_and(|s| s.hl7_ack_enabled);
        AckResponse::for_request(&AckRequest {
            report_id: submission.report_id,
            ack_enabled,
            status,
            content_type: submission.content_type,
            body: submission.content,
            received_at: Utc::now(),
        })
    }

    /// Turn a submission into FHIR bundles, one per contained message.
    pub fn ingest(&self, submission: &Submission<'_>) -> Result<Vec<Bundle>> {
        let sender = self.sender(submission.sender)?;
        match sender.format {
            ReportFormat::Fhir => Ok(vec![Bundle::from_json(submission.content)?]),
            ReportFormat::Hl7 | ReportFormat::Hl7Batch => {
                let schema = sender
                    .schema_name
                    .as_deref()
                    .ok_or_else(|| HubError::MissingSchema(sender.full_name()))?;
                let messages = Hl7Message::parse_all(submission.content)?;
                messages
                    .iter()
                    .map(|message| {
                        self.translator
                            .hl7_to_fhir(message, schema)
                            .map_err(HubError::from)
                    })
                    .collect()
            }
            ReportFormat::Csv => Err(HubError::UnsupportedFormat(ReportFormat::Csv)),
        }
    }

    /// Ingest a submission and route every resulting bundle.
    pub async fn process(&self, submission: &Submission<'_>) -> Result<Vec<ReceiverDelivery>> {
        let sender = self.sender(submission.sender)?;
        let root = ReportLineage::submitted(
            submission.report_id,
            &sender.topic,
            sender.schema_name.as_deref().unwrap_or_default(),
        );
        self.record_lineage(&root);

        let bundles = self.ingest(submission)?;
        let mut deliveries = Vec::new();
        for bundle in &bundles {
            let converted = if sender.format == ReportFormat::Fhir {
                root.clone()
            } else {
                let child = root.child(
                    Uuid::new_v4(),
                    sender.schema_name.as_deref().unwrap_or_default(),
                    ReportAction::Convert,
                );
                self.record_lineage(&child);
                child
            };
            deliveries.extend(self.route_report(&converted, bundle).await);
        }
        Ok(deliveries)
    }

    /// Filter, translate and deliver one bundle to every receiver on its topic.
    pub async fn route_report(
        &self,
        lineage: &ReportLineage,
        bundle: &Bundle,
    ) -> Vec<ReceiverDelivery> {
        let routes = routing::route(bundle, &lineage.schema_topic, &self.settings.receivers);
        let mut deliveries = Vec::with_capacity(routes.len());
        for (receiver, filter) in routes {
            let delivery = self.deliver(lineage, bundle, receiver, filter).await;
            self.record_event(&LineageEvent::new(
                lineage.report_id,
                delivery.report_id,
                delivery.receiver.clone(),
                delivery.outcome.clone(),
            ));
            deliveries.push(delivery);
        }
        deliveries
    }

    async fn deliver(
        &self,
        lineage: &ReportLineage,
        bundle: &Bundle,
        receiver: &ReceiverSettings,
        filter: FilterReport,
    ) -> ReceiverDelivery {
        let name = receiver.full_name();
        if !filter.is_eligible() {
            let rejected_by = filter.rejected_by();
            return ReceiverDelivery::not_sent(name, filter, ActionOutcome::Filtered { rejected_by });
        }

        let schema = &receiver.translation.schema;
        let translated = match self.translator.translate(bundle, schema) {
            Ok(translated) => translated,
            Err(error) => {
                warn!(report_id = %lineage.report_id, receiver = %name, schema = %schema, %error, "translation failed");
                let message = error.to_string();
                return ReceiverDelivery::not_sent(name, filter, ActionOutcome::Error { message });
            }
        };

        let content_type = translated.content_type();
        let content = match (&translated, receiver.translation.use_batching) {
            (Translated::Hl7(message), true) => {
                let header = BatchHeader::from_message(&message.to_message(), Utc::now().into());
                join(&[message.encode()], &header)
            }
            _ => translated.encode(),
        };

        let report_id = Uuid::new_v4();
        let action = if receiver.translation.use_batching {
            ReportAction::Batch
        } else {
            ReportAction::Send
        };
        self.record_lineage(&lineage.child(report_id, schema, action));

        let item_count = 1;
        let token = self
            .dispatcher
            .send(
                &receiver.transport,
                &SendRequest {
                    report_id,
                    receiver: &name,
                    content: &content,
                    content_type,
                    item_count,
                },
                self.settings.transport_timeout(),
            )
            .await;

        let retry = PendingRetry::schedule(
            &self.settings.retry,
            report_id,
            &name,
            token.clone(),
            item_count,
            0,
            Utc::now(),
        );
        info!(report_id = %report_id, receiver = %name, delivered = token.is_delivered(), "routed report");

        ReceiverDelivery {
            receiver: name,
            filter,
            report_id: Some(report_id),
            content: Some(content),
            content_type: Some(content_type),
            outcome: outcome_for(&token),
            token: Some(token),
            retry,
        }
    }

    /// Run a scheduled retry. Returns the token mapped back to the original
    /// payload and the follow-up retry, if one is needed and allowed.
    pub async fn retry(
        &self,
        pending: &PendingRetry,
        content: &str,
        content_type: &str,
    ) -> Result<(RetryToken, Option<PendingRetry>)> {
        let receiver = self
            .settings
            .receiver(&pending.receiver)
            .ok_or_else(|| HubError::UnknownReceiver(pending.receiver.clone()))?;
        let (content, item_count) = pending.resend_content(content)?;

        let token = self
            .dispatcher
            .send(
                &receiver.transport,
                &SendRequest {
                    report_id: pending.report_id,
                    receiver: &pending.receiver,
                    content: &content,
                    content_type,
                    item_count,
                },
                self.settings.transport_timeout(),
            )
            .await;

        let next = pending.next(&self.settings.retry, token.clone(), Utc::now());
        let token = pending.remap(token);
        self.record_event(&LineageEvent::new(
            pending.report_id,
            Some(pending.report_id),
            pending.receiver.clone(),
            outcome_for(&token),
        ));
        Ok((token, next))
    }

    fn record_lineage(&self, lineage: &ReportLineage) {
        if let Err(error) = self.recorder.record_lineage(lineage) {
            warn!(report_id = %lineage.report_id, %error, "failed to record lineage");
        }
    }

    fn record_event(&self, event: &LineageEvent) {
        if let Err(error) = self.recorder.record_event(event) {
            warn!(report_id = %event.input_report_id, %error, "failed to record lineage event");
        }
    }
}
