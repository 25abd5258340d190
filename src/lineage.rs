//! Report lineage.
//!
//! Every report the hub creates points back at the report it came from and
//! at the root submission. Lineage and delivery events are emitted through a
//! [`LineageRecorder`]; storage is the recorder's business.

use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::routing::FilterCategory;

#[derive(Debug, Error)]
pub enum LineageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lineage recorder lock poisoned")]
    Poisoned,
}

/// The step that produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportAction {
    Receive,
    Convert,
    Route,
    Batch,
    Send,
    Resend,
}

/// Parentage of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLineage {
    pub report_id: Uuid,
    pub parent_report_id: Option<Uuid>,
    pub root_report_id: Uuid,
    pub schema_topic: String,
    pub schema_name: String,
    pub action: ReportAction,
}

impl ReportLineage {
    /// A submitted report, which is its own root.
    pub fn submitted(report_id: Uuid, schema_topic: &str, schema_name: &str) -> Self {
        Self {
            report_id,
            parent_report_id: None,
            root_report_id: report_id,
            schema_topic: schema_topic.to_string(),
            schema_name: schema_name.to_string(),
            action: ReportAction::Receive,
        }
    }

    /// A report derived from this one.
    pub fn child(&self, report_id: Uuid, schema_name: &str, action: ReportAction) -> Self {
        Self {
            report_id,
            parent_report_id: Some(self.report_id),
            root_report_id: self.root_report_id,
            schema_topic: self.schema_topic.clone(),
            schema_name: schema_name.to_string(),
            action,
        }
    }
}

/// What happened to a report for one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Delivered,
    PartiallyDelivered { failed_items: Vec<usize> },
    Failed,
    Filtered { rejected_by: Vec<FilterCategory> },
    Error { message: String },
}

/// One delivery outcome for one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEvent {
    pub input_report_id: Uuid,
    pub output_report_id: Option<Uuid>,
    pub receiver_name: String,
    pub outcome: ActionOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl LineageEvent {
    pub fn new(
        input_report_id: Uuid,
        output_report_id: Option<Uuid>,
        receiver_name: impl Into<String>,
        outcome: ActionOutcome,
    ) -> Self {
        Self {
            input_report_id,
            output_report_id,
            receiver_name: receiver_name.into(),
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// Sink for lineage records.
pub trait LineageRecorder: Send + Sync {
    fn record_lineage(&self, lineage: &ReportLineage) -> Result<(), LineageError>;

    fn record_event(&self, event: &LineageEvent) -> Result<(), LineageError>;
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    lineage: Mutex<Vec<ReportLineage>>,
    events: Mutex<Vec<LineageEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lineage(&self) -> Vec<ReportLineage> {
        self.lineage.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<LineageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl LineageRecorder for MemoryRecorder {
    fn record_lineage(&self, lineage: &ReportLineage) -> Result<(), LineageError> {
        self.lineage
            .lock()
            .map_err(|_| LineageError::Poisoned)?
            .push(lineage.clone());
        Ok(())
    }

    fn record_event(&self, event: &LineageEvent) -> Result<(), LineageError> {
        self.events
            .lock()
            .map_err(|_| LineageError::Poisoned)?
            .push(event.clone());
        Ok(())
    }
}

/// NDJSON (Newline Delimited JSON) writer
///
/// Writes records as NDJSON, one JSON object per line.
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single record as an NDJSON line
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), LineageError> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LineageError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum NdjsonRecord<'a> {
    Lineage(&'a ReportLineage),
    Event(&'a LineageEvent),
}

/// Appends every record as one NDJSON line, tagged `"record": "lineage"` or
/// `"record": "event"`.
pub struct NdjsonRecorder<W: Write + Send> {
    writer: Mutex<NdjsonWriter<W>>,
}

impl<W: Write + Send> NdjsonRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(NdjsonWriter::new(writer)),
        }
    }

    pub fn into_inner(self) -> Result<W, LineageError> {
        self.writer
            .into_inner()
            .map(NdjsonWriter::into_inner)
            .map_err(|_| LineageError::Poisoned)
    }

    fn write(&self, record: NdjsonRecord<'_>) -> Result<(), LineageError> {
        let mut writer = self.writer.lock().map_err(|_| LineageError::Poisoned)?;
        writer.write(&record)?;
        writer.flush()
    }
}

impl<W: Write + Send> LineageRecorder for NdjsonRecorder<W> {
    fn record_lineage(&self, lineage: &ReportLineage) -> Result<(), LineageError> {
        self.write(NdjsonRecord::Lineage(lineage))
    }

    fn record_event(&self, event: &LineageEvent) -> Result<(), LineageError> {
        self.write(NdjsonRecord::Event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_root() {
        let root = ReportLineage::submitted(Uuid::new_v4(), "covid-19", "oru-r01-to-fhir");
        let converted = root.child(Uuid::new_v4(), "fhir-to-oru-r01", ReportAction::Convert);
        let sent = converted.child(Uuid::new_v4(), "fhir-to-oru-r01", ReportAction::Send);

        assert_eq!(root.parent_report_id, None);
        assert_eq!(sent.parent_report_id, Some(converted.report_id));
        assert_eq!(sent.root_report_id, root.report_id);
        assert_eq!(sent.schema_topic, "covid-19");
    }

    #[test]
    fn test_memory_recorder() {
        let recorder = MemoryRecorder::new();
        let id = Uuid::new_v4();
        recorder
            .record_lineage(&ReportLineage::submitted(id, "t", "s"))
            .unwrap();
        recorder
            .record_event(&LineageEvent::new(id, None, "st.elr", ActionOutcome::Failed))
            .unwrap();
        assert_eq!(recorder.lineage().len(), 1);
        assert_eq!(recorder.events()[0].receiver_name, "st.elr");
    }

    #[test]
    fn test_ndjson_recorder() {
        let recorder = NdjsonRecorder::new(Vec::new());
        let id = Uuid::new_v4();
        recorder
            .record_lineage(&ReportLineage::submitted(id, "covid-19", "s"))
            .unwrap();
        recorder
            .record_event(&LineageEvent::new(
                id,
                Some(Uuid::new_v4()),
                "st.elr",
                ActionOutcome::PartiallyDelivered {
                    failed_items: vec![1],
                },
            ))
            .unwrap();

        let output = String::from_utf8(recorder.into_inner().unwrap()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"], "lineage");
        assert_eq!(lines[0]["action"], "receive");
        assert_eq!(lines[1]["record"], "event");
        assert_eq!(lines[1]["outcome"]["status"], "partially_delivered");
        assert_eq!(lines[1]["outcome"]["failed_items"][0], 1);
    }
}
