//! Hub configuration: senders, receivers and delivery defaults.
//!
//! Settings are read from one YAML file. Two environment variables override
//! file values: `REPORTWIRE_TEMPLATES_DIR` and `NATS_URL`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fhirpath::{self, EvaluationError};
use crate::transport::{RetryPolicy, TransportConfig};

pub const TEMPLATES_DIR_ENV: &str = "REPORTWIRE_TEMPLATES_DIR";
pub const NATS_URL_ENV: &str = "NATS_URL";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("receiver '{receiver}' has an invalid {category} filter '{expression}': {source}")]
    InvalidFilter {
        receiver: String,
        category: &'static str,
        expression: String,
        #[source]
        source: EvaluationError,
    },
}

/// Wire format of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportFormat {
    Hl7,
    Hl7Batch,
    Fhir,
    Csv,
}

impl ReportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Hl7 | ReportFormat::Hl7Batch => crate::hl7::HL7_CONTENT_TYPE,
            ReportFormat::Fhir => crate::fhir::FHIR_CONTENT_TYPE,
            ReportFormat::Csv => "text/csv",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerStatus {
    #[default]
    Active,
    Inactive,
    Testing,
}

/// An organization submitting reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSettings {
    pub name: String,
    pub organization_name: String,
    pub topic: String,
    pub format: ReportFormat,
    /// Schema used to turn this sender's HL7 into FHIR
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub hl7_ack_enabled: bool,
    #[serde(default)]
    pub customer_status: CustomerStatus,
}

impl SenderSettings {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.organization_name, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationSettings {
    /// Schema rendering the bundle for this receiver
    pub schema: String,
    pub format: ReportFormat,
    #[serde(default)]
    pub use_batching: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOperation {
    #[default]
    None,
    Merge,
}

/// When batched deliveries go out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default)]
    pub operation: BatchOperation,
    pub number_per_day: u32,
    pub initial_time: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

/// A downstream jurisdiction and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSettings {
    pub name: String,
    pub organization_name: String,
    pub topic: String,
    #[serde(default)]
    pub customer_status: CustomerStatus,
    #[serde(default)]
    pub jurisdictional_filter: Vec<String>,
    #[serde(default)]
    pub quality_filter: Vec<String>,
    #[serde(default)]
    pub routing_filter: Vec<String>,
    #[serde(default)]
    pub processing_mode_filter: Vec<String>,
    #[serde(default)]
    pub reverse_the_quality_filter: bool,
    pub translation: TranslationSettings,
    #[serde(default = "default_transport")]
    pub transport: TransportConfig,
    #[serde(default)]
    pub timing: Option<TimingSettings>,
}

fn default_transport() -> TransportConfig {
    TransportConfig::Null
}

impl ReceiverSettings {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.organization_name, self.name)
    }

    /// Every filter expression with its category name.
    pub fn filters(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("jurisdictional", &self.jurisdictional_filter),
            ("quality", &self.quality_filter),
            ("routing", &self.routing_filter),
            ("processing mode", &self.processing_mode_filter),
        ]
        .into_iter()
        .flat_map(|(category, list)| list.iter().map(move |e| (category, e.as_str())))
    }
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Complete hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSettings {
    pub hub_name: String,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    #[serde(default = "default_timeout_secs")]
    pub transport_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub senders: Vec<SenderSettings>,
    #[serde(default)]
    pub receivers: Vec<ReceiverSettings>,
}

impl HubSettings {
    /// Load settings from a YAML file and apply environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, does not parse, names a
    /// sender or receiver twice, or carries a filter that does not parse.
    ///
    /// # Example
    /// ```ignore
    /// let settings = HubSettings::load_from_file("config/hub.yaml")?;
    /// println!("{} receivers", settings.receivers.len());
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_yaml(&contents)?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Parse and validate settings without touching the environment.
    pub fn from_yaml(text: &str) -> Result<Self, SettingsError> {
        let settings: HubSettings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override file values from a variable lookup (normally the process environment).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(TEMPLATES_DIR_ENV) {
            self.templates_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup(NATS_URL_ENV) {
            self.nats_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut seen = HashSet::new();
        for sender in &self.senders {
            if !seen.insert(sender.full_name()) {
                return Err(SettingsError::Duplicate {
                    kind: "sender",
                    name: sender.full_name(),
                });
            }
        }

        let mut seen = HashSet::new();
        for receiver in &self.receivers {
            if !seen.insert(receiver.full_name()) {
                return Err(SettingsError::Duplicate {
                    kind: "receiver",
                    name: receiver.full_name(),
                });
            }
            for (category, expression) in receiver.filters() {
                fhirpath::validate(expression).map_err(|source| SettingsError::InvalidFilter {
                    receiver: receiver.full_name(),
                    category,
                    expression: expression.to_string(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    /// Look up a sender by `organization.name`.
    pub fn sender(&self, full_name: &str) -> Option<&SenderSettings> {
        self.senders.iter().find(|s| s.full_name() == full_name)
    }

    /// Look up a receiver by `organization.name`.
    pub fn receiver(&self, full_name: &str) -> Option<&ReceiverSettings> {
        self.receivers.iter().find(|r| r.full_name() == full_name)
    }

    /// Receivers subscribed to a topic, in declaration order.
    pub fn receivers_for_topic<'a>(
        &'a self,
        topic: &'a str,
    ) -> impl Iterator<Item = &'a ReceiverSettings> + 'a {
        self.receivers.iter().filter(move |r| r.topic == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const SETTINGS: &str = r#"
hub_name: test-hub
senders:
  - name: elr
    organization_name: lab
    topic: covid-19
    format: HL7
    schema_name: oru-r01-to-fhir
    hl7_ack_enabled: true
receivers:
  - name: elr
    organization_name: state
    topic: covid-19
    jurisdictional_filter:
      - "Bundle.entry.resource.ofType(Patient).address.state = 'ST'"
    quality_filter:
      - "Bundle.entry.resource.ofType(Patient).exists()"
    translation:
      schema: fhir-to-oru-r01
      format: HL7
      use_batching: true
    transport:
      type: rest
      url: http://localhost:9000/reports
    timing:
      operation: MERGE
      number_per_day: 12
      initial_time: "00:00"
  - name: archive
    organization_name: state
    topic: covid-19
    customer_status: inactive
    translation:
      schema: identity
      format: FHIR
"#;

    #[test]
    fn test_parse_settings() {
        let settings = HubSettings::from_yaml(SETTINGS).unwrap();
        assert_eq!(settings.templates_dir, PathBuf::from("templates"));
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.transport_timeout(), Duration::from_secs(30));

        let sender = settings.sender("lab.elr").unwrap();
        assert!(sender.hl7_ack_enabled);
        assert_eq!(sender.format, ReportFormat::Hl7);

        let receiver = settings.receiver("state.elr").unwrap();
        assert!(receiver.translation.use_batching);
        assert_eq!(receiver.timing.as_ref().unwrap().time_zone, "UTC");
        assert_eq!(receiver.filters().count(), 2);

        let archive = settings.receiver("state.archive").unwrap();
        assert_eq!(archive.customer_status, CustomerStatus::Inactive);
        assert_eq!(archive.transport, TransportConfig::Null);
        assert_eq!(settings.receivers_for_topic("covid-19").count(), 2);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = HubSettings::from_yaml(SETTINGS).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (TEMPLATES_DIR_ENV, "/etc/reportwire/templates"),
            (NATS_URL_ENV, "nats://nats:4222"),
        ]);
        settings.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(
            settings.templates_dir,
            PathBuf::from("/etc/reportwire/templates")
        );
        assert_eq!(settings.nats_url, "nats://nats:4222");
    }

    #[test]
    fn test_rejects_bad_filters_and_duplicates() {
        let bad = SETTINGS.replace("address.state = 'ST'", "address.state = ");
        assert!(matches!(
            HubSettings::from_yaml(&bad),
            Err(SettingsError::InvalidFilter { category: "jurisdictional", .. })
        ));

        let duplicate = SETTINGS.replace("name: archive", "name: elr");
        assert!(matches!(
            HubSettings::from_yaml(&duplicate),
            Err(SettingsError::Duplicate { kind: "receiver", .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.yaml");
        fs::write(&path, SETTINGS).unwrap();
        let settings = HubSettings::load_from_file(&path).unwrap();
        assert_eq!(settings.hub_name, "test-hub");

        assert!(matches!(
            HubSettings::load_from_file(dir.path().join("missing.yaml")),
            Err(SettingsError::Io { .. })
        ));
    }
}
