//! Delivery by writing files into a receiver's drop directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{RetryToken, SendRequest, Transport, TransportError};
use crate::fhir::FHIR_CONTENT_TYPE;
use crate::hl7::HL7_CONTENT_TYPE;

/// Writes `<report_id>.<ext>` into a directory. The file is written under a
/// temporary name and renamed, so pickers never see partial content.
#[derive(Debug, Clone)]
pub struct FileDropTransport {
    directory: PathBuf,
}

impl FileDropTransport {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn extension(content_type: &str) -> &'static str {
        match content_type {
            HL7_CONTENT_TYPE => "hl7",
            FHIR_CONTENT_TYPE => "fhir",
            "application/json" => "json",
            "text/csv" => "csv",
            _ => "txt",
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransportError {
    let path = path.to_path_buf();
    move |source| TransportError::Io { path, source }
}

#[async_trait]
impl Transport for FileDropTransport {
    async fn send(&self, request: &SendRequest<'_>) -> Result<RetryToken, TransportError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_error(&self.directory))?;

        let name = format!(
            "{}.{}",
            request.report_id,
            Self::extension(request.content_type)
        );
        let target = self.directory.join(&name);
        let staging = self.directory.join(format!(".{name}.tmp"));

        tokio::fs::write(&staging, request.content)
            .await
            .map_err(io_error(&staging))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(io_error(&target))?;

        debug!(path = %target.display(), bytes = request.content.len(), "dropped report file");
        Ok(RetryToken::None)
    }

    fn kind(&self) -> &'static str {
        "file_drop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_writes_named_file() {
        let dir = TempDir::new().unwrap();
        let transport = FileDropTransport::new(dir.path().join("outbox"));
        let report_id = Uuid::new_v4();
        let request = SendRequest {
            report_id,
            receiver: "st.elr",
            content: "MSH|^~\\&|A",
            content_type: HL7_CONTENT_TYPE,
            item_count: 1,
        };

        let token = transport.send(&request).await.unwrap();
        assert_eq!(token, RetryToken::None);

        let written = std::fs::read_to_string(
            dir.path().join("outbox").join(format!("{report_id}.hl7")),
        )
        .unwrap();
        assert_eq!(written, "MSH|^~\\&|A");
        assert_eq!(std::fs::read_dir(dir.path().join("outbox")).unwrap().count(), 1);
    }
}
