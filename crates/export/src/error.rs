//! Error and warning types for the export pipeline

use crate::collaborators::{QueueError, StoreError, StructureError, TemplateError};
use serde::Serialize;
use thiserror::Error;

/// Error type for export operations
#[derive(Debug, Error)]
pub enum ExportError {
    /// Missing or invalid setting, unresolvable template, missing path token
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Host data rejected before anything is written
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tracking service refused or failed a request
    #[error("Tracking service request failed during {stage}: {source}")]
    RemoteSubmission {
        stage: String,
        #[source]
        source: StoreError,
    },

    /// Folder creation for a new entity failed
    #[error("Folder creation failed: {0}")]
    Structure(#[from] StructureError),

    /// The job queue refused a job after the batch went through
    #[error("Job scheduling failed: {0}")]
    JobScheduling(#[from] QueueError),

    /// Callback arrived in the wrong state or for another session
    #[error("Session error: {0}")]
    Session(String),
}

impl ExportError {
    pub fn remote(stage: impl Into<String>, source: StoreError) -> Self {
        ExportError::RemoteSubmission {
            stage: stage.into(),
            source,
        }
    }

    /// Message handed back to the host's abort mechanism
    pub fn abort_message(&self) -> String {
        match self {
            ExportError::Validation(msg) => format!("This sequence cannot be exported: {}", msg),
            ExportError::RemoteSubmission { .. } => {
                format!("Submission to Shotgun failed. {}", self)
            }
            other => other.to_string(),
        }
    }
}

impl From<TemplateError> for ExportError {
    fn from(e: TemplateError) -> Self {
        ExportError::Configuration(e.to_string())
    }
}

/// Non-fatal condition noticed while aggregating or submitting.
///
/// Anomalies are logged and reported back; they never abort an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// No segment contributed cut data to the item
    MissingCutData { container: String, item: String },
    /// A segment reported an empty or inverted record range
    InvalidCutRange {
        item: String,
        record_in: i64,
        record_out: i64,
    },
    /// A rendered path carries no `[first-last]` frame token
    MissingFrameRange { path: String },
    /// The batch response had no version for a submitted path
    UnmatchedVersion { path: String },
    /// An asset referenced a shot that was never resolved in this session
    UnknownItem { container: String, item: String },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::MissingCutData { container, item } => {
                write!(f, "{}/{} has no cut information, cut update skipped", container, item)
            }
            Anomaly::InvalidCutRange {
                item,
                record_in,
                record_out,
            } => write!(
                f,
                "{} reported an empty record range {}-{}, ignored",
                item, record_in, record_out
            ),
            Anomaly::MissingFrameRange { path } => {
                write!(f, "no frame range found in '{}', version has no frame data", path)
            }
            Anomaly::UnmatchedVersion { path } => {
                write!(f, "no version returned for '{}'", path)
            }
            Anomaly::UnknownItem { container, item } => {
                write!(f, "{}/{} was not prepared for this export, asset ignored", container, item)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_error_becomes_configuration() {
        let err: ExportError = TemplateError::UnknownTemplate("plate".to_string()).into();
        assert!(matches!(err, ExportError::Configuration(_)));
        assert!(err.to_string().contains("plate"));
    }

    #[test]
    fn test_abort_message_for_validation() {
        let err = ExportError::Validation("shot names must not be empty".to_string());
        assert_eq!(
            err.abort_message(),
            "This sequence cannot be exported: shot names must not be empty"
        );
    }

    #[test]
    fn test_remote_error_names_stage() {
        let err = ExportError::remote("shot creation", StoreError::Rejected("bad field".into()));
        let msg = err.abort_message();
        assert!(msg.starts_with("Submission to Shotgun failed."));
        assert!(msg.contains("shot creation"));
    }

    #[test]
    fn test_anomaly_serializes_with_kind() {
        let anomaly = Anomaly::MissingCutData {
            container: "SEQ01".to_string(),
            item: "sh_10".to_string(),
        };
        let json = serde_json::to_value(&anomaly).unwrap();
        assert_eq!(json["kind"], "missing_cut_data");
        assert_eq!(json["item"], "sh_10");
    }
}
