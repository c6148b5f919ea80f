//! Background job specifications and their versioned payloads.
//!
//! Jobs run in a separate, UI-less process. Everything they need travels in a
//! [`JobPayload`], serialized as JSON with an explicit schema version so the
//! consumer can validate it without trusting the producer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier the job queue assigns; assumed unique and increasing
pub type JobId = u64;

/// Payload schema produced by this crate
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported job payload schema {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },
    #[error("job payload has no schema_version")]
    MissingVersion,
}

/// What a published file is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    /// Batch setup file of an item
    Batch,
    /// Rendered frames of a segment
    Render,
    /// Open clip of an item or segment
    Clip,
    /// Local playback movie transcoded from a render
    Quicktime,
}

/// One file to register as a published file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub kind: PublishKind,
    /// Serialized context handle of the owning item
    pub context: String,
    pub path: String,
    pub name: String,
    pub publish_type: String,
    pub version_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
    /// Use this publish's thumbnail for the item as well
    #[serde(default)]
    pub make_item_thumbnail: bool,
    /// Link the publish to the item's batch file publish
    #[serde(default)]
    pub depends_on_item_batch: bool,
    /// Index of an earlier publish in the same list this one depends on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on_publish: Option<usize>,
    #[serde(default)]
    pub is_batch_render: bool,
    /// Review version to link the publish to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i64>,
}

/// Source and target sizes of a transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    pub version_id: i64,
    /// Normalized (printf style) frame path
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub target_width: u32,
    pub target_height: u32,
}

/// Work carried by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTask {
    RegisterPublishes {
        comment: String,
        publishes: Vec<PublishRequest>,
    },
    UploadThumbnails {
        sources: Vec<MediaSource>,
    },
    UploadQuicktime {
        source: MediaSource,
        /// Version field the movie is uploaded to
        upload_field: String,
    },
    CreateLocalQuicktime {
        source: MediaSource,
        movie_path: String,
    },
}

impl JobTask {
    /// Handler method the queue invokes for this task
    pub fn method_name(&self) -> &'static str {
        match self {
            JobTask::RegisterPublishes { .. } => "register_publishes",
            JobTask::UploadThumbnails { .. } => "upload_thumbnails",
            JobTask::UploadQuicktime { .. } => "upload_quicktime",
            JobTask::CreateLocalQuicktime { .. } => "create_local_quicktime",
        }
    }
}

/// Serialized form of a job's arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub schema_version: u32,
    pub task: JobTask,
}

impl JobPayload {
    pub fn new(task: JobTask) -> Self {
        Self {
            schema_version: PAYLOAD_SCHEMA_VERSION,
            task,
        }
    }

    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a payload.
    ///
    /// The schema version is checked before the task is decoded, so a payload
    /// from a newer producer is reported as unsupported rather than malformed.
    pub fn from_json(json: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(json)?;
        let found = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or(PayloadError::MissingVersion)?;
        if found != u64::from(PAYLOAD_SCHEMA_VERSION) {
            return Err(PayloadError::UnsupportedVersion {
                found,
                supported: PAYLOAD_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// A job ready to hand to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub description: String,
    /// Job that must finish before this one starts
    pub predecessor: Option<JobId>,
    /// Handler the queue dispatches to
    pub target: String,
    pub method: String,
    pub payload: JobPayload,
}

impl JobSpec {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        predecessor: Option<JobId>,
        target: &str,
        task: JobTask,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            predecessor,
            target: target.to_string(),
            method: task.method_name().to_string(),
            payload: JobPayload::new(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MediaSource {
        MediaSource {
            version_id: 7,
            path: "/mnt/SEQ01/sh_10.%04d.dpx".to_string(),
            width: 1920,
            height: 1080,
            fps: 23.976,
            target_width: 1280,
            target_height: 720,
        }
    }

    #[test]
    fn test_payload_json_is_tagged_and_versioned() {
        let payload = JobPayload::new(JobTask::UploadQuicktime {
            source: source(),
            upload_field: "sg_uploaded_movie".to_string(),
        });
        let value: Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();

        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["task"]["kind"], "upload_quicktime");
        assert_eq!(value["task"]["source"]["version_id"], 7);
        assert_eq!(value["task"]["source"]["fps"], 23.976);
        assert_eq!(JobPayload::from_json(&value.to_string()).unwrap(), payload);
    }

    #[test]
    fn test_newer_schema_is_rejected_before_decoding() {
        let json = json!({"schema_version": 2, "task": {"kind": "defragment"}}).to_string();
        let err = JobPayload::from_json(&json).unwrap_err();
        assert!(matches!(
            err,
            PayloadError::UnsupportedVersion { found: 2, supported: 1 }
        ));
    }

    #[test]
    fn test_missing_version_and_garbage() {
        let err = JobPayload::from_json(r#"{"task": {}}"#).unwrap_err();
        assert!(matches!(err, PayloadError::MissingVersion));

        let err = JobPayload::from_json("not json").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn test_spec_method_follows_task() {
        let spec = JobSpec::new(
            "Register publishes",
            "2 files",
            Some(12),
            "tk-flame-export",
            JobTask::RegisterPublishes {
                comment: String::new(),
                publishes: Vec::new(),
            },
        );
        assert_eq!(spec.method, "register_publishes");
        assert_eq!(spec.predecessor, Some(12));
    }
}
