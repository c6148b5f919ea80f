//! Typed asset records received from the host
//!
//! The host describes every exported asset with a loosely typed dictionary.
//! [`AssetDescriptor::from_info`] turns it into one variant per asset kind and
//! reports missing or malformed keys as configuration errors.

use crate::error::ExportError;
use crate::jobs::JobId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Asset kinds the integration handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    Video,
    Batch,
    OpenClip,
    BatchOpenClip,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetKind::Video => write!(f, "video"),
            AssetKind::Batch => write!(f, "batch"),
            AssetKind::OpenClip => write!(f, "openClip"),
            AssetKind::BatchOpenClip => write!(f, "batchOpenClip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAsset {
    pub destination_path: String,
    #[serde(default)]
    pub resolved_path: String,
    #[serde(default)]
    pub sequence_name: String,
    #[serde(default)]
    pub shot_name: String,
    #[serde(default)]
    pub asset_name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub version_number: i64,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_aspect_ratio", deserialize_with = "lenient_f64")]
    pub aspect_ratio: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fps: f64,
    #[serde(deserialize_with = "lenient_i64")]
    pub record_in: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub record_out: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub source_in: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub source_out: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub handle_in: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub track: i64,
    #[serde(default)]
    pub is_background: bool,
    #[serde(default, deserialize_with = "lenient_job_id")]
    pub background_job_id: Option<JobId>,
}

fn default_aspect_ratio() -> f64 {
    1.0
}

impl VideoAsset {
    /// Name of the segment this render belongs to
    pub fn segment_name(&self) -> &str {
        if self.asset_name.is_empty() {
            &self.shot_name
        } else {
            &self.asset_name
        }
    }

    /// Host job id, honoured only for background renders
    pub fn render_job_id(&self) -> Option<JobId> {
        if self.is_background {
            self.background_job_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAsset {
    pub destination_path: String,
    #[serde(default)]
    pub resolved_path: String,
    #[serde(default)]
    pub sequence_name: String,
    #[serde(default)]
    pub shot_name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub version_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClipAsset {
    pub destination_path: String,
    #[serde(default)]
    pub resolved_path: String,
    #[serde(default)]
    pub sequence_name: String,
    #[serde(default)]
    pub shot_name: String,
    #[serde(default)]
    pub asset_name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub version_number: i64,
}

/// An exported asset, one variant per handled kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "assetType", rename_all = "camelCase")]
pub enum AssetDescriptor {
    Video(VideoAsset),
    Batch(BatchAsset),
    OpenClip(OpenClipAsset),
    BatchOpenClip(OpenClipAsset),
}

const HANDLED_KINDS: [&str; 4] = ["video", "batch", "openClip", "batchOpenClip"];

impl AssetDescriptor {
    /// Validate a host asset record.
    ///
    /// Returns `Ok(None)` for asset kinds the integration ignores (audio,
    /// sequence/EDL exports).
    pub fn from_info(info: &Value) -> Result<Option<Self>, ExportError> {
        let kind = info
            .get("assetType")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExportError::Configuration("asset record has no 'assetType'".to_string())
            })?;

        if !HANDLED_KINDS.contains(&kind) {
            debug!(asset_type = kind, "Ignoring unsupported asset type");
            return Ok(None);
        }

        serde_json::from_value(info.clone())
            .map(Some)
            .map_err(|e| ExportError::Configuration(format!("invalid {} asset record: {}", kind, e)))
    }

    pub fn kind(&self) -> AssetKind {
        match self {
            AssetDescriptor::Video(_) => AssetKind::Video,
            AssetDescriptor::Batch(_) => AssetKind::Batch,
            AssetDescriptor::OpenClip(_) => AssetKind::OpenClip,
            AssetDescriptor::BatchOpenClip(_) => AssetKind::BatchOpenClip,
        }
    }

    pub fn sequence_name(&self) -> &str {
        match self {
            AssetDescriptor::Video(a) => &a.sequence_name,
            AssetDescriptor::Batch(a) => &a.sequence_name,
            AssetDescriptor::OpenClip(a) | AssetDescriptor::BatchOpenClip(a) => &a.sequence_name,
        }
    }

    pub fn shot_name(&self) -> &str {
        match self {
            AssetDescriptor::Video(a) => &a.shot_name,
            AssetDescriptor::Batch(a) => &a.shot_name,
            AssetDescriptor::OpenClip(a) | AssetDescriptor::BatchOpenClip(a) => &a.shot_name,
        }
    }

    pub fn version_number(&self) -> i64 {
        match self {
            AssetDescriptor::Video(a) => a.version_number,
            AssetDescriptor::Batch(a) => a.version_number,
            AssetDescriptor::OpenClip(a) | AssetDescriptor::BatchOpenClip(a) => a.version_number,
        }
    }

    pub fn resolved_path(&self) -> &str {
        match self {
            AssetDescriptor::Video(a) => &a.resolved_path,
            AssetDescriptor::Batch(a) => &a.resolved_path,
            AssetDescriptor::OpenClip(a) | AssetDescriptor::BatchOpenClip(a) => &a.resolved_path,
        }
    }

    pub fn destination_path(&self) -> &str {
        match self {
            AssetDescriptor::Video(a) => &a.destination_path,
            AssetDescriptor::Batch(a) => &a.destination_path,
            AssetDescriptor::OpenClip(a) | AssetDescriptor::BatchOpenClip(a) => {
                &a.destination_path
            }
        }
    }

    /// Absolute path of the written asset
    pub fn full_path(&self) -> String {
        crate::paths::join_export_path(self.destination_path(), self.resolved_path())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

// Host integers sometimes arrive as strings ("track": "1").
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(v) => Ok(v),
        Lenient::Float(v) if v.fract() == 0.0 => Ok(v as i64),
        Lenient::Float(v) => Err(serde::de::Error::custom(format!("expected integer, got {}", v))),
        Lenient::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(v) => Ok(v as f64),
        Lenient::Float(v) => Ok(v),
        Lenient::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// Foreground renders report an empty job id.
fn lenient_job_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<JobId>, D::Error> {
    match Option::<Lenient>::deserialize(d)? {
        None => Ok(None),
        Some(Lenient::Int(v)) => u64::try_from(v).map(Some).map_err(serde::de::Error::custom),
        Some(Lenient::Float(v)) => Err(serde::de::Error::custom(format!("invalid job id {}", v))),
        Some(Lenient::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Lenient::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn video_info() -> Value {
        json!({
            "assetType": "video",
            "destinationPath": "/mnt/projects/flame_testing",
            "resolvedPath": "SEQ01/sh_0010/plates/sh_0010.[00000430-00000431].dpx",
            "sequenceName": "SEQ01",
            "shotName": "sh_0010",
            "assetName": "010_Jump_Sand",
            "versionNumber": 0,
            "width": 1920,
            "height": 1080,
            "aspectRatio": 1.7777777910232544,
            "fps": "23.976",
            "recordIn": 0,
            "recordOut": 2,
            "sourceIn": 430,
            "sourceOut": 432,
            "track": "1",
            "isBackground": false,
            "backgroundJobId": ""
        })
    }

    #[test]
    fn test_video_record_parses_host_quirks() {
        let asset = AssetDescriptor::from_info(&video_info()).unwrap().unwrap();
        let AssetDescriptor::Video(video) = &asset else {
            panic!("expected a video asset");
        };

        assert_eq!(asset.kind(), AssetKind::Video);
        assert!((video.fps - 23.976).abs() < 1e-9);
        assert_eq!(video.track, 1);
        assert_eq!(video.background_job_id, None);
        assert_eq!(video.segment_name(), "010_Jump_Sand");
        assert_eq!(
            asset.full_path(),
            "/mnt/projects/flame_testing/SEQ01/sh_0010/plates/sh_0010.[00000430-00000431].dpx"
        );
    }

    #[test]
    fn test_background_job_id_only_for_background_renders() {
        let mut info = video_info();
        info["backgroundJobId"] = json!("42");
        let Some(AssetDescriptor::Video(video)) = AssetDescriptor::from_info(&info).unwrap() else {
            panic!("expected a video asset");
        };
        assert_eq!(video.background_job_id, Some(42));
        assert_eq!(video.render_job_id(), None);

        info["isBackground"] = json!(true);
        let Some(AssetDescriptor::Video(video)) = AssetDescriptor::from_info(&info).unwrap() else {
            panic!("expected a video asset");
        };
        assert_eq!(video.render_job_id(), Some(42));
    }

    #[test]
    fn test_missing_required_key_is_configuration_error() {
        let mut info = video_info();
        info.as_object_mut().unwrap().remove("width");

        let err = AssetDescriptor::from_info(&info).unwrap_err();
        assert!(matches!(err, ExportError::Configuration(_)));
        assert!(err.to_string().contains("width"));
    }

    #[test]
    fn test_unsupported_kinds_are_ignored() {
        let audio = json!({"assetType": "audio", "destinationPath": "/tmp"});
        assert!(AssetDescriptor::from_info(&audio).unwrap().is_none());

        let edl = json!({"assetType": "sequence"});
        assert!(AssetDescriptor::from_info(&edl).unwrap().is_none());
    }

    #[test]
    fn test_missing_asset_type_is_error() {
        let err = AssetDescriptor::from_info(&json!({"destinationPath": "/tmp"})).unwrap_err();
        assert!(matches!(err, ExportError::Configuration(_)));
    }

    #[test]
    fn test_clip_kinds_share_record_shape() {
        let info = json!({
            "assetType": "batchOpenClip",
            "destinationPath": "/mnt",
            "resolvedPath": "SEQ01/sh_10/sh_10.clip",
            "sequenceName": "SEQ01",
            "shotName": "sh_10",
            "versionNumber": "3"
        });
        let asset = AssetDescriptor::from_info(&info).unwrap().unwrap();
        assert_eq!(asset.kind(), AssetKind::BatchOpenClip);
        assert_eq!(asset.version_number(), 3);
        assert_eq!(asset.shot_name(), "sh_10");
    }
}
