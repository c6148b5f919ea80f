//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Settings parsed but are not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Tracking-service entity layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingConfig {
    /// Remote id of the project every entity is scoped to
    #[serde(default = "default_project_id")]
    pub project_id: i64,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Entity type of the parent grouping (default "Sequence")
    #[serde(default = "default_container_entity_type")]
    pub container_entity_type: String,
    /// Entity type of the per-shot records (default "Shot")
    #[serde(default = "default_item_entity_type")]
    pub item_entity_type: String,
    /// Field on the item entity that links to its container
    #[serde(default = "default_parent_link_field")]
    pub parent_link_field: String,
    /// Task template assigned to newly created containers (empty = none)
    #[serde(default)]
    pub container_task_template: String,
    /// Task template assigned to newly created items (empty = none)
    #[serde(default)]
    pub item_task_template: String,
}

fn default_project_id() -> i64 {
    1
}

fn default_project_name() -> String {
    "Untitled".to_string()
}

fn default_container_entity_type() -> String {
    "Sequence".to_string()
}

fn default_item_entity_type() -> String {
    "Shot".to_string()
}

fn default_parent_link_field() -> String {
    "sg_sequence".to_string()
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            project_name: default_project_name(),
            container_entity_type: default_container_entity_type(),
            item_entity_type: default_item_entity_type(),
            parent_link_field: default_parent_link_field(),
            container_task_template: String::new(),
            item_task_template: String::new(),
        }
    }
}

/// Where the host writes exported media
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    #[serde(default = "default_destination_host")]
    pub destination_host: String,
    /// Export root; resolved paths are returned relative to it
    #[serde(default = "default_destination_path")]
    pub destination_path: PathBuf,
    /// Characters a container name may not contain
    #[serde(default = "default_forbidden_container_chars")]
    pub forbidden_container_chars: String,
}

fn default_destination_host() -> String {
    "localhost".to_string()
}

fn default_destination_path() -> PathBuf {
    PathBuf::from("/mnt/projects")
}

fn default_forbidden_container_chars() -> String {
    "/\\:*?\"<>|".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            destination_host: default_destination_host(),
            destination_path: default_destination_path(),
            forbidden_container_chars: default_forbidden_container_chars(),
        }
    }
}

/// Template ids used to resolve each asset kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplatesConfig {
    #[serde(default = "default_video_template")]
    pub video: String,
    #[serde(default = "default_batch_template")]
    pub batch: String,
    #[serde(default = "default_segment_clip_template")]
    pub segment_clip: String,
    #[serde(default = "default_shot_clip_template")]
    pub shot_clip: String,
    /// Destination of locally generated review movies
    #[serde(default)]
    pub local_quicktime: Option<String>,
}

fn default_video_template() -> String {
    "flame_shot_render_dpx".to_string()
}

fn default_batch_template() -> String {
    "flame_shot_batch".to_string()
}

fn default_segment_clip_template() -> String {
    "flame_segment_clip".to_string()
}

fn default_shot_clip_template() -> String {
    "flame_shot_clip".to_string()
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            video: default_video_template(),
            batch: default_batch_template(),
            segment_clip: default_segment_clip_template(),
            shot_clip: default_shot_clip_template(),
            local_quicktime: None,
        }
    }
}

/// Published file type names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishTypesConfig {
    #[serde(default = "default_video_publish_type")]
    pub video: String,
    #[serde(default = "default_batch_publish_type")]
    pub batch: String,
    #[serde(default = "default_clip_publish_type")]
    pub clip: String,
    #[serde(default = "default_quicktime_publish_type")]
    pub quicktime: String,
}

fn default_video_publish_type() -> String {
    "Flame Render".to_string()
}

fn default_batch_publish_type() -> String {
    "Flame Batch File".to_string()
}

fn default_clip_publish_type() -> String {
    "Flame OpenClip".to_string()
}

fn default_quicktime_publish_type() -> String {
    "Flame Quicktime".to_string()
}

impl Default for PublishTypesConfig {
    fn default() -> Self {
        Self {
            video: default_video_publish_type(),
            batch: default_batch_publish_type(),
            clip: default_clip_publish_type(),
            quicktime: default_quicktime_publish_type(),
        }
    }
}

/// Review media behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewConfig {
    /// Upload a review movie to the tracking service per rendered segment
    #[serde(default = "default_true")]
    pub upload_quicktime: bool,
    /// Upload pre-transcoded movies and thumbnails instead of letting the
    /// service transcode
    #[serde(default)]
    pub bypass_server_transcoding: bool,
    /// Generate a high-resolution movie next to the frames for playback
    #[serde(default)]
    pub generate_local_quicktime: bool,
    #[serde(default = "default_department")]
    pub department: String,
    #[serde(default = "default_quicktime_target_height")]
    pub quicktime_target_height: u32,
    #[serde(default = "default_thumbnail_target_height")]
    pub thumbnail_target_height: u32,
}

fn default_true() -> bool {
    true
}

fn default_department() -> String {
    "Flame".to_string()
}

fn default_quicktime_target_height() -> u32 {
    720
}

fn default_thumbnail_target_height() -> u32 {
    400
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            upload_quicktime: true,
            bypass_server_transcoding: false,
            generate_local_quicktime: false,
            department: default_department(),
            quicktime_target_height: default_quicktime_target_height(),
            thumbnail_target_height: default_thumbnail_target_height(),
        }
    }
}

/// Background batch render integration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchRenderConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Whether the review opt-in starts checked
    #[serde(default)]
    pub review_by_default: bool,
    #[serde(default)]
    pub default_comment: String,
}

/// An export preset the user can pick at export begin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetConfig {
    pub name: String,
    pub preset_path: PathBuf,
}

/// Settings handed to the job queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Name of the handler the queue invokes for our jobs
    #[serde(default = "default_job_target")]
    pub target: String,
}

fn default_job_target() -> String {
    "tk-flame-export".to_string()
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            target: default_job_target(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    /// Template id -> definition, consumed by the built-in template engine
    #[serde(default)]
    pub template_definitions: BTreeMap<String, String>,
    #[serde(default)]
    pub publish_types: PublishTypesConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub batch_render: BatchRenderConfig,
    #[serde(default)]
    pub presets: Vec<PresetConfig>,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional sections with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SHOT_EXPORT_DESTINATION_PATH -> export.destination_path
    /// - SHOT_EXPORT_PROJECT_ID -> tracking.project_id
    /// - SHOT_EXPORT_UPLOAD_QUICKTIME -> review.upload_quicktime
    /// - SHOT_EXPORT_BYPASS_TRANSCODING -> review.bypass_server_transcoding
    /// - SHOT_EXPORT_LOCAL_QUICKTIME -> review.generate_local_quicktime
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SHOT_EXPORT_DESTINATION_PATH") {
            if !val.is_empty() {
                self.export.destination_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SHOT_EXPORT_PROJECT_ID") {
            if let Ok(id) = val.parse::<i64>() {
                self.tracking.project_id = id;
            }
        }

        if let Some(flag) = env_flag("SHOT_EXPORT_UPLOAD_QUICKTIME") {
            self.review.upload_quicktime = flag;
        }
        if let Some(flag) = env_flag("SHOT_EXPORT_BYPASS_TRANSCODING") {
            self.review.bypass_server_transcoding = flag;
        }
        if let Some(flag) = env_flag("SHOT_EXPORT_LOCAL_QUICKTIME") {
            self.review.generate_local_quicktime = flag;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the export pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tracking = &self.tracking;
        if tracking.container_entity_type.trim().is_empty()
            || tracking.item_entity_type.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "entity types must not be empty".to_string(),
            ));
        }
        if tracking.parent_link_field.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "parent_link_field must not be empty".to_string(),
            ));
        }

        let templates = [
            ("video", &self.templates.video),
            ("batch", &self.templates.batch),
            ("segment_clip", &self.templates.segment_clip),
            ("shot_clip", &self.templates.shot_clip),
        ];
        for (kind, id) in templates {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "template for '{}' assets must not be empty",
                    kind
                )));
            }
        }

        if self.review.quicktime_target_height == 0 || self.review.thumbnail_target_height == 0 {
            return Err(ConfigError::Invalid(
                "review target heights must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for preset in &self.presets {
            if !seen.insert(preset.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate preset name '{}'",
                    preset.name
                )));
            }
        }

        Ok(())
    }

    /// The preset offered when the user makes no choice
    pub fn default_preset(&self) -> Option<&PresetConfig> {
        self.presets.first()
    }
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_flag(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("SHOT_EXPORT_DESTINATION_PATH");
        env::remove_var("SHOT_EXPORT_PROJECT_ID");
        env::remove_var("SHOT_EXPORT_UPLOAD_QUICKTIME");
        env::remove_var("SHOT_EXPORT_BYPASS_TRANSCODING");
        env::remove_var("SHOT_EXPORT_LOCAL_QUICKTIME");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_review_and_tracking(
            project_id in 1i64..100_000,
            upload in proptest::bool::ANY,
            bypass in proptest::bool::ANY,
            local in proptest::bool::ANY,
            qt_height in 1u32..4096,
        ) {
            let toml_str = format!(
                r#"
[tracking]
project_id = {}

[review]
upload_quicktime = {}
bypass_server_transcoding = {}
generate_local_quicktime = {}
quicktime_target_height = {}
"#,
                project_id, upload, bypass, local, qt_height
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.tracking.project_id, project_id);
            prop_assert_eq!(config.review.upload_quicktime, upload);
            prop_assert_eq!(config.review.bypass_server_transcoding, bypass);
            prop_assert_eq!(config.review.generate_local_quicktime, local);
            prop_assert_eq!(config.review.quicktime_target_height, qt_height);
            prop_assert_eq!(config.review.thumbnail_target_height, 400);
        }

        #[test]
        fn prop_env_overrides_review_flags(
            initial in proptest::bool::ANY,
            override_flag in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[review]\nbypass_server_transcoding = {}\ngenerate_local_quicktime = {}\n",
                initial, initial
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SHOT_EXPORT_BYPASS_TRANSCODING", override_flag.to_string());
            env::set_var("SHOT_EXPORT_LOCAL_QUICKTIME", if override_flag { "yes" } else { "0" });
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.review.bypass_server_transcoding, override_flag);
            prop_assert_eq!(config.review.generate_local_quicktime, override_flag);
        }

        #[test]
        fn prop_env_overrides_project_id(override_id in 1i64..1_000_000) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("[tracking]\nproject_id = 7\n").expect("Valid TOML");
            env::set_var("SHOT_EXPORT_PROJECT_ID", override_id.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.tracking.project_id, override_id);
        }
    }

    #[test]
    fn test_invalid_env_flag_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("SHOT_EXPORT_UPLOAD_QUICKTIME", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.review.upload_quicktime);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.tracking.container_entity_type, "Sequence");
        assert_eq!(config.tracking.item_entity_type, "Shot");
        assert_eq!(config.tracking.parent_link_field, "sg_sequence");
        assert_eq!(config.export.destination_host, "localhost");
        assert_eq!(config.review.quicktime_target_height, 720);
        assert!(config.review.upload_quicktime);
        assert!(!config.batch_render.enabled);
        assert!(config.presets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_and_definitions_parse() {
        let toml_str = r#"
[template_definitions]
flame_shot_render_dpx = "{Sequence}/{Shot}/plates/{Shot}_v{version:03}.{SEQ}.dpx"

[[presets]]
name = "10 bit DPX"
preset_path = "/presets/dpx.xml"

[[presets]]
name = "16 bit EXR"
preset_path = "/presets/exr.xml"
"#;
        let config = Config::parse_toml(toml_str).expect("TOML should parse");

        assert_eq!(config.presets.len(), 2);
        assert_eq!(config.default_preset().map(|p| p.name.as_str()), Some("10 bit DPX"));
        assert!(config
            .template_definitions
            .contains_key("flame_shot_render_dpx"));
    }

    #[test]
    fn test_validate_rejects_duplicate_presets() {
        let toml_str = r#"
[[presets]]
name = "dpx"
preset_path = "/a.xml"

[[presets]]
name = "dpx"
preset_path = "/b.xml"
"#;
        let config = Config::parse_toml(toml_str).expect("TOML should parse");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("duplicate preset"));
    }

    #[test]
    fn test_validate_rejects_empty_template_and_zero_height() {
        let mut config = Config::default();
        config.templates.batch = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.review.thumbnail_target_height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[export]\ndestination_path = \"/jobs/proj\"").unwrap();

        let config = Config::load_from_file(file.path()).expect("file should load");
        assert_eq!(config.export.destination_path, PathBuf::from("/jobs/proj"));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
