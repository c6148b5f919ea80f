//! Export session state machine
//!
//! The host drives an export through a fixed sequence of callbacks:
//!
//! ```text
//! export begin -> sequence begin* -> (asset path needed, asset complete)* -> export end
//! ```
//!
//! The controller owns at most one [`Session`] across those callbacks. Errors
//! raised for one sequence or asset leave the session usable for the next
//! callback, so an aborted sequence never poisons its siblings.

use crate::assets::AssetDescriptor;
use crate::collaborators::{
    ContextResolver, FieldValue, Filter, JobQueue, StructureCreator, TemplateSystem, TrackingStore,
};
use crate::error::{Anomaly, ExportError};
use crate::jobs::JobId;
use crate::model::{BatchRecord, ClipRecord, Container, Context, EntityRef, Item, RenderRecord};
use crate::paths::{inject_dynamic_fields, relative_to};
use crate::planner::{PlanOptions, SubmissionPlanner, SubmissionReport};
use crate::resolver::{record_id, EntityResolver};
use crate::session::{accumulate_cut, Session, SessionState};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shot_export_config::Config;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External systems the controller talks to
pub struct Collaborators {
    pub templates: Box<dyn TemplateSystem>,
    pub store: Box<dyn TrackingStore>,
    pub structure: Box<dyn StructureCreator>,
    pub contexts: Box<dyn ContextResolver>,
    pub queue: Box<dyn JobQueue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBeginInfo {
    #[serde(default)]
    pub comment: String,
    /// Preset picked by the user; the first configured preset when absent
    #[serde(default)]
    pub preset: Option<String>,
}

/// What the host needs to start writing files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportBeginReply {
    pub session_id: Uuid,
    pub destination_host: String,
    pub destination_path: PathBuf,
    pub preset_path: Option<PathBuf>,
}

/// Where the host says it actually wrote the export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEndInfo {
    #[serde(default)]
    pub destination_host: String,
    #[serde(default)]
    pub destination_path: PathBuf,
    #[serde(default)]
    pub preset_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExportOutcome {
    Submitted(SubmissionReport),
    /// The export ended before any asset completed; nothing was submitted
    Incomplete { state: SessionState },
}

/// Host record of a finished batch render
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRenderInfo {
    /// Full path of the rendered frames, with the frame token
    pub path: String,
    #[serde(default)]
    pub version_number: i64,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub is_background: bool,
    #[serde(default)]
    pub background_job_id: Option<JobId>,
    /// Batch setup saved alongside the render
    #[serde(default)]
    pub batch_path: Option<String>,
    #[serde(default)]
    pub aborted: bool,
}

fn default_aspect_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReviewChoice {
    pub send_to_review: bool,
    pub comment: String,
}

pub struct ExportSessionController {
    config: Config,
    collaborators: Collaborators,
    session: Option<Session>,
}

impl ExportSessionController {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            session: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.as_ref().map_or(SessionState::Idle, |s| s.state)
    }

    /// Discard the live session, if any
    pub fn reset(&mut self) -> Option<Uuid> {
        let session = self.session.take()?;
        warn!(session = %session.id, state = %session.state, "Discarding export session");
        Some(session.id)
    }

    /// Start a new session.
    ///
    /// Rejected while another session is live.
    pub fn on_export_begin(&mut self, info: &ExportBeginInfo) -> Result<ExportBeginReply, ExportError> {
        if let Some(live) = &self.session {
            return Err(ExportError::Session(format!(
                "export session {} is still running ({})",
                live.id, live.state
            )));
        }

        let preset = match &info.preset {
            Some(name) => Some(
                self.config
                    .presets
                    .iter()
                    .find(|p| &p.name == name)
                    .ok_or_else(|| ExportError::Configuration(format!("unknown export preset '{}'", name)))?,
            ),
            None => self.config.default_preset(),
        };

        let tracking = &self.config.tracking;
        let mut project_context = self
            .collaborators
            .contexts
            .context_for("Project", tracking.project_id)
            .map_err(|e| ExportError::remote("context resolution", e))?;
        let project = project_context
            .project
            .get_or_insert_with(|| EntityRef::new("Project", tracking.project_id));
        if project.name.is_none() {
            project.name = Some(tracking.project_name.clone());
        }

        let session = Session::new(&info.comment, preset.map(|p| p.name.clone()), project_context);
        info!(session = %session.id, preset = ?session.preset, "Export started");

        let reply = ExportBeginReply {
            session_id: session.id,
            destination_host: self.config.export.destination_host.clone(),
            destination_path: self.config.export.destination_path.clone(),
            preset_path: preset.map(|p| p.preset_path.clone()),
        };
        self.session = Some(session);
        Ok(reply)
    }

    /// Resolve one exported sequence and its shots
    pub fn on_sequence_begin(
        &mut self,
        session_id: Uuid,
        container_name: &str,
        item_names: &[String],
    ) -> Result<(), ExportError> {
        live_session(&mut self.session, session_id)?;
        validate_sequence(&self.config, container_name, item_names)?;

        let mut resolver = EntityResolver::new(
            &self.config.tracking,
            self.collaborators.store.as_mut(),
            self.collaborators.structure.as_mut(),
            self.collaborators.contexts.as_ref(),
        );
        let (mut container, items) = resolver.resolve(container_name, item_names)?;
        container.items = items;

        let session = live_session(&mut self.session, session_id)?;
        info!(
            session = %session.id,
            container = container_name,
            items = container.items.len(),
            "Sequence resolved"
        );
        session.insert_container(container);
        if session.state != SessionState::AssetsObserved {
            session.state = SessionState::StructureResolved;
        }
        Ok(())
    }

    /// Resolve where the host should write an asset, relative to the
    /// destination root.
    ///
    /// Video assets also contribute their record range to the shot's cut.
    /// Returns `None` for asset kinds that are not handled.
    pub fn on_asset_path_needed(
        &mut self,
        session_id: Uuid,
        info: &Value,
    ) -> Result<Option<String>, ExportError> {
        let Some(asset) = AssetDescriptor::from_info(info)? else {
            return Ok(None);
        };
        let session = live_session(&mut self.session, session_id)?;
        let (container, item) = (asset.sequence_name(), asset.shot_name());

        let tracking = &self.config.tracking;
        let mut fields = session.context_for(container, item).fields.clone();
        fields
            .entry(tracking.container_entity_type.clone())
            .or_insert_with(|| FieldValue::from(container));
        fields
            .entry(tracking.item_entity_type.clone())
            .or_insert_with(|| FieldValue::from(item));
        inject_dynamic_fields(&mut fields, &asset, Local::now().naive_local())?;

        let template = template_for(&self.config, &asset);
        let path = self.collaborators.templates.apply(template, &fields)?;
        let relative = relative_to(&path, &self.config.export.destination_path);

        // Cut data only counts once the host has a path to write to.
        if let AssetDescriptor::Video(video) = &asset {
            let anomaly = match session.item_mut(container, item) {
                Some(found) => {
                    found.segment_mut(video.segment_name());
                    accumulate_cut(found, video.record_in, video.record_out)
                }
                None => Some(Anomaly::UnknownItem {
                    container: container.to_string(),
                    item: item.to_string(),
                }),
            };
            if let Some(anomaly) = anomaly {
                session.note(anomaly);
            }
        }

        debug!(kind = %asset.kind(), path = relative.as_str(), "Resolved asset path");
        Ok(Some(relative))
    }

    /// Record a finished asset on its shot
    pub fn on_asset_complete(&mut self, session_id: Uuid, info: &Value) -> Result<(), ExportError> {
        let Some(asset) = AssetDescriptor::from_info(info)? else {
            return Ok(());
        };
        let session = live_session(&mut self.session, session_id)?;
        let (container, name) = (asset.sequence_name(), asset.shot_name());
        let path = asset.full_path();
        if session.item(container, name).is_none() {
            session.note(Anomaly::UnknownItem {
                container: container.to_string(),
                item: name.to_string(),
            });
            return Ok(());
        }
        session.state = SessionState::AssetsObserved;
        session.reached_terminal_phase = true;
        let Some(item) = session.item_mut(container, name) else {
            return Ok(());
        };

        match &asset {
            AssetDescriptor::Video(video) => {
                item.segment_mut(video.segment_name()).render = Some(RenderRecord {
                    path,
                    version_number: video.version_number,
                    width: video.width,
                    height: video.height,
                    aspect_ratio: video.aspect_ratio,
                    fps: video.fps,
                    record_in: video.record_in,
                    record_out: video.record_out,
                    handle_in: video.handle_in,
                    track: video.track,
                    background_job_id: video.render_job_id(),
                });
            }
            AssetDescriptor::Batch(batch) => {
                item.batch = Some(BatchRecord {
                    path,
                    version_number: batch.version_number,
                });
                for segment in item.segments.values_mut() {
                    segment.batch_is_shared_with_item = true;
                }
            }
            AssetDescriptor::OpenClip(clip) | AssetDescriptor::BatchOpenClip(clip) => {
                let segment = match &asset {
                    AssetDescriptor::OpenClip(_) if !clip.asset_name.is_empty() => {
                        Some(clip.asset_name.clone())
                    }
                    _ => None,
                };
                if !item.clips.iter().any(|c| c.path == path) {
                    item.clips.push(ClipRecord {
                        path,
                        version_number: clip.version_number,
                        segment,
                    });
                }
            }
        }
        debug!(kind = %asset.kind(), container, item = name, "Asset recorded");
        Ok(())
    }

    /// Finish the export.
    ///
    /// The session is consumed either way. Nothing is planned unless at
    /// least one asset completed.
    pub fn on_export_end(
        &mut self,
        session_id: Uuid,
        info: &ExportEndInfo,
    ) -> Result<ExportOutcome, ExportError> {
        live_session(&mut self.session, session_id)?;
        let Some(mut session) = self.session.take() else {
            return Err(ExportError::Session("no export session is running".to_string()));
        };

        debug!(
            session = %session.id,
            host = info.destination_host.as_str(),
            path = %info.destination_path.display(),
            preset = ?info.preset_path,
            "Host finished writing"
        );
        if !info.destination_path.as_os_str().is_empty()
            && info.destination_path != self.config.export.destination_path
        {
            warn!(
                session = %session.id,
                written = %info.destination_path.display(),
                configured = %self.config.export.destination_path.display(),
                "Export written outside the configured destination"
            );
        }

        if session.state != SessionState::AssetsObserved || !session.reached_terminal_phase {
            warn!(session = %session.id, state = %session.state, "Export ended before any asset completed, nothing submitted");
            return Ok(ExportOutcome::Incomplete {
                state: session.state,
            });
        }

        let planner = SubmissionPlanner::new(
            &self.config,
            self.collaborators.templates.as_ref(),
            PlanOptions::default(),
        );
        let report = planner.submit(
            &mut session,
            self.collaborators.store.as_mut(),
            self.collaborators.queue.as_mut(),
        )?;
        session.state = SessionState::Submitted;
        info!(session = %session.id, jobs = report.jobs.len(), "{}", report.summary);
        Ok(ExportOutcome::Submitted(report))
    }

    /// Offer review submission for a batch render.
    ///
    /// `None` when the integration is disabled.
    pub fn on_batch_render_begin(&self, info: &BatchRenderInfo) -> Option<BatchReviewChoice> {
        let settings = &self.config.batch_render;
        if !settings.enabled || info.aborted {
            return None;
        }
        Some(BatchReviewChoice {
            send_to_review: settings.review_by_default,
            comment: settings.default_comment.clone(),
        })
    }

    /// Publish a finished batch render.
    ///
    /// Works on a throwaway session and never touches the live export. The
    /// shot must already exist in the tracking service.
    pub fn on_batch_render_end(
        &mut self,
        info: &BatchRenderInfo,
        choice: &BatchReviewChoice,
    ) -> Result<Option<SubmissionReport>, ExportError> {
        if info.aborted || !self.config.batch_render.enabled {
            debug!(path = info.path.as_str(), "Ignoring batch render");
            return Ok(None);
        }

        let tracking = &self.config.tracking;
        let fields = self
            .collaborators
            .templates
            .fields(&self.config.templates.video, &info.path)?;
        let field_text = |key: &str| {
            fields
                .get(key)
                .and_then(FieldValue::as_text)
                .map(str::to_string)
                .ok_or_else(|| {
                    ExportError::Configuration(format!("render path '{}' has no {} field", info.path, key))
                })
        };
        let container_name = field_text(&tracking.container_entity_type)?;
        let item_name = field_text(&tracking.item_entity_type)?;
        let segment_name = fields
            .get("segment_name")
            .and_then(FieldValue::as_text)
            .map_or_else(|| item_name.clone(), str::to_string);

        // Shot codes repeat across sequences, so the shot is looked up
        // under its sequence.
        let project = EntityRef::new("Project", tracking.project_id);
        let container_filters = [
            Filter::is("code", container_name.as_str()),
            Filter::is("project", project.to_link()),
        ];
        let container = self
            .collaborators
            .store
            .find_one(&tracking.container_entity_type, &container_filters)
            .map_err(|e| ExportError::remote("container lookup", e))?
            .ok_or_else(|| {
                ExportError::Configuration(format!(
                    "{} '{}' does not exist in the tracking service",
                    tracking.container_entity_type, container_name
                ))
            })?;
        let container_id = record_id(&container, "container lookup")?;
        let container_link = EntityRef::new(&tracking.container_entity_type, container_id);

        let item_filters = [
            Filter::is("code", item_name.as_str()),
            Filter::is("project", project.to_link()),
            Filter::is(&tracking.parent_link_field, container_link.to_link()),
        ];
        let record = self
            .collaborators
            .store
            .find_one(&tracking.item_entity_type, &item_filters)
            .map_err(|e| ExportError::remote("item lookup", e))?
            .ok_or_else(|| {
                ExportError::Configuration(format!(
                    "{} '{}' does not exist in {} '{}'",
                    tracking.item_entity_type, item_name, tracking.container_entity_type, container_name
                ))
            })?;
        let item_id = record_id(&record, "item lookup")?;
        let context = self
            .collaborators
            .contexts
            .context_for(&tracking.item_entity_type, item_id)
            .map_err(|e| ExportError::remote("context resolution", e))?;

        let mut item = Item::new(&item_name, &container_name, item_id, context);
        let segment = item.segment_mut(&segment_name);
        segment.render = Some(RenderRecord {
            path: info.path.clone(),
            version_number: info.version_number,
            width: info.width,
            height: info.height,
            aspect_ratio: info.aspect_ratio,
            fps: info.fps,
            record_in: 0,
            record_out: 0,
            handle_in: 0,
            track: 0,
            background_job_id: info.background_job_id.filter(|_| info.is_background),
        });
        if let Some(batch_path) = &info.batch_path {
            segment.batch_is_shared_with_item = true;
            item.batch = Some(BatchRecord {
                path: batch_path.clone(),
                version_number: info.version_number,
            });
        }

        let mut session = Session::new(&choice.comment, None, Context::default());
        session.state = SessionState::AssetsObserved;
        session.reached_terminal_phase = true;
        session.insert_container(Container {
            name: container_name,
            remote_id: container_id,
            created_this_session: false,
            context: Context::default(),
            items: vec![item],
        });

        let options = PlanOptions {
            reconcile_cuts: false,
            create_versions: choice.send_to_review,
            is_batch_render: true,
        };
        let planner = SubmissionPlanner::new(&self.config, self.collaborators.templates.as_ref(), options);
        let report = planner.submit(
            &mut session,
            self.collaborators.store.as_mut(),
            self.collaborators.queue.as_mut(),
        )?;
        info!(item = item_name.as_str(), review = choice.send_to_review, "Batch render published");
        Ok(Some(report))
    }
}

fn live_session(session: &mut Option<Session>, id: Uuid) -> Result<&mut Session, ExportError> {
    match session.as_ref().map(|live| live.id) {
        Some(live_id) if live_id == id => Ok(session.as_mut().expect("session checked above")),
        Some(live_id) => Err(ExportError::Session(format!(
            "callback for session {} but session {} is running",
            id, live_id
        ))),
        None => Err(ExportError::Session(format!("no export session is running (got {})", id))),
    }
}

fn validate_sequence(config: &Config, container: &str, items: &[String]) -> Result<(), ExportError> {
    if container.trim().is_empty() {
        return Err(ExportError::Validation("the sequence has no name".to_string()));
    }
    let forbidden = &config.export.forbidden_container_chars;
    if let Some(bad) = container
        .chars()
        .find(|c| forbidden.contains(*c) || c.is_control())
    {
        return Err(ExportError::Validation(format!(
            "sequence name '{}' contains the forbidden character {:?}",
            container, bad
        )));
    }
    if items.iter().any(|name| name.trim().is_empty()) {
        return Err(ExportError::Validation(format!(
            "sequence '{}' has segments without a shot name",
            container
        )));
    }
    Ok(())
}

fn template_for<'c>(config: &'c Config, asset: &AssetDescriptor) -> &'c str {
    match asset {
        AssetDescriptor::Video(_) => &config.templates.video,
        AssetDescriptor::Batch(_) => &config.templates.batch,
        AssetDescriptor::OpenClip(_) => &config.templates.segment_clip,
        AssetDescriptor::BatchOpenClip(_) => &config.templates.shot_clip,
    }
}
