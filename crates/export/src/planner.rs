//! Submission planning
//!
//! Turns a fully observed session into one combined batch call (review
//! versions plus cut updates) and the dependent background jobs.
//!
//! The steps run in a fixed order because later steps need ids minted by
//! earlier ones:
//! 1. assign cut order and collect changed cuts
//! 2. build one version per distinct rendered sequence
//! 3. run the batch and back-fill version ids by path
//! 4. schedule publish registration, thumbnails and review movies after the
//!    render jobs they depend on

use crate::collaborators::{BatchRequest, FieldValue, JobQueue, Record, TemplateSystem, TrackingStore};
use crate::cut::{plan_cut_updates, CutPlan, CutUpdate};
use crate::error::{Anomaly, ExportError};
use crate::jobs::{JobId, JobSpec, JobTask, MediaSource, PublishKind, PublishRequest};
use crate::media::{scale_to_height, upload_field};
use crate::model::{Item, RenderRecord, Segment};
use crate::paths::{
    find_frame_token, frame_range, normalize_sequence_path, sibling_movie_path, single_frame_number,
    version_name, SEQ_FIELD,
};
use crate::session::Session;
use serde::Serialize;
use serde_json::{json, Value};
use shot_export_config::Config;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Which parts of the pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Compute cut order and push changed cuts
    pub reconcile_cuts: bool,
    /// Create review versions for renders
    pub create_versions: bool,
    /// Publishes come from a batch render rather than a sequence export
    pub is_batch_render: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            reconcile_cuts: true,
            create_versions: true,
            is_batch_render: false,
        }
    }
}

/// A segment waiting for its version id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTarget {
    pub container: String,
    pub item: String,
    pub segment: String,
    /// Normalized path the version is keyed by
    pub path: String,
}

/// The combined batch call, before it runs
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Version creates first, then cut updates
    pub requests: Vec<BatchRequest>,
    pub version_targets: Vec<VersionTarget>,
    pub cut_updates: Vec<CutUpdate>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub spec: JobSpec,
}

/// What a submission did
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    pub batch: Vec<BatchRequest>,
    pub jobs: Vec<ScheduledJob>,
    pub summary: String,
    pub anomalies: Vec<Anomaly>,
}

pub struct SubmissionPlanner<'a> {
    config: &'a Config,
    templates: &'a dyn TemplateSystem,
    options: PlanOptions,
}

impl<'a> SubmissionPlanner<'a> {
    pub fn new(config: &'a Config, templates: &'a dyn TemplateSystem, options: PlanOptions) -> Self {
        Self {
            config,
            templates,
            options,
        }
    }

    /// Run the whole submission for a session.
    ///
    /// A failed batch call aborts before any job is scheduled.
    pub fn submit(
        &self,
        session: &mut Session,
        store: &mut dyn TrackingStore,
        queue: &mut dyn JobQueue,
    ) -> Result<SubmissionReport, ExportError> {
        let plan = self.plan_batch(session);
        let mut anomalies = plan.anomalies.clone();

        if plan.requests.is_empty() {
            debug!(session = %session.id, "Nothing to submit to the tracking service");
        } else {
            info!(
                session = %session.id,
                versions = plan.requests.len() - plan.cut_updates.len(),
                cut_updates = plan.cut_updates.len(),
                "Submitting batch"
            );
            let response = store
                .batch(&plan.requests)
                .map_err(|e| ExportError::remote("review submission", e))?;
            anomalies.extend(self.apply_batch_response(session, &plan, &response));
        }

        let mut jobs = Vec::new();
        for spec in self.plan_jobs(session)? {
            let id = queue.enqueue(&spec)?;
            info!(job_id = id, predecessor = ?spec.predecessor, title = spec.title.as_str(), "Scheduled job");
            jobs.push(ScheduledJob { id, spec });
        }

        for item in session.containers.values_mut().flat_map(|c| c.items.iter_mut()) {
            if item.created_this_session && item.segments.values().any(|s| s.render.is_some()) {
                item.thumbnail_uploaded = true;
            }
        }

        for anomaly in anomalies {
            session.note(anomaly);
        }

        Ok(SubmissionReport {
            batch: plan.requests,
            jobs,
            summary: summary_text(
                session.new_item_count(),
                plan.cut_updates.len(),
                &self.config.tracking.item_entity_type,
            ),
            anomalies: session.anomalies.clone(),
        })
    }

    /// Steps 1 and 2: cut order and the combined batch request
    pub fn plan_batch(&self, session: &mut Session) -> BatchPlan {
        let cuts = if self.options.reconcile_cuts {
            plan_cut_updates(&mut session.containers)
        } else {
            CutPlan::default()
        };

        let mut plan = BatchPlan {
            anomalies: cuts.anomalies,
            ..Default::default()
        };

        if self.options.create_versions {
            let mut submitted: Vec<String> = Vec::new();
            for item in session.items() {
                for segment in item.segments.values() {
                    let Some(render) = &segment.render else {
                        continue;
                    };
                    let path = self.normalized_path(&render.path);
                    if !submitted.contains(&path) {
                        let (request, anomaly) =
                            self.version_request(item, render, &path, &session.comment);
                        plan.anomalies.extend(anomaly);
                        plan.requests.push(request);
                        submitted.push(path.clone());
                    }
                    plan.version_targets.push(VersionTarget {
                        container: item.container.clone(),
                        item: item.name.clone(),
                        segment: segment.name.clone(),
                        path,
                    });
                }
            }
        }

        let item_type = &self.config.tracking.item_entity_type;
        plan.requests
            .extend(cuts.updates.iter().map(|u| u.to_request(item_type)));
        plan.cut_updates = cuts.updates;
        plan
    }

    /// Step 3: store the version ids returned by the batch on their segments
    pub fn apply_batch_response(
        &self,
        session: &mut Session,
        plan: &BatchPlan,
        response: &[Record],
    ) -> Vec<Anomaly> {
        let ids: HashMap<&str, i64> = response
            .iter()
            .filter_map(|record| {
                let path = record.get("sg_path_to_frames")?.as_str()?;
                let id = record.get("id")?.as_i64()?;
                Some((path, id))
            })
            .collect();

        let mut anomalies = Vec::new();
        for target in &plan.version_targets {
            let Some(id) = ids.get(target.path.as_str()) else {
                anomalies.push(Anomaly::UnmatchedVersion {
                    path: target.path.clone(),
                });
                continue;
            };
            if let Some(item) = session.item_mut(&target.container, &target.item) {
                if let Some(segment) = item.segments.get_mut(&target.segment) {
                    segment.remote_version_id = Some(*id);
                }
            }
        }
        anomalies
    }

    /// Steps 4 to 8: the job graph, in enqueue order
    pub fn plan_jobs(&self, session: &Session) -> Result<Vec<JobSpec>, ExportError> {
        let target = self.config.jobs.target.as_str();
        let review = &self.config.review;
        let last_render_job = session
            .items()
            .flat_map(|i| i.segments.values())
            .filter_map(Segment::render_job_id)
            .max();

        let mut publishes = Vec::new();
        let mut versioned: Vec<(&Item, &Segment, &RenderRecord, i64)> = Vec::new();
        for item in session.items() {
            let context = item.context.to_handle().map_err(|e| {
                ExportError::Configuration(format!("cannot serialize context of {}: {}", item.name, e))
            })?;
            publishes.extend(self.item_publishes(item, &context));

            for segment in item.segments.values() {
                if let (Some(render), Some(version_id)) = (&segment.render, segment.remote_version_id) {
                    versioned.push((item, segment, render, version_id));
                }
            }
        }

        let mut jobs = Vec::new();
        jobs.push(JobSpec::new(
            "Shotgun Publish",
            format!("Registering {} published files", publishes.len()),
            last_render_job,
            target,
            JobTask::RegisterPublishes {
                comment: session.comment.clone(),
                publishes,
            },
        ));

        if review.bypass_server_transcoding && !versioned.is_empty() {
            let sources = versioned
                .iter()
                .map(|(_, _, render, version_id)| {
                    self.media_source(render, *version_id, review.thumbnail_target_height)
                })
                .collect();
            jobs.push(JobSpec::new(
                "Shotgun Thumbnails",
                format!("Uploading {} thumbnails", versioned.len()),
                last_render_job,
                target,
                JobTask::UploadThumbnails { sources },
            ));
        }

        if review.upload_quicktime {
            for (item, segment, render, version_id) in &versioned {
                let source = self.media_source(render, *version_id, review.quicktime_target_height);
                let field = upload_field(
                    review.bypass_server_transcoding,
                    source.target_height,
                    review.quicktime_target_height,
                );
                jobs.push(JobSpec::new(
                    "Shotgun Review",
                    format!("Uploading review movie for {}, {}", item.name, segment.name),
                    segment.render_job_id(),
                    target,
                    JobTask::UploadQuicktime {
                        source,
                        upload_field: field.to_string(),
                    },
                ));
            }
        }

        if review.generate_local_quicktime {
            for (item, segment, render, version_id) in &versioned {
                let source = self.media_source(render, *version_id, render.height);
                let movie_path = self.local_movie_path(render, &source.path);
                jobs.push(JobSpec::new(
                    "Local Movie",
                    format!("Creating playback movie for {}, {}", item.name, segment.name),
                    segment.render_job_id(),
                    target,
                    JobTask::CreateLocalQuicktime { source, movie_path },
                ));
            }
        }

        Ok(jobs)
    }

    fn item_publishes(&self, item: &Item, context: &str) -> Vec<PublishRequest> {
        let types = &self.config.publish_types;
        let publish = |kind, path: &str, name: String, publish_type: &str, version_number| {
            PublishRequest {
                kind,
                context: context.to_string(),
                path: path.to_string(),
                name,
                publish_type: publish_type.to_string(),
                version_number,
                dimensions: None,
                make_item_thumbnail: false,
                depends_on_item_batch: false,
                is_batch_render: self.options.is_batch_render,
                version_id: None,
                depends_on_publish: None,
            }
        };

        let mut out = Vec::new();
        if let Some(batch) = &item.batch {
            out.push(publish(
                PublishKind::Batch,
                &batch.path,
                self.batch_publish_name(item, &batch.path),
                &types.batch,
                batch.version_number,
            ));
        }

        let mut wants_thumbnail = item.created_this_session && !item.thumbnail_uploaded;
        for segment in item.segments.values() {
            let Some(render) = &segment.render else {
                continue;
            };
            let name = if self.options.is_batch_render {
                version_name(&render.path)
            } else {
                format!("{}, {}", item.name, segment.name)
            };
            let mut request = publish(
                PublishKind::Render,
                &render.path,
                name,
                &types.video,
                render.version_number,
            );
            request.dimensions = Some((render.width, render.height));
            request.make_item_thumbnail = wants_thumbnail;
            request.depends_on_item_batch = segment.batch_is_shared_with_item;
            request.version_id = segment.remote_version_id;
            let render_index = out.len();
            out.push(request);
            wants_thumbnail = false;

            // Local movie publish waits on its render publish.
            if self.config.review.generate_local_quicktime && segment.remote_version_id.is_some() {
                let movie_path = self.local_movie_path(render, &self.normalized_path(&render.path));
                let mut movie = publish(
                    PublishKind::Quicktime,
                    &movie_path,
                    version_name(&render.path),
                    &types.quicktime,
                    render.version_number,
                );
                movie.dimensions = Some((render.width, render.height));
                movie.version_id = segment.remote_version_id;
                movie.depends_on_publish = Some(render_index);
                out.push(movie);
            }
        }

        for clip in &item.clips {
            let name = match &clip.segment {
                Some(segment) => format!("{}, {}", item.name, segment),
                None => item.name.clone(),
            };
            out.push(publish(
                PublishKind::Clip,
                &clip.path,
                name,
                &types.clip,
                clip.version_number,
            ));
        }
        out
    }

    /// Batch publish name: the item field parsed from the path, else the item name
    fn batch_publish_name(&self, item: &Item, path: &str) -> String {
        let item_type = &self.config.tracking.item_entity_type;
        self.templates
            .fields(&self.config.templates.batch, path)
            .ok()
            .and_then(|fields| fields.get(item_type).and_then(FieldValue::as_text).map(str::to_string))
            .unwrap_or_else(|| item.name.clone())
    }

    fn media_source(&self, render: &RenderRecord, version_id: i64, target_height: u32) -> MediaSource {
        let (target_width, target_height) = scale_to_height(target_height, render.width, render.height);
        MediaSource {
            version_id,
            path: self.normalized_path(&render.path),
            width: render.width,
            height: render.height,
            target_width,
            target_height,
            fps: render.fps,
        }
    }

    /// Sequence path in printf form.
    ///
    /// Goes through the video template when the path matches it, so padding
    /// follows the template; otherwise the host token is rewritten in place.
    pub fn normalized_path(&self, path: &str) -> String {
        let template = &self.config.templates.video;
        if let Ok(mut fields) = self.templates.fields(template, path) {
            let spec = fields
                .get(SEQ_FIELD)
                .and_then(FieldValue::as_text)
                .and_then(find_frame_token)
                .map(|token| token.format_spec());
            if let Some(spec) = spec {
                fields.insert(SEQ_FIELD.to_string(), FieldValue::Text(spec));
                if let Ok(normalized) = self.templates.apply(template, &fields) {
                    return normalized;
                }
            }
        }
        debug!(path, template = template.as_str(), "Path does not match the video template, rewriting token");
        normalize_sequence_path(path)
    }

    fn local_movie_path(&self, render: &RenderRecord, normalized: &str) -> String {
        let Some(template) = &self.config.templates.local_quicktime else {
            return sibling_movie_path(normalized);
        };
        let resolved = self
            .templates
            .fields(&self.config.templates.video, &render.path)
            .and_then(|fields| self.templates.apply(template, &fields));
        match resolved {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Cannot resolve local movie template, writing next to the frames");
                sibling_movie_path(normalized)
            }
        }
    }

    fn version_request(
        &self,
        item: &Item,
        render: &RenderRecord,
        normalized: &str,
        comment: &str,
    ) -> (BatchRequest, Option<Anomaly>) {
        let ctx = &item.context;
        let mut data = Record::new();
        data.insert("code".to_string(), json!(version_name(&render.path)));
        data.insert("description".to_string(), json!(comment));
        let links = [
            ("project", &ctx.project),
            ("entity", &ctx.entity),
            ("sg_task", &ctx.task),
            ("user", &ctx.user),
            ("created_by", &ctx.user),
        ];
        for (field, link) in links {
            if let Some(link) = link {
                data.insert(field.to_string(), link.to_link());
            }
        }

        data.insert("sg_frames_have_slate".to_string(), Value::Bool(false));
        data.insert("sg_movie_has_slate".to_string(), Value::Bool(false));
        data.insert("sg_frames_aspect_ratio".to_string(), json!(render.aspect_ratio));
        data.insert("sg_movie_aspect_ratio".to_string(), json!(render.aspect_ratio));

        let range = frame_range(&render.path)
            .or_else(|| single_frame_number(&render.path).map(|frame| (frame, frame)));
        let mut anomaly = None;
        match range {
            Some((first, last)) => {
                data.insert("sg_first_frame".to_string(), json!(first));
                data.insert("sg_last_frame".to_string(), json!(last));
                data.insert("frame_count".to_string(), json!(last - first + 1));
                data.insert("frame_range".to_string(), json!(format!("{}-{}", first, last)));
            }
            None => {
                anomaly = Some(Anomaly::MissingFrameRange {
                    path: render.path.clone(),
                });
            }
        }

        data.insert("sg_path_to_frames".to_string(), json!(normalized));
        data.insert("sg_department".to_string(), json!(self.config.review.department));

        (
            BatchRequest::Create {
                entity_type: "Version".to_string(),
                data,
            },
            anomaly,
        )
    }
}

fn plural(label: &str, count: usize) -> String {
    if count == 1 {
        label.to_string()
    } else {
        format!("{}s", label)
    }
}

/// Human readable account of what changed in the tracking service.
///
/// Cut-only updates are the cut mutations not caused by new items. Empty
/// categories are left out.
pub fn summary_text(new_items: usize, cut_mutations: usize, item_label: &str) -> String {
    let cut_only = cut_mutations.saturating_sub(new_items);
    let mut parts = Vec::new();
    if new_items > 0 {
        parts.push(format!("{} new {} created", new_items, plural(item_label, new_items)));
    }
    if cut_only > 0 {
        parts.push(format!(
            "cut changes pushed for {} {}",
            cut_only,
            plural(item_label, cut_only)
        ));
    }
    if parts.is_empty() {
        format!("No {} were created or updated.", plural(item_label, 2))
    } else {
        format!("{}.", parts.join(", "))
    }
}
