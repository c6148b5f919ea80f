//! Shot Export
//!
//! Tracks a host export session across its callback lifecycle, resolves the
//! exported sequences and shots against the tracking service, reconciles cut
//! information and submits review versions plus the post-processing job graph.

pub mod assets;
pub mod collaborators;
pub mod controller;
pub mod cut;
pub mod error;
pub mod jobs;
pub mod media;
pub mod memory;
pub mod model;
pub mod paths;
pub mod planner;
pub mod resolver;
pub mod session;

pub use shot_export_config as config;
pub use shot_export_config::Config;
pub use assets::{AssetDescriptor, AssetKind, BatchAsset, OpenClipAsset, VideoAsset};
pub use collaborators::{
    BatchRequest, ContextResolver, FieldValue, Fields, Filter, JobQueue, QueueError, Record,
    StoreError, StructureCreator, StructureError, TemplateError, TemplateSystem, TrackingStore,
};
pub use controller::{
    BatchRenderInfo, BatchReviewChoice, Collaborators, ExportBeginInfo, ExportBeginReply,
    ExportEndInfo, ExportOutcome, ExportSessionController,
};
pub use cut::{plan_cut_updates, CutPlan, CutUpdate};
pub use error::{Anomaly, ExportError};
pub use jobs::{JobId, JobPayload, JobSpec, JobTask, PayloadError, PublishKind, PublishRequest};
pub use media::{scale_to_height, upload_field};
pub use model::{Container, Context, CutInfo, EntityRef, Item, RenderRecord, Segment};
pub use planner::{PlanOptions, SubmissionPlanner, SubmissionReport};
pub use resolver::EntityResolver;
pub use session::{accumulate_cut, Session, SessionState};
