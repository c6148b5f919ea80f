//! CLI entry point for the shot export tooling
//!
//! Offline companion to the host integration: validates configuration,
//! replays recorded export callbacks against in-memory collaborators and
//! checks background job payloads.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shot_export::memory::{BasicTemplates, MemoryStore, MemoryStructure, RecordingQueue};
use shot_export::{
    BatchRenderInfo, BatchReviewChoice, Collaborators, Config, ExportBeginInfo, ExportEndInfo,
    ExportOutcome, ExportSessionController, JobId, JobPayload, JobSpec, SubmissionReport,
};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shot Export - Flame to Shotgun export tooling
#[derive(Parser, Debug)]
#[command(name = "shot-export")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the configuration file
        #[arg(short, long, default_value = "shot-export.toml")]
        config: PathBuf,
    },
    /// Replay a recorded callback transcript against in-memory services
    Replay {
        #[arg(short, long, default_value = "shot-export.toml")]
        config: PathBuf,
        /// JSON list of recorded callbacks
        #[arg(short, long)]
        events: PathBuf,
        /// JSON object of existing records, keyed by entity type
        #[arg(short, long)]
        store: Option<PathBuf>,
    },
    /// Validate a background job payload
    InspectPayload {
        /// Path to the payload JSON
        payload: PathBuf,
    },
}

/// One host callback as recorded in a transcript
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    ExportBegin(ExportBeginInfo),
    SequenceBegin {
        container: String,
        items: Vec<String>,
    },
    AssetPathNeeded {
        asset: Value,
    },
    AssetComplete {
        asset: Value,
    },
    ExportEnd {
        #[serde(default)]
        info: ExportEndInfo,
    },
    BatchRenderBegin {
        info: BatchRenderInfo,
    },
    BatchRenderEnd {
        info: BatchRenderInfo,
        #[serde(default)]
        send_to_review: Option<bool>,
        #[serde(default)]
        comment: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct Abort {
    event: usize,
    message: String,
}

/// Everything a replay produced
#[derive(Debug, Default, Serialize)]
struct ReplayLog {
    aborts: Vec<Abort>,
    paths: Vec<String>,
    outcomes: Vec<ExportOutcome>,
    batch_renders: Vec<SubmissionReport>,
    jobs: Vec<(JobId, JobSpec)>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "shot_export=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let result = match args.command {
        Command::CheckConfig { config } => check_config(&config),
        Command::Replay {
            config,
            events,
            store,
        } => run_replay(&config, &events, store.as_deref()),
        Command::InspectPayload { payload } => inspect_payload(&payload),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<Config, Box<dyn Error>> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_config(path)?;
    println!("Config file: {}", path.display());
    println!(
        "Project {} ({}), {} in {}",
        config.tracking.project_id,
        config.tracking.project_name,
        config.tracking.item_entity_type,
        config.tracking.container_entity_type
    );
    println!(
        "Destination: {}:{}",
        config.export.destination_host,
        config.export.destination_path.display()
    );
    println!(
        "Review upload: {}, bypass transcoding: {}, local movies: {}",
        config.review.upload_quicktime,
        config.review.bypass_server_transcoding,
        config.review.generate_local_quicktime
    );
    println!("Presets: {}", config.presets.len());
    println!("Configuration OK");
    Ok(())
}

fn run_replay(config: &Path, events: &Path, store: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let config = load_config(config)?;
    let events: Vec<Event> = serde_json::from_str(&fs::read_to_string(events)?)?;
    let store = match store {
        Some(path) => MemoryStore::from_fixture(&serde_json::from_str(&fs::read_to_string(path)?)?)?,
        None => MemoryStore::new(),
    };

    let log = replay(config, &events, store);
    println!("{}", serde_json::to_string_pretty(&log)?);
    Ok(())
}

/// Drive a controller with recorded callbacks.
///
/// A failing callback is logged as an abort and the replay moves on, the
/// way the host keeps exporting the remaining sequences.
fn replay(config: Config, events: &[Event], store: MemoryStore) -> ReplayLog {
    let queue = RecordingQueue::new();
    let collaborators = Collaborators {
        templates: Box::new(BasicTemplates::from_config(&config)),
        store: Box::new(store.clone()),
        structure: Box::new(MemoryStructure::default()),
        contexts: Box::new(store.contexts()),
        queue: Box::new(queue.clone()),
    };
    let mut controller = ExportSessionController::new(config, collaborators);
    let mut log = ReplayLog::default();

    for (index, event) in events.iter().enumerate() {
        let session_id = controller.session().map(|s| s.id);
        let result = match (event, session_id) {
            (Event::ExportBegin(begin), _) => controller.on_export_begin(begin).map(|reply| {
                info!(session = %reply.session_id, "Replaying export");
            }),
            (Event::BatchRenderBegin { info }, _) => {
                let choice = controller.on_batch_render_begin(info);
                info!(path = info.path.as_str(), ?choice, "Batch render started");
                Ok(())
            }
            (
                Event::BatchRenderEnd {
                    info,
                    send_to_review,
                    comment,
                },
                _,
            ) => {
                let offered = controller.on_batch_render_begin(info).unwrap_or(BatchReviewChoice {
                    send_to_review: false,
                    comment: String::new(),
                });
                let choice = BatchReviewChoice {
                    send_to_review: send_to_review.unwrap_or(offered.send_to_review),
                    comment: comment.clone().unwrap_or(offered.comment),
                };
                controller
                    .on_batch_render_end(info, &choice)
                    .map(|report| log.batch_renders.extend(report))
            }
            (_, None) => {
                log.aborts.push(Abort {
                    event: index,
                    message: "no export session is running".to_string(),
                });
                continue;
            }
            (Event::SequenceBegin { container, items }, Some(id)) => {
                controller.on_sequence_begin(id, container, items)
            }
            (Event::AssetPathNeeded { asset }, Some(id)) => controller
                .on_asset_path_needed(id, asset)
                .map(|path| log.paths.extend(path)),
            (Event::AssetComplete { asset }, Some(id)) => controller.on_asset_complete(id, asset),
            (Event::ExportEnd { info }, Some(id)) => controller
                .on_export_end(id, info)
                .map(|outcome| log.outcomes.push(outcome)),
        };

        if let Err(e) = result {
            warn!(event = index, error = %e, "Callback aborted");
            log.aborts.push(Abort {
                event: index,
                message: e.abort_message(),
            });
        }
    }

    log.jobs = queue.jobs();
    log
}

fn inspect_payload(path: &Path) -> Result<(), Box<dyn Error>> {
    let payload = JobPayload::from_json(&fs::read_to_string(path)?)?;
    println!("Payload schema {}: {}", payload.schema_version, payload.task.method_name());
    println!("{}", serde_json::to_string_pretty(&payload.task)?);
    Ok(())
}
