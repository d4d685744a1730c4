//! Execution strategies: each turns a resolved resource and a [`Plan`] into a
//! [`PipelineOutput`].
//!
//! Strategies that touch disk get exactly one scratch workspace, opened here
//! and released here when the strategy fails. On success the workspace moves
//! into the output and lives until the body is gone.

mod collection;
mod direct;
mod materialize;
mod merge;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::delivery::{CollectionSummary, PipelineOutput};
use crate::descriptor::ResourceDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::filename::{self, FilenameFields};
use crate::request::{CombineMode, TransformRequest};
use crate::strategy::{Plan, Strategy};
use crate::toolchain::Toolchain;
use crate::workspace::WorkspaceManager;

/// Extensions of files the fetch engine leaves behind while still working.
const PARTIAL_SUFFIXES: &[&str] = &["part", "ytdl", "temp", "tmp"];

#[derive(Debug, Clone)]
pub struct Pipeline {
    toolchain: Toolchain,
    workspaces: WorkspaceManager,
    exit_timeout: Duration,
}

/// A finished file inside the workspace, before it becomes a body.
struct Materialized {
    path: PathBuf,
    summary: Option<CollectionSummary>,
}

impl Pipeline {
    pub fn new(toolchain: Toolchain, workspaces: WorkspaceManager, exit_timeout: Duration) -> Self {
        Self {
            toolchain,
            workspaces,
            exit_timeout,
        }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub async fn execute(
        &self,
        descriptor: &ResourceDescriptor,
        plan: &Plan,
        request: &TransformRequest,
    ) -> GatewayResult<PipelineOutput> {
        let filename = client_filename(descriptor, plan, request);

        if plan.strategy == Strategy::DirectStream {
            return direct::run(self, descriptor, plan, filename);
        }

        let mut workspace = self.workspaces.open()?;
        let outcome = match plan.strategy {
            Strategy::DiskMaterialize(mode) => {
                materialize::run(self, &workspace, descriptor, plan, mode).await
            }
            Strategy::Merge => merge::run(self, &workspace, descriptor, plan, false).await,
            Strategy::FilteredMerge => merge::run(self, &workspace, descriptor, plan, true).await,
            Strategy::CollectionAggregate(combine) => {
                collection::run(self, &mut workspace, descriptor, plan, request, combine).await
            }
            Strategy::DirectStream => Err(GatewayError::internal("direct stream has no workspace")),
        };

        match outcome {
            Ok(Materialized { path, summary }) => {
                debug!(output = %path.display(), "pipeline output ready");
                Ok(PipelineOutput::File {
                    path,
                    workspace,
                    content_type: plan.content_type.clone(),
                    filename,
                    summary,
                })
            }
            Err(err) => {
                warn!(id = %descriptor.id, error = %err, "pipeline failed");
                workspace.release();
                Err(err)
            }
        }
    }
}

fn client_filename(descriptor: &ResourceDescriptor, plan: &Plan, request: &TransformRequest) -> String {
    let requested_format = request.selector.expression();
    let fields = FilenameFields {
        title: descriptor.title.as_deref(),
        uploader: descriptor.uploader.as_deref(),
        id: &descriptor.id,
        resolution: plan.resolution.as_deref(),
        format: Some(requested_format.as_str()),
    };
    let template = request.filename_template.as_deref();

    if let Strategy::CollectionAggregate(CombineMode::None) = plan.strategy
        && template.is_none_or(|template| template.trim().is_empty())
    {
        let kind = if request.audio_extract { "mp3" } else { "videos" };
        let stem = format!("{}_{kind}", descriptor.id);
        let fields = FilenameFields {
            title: Some(&stem),
            ..fields
        };
        return filename::build(None, &fields, &plan.ext);
    }

    filename::build(template, &fields, &plan.ext)
}

/// Finds the file the fetch engine produced. Candidates in order: the path
/// it printed, `<stem>.<preferred_ext>`, then any finished `<stem>.*` file.
fn locate_output(
    dir: &Path,
    reported: &[u8],
    stem: &str,
    preferred_ext: &str,
) -> GatewayResult<PathBuf> {
    let printed = String::from_utf8_lossy(reported)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from);

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(printed) = printed {
        candidates.push(printed);
    }
    candidates.push(dir.join(format!("{stem}.{preferred_ext}")));

    if let Some(found) = candidates
        .into_iter()
        .find(|candidate| candidate.starts_with(dir) && candidate.is_file())
    {
        return Ok(found);
    }

    let prefix = format!("{stem}.");
    WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                return false;
            };
            let finished = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_none_or(|ext| !PARTIAL_SUFFIXES.contains(&ext));
            name.starts_with(&prefix) && finished
        })
        .ok_or_else(|| {
            GatewayError::internal(format!(
                "download reported success but no output for {stem} was found"
            ))
        })
}
