//! Separate video and audio downloads muxed into one MP4, optionally followed
//! by vocal removal.

use std::path::PathBuf;

use tracing::info;

use super::{Materialized, Pipeline, locate_output};
use crate::descriptor::ResourceDescriptor;
use crate::error::GatewayResult;
use crate::filter;
use crate::pipe::ProcessChain;
use crate::strategy::Plan;
use crate::toolchain::FETCH_ENGINE;
use crate::workspace::ScratchWorkspace;

const MERGED_EXT: &str = "mp4";
const FILTERED_OUTPUT: &str = "karaoke.mp4";

pub(super) async fn run(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
    remove_vocals: bool,
) -> GatewayResult<Materialized> {
    let merged = merge(pipeline, workspace, descriptor, plan).await?;
    info!(id = %descriptor.id, output = %merged.display(), "merge finished");

    if !remove_vocals {
        return Ok(Materialized {
            path: merged,
            summary: None,
        });
    }

    // The merged file stays in the workspace and goes away with it.
    let filtered = workspace.join(FILTERED_OUTPUT);
    filter::remove_vocals(&pipeline.toolchain, &merged, &filtered, pipeline.exit_timeout).await?;
    Ok(Materialized {
        path: filtered,
        summary: None,
    })
}

async fn merge(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
) -> GatewayResult<PathBuf> {
    let mut fetch = pipeline.toolchain.fetch_command();
    fetch
        .arg("-f")
        .arg(&plan.fetch_selector)
        .arg("--merge-output-format")
        .arg(MERGED_EXT)
        .arg("--remux-video")
        .arg(MERGED_EXT)
        .arg("-o")
        .arg(workspace.join("%(id)s.%(ext)s"))
        .arg("--no-simulate")
        .arg("--print")
        .arg("after_move:filepath")
        .arg("--")
        .arg(&descriptor.source_url);

    let reported = ProcessChain::single(FETCH_ENGINE, fetch)?
        .collect_stdout(pipeline.exit_timeout)
        .await?;
    locate_output(workspace.path(), &reported, &descriptor.id, MERGED_EXT)
}
