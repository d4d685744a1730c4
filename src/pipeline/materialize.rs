//! Downloads written to the workspace before serving: MP3 extraction through
//! the encoder, or the fetch engine's own output kept as is.

use tracing::info;

use super::{Materialized, Pipeline, locate_output};
use crate::descriptor::ResourceDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::pipe::{ProcessChain, Stage};
use crate::strategy::{MaterializeMode, Plan};
use crate::toolchain::{ENCODER, FETCH_ENGINE};
use crate::workspace::ScratchWorkspace;

const AUDIO_OUTPUT: &str = "audio.mp3";

pub(super) async fn run(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
    mode: MaterializeMode,
) -> GatewayResult<Materialized> {
    let path = match mode {
        MaterializeMode::Audio => extract_audio(pipeline, workspace, descriptor, plan).await?,
        MaterializeMode::Passthrough => passthrough(pipeline, workspace, descriptor, plan).await?,
    };
    info!(id = %descriptor.id, mode = ?mode, output = %path.display(), "download materialized");
    Ok(Materialized {
        path,
        summary: None,
    })
}

/// `fetch engine -o - | encoder -i pipe:0 ... audio.mp3`
async fn extract_audio(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
) -> GatewayResult<std::path::PathBuf> {
    let toolchain = &pipeline.toolchain;
    let output = workspace.join(AUDIO_OUTPUT);

    let mut fetch = toolchain.fetch_command();
    fetch
        .arg("-f")
        .arg(&plan.fetch_selector)
        .arg("-o")
        .arg("-")
        .arg("--")
        .arg(&descriptor.source_url);

    let mut encode = toolchain.encoder_command();
    encode
        .args(["-i", "pipe:0", "-vn", "-c:a", "libmp3lame", "-b:a", "320k", "-f", "mp3"])
        .arg(&output);

    ProcessChain::spawn(vec![
        Stage::new(FETCH_ENGINE, fetch),
        Stage::new(ENCODER, encode),
    ])?
    .collect_stdout(pipeline.exit_timeout)
    .await?;

    if !output.is_file() {
        return Err(GatewayError::internal(
            "encoder reported success but produced no MP3",
        ));
    }
    Ok(output)
}

async fn passthrough(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
) -> GatewayResult<std::path::PathBuf> {
    let mut fetch = pipeline.toolchain.fetch_command();
    fetch
        .arg("-f")
        .arg(&plan.fetch_selector)
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
    locate_output(workspace.path(), &reported, &descriptor.id, &plan.ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EncodingSelector, TransformRequest};
    use crate::strategy::select;
    use crate::test_support::{install_script, sample_single};
    use crate::toolchain::Toolchain;
    use crate::workspace::WorkspaceManager;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pipeline(engine: &Path, encoder: &Path, scratch: &Path) -> Pipeline {
        Pipeline::new(
            Toolchain::new(engine, encoder),
            WorkspaceManager::new(Some(scratch.to_path_buf())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn audio_chain_writes_mp3_into_workspace() {
        let dir = tempdir().unwrap();
        let engine = install_script(dir.path(), "yt-dlp", "printf 'raw-audio'");
        let encoder = install_script(dir.path(), "ffmpeg", "for last; do :; done\ncat > \"$last\"");
        let scratch = dir.path().join("scratch");
        let pipeline = pipeline(&engine, &encoder, &scratch);

        let descriptor = sample_single();
        let request = TransformRequest {
            audio_extract: true,
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();
        let workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &workspace, &descriptor, &plan, MaterializeMode::Audio)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&done.path).unwrap(), b"raw-audio");
        assert!(done.path.starts_with(workspace.path()));
    }

    #[tokio::test]
    async fn encoder_failure_surfaces_with_diagnostics() {
        let dir = tempdir().unwrap();
        let engine = install_script(dir.path(), "yt-dlp", "printf 'raw-audio'");
        let encoder = install_script(
            dir.path(),
            "ffmpeg",
            "cat > /dev/null; echo 'pipe:0: Invalid data found' >&2; exit 1",
        );
        let scratch = dir.path().join("scratch");
        let pipeline = pipeline(&engine, &encoder, &scratch);
        let descriptor = sample_single();
        let request = TransformRequest {
            audio_extract: true,
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();

        let err = pipeline.execute(&descriptor, &plan, &request).await.err().unwrap();
        match err {
            GatewayError::ToolchainFailure { program, diagnostics, .. } => {
                assert_eq!(program, ENCODER);
                assert!(diagnostics.contains("Invalid data"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn passthrough_serves_reported_file() {
        let dir = tempdir().unwrap();
        let engine = install_script(
            dir.path(),
            "yt-dlp",
            r#"prev=""
for arg; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
path=$(printf '%s' "$out" | sed -e 's/%(id)s/abc/' -e 's/%(ext)s/m4a/')
printf 'm4a-bytes' > "$path"
echo "$path""#,
        );
        let scratch = dir.path().join("scratch");
        let pipeline = pipeline(&engine, Path::new("ffmpeg"), &scratch);
        let descriptor = sample_single();
        let request = TransformRequest {
            selector: EncodingSelector::Literal("140".into()),
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();
        let workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &workspace, &descriptor, &plan, MaterializeMode::Passthrough)
            .await
            .unwrap();
        assert_eq!(done.path, workspace.join("abc.m4a"));
        assert_eq!(std::fs::read(&done.path).unwrap(), b"m4a-bytes");
    }

    #[tokio::test]
    async fn silent_success_without_output_is_internal_error() {
        let dir = tempdir().unwrap();
        let engine = install_script(dir.path(), "yt-dlp", "exit 0");
        let scratch = dir.path().join("scratch");
        let pipeline = pipeline(&engine, Path::new("ffmpeg"), &scratch);
        let descriptor = sample_single();
        let request = TransformRequest {
            selector: EncodingSelector::Literal("140".into()),
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();

        let err = pipeline.execute(&descriptor, &plan, &request).await.err().unwrap();
        assert!(matches!(err, GatewayError::InternalConsistency(_)));
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
