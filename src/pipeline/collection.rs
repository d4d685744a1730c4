//! Every entry of a collection downloaded into one workspace, then packed
//! into a zip archive or concatenated into a single file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use super::{Materialized, Pipeline, locate_output};
use crate::delivery::CollectionSummary;
use crate::descriptor::ResourceDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::filter;
use crate::pipe::ProcessChain;
use crate::request::{CombineMode, TransformRequest};
use crate::strategy::Plan;
use crate::toolchain::{ENCODER, FETCH_ENGINE};
use crate::workspace::ScratchWorkspace;

const ITEMS_DIR: &str = "items";
const MANIFEST: &str = "concat.txt";
const AUDIO_CONCAT_ARGS: &[&str] = &["-c", "copy"];
const VIDEO_CONCAT_ARGS: &[&str] = &[
    "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-c:a", "aac", "-b:a", "192k",
    "-movflags", "+faststart",
];

pub(super) async fn run(
    pipeline: &Pipeline,
    workspace: &mut ScratchWorkspace,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
    request: &TransformRequest,
    combine: CombineMode,
) -> GatewayResult<Materialized> {
    let audio = request.audio_extract || combine == CombineMode::Audio;
    let items_dir = workspace.join(ITEMS_DIR);
    fs::create_dir_all(&items_dir).await?;

    let mut files: Vec<PathBuf> = Vec::new();
    let mut last_failure: Option<String> = None;
    for (index, entry) in descriptor.entries.iter().enumerate() {
        let prefix = format!("{:03}-{}", index + 1, path_safe(&entry.id));
        match fetch_item(pipeline, &items_dir, entry, plan, &prefix, audio, combine).await {
            Ok(path) => files.push(path),
            Err(err @ GatewayError::ToolchainMissing { .. }) => return Err(err),
            Err(err) => {
                warn!(item = %entry.id, error = %err, "collection item failed, skipping");
                last_failure = Some(err.to_string());
            }
        }
    }

    let summary = CollectionSummary {
        items: files.len(),
        skipped: descriptor.entries.len() - files.len(),
        truncated: descriptor.truncated,
    };
    if files.is_empty() {
        return Err(GatewayError::ToolchainFailure {
            program: FETCH_ENGINE.to_string(),
            status: "no successful playlist items".to_string(),
            diagnostics: last_failure.unwrap_or_else(|| "playlist has no entries".to_string()),
        });
    }
    info!(
        id = %descriptor.id,
        items = summary.items,
        skipped = summary.skipped,
        truncated = summary.truncated,
        "collection items downloaded"
    );

    let path = match combine {
        CombineMode::None => {
            let archive = workspace.sibling_archive();
            let target = archive.clone();
            tokio::task::spawn_blocking(move || write_archive(&files, &target))
                .await
                .map_err(|err| GatewayError::internal(format!("archive task failed: {err}")))??;
            archive
        }
        CombineMode::Audio | CombineMode::Video => {
            let combined = concatenate(pipeline, workspace, &files, combine).await?;
            if request.vocal_removal && combine == CombineMode::Video {
                let filtered = workspace.join("combined.karaoke.mp4");
                filter::remove_vocals(
                    &pipeline.toolchain,
                    &combined,
                    &filtered,
                    pipeline.exit_timeout,
                )
                .await?;
                filtered
            } else {
                combined
            }
        }
    };

    Ok(Materialized {
        path,
        summary: Some(summary),
    })
}

async fn fetch_item(
    pipeline: &Pipeline,
    items_dir: &Path,
    entry: &ResourceDescriptor,
    plan: &Plan,
    prefix: &str,
    audio: bool,
    combine: CombineMode,
) -> GatewayResult<PathBuf> {
    let mut fetch = pipeline.toolchain.fetch_command();
    fetch
        .arg("-f")
        .arg(&plan.fetch_selector)
        .arg("-o")
        .arg(items_dir.join(format!("{prefix}.%(ext)s")));
    if audio {
        fetch.args(["-x", "--audio-format", "mp3", "--audio-quality", "0"]);
    } else if combine == CombineMode::Video {
        fetch.args(["--merge-output-format", "mp4"]);
    }
    fetch
        .arg("--no-simulate")
        .arg("--print")
        .arg("after_move:filepath")
        .arg("--")
        .arg(&entry.source_url);

    let reported = ProcessChain::single(FETCH_ENGINE, fetch)?
        .collect_stdout(pipeline.exit_timeout)
        .await?;
    let preferred = if audio { "mp3" } else { "mp4" };
    locate_output(items_dir, &reported, prefix, preferred)
}

/// Item ids end up in file names; keep them to one plain path component.
fn path_safe(id: &str) -> String {
    id.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

fn write_archive(files: &[PathBuf], archive: &Path) -> GatewayResult<()> {
    let mut writer = ZipWriter::new(File::create(archive)?);
    // Media is already compressed.
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| GatewayError::internal("collection item has no file name"))?;
        writer.start_file(name, options).map_err(zip_error)?;
        io::copy(&mut File::open(path)?, &mut writer)?;
    }
    writer.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> GatewayError {
    GatewayError::Io(io::Error::other(err))
}

async fn concatenate(
    pipeline: &Pipeline,
    workspace: &ScratchWorkspace,
    files: &[PathBuf],
    combine: CombineMode,
) -> GatewayResult<PathBuf> {
    let manifest = workspace.join(MANIFEST);
    fs::write(&manifest, concat_manifest(files)).await?;

    let (output, codec_args) = match combine {
        CombineMode::Audio => (workspace.join("combined.mp3"), AUDIO_CONCAT_ARGS),
        _ => (workspace.join("combined.mp4"), VIDEO_CONCAT_ARGS),
    };

    let mut command = pipeline.toolchain.encoder_command();
    command
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&manifest)
        .args(codec_args)
        .arg(&output);
    ProcessChain::single(ENCODER, command)?
        .collect_stdout(pipeline.exit_timeout)
        .await?;

    if !output.is_file() {
        return Err(GatewayError::internal(
            "encoder reported success but produced no combined file",
        ));
    }
    Ok(output)
}

/// Concat demuxer input: one `file '<path>'` line per item, in order.
fn concat_manifest(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::select;
    use crate::test_support::{
        install_recording_encoder, install_script, install_writing_encoder, sample_collection,
    };
    use crate::toolchain::Toolchain;
    use crate::workspace::WorkspaceManager;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Fails for URLs containing `bad`, otherwise writes the item and prints
    /// where it went.
    const ITEM_ENGINE: &str = r#"prev=""
for arg; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
  last="$arg"
done
case "$last" in
  *bad*) echo "ERROR: [test] video unavailable" >&2; exit 1;;
esac
ext=mp4
case "$*" in *--audio-format*) ext=mp3;; esac
path=$(printf '%s' "$out" | sed -e "s/%(ext)s/$ext/")
printf '%s' "$last" > "$path"
echo "$path""#;

    fn pipeline(dir: &Path, encoder: PathBuf) -> Pipeline {
        let engine = install_script(dir, "yt-dlp", ITEM_ENGINE);
        Pipeline::new(
            Toolchain::new(engine, encoder),
            WorkspaceManager::new(Some(dir.join("scratch"))),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn five_of_seven_items_become_an_archive_of_five() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), PathBuf::from("ffmpeg"));
        let descriptor = sample_collection(&["a", "bad1", "c", "d", "bad2", "f", "g"]);
        let request = TransformRequest::default();
        let plan = select(&descriptor, &request).unwrap();
        let mut workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &mut workspace, &descriptor, &plan, &request, CombineMode::None)
            .await
            .unwrap();
        assert_eq!(
            done.summary,
            Some(CollectionSummary {
                items: 5,
                skipped: 2,
                truncated: false
            })
        );
        assert_eq!(done.path.extension().unwrap(), "zip");
        assert!(!done.path.starts_with(workspace.path()));

        let mut archive = zip::ZipArchive::new(File::open(&done.path).unwrap()).unwrap();
        assert_eq!(archive.len(), 5);
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names[0], "001-a.mp4");
        assert_eq!(names[4], "007-g.mp4");
        assert_eq!(
            archive.by_index(0).unwrap().compression(),
            CompressionMethod::Stored
        );

        workspace.release();
        assert!(!done.path.exists());
    }

    #[tokio::test]
    async fn all_items_failing_is_an_error() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), PathBuf::from("ffmpeg"));
        let descriptor = sample_collection(&["bad1", "bad2"]);
        let request = TransformRequest::default();
        let plan = select(&descriptor, &request).unwrap();

        let err = pipeline.execute(&descriptor, &plan, &request).await.err().unwrap();
        assert!(err.to_string().contains("video unavailable"));
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn combined_audio_concatenates_in_order() {
        let dir = tempdir().unwrap();
        // Copies the concat manifest to the output so the test can inspect it.
        let encoder = install_script(
            dir.path(),
            "ffmpeg",
            r#"prev=""
for arg; do
  if [ "$prev" = "-i" ]; then manifest="$arg"; fi
  prev="$arg"
  last="$arg"
done
cp "$manifest" "$last""#,
        );
        let pipeline = pipeline(dir.path(), encoder);
        let descriptor = sample_collection(&["a", "bad", "it's"]);
        let request = TransformRequest {
            combine: CombineMode::Audio,
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();
        let mut workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &mut workspace, &descriptor, &plan, &request, CombineMode::Audio)
            .await
            .unwrap();
        assert_eq!(done.path, workspace.join("combined.mp3"));
        let manifest = std::fs::read_to_string(&done.path).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("001-a.mp3'"));
        assert!(lines[1].ends_with("003-it_s.mp3'"));
    }

    #[tokio::test]
    async fn combined_video_with_karaoke_serves_filtered_file() {
        let dir = tempdir().unwrap();
        let encoder = install_recording_encoder(dir.path(), "encoded");
        let pipeline = pipeline(dir.path(), encoder);
        let descriptor = sample_collection(&["a", "bad", "c", "d"]);
        let request = TransformRequest {
            combine: CombineMode::Video,
            vocal_removal: true,
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();
        let mut workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &mut workspace, &descriptor, &plan, &request, CombineMode::Video)
            .await
            .unwrap();
        assert_eq!(done.path, workspace.join("combined.karaoke.mp4"));
        assert_eq!(std::fs::read_to_string(&done.path).unwrap(), "encoded");
        assert!(workspace.join("combined.mp4").is_file());
        assert_eq!(
            done.summary,
            Some(CollectionSummary {
                items: 3,
                skipped: 1,
                truncated: false
            })
        );

        let manifest = std::fs::read_to_string(workspace.join(MANIFEST)).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("001-a.mp4'"));
        assert!(lines[1].ends_with("003-c.mp4'"));
        assert!(lines[2].ends_with("004-d.mp4'"));

        let log = std::fs::read_to_string(dir.path().join("ffmpeg.log")).unwrap();
        let calls: Vec<&str> = log.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("-f concat"));
        assert!(calls[0].contains(&VIDEO_CONCAT_ARGS.join(" ")));
        assert!(calls[0].ends_with("combined.mp4"));
        assert!(calls[1].contains("-af"));
        assert!(calls[1].contains("combined.mp4 "));
        assert!(calls[1].ends_with("combined.karaoke.mp4"));
    }

    #[tokio::test]
    async fn combined_video_without_filter_serves_concatenation() {
        let dir = tempdir().unwrap();
        let encoder = install_writing_encoder(dir.path(), "joined");
        let pipeline = pipeline(dir.path(), encoder);
        let descriptor = sample_collection(&["a", "b"]);
        let request = TransformRequest {
            combine: CombineMode::Video,
            ..TransformRequest::default()
        };
        let plan = select(&descriptor, &request).unwrap();
        let mut workspace = pipeline.workspaces.open().unwrap();

        let done = run(&pipeline, &mut workspace, &descriptor, &plan, &request, CombineMode::Video)
            .await
            .unwrap();
        assert_eq!(done.path, workspace.join("combined.mp4"));
        assert_eq!(std::fs::read_to_string(&done.path).unwrap(), "joined");
        assert!(!workspace.join("combined.karaoke.mp4").exists());
    }

    #[test]
    fn manifest_escapes_quotes() {
        let manifest = concat_manifest(&[PathBuf::from("/tmp/a'b.mp3")]);
        assert_eq!(manifest, "file '/tmp/a'\\''b.mp3'\n");
    }
}
