//! Helpers shared by the unit tests: stub executables standing in for the
//! fetch engine and encoder.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::descriptor::{EncodingOption, ResourceDescriptor, ResourceKind};

/// Writes an executable `#!/bin/sh` script named `name` into `dir`.
pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Encoder stub that treats its last argument as the output path and writes
/// `content` there.
pub fn install_writing_encoder(dir: &Path, content: &str) -> PathBuf {
    install_script(
        dir,
        "ffmpeg",
        &format!("for last; do :; done\nprintf '%s' '{content}' > \"$last\""),
    )
}

/// Like [`install_writing_encoder`], but also appends each invocation's
/// arguments as one line to `ffmpeg.log` in `dir`.
pub fn install_recording_encoder(dir: &Path, content: &str) -> PathBuf {
    let log = dir.join("ffmpeg.log");
    install_script(
        dir,
        "ffmpeg",
        &format!(
            "echo \"$*\" >> '{}'\nfor last; do :; done\nprintf '%s' '{content}' > \"$last\"",
            log.display()
        ),
    )
}

/// A single item with one muxed, one video-only and one audio-only option.
pub fn sample_single() -> ResourceDescriptor {
    ResourceDescriptor {
        kind: ResourceKind::Single,
        id: "abc".into(),
        title: Some("Sample Clip".into()),
        uploader: Some("Sample Channel".into()),
        uploader_id: None,
        thumbnail: None,
        description: None,
        duration: Some(12.0),
        view_count: None,
        source_url: "https://example.test/watch?v=abc".into(),
        formats: vec![
            option("140", "m4a", "none", "mp4a.40.2", None),
            option("137", "mp4", "avc1.640028", "none", Some(1080)),
            option("18", "mp4", "avc1.42001E", "mp4a.40.2", Some(360)),
        ],
        entries: Vec::new(),
        entry_count: None,
        truncated: false,
    }
}

/// A collection whose entries point at `https://example.test/<id>`.
pub fn sample_collection(ids: &[&str]) -> ResourceDescriptor {
    let entries = ids
        .iter()
        .map(|id| ResourceDescriptor {
            id: id.to_string(),
            title: Some(format!("Item {id}")),
            source_url: format!("https://example.test/{id}"),
            formats: Vec::new(),
            ..sample_single()
        })
        .collect::<Vec<_>>();
    ResourceDescriptor {
        kind: ResourceKind::Collection,
        id: "PL1".into(),
        title: Some("Sample List".into()),
        source_url: "https://example.test/list".into(),
        formats: Vec::new(),
        entry_count: Some(entries.len()),
        entries,
        ..sample_single()
    }
}

fn option(id: &str, ext: &str, vcodec: &str, acodec: &str, height: Option<u32>) -> EncodingOption {
    EncodingOption {
        format_id: id.into(),
        ext: ext.into(),
        vcodec: Some(vcodec.into()),
        acodec: Some(acodec.into()),
        filesize: Some(2048),
        height,
        ..EncodingOption::default()
    }
}
