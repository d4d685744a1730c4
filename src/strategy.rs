//! Picks the execution strategy for a resolved resource and a request.

use tracing::debug;

use crate::descriptor::{EncodingOption, ResourceDescriptor};
use crate::error::{GatewayError, GatewayResult};
use crate::request::{CombineMode, EncodingSelector, TransformRequest};

const AUDIO_SELECTOR: &str = "bestaudio/best";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeMode {
    /// Fetch engine into encoder, MP3 written to the workspace.
    Audio,
    /// Fetch engine output kept as is.
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectStream,
    DiskMaterialize(MaterializeMode),
    Merge,
    FilteredMerge,
    CollectionAggregate(CombineMode),
}

/// Everything an execution strategy needs besides the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub strategy: Strategy,
    /// Value for the fetch engine's `-f`.
    pub fetch_selector: String,
    pub selected: Option<EncodingOption>,
    pub ext: String,
    pub content_type: String,
    /// Only set when the exact byte count is known up front.
    pub content_length: Option<u64>,
    pub resolution: Option<String>,
}

/// First matching rule wins; incompatible combinations are rejected here,
/// before any process runs.
pub fn select(descriptor: &ResourceDescriptor, request: &TransformRequest) -> GatewayResult<Plan> {
    request.validate_flags()?;

    let plan = if descriptor.is_collection() {
        select_collection(request)?
    } else {
        select_single(descriptor, request)?
    };
    debug!(id = %descriptor.id, strategy = ?plan.strategy, selector = %plan.fetch_selector, "strategy selected");
    Ok(plan)
}

fn select_collection(request: &TransformRequest) -> GatewayResult<Plan> {
    if request.vocal_removal && request.combine != CombineMode::Video {
        return Err(GatewayError::validation(
            "karaoke on a playlist requires playlist_combine=video",
        ));
    }
    let wants_audio = request.audio_extract || request.combine == CombineMode::Audio;
    let fetch_selector = if wants_audio && request.selector.is_default() {
        AUDIO_SELECTOR.to_string()
    } else {
        request.selector.expression()
    };
    let ext = match request.combine {
        CombineMode::None => "zip",
        CombineMode::Audio => "mp3",
        CombineMode::Video => "mp4",
    };
    Ok(plan(
        Strategy::CollectionAggregate(request.combine),
        fetch_selector,
        None,
        ext,
    ))
}

fn select_single(descriptor: &ResourceDescriptor, request: &TransformRequest) -> GatewayResult<Plan> {
    if request.combine != CombineMode::None {
        return Err(GatewayError::validation(
            "playlist_combine only applies to playlists",
        ));
    }

    let selected = selected_option(descriptor, &request.selector)?;

    if request.audio_extract {
        let fetch_selector = if request.selector.is_default() {
            AUDIO_SELECTOR.to_string()
        } else {
            request.selector.expression()
        };
        return Ok(plan(
            Strategy::DiskMaterialize(MaterializeMode::Audio),
            fetch_selector,
            selected,
            "mp3",
        ));
    }

    let video_only = selected.as_ref().is_some_and(EncodingOption::is_video_only);
    if request.selector.needs_merge() || video_only {
        let fetch_selector = match (&request.selector, &selected) {
            (EncodingSelector::Literal(id), Some(_)) => format!("{id}+bestaudio/{id}"),
            (selector, _) => selector.expression(),
        };
        let strategy = if request.vocal_removal {
            Strategy::FilteredMerge
        } else {
            Strategy::Merge
        };
        return Ok(plan(strategy, fetch_selector, selected, "mp4"));
    }

    if let Some(option) = selected.as_ref().filter(|option| option.is_audio_only()) {
        if request.vocal_removal {
            return Err(GatewayError::validation(
                "karaoke needs a format with video",
            ));
        }
        let ext = non_empty_ext(&option.ext).to_string();
        return Ok(plan(
            Strategy::DiskMaterialize(MaterializeMode::Passthrough),
            request.selector.expression(),
            selected,
            &ext,
        ));
    }

    if request.vocal_removal {
        return Ok(plan(
            Strategy::FilteredMerge,
            request.selector.expression(),
            selected,
            "mp4",
        ));
    }

    let ext = match &selected {
        Some(option) => non_empty_ext(&option.ext).to_string(),
        None if request.selector.is_default() => best_muxed(descriptor)
            .map(|option| non_empty_ext(&option.ext).to_string())
            .unwrap_or_else(|| "bin".to_string()),
        None => "bin".to_string(),
    };
    let content_length = selected.as_ref().and_then(|option| option.filesize);
    let mut direct = plan(
        Strategy::DirectStream,
        request.selector.expression(),
        selected,
        &ext,
    );
    direct.content_length = content_length;
    Ok(direct)
}

/// The concrete option a literal or composite selector names. Selectors are
/// only checked against a non-empty encoding list.
fn selected_option(
    descriptor: &ResourceDescriptor,
    selector: &EncodingSelector,
) -> GatewayResult<Option<EncodingOption>> {
    let lookup = |id: &str| -> GatewayResult<Option<EncodingOption>> {
        if descriptor.formats.is_empty() {
            return Ok(None);
        }
        descriptor
            .find_format(id)
            .cloned()
            .map(Some)
            .ok_or_else(|| GatewayError::validation(format!("unknown format: {id}")))
    };

    match selector {
        EncodingSelector::Generic(_) => Ok(None),
        EncodingSelector::Literal(id) => lookup(id),
        EncodingSelector::Composite(parts) => {
            let mut first = None;
            for part in parts {
                if part.starts_with("best") || part.starts_with("worst") {
                    continue;
                }
                let found = lookup(part)?;
                if first.is_none() {
                    first = found;
                }
            }
            Ok(first)
        }
    }
}

/// The fetch engine lists formats worst to best.
fn best_muxed(descriptor: &ResourceDescriptor) -> Option<&EncodingOption> {
    descriptor
        .formats
        .iter()
        .rev()
        .find(|option| option.is_muxed())
}

fn non_empty_ext(ext: &str) -> &str {
    if ext.trim().is_empty() { "bin" } else { ext }
}

fn plan(strategy: Strategy, fetch_selector: String, selected: Option<EncodingOption>, ext: &str) -> Plan {
    let content_type = content_type_for(ext);
    let resolution = selected.as_ref().and_then(EncodingOption::resolution_label);
    Plan {
        strategy,
        fetch_selector,
        selected,
        ext: ext.to_string(),
        content_type,
        content_length: None,
        resolution,
    }
}

pub fn content_type_for(ext: &str) -> String {
    match ext {
        "mp3" => "audio/mpeg".to_string(),
        "zip" => "application/zip".to_string(),
        "bin" => "application/octet-stream".to_string(),
        other => mime_guess::from_ext(other)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ResourceKind;

    fn option(id: &str, ext: &str, vcodec: &str, acodec: &str) -> EncodingOption {
        EncodingOption {
            format_id: id.into(),
            ext: ext.into(),
            vcodec: Some(vcodec.into()),
            acodec: Some(acodec.into()),
            filesize: Some(1000),
            height: (vcodec != "none").then_some(720),
            ..EncodingOption::default()
        }
    }

    fn single() -> ResourceDescriptor {
        ResourceDescriptor {
            kind: ResourceKind::Single,
            id: "abc".into(),
            title: Some("Clip".into()),
            uploader: None,
            uploader_id: None,
            thumbnail: None,
            description: None,
            duration: None,
            view_count: None,
            source_url: "https://example.test/abc".into(),
            formats: vec![
                option("140", "m4a", "none", "mp4a"),
                option("137", "mp4", "avc1", "none"),
                option("18", "mp4", "avc1", "mp4a"),
            ],
            entries: Vec::new(),
            entry_count: None,
            truncated: false,
        }
    }

    fn collection() -> ResourceDescriptor {
        ResourceDescriptor {
            kind: ResourceKind::Collection,
            formats: Vec::new(),
            ..single()
        }
    }

    fn request(format: &str) -> TransformRequest {
        TransformRequest {
            selector: EncodingSelector::parse(Some(format)).unwrap(),
            ..TransformRequest::default()
        }
    }

    #[test]
    fn composite_selector_merges() {
        let plan = select(&single(), &request("137+140")).unwrap();
        assert_eq!(plan.strategy, Strategy::Merge);
        assert_eq!(plan.ext, "mp4");
        assert_eq!(plan.content_type, "video/mp4");
        assert_eq!(plan.resolution.as_deref(), Some("720p"));
    }

    #[test]
    fn video_only_literal_pulls_in_audio() {
        let plan = select(&single(), &request("137")).unwrap();
        assert_eq!(plan.strategy, Strategy::Merge);
        assert_eq!(plan.fetch_selector, "137+bestaudio/137");
    }

    #[test]
    fn muxed_literal_streams_with_exact_length() {
        let plan = select(&single(), &request("18")).unwrap();
        assert_eq!(plan.strategy, Strategy::DirectStream);
        assert_eq!(plan.content_length, Some(1000));
        assert_eq!(plan.ext, "mp4");
    }

    #[test]
    fn default_selector_streams_without_length() {
        let plan = select(&single(), &TransformRequest::default()).unwrap();
        assert_eq!(plan.strategy, Strategy::DirectStream);
        assert_eq!(plan.content_length, None);
        assert_eq!(plan.ext, "mp4");
    }

    #[test]
    fn audio_only_literal_is_materialized() {
        let plan = select(&single(), &request("140")).unwrap();
        assert_eq!(
            plan.strategy,
            Strategy::DiskMaterialize(MaterializeMode::Passthrough)
        );
        assert_eq!(plan.ext, "m4a");
    }

    #[test]
    fn audio_extract_wins_over_format_shape() {
        let request = TransformRequest {
            audio_extract: true,
            ..request("137+140")
        };
        let plan = select(&single(), &request).unwrap();
        assert_eq!(plan.strategy, Strategy::DiskMaterialize(MaterializeMode::Audio));
        assert_eq!(plan.content_type, "audio/mpeg");

        let default_audio = TransformRequest {
            audio_extract: true,
            ..TransformRequest::default()
        };
        let plan = select(&single(), &default_audio).unwrap();
        assert_eq!(plan.fetch_selector, AUDIO_SELECTOR);
    }

    #[test]
    fn vocal_removal_filters_merges_and_muxed_streams() {
        let merge = TransformRequest {
            vocal_removal: true,
            ..request("137+140")
        };
        assert_eq!(select(&single(), &merge).unwrap().strategy, Strategy::FilteredMerge);

        let muxed = TransformRequest {
            vocal_removal: true,
            ..request("18")
        };
        assert_eq!(select(&single(), &muxed).unwrap().strategy, Strategy::FilteredMerge);

        let audio = TransformRequest {
            vocal_removal: true,
            ..request("140")
        };
        assert!(matches!(
            select(&single(), &audio).unwrap_err(),
            GatewayError::Validation(_)
        ));
    }

    #[test]
    fn vocal_removal_with_audio_extract_is_rejected() {
        let request = TransformRequest {
            vocal_removal: true,
            audio_extract: true,
            ..TransformRequest::default()
        };
        assert!(matches!(
            select(&single(), &request).unwrap_err(),
            GatewayError::Validation(_)
        ));
    }

    #[test]
    fn unknown_literal_is_rejected_only_when_formats_are_known() {
        assert!(select(&single(), &request("999")).is_err());

        let mut bare = single();
        bare.formats.clear();
        let plan = select(&bare, &request("999")).unwrap();
        assert_eq!(plan.strategy, Strategy::DirectStream);
        assert_eq!(plan.ext, "bin");
    }

    #[test]
    fn collections_aggregate() {
        let plan = select(&collection(), &TransformRequest::default()).unwrap();
        assert_eq!(plan.strategy, Strategy::CollectionAggregate(CombineMode::None));
        assert_eq!(plan.content_type, "application/zip");

        let combined = TransformRequest {
            combine: CombineMode::Audio,
            ..TransformRequest::default()
        };
        let plan = select(&collection(), &combined).unwrap();
        assert_eq!(plan.ext, "mp3");
        assert_eq!(plan.fetch_selector, AUDIO_SELECTOR);
    }

    #[test]
    fn combine_and_karaoke_rules_for_collections() {
        let single_combine = TransformRequest {
            combine: CombineMode::Video,
            ..TransformRequest::default()
        };
        assert!(select(&single(), &single_combine).is_err());

        let karaoke_zip = TransformRequest {
            vocal_removal: true,
            ..TransformRequest::default()
        };
        assert!(select(&collection(), &karaoke_zip).is_err());

        let karaoke_video = TransformRequest {
            vocal_removal: true,
            combine: CombineMode::Video,
            ..TransformRequest::default()
        };
        assert_eq!(
            select(&collection(), &karaoke_video).unwrap().strategy,
            Strategy::CollectionAggregate(CombineMode::Video)
        );
    }
}
