//! Resource descriptors built from the metadata resolver's JSON output.
//!
//! The structs here are what `/api/info` serializes, so field names follow the
//! yt-dlp vocabulary the frontend already understands.

use serde::{Deserialize, Serialize};

/// Whether a URL points at one item or at an ordered group of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[serde(rename = "video")]
    Single,
    #[serde(rename = "playlist")]
    Collection,
}

/// One concrete downloadable variant of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingOption {
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize_approx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
}

impl EncodingOption {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    /// Video track without a usable audio track; serving it needs a merge.
    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    pub fn is_muxed(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    /// Human label such as `720p`, falling back to the reported resolution.
    pub fn resolution_label(&self) -> Option<String> {
        if let Some(height) = self.height {
            return Some(format!("{height}p"));
        }
        self.resolution
            .as_deref()
            .filter(|value| !value.is_empty() && *value != "audio only")
            .map(str::to_string)
    }
}

/// yt-dlp reports absent codecs as the literal string `none`.
fn codec_present(codec: Option<&str>) -> bool {
    match codec.map(str::trim) {
        None | Some("") => false,
        Some(value) => !value.eq_ignore_ascii_case("none"),
    }
}

/// Structured description of a URL. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "_type")]
    pub kind: ResourceKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(rename = "webpage_url")]
    pub source_url: String,
    /// Encodings of a single item. Always serialized, possibly empty.
    #[serde(default)]
    pub formats: Vec<EncodingOption>,
    /// Ordered item summaries of a collection.
    #[serde(default, rename = "videos", skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<ResourceDescriptor>,
    /// Number of items the collection reported before any cap was applied.
    #[serde(rename = "video_count", skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<usize>,
    #[serde(default)]
    pub truncated: bool,
}

impl ResourceDescriptor {
    pub fn is_collection(&self) -> bool {
        self.kind == ResourceKind::Collection
    }

    pub fn find_format(&self, format_id: &str) -> Option<&EncodingOption> {
        self.formats
            .iter()
            .find(|option| option.format_id == format_id)
    }

    /// Title, falling back to the id when the resolver did not report one.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

/// Subset of `yt-dlp --dump-single-json` output the gateway reads. Everything
/// is optional because extractors differ wildly in what they report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInfo {
    #[serde(rename = "_type")]
    pub kind: Option<String>,
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub uploader_id: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
    pub original_url: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<RawFormat>>,
    #[serde(default)]
    pub entries: Option<Vec<Option<RawInfo>>>,
    pub playlist_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub format_note: Option<String>,
}

impl RawInfo {
    pub fn is_collection(&self) -> bool {
        matches!(
            self.kind.as_deref(),
            Some("playlist") | Some("multi_video")
        )
    }

    /// URL to hand to the fetch engine for this entry.
    pub fn entry_url(&self) -> Option<&str> {
        self.webpage_url
            .as_deref()
            .or(self.url.as_deref())
            .or(self.original_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }

    /// Converts a single item into a descriptor.
    pub fn into_single(self, fallback_url: &str) -> ResourceDescriptor {
        let source_url = self
            .entry_url()
            .map(str::to_string)
            .unwrap_or_else(|| fallback_url.to_string());
        let formats = self
            .formats
            .unwrap_or_default()
            .into_iter()
            .filter_map(RawFormat::into_option)
            .collect();
        ResourceDescriptor {
            kind: ResourceKind::Single,
            id: self.id.unwrap_or_else(|| "download".to_string()),
            title: self.title,
            uploader: self.uploader.or(self.channel),
            uploader_id: self.uploader_id,
            thumbnail: self.thumbnail,
            description: self.description,
            duration: self.duration,
            view_count: self.view_count,
            source_url,
            formats,
            entries: Vec::new(),
            entry_count: None,
            truncated: false,
        }
    }

    /// Converts a collection, keeping only its own fields. Entries are filled
    /// in by the resolver.
    pub fn collection_header(&self, fallback_url: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            kind: ResourceKind::Collection,
            id: self.id.clone().unwrap_or_else(|| "playlist".to_string()),
            title: self.title.clone(),
            uploader: self.uploader.clone().or_else(|| self.channel.clone()),
            uploader_id: self.uploader_id.clone(),
            thumbnail: self.thumbnail.clone(),
            description: self.description.clone(),
            duration: None,
            view_count: self.view_count,
            source_url: self
                .webpage_url
                .clone()
                .unwrap_or_else(|| fallback_url.to_string()),
            formats: Vec::new(),
            entries: Vec::new(),
            entry_count: None,
            truncated: false,
        }
    }
}

impl RawFormat {
    fn into_option(self) -> Option<EncodingOption> {
        let format_id = self.format_id?.trim().to_string();
        if format_id.is_empty() {
            return None;
        }
        Some(EncodingOption {
            format_id,
            ext: self.ext.unwrap_or_default(),
            vcodec: self.vcodec,
            acodec: self.acodec,
            filesize: self.filesize.map(|value| value as u64),
            filesize_approx: self.filesize_approx.map(|value| value as u64),
            width: self.width.map(|value| value as u32),
            height: self.height.map(|value| value as u32),
            resolution: self.resolution,
            fps: self.fps,
            tbr: self.tbr,
            abr: self.abr,
            format_note: self.format_note,
        })
    }
}
