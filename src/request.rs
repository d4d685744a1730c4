//! Caller-supplied transform options and their static validation.

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_SELECTOR: &str = "best";

/// The `format` parameter, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingSelector {
    /// A fetch-engine expression such as `best`, `bestvideo[height<=720]` or
    /// `bv*+ba/b`. Passed through untouched.
    Generic(String),
    /// One concrete `format_id` from the descriptor.
    Literal(String),
    /// `videoId+audioId`: components the engine muxes together.
    Composite(Vec<String>),
}

impl EncodingSelector {
    pub fn parse(raw: Option<&str>) -> GatewayResult<Self> {
        let value = raw.map(str::trim).filter(|value| !value.is_empty());
        let Some(value) = value else {
            return Ok(Self::Generic(DEFAULT_SELECTOR.to_string()));
        };
        if value.starts_with('-') || value.chars().any(char::is_whitespace) {
            return Err(GatewayError::validation(format!(
                "invalid format selector: {value}"
            )));
        }

        let generic = value.starts_with("best")
            || value.starts_with("worst")
            || value.contains(['[', '/', '*']);
        if generic {
            return Ok(Self::Generic(value.to_string()));
        }

        if value.contains('+') {
            let parts: Vec<String> = value.split('+').map(str::to_string).collect();
            if parts.iter().any(String::is_empty) {
                return Err(GatewayError::validation(format!(
                    "invalid format selector: {value}"
                )));
            }
            return Ok(Self::Composite(parts));
        }

        Ok(Self::Literal(value.to_string()))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Generic(value) if value == DEFAULT_SELECTOR)
    }

    /// True when the engine has to mux separate video and audio downloads.
    pub fn needs_merge(&self) -> bool {
        match self {
            Self::Composite(_) => true,
            Self::Generic(value) => value.contains('+'),
            Self::Literal(_) => false,
        }
    }

    /// The expression handed to the fetch engine's `-f`.
    pub fn expression(&self) -> String {
        match self {
            Self::Generic(value) | Self::Literal(value) => value.clone(),
            Self::Composite(parts) => parts.join("+"),
        }
    }
}

/// How a collection download is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineMode {
    /// Every item packed into one zip archive.
    #[default]
    None,
    /// Items joined into one MP3.
    Audio,
    /// Items joined into one MP4.
    Video,
}

impl CombineMode {
    pub fn parse(raw: Option<&str>) -> GatewayResult<Self> {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("none") | Some("zip") => Ok(Self::None),
            Some("audio") | Some("mp3") => Ok(Self::Audio),
            Some("video") | Some("mp4") => Ok(Self::Video),
            Some(other) => Err(GatewayError::validation(format!(
                "unknown playlist_combine value: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub selector: EncodingSelector,
    pub audio_extract: bool,
    pub filename_template: Option<String>,
    pub combine: CombineMode,
    pub vocal_removal: bool,
}

impl Default for TransformRequest {
    fn default() -> Self {
        Self {
            selector: EncodingSelector::Generic(DEFAULT_SELECTOR.to_string()),
            audio_extract: false,
            filename_template: None,
            combine: CombineMode::None,
            vocal_removal: false,
        }
    }
}

impl TransformRequest {
    /// Rejects flag combinations that can never be served, independent of the
    /// resolved resource. Runs before any slot is taken or process started.
    pub fn validate_flags(&self) -> GatewayResult<()> {
        if self.vocal_removal && self.audio_extract {
            return Err(GatewayError::validation(
                "karaoke cannot be combined with MP3 conversion",
            ));
        }
        if self.vocal_removal && self.combine == CombineMode::Audio {
            return Err(GatewayError::validation(
                "karaoke requires video output; use playlist_combine=video",
            ));
        }
        if self.audio_extract && self.combine == CombineMode::Video {
            return Err(GatewayError::validation(
                "MP3 conversion cannot be combined with playlist_combine=video",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_selectors() {
        assert_eq!(
            EncodingSelector::parse(None).unwrap(),
            EncodingSelector::Generic("best".into())
        );
        assert_eq!(
            EncodingSelector::parse(Some("bestvideo+bestaudio")).unwrap(),
            EncodingSelector::Generic("bestvideo+bestaudio".into())
        );
        assert_eq!(
            EncodingSelector::parse(Some("bv*[height<=720]")).unwrap(),
            EncodingSelector::Generic("bv*[height<=720]".into())
        );
        assert_eq!(
            EncodingSelector::parse(Some("137+140")).unwrap(),
            EncodingSelector::Composite(vec!["137".into(), "140".into()])
        );
        assert_eq!(
            EncodingSelector::parse(Some("22")).unwrap(),
            EncodingSelector::Literal("22".into())
        );
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(EncodingSelector::parse(Some("--exec")).is_err());
        assert!(EncodingSelector::parse(Some("137+")).is_err());
        assert!(EncodingSelector::parse(Some("1 2")).is_err());
    }

    #[test]
    fn parses_combine_modes() {
        assert_eq!(CombineMode::parse(None).unwrap(), CombineMode::None);
        assert_eq!(CombineMode::parse(Some("MP3")).unwrap(), CombineMode::Audio);
        assert_eq!(CombineMode::parse(Some("video")).unwrap(), CombineMode::Video);
        assert!(CombineMode::parse(Some("gif")).is_err());
    }

    #[test]
    fn vocal_removal_with_audio_extract_is_rejected() {
        let request = TransformRequest {
            audio_extract: true,
            vocal_removal: true,
            ..TransformRequest::default()
        };
        let err = request.validate_flags().unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn incompatible_combine_flags_are_rejected() {
        let vocal_audio = TransformRequest {
            vocal_removal: true,
            combine: CombineMode::Audio,
            ..TransformRequest::default()
        };
        assert!(vocal_audio.validate_flags().is_err());

        let mp3_video = TransformRequest {
            audio_extract: true,
            combine: CombineMode::Video,
            ..TransformRequest::default()
        };
        assert!(mp3_video.validate_flags().is_err());

        let fine = TransformRequest {
            vocal_removal: true,
            combine: CombineMode::Video,
            ..TransformRequest::default()
        };
        assert!(fine.validate_flags().is_ok());
    }
}
