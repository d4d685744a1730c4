#![forbid(unsafe_code)]

//! Typed failures produced by the download pipeline.
//!
//! Every strategy reports through [`GatewayError`]; the HTTP layer maps each
//! variant to a status code in exactly one place.

use std::process::ExitStatus;

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("too many downloads in progress, try again later")]
    AdmissionRejected,

    #[error("could not resolve media: {0}")]
    Resolution(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{program} is not installed or not in PATH")]
    ToolchainMissing { program: String },

    #[error("{program} exited with {status}: {diagnostics}")]
    ToolchainFailure {
        program: String,
        status: String,
        diagnostics: String,
    },

    #[error("internal error: {0}")]
    InternalConsistency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn missing(program: impl Into<String>) -> Self {
        Self::ToolchainMissing {
            program: program.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }

    /// Builds a toolchain failure from an exit status and the captured tail of
    /// the process diagnostics.
    pub fn failed(program: impl Into<String>, status: Option<ExitStatus>, diagnostics: &[String]) -> Self {
        let status = match status {
            Some(status) => status.to_string(),
            None => "an unknown status".to_string(),
        };
        let diagnostics = if diagnostics.is_empty() {
            "no diagnostic output".to_string()
        } else {
            diagnostics.join("\n")
        };
        Self::ToolchainFailure {
            program: program.into(),
            status,
            diagnostics,
        }
    }

    /// Translates a spawn failure: a missing executable is reported as
    /// [`GatewayError::ToolchainMissing`], anything else stays an I/O error.
    pub fn from_spawn(program: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::missing(program)
        } else {
            Self::Io(err)
        }
    }

    /// True for failures caused by the caller rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected | Self::Resolution(_) | Self::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_not_found_maps_to_missing_toolchain() {
        let err = GatewayError::from_spawn(
            "yt-dlp",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        assert!(matches!(err, GatewayError::ToolchainMissing { ref program } if program == "yt-dlp"));
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn spawn_permission_error_stays_io() {
        let err = GatewayError::from_spawn(
            "ffmpeg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, GatewayError::Io(_)));
    }

    #[test]
    fn failure_joins_diagnostics() {
        let err = GatewayError::failed("ffmpeg", None, &["first".into(), "second".into()]);
        let text = err.to_string();
        assert!(text.contains("first\nsecond"));
        assert!(!err.is_client_error());
    }
}
