//! Locations of the fetch engine (yt-dlp) and encoder (ffmpeg) plus the
//! command lines the pipeline builds for them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Display name used in errors and logs for the fetch engine.
pub const FETCH_ENGINE: &str = "yt-dlp";
/// Display name used in errors and logs for the encoder toolchain.
pub const ENCODER: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct Toolchain {
    fetch_program: PathBuf,
    encoder_program: PathBuf,
}

/// Presence and version of one external program, as reported by `/api/health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Toolchain {
    pub fn new(fetch_program: impl Into<PathBuf>, encoder_program: impl Into<PathBuf>) -> Self {
        Self {
            fetch_program: fetch_program.into(),
            encoder_program: encoder_program.into(),
        }
    }

    /// Base fetch-engine command with the flags every invocation shares.
    /// Children die with their handle so an abandoned pipeline never leaks a
    /// process.
    pub fn fetch_command(&self) -> Command {
        let mut command = Command::new(&self.fetch_program);
        command
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--newline")
            .kill_on_drop(true);
        command
    }

    /// Metadata lookup: one JSON document on stdout.
    pub fn metadata_command(&self, url: &str, flat: bool) -> Command {
        let mut command = Command::new(&self.fetch_program);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress");
        if flat {
            command.arg("--flat-playlist");
        }
        command
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Base encoder command: quiet, non-interactive, overwriting outputs.
    pub fn encoder_command(&self) -> Command {
        let mut command = Command::new(&self.encoder_program);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .kill_on_drop(true);
        command
    }

    /// Fails with [`GatewayError::ToolchainMissing`] when either executable
    /// cannot be found.
    pub fn ensure_available(&self) -> GatewayResult<()> {
        which::which(&self.fetch_program).map_err(|_| GatewayError::missing(FETCH_ENGINE))?;
        which::which(&self.encoder_program).map_err(|_| GatewayError::missing(ENCODER))?;
        Ok(())
    }

    pub async fn fetch_status(&self) -> ToolStatus {
        probe(&self.fetch_program, "--version").await
    }

    pub async fn encoder_status(&self) -> ToolStatus {
        probe(&self.encoder_program, "-version").await
    }
}

/// Runs `<program> <flag>` and keeps the first output line as the version.
async fn probe(program: &Path, flag: &str) -> ToolStatus {
    let Ok(path) = which::which(program) else {
        return ToolStatus {
            available: false,
            path: None,
            version: None,
        };
    };

    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(&path)
            .arg(flag)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let version = match output {
        Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty()),
        Ok(Ok(output)) => {
            debug!(program = %path.display(), status = %output.status, "version probe failed");
            None
        }
        Ok(Err(err)) => {
            debug!(program = %path.display(), error = %err, "version probe could not run");
            None
        }
        Err(_) => {
            debug!(program = %path.display(), "version probe timed out");
            None
        }
    };

    ToolStatus {
        available: true,
        path: Some(path.to_string_lossy().into_owned()),
        version,
    }
}
