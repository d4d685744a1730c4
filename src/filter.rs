//! Vocal removal through the encoder's audio filters, with preset fallback.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::pipe::ProcessChain;
use crate::toolchain::{ENCODER, Toolchain};

#[derive(Debug, Clone, Copy)]
pub struct FilterPreset {
    pub name: &'static str,
    pub audio_filter: &'static str,
}

/// Most aggressive first. Center cancellation works on stereo sources only,
/// which is why gentler chains follow it.
pub const VOCAL_REMOVAL_PRESETS: &[FilterPreset] = &[
    FilterPreset {
        name: "center-cancel-shaped",
        audio_filter: "pan=stereo|c0=c0-c1|c1=c1-c0,highpass=f=120,lowpass=f=9000,\
                       equalizer=f=1000:t=q:w=1.5:g=-4,loudnorm=I=-16:TP=-1.5:LRA=11",
    },
    FilterPreset {
        name: "center-cancel-light",
        audio_filter: "pan=stereo|c0=0.5*c0-0.5*c1|c1=0.5*c1-0.5*c0,loudnorm=I=-16:TP=-1.5:LRA=11",
    },
    FilterPreset {
        name: "stereotools",
        audio_filter: "stereotools=mlev=0.015625",
    },
];

/// Writes `output` from `input` with vocals suppressed. Video is copied, audio
/// re-encoded to AAC. Each failed preset's partial output is deleted before
/// the next one runs.
pub async fn remove_vocals(
    toolchain: &Toolchain,
    input: &Path,
    output: &Path,
    exit_timeout: Duration,
) -> GatewayResult<()> {
    run_presets(toolchain, VOCAL_REMOVAL_PRESETS, input, output, exit_timeout).await
}

async fn run_presets(
    toolchain: &Toolchain,
    presets: &[FilterPreset],
    input: &Path,
    output: &Path,
    exit_timeout: Duration,
) -> GatewayResult<()> {
    let mut failures: Vec<String> = Vec::new();

    for preset in presets {
        let mut command = toolchain.encoder_command();
        command
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg("0:v?")
            .arg("-map")
            .arg("0:a")
            .arg("-af")
            .arg(preset.audio_filter)
            .args(["-c:v", "copy", "-c:a", "aac", "-b:a", "192k"])
            .arg(output);

        let outcome = match ProcessChain::single(ENCODER, command) {
            Ok(chain) => chain.collect_stdout(exit_timeout).await.map(|_| ()),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) if output.is_file() => {
                info!(preset = preset.name, "vocal removal applied");
                return Ok(());
            }
            Ok(()) => failures.push(format!("{}: no output produced", preset.name)),
            Err(err @ GatewayError::ToolchainMissing { .. }) => return Err(err),
            Err(GatewayError::ToolchainFailure { diagnostics, .. }) => {
                failures.push(format!("{}: {diagnostics}", preset.name));
            }
            Err(other) => failures.push(format!("{}: {other}", preset.name)),
        }

        warn!(preset = preset.name, "vocal removal preset failed");
        remove_partial(output).await;
    }

    let start = failures.len().saturating_sub(2);
    Err(GatewayError::ToolchainFailure {
        program: ENCODER.to_string(),
        status: "a failure for every vocal removal preset".to_string(),
        diagnostics: failures[start..].join("\n"),
    })
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial output"),
    }
}
