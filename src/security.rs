#![forbid(unsafe_code)]

//! Security checks shared by the gateway binary and the pipeline.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

use crate::error::{GatewayError, GatewayResult};

/// Fails fast when the gateway is started as root. Downloads run arbitrary
/// remote content through external tools, so the service belongs to an
/// unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or set APSARAFLOW_ALLOW_ROOT=1"
        );
    }
    Ok(())
}

/// Checks a caller-supplied media URL before it reaches any external tool.
///
/// Only absolute http(s) URLs with a host are accepted. The returned string is
/// the normalized form handed to the fetch engine.
pub fn validate_source_url(raw: &str) -> GatewayResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::resolution("a media URL is required"));
    }
    if trimmed.starts_with('-') {
        return Err(GatewayError::resolution("unsupported URL"));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| GatewayError::resolution(format!("unsupported URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::resolution(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(GatewayError::resolution("URL has no host"));
    }
    Ok(parsed.to_string())
}
