#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_PLAYLIST_ITEMS: usize = 50;
pub const DEFAULT_PLAYLIST_MAX_ITEMS: usize = 500;
pub const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROCESS_EXIT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_FETCH_PROGRAM: &str = "yt-dlp";
pub const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";

/// Everything the gateway reads from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub max_concurrent_downloads: usize,
    pub playlist_default_items: usize,
    pub playlist_max_items: usize,
    pub admission_timeout: Duration,
    pub process_exit_timeout: Duration,
    pub fetch_program: PathBuf,
    pub encoder_program: PathBuf,
    pub scratch_root: Option<PathBuf>,
    pub allow_root: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            playlist_default_items: DEFAULT_PLAYLIST_ITEMS,
            playlist_max_items: DEFAULT_PLAYLIST_MAX_ITEMS,
            admission_timeout: Duration::from_secs(DEFAULT_ADMISSION_TIMEOUT_SECS),
            process_exit_timeout: Duration::from_secs(DEFAULT_PROCESS_EXIT_TIMEOUT_SECS),
            fetch_program: PathBuf::from(DEFAULT_FETCH_PROGRAM),
            encoder_program: PathBuf::from(DEFAULT_ENCODER_PROGRAM),
            scratch_root: None,
            allow_root: false,
        }
    }
}

impl GatewaySettings {
    /// Item cap for a collection request. Callers only get past the default cap
    /// when they explicitly ask for a large playlist, and never past the
    /// operator maximum. A large playlist without an explicit count gets the
    /// maximum.
    pub fn playlist_limit(&self, requested: Option<usize>, allow_large: bool) -> usize {
        let ceiling = if allow_large {
            self.playlist_max_items
        } else {
            self.playlist_default_items
        };
        requested.unwrap_or(ceiling).clamp(1, ceiling.max(1))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_concurrent_downloads: Option<usize>,
    pub scratch_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<GatewaySettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> GatewaySettings {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> GatewaySettings {
    let defaults = GatewaySettings::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("APSARAFLOW_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| lookup("APSARAFLOW_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.port);
    let max_concurrent_downloads = overrides
        .max_concurrent_downloads
        .or_else(|| parsed("MAX_CONCURRENT_DOWNLOADS").map(|value| value as usize))
        .unwrap_or(defaults.max_concurrent_downloads)
        .max(1);
    let playlist_max_items = parsed("PLAYLIST_MAX_ITEMS")
        .map(|value| value as usize)
        .unwrap_or(defaults.playlist_max_items)
        .max(1);
    let playlist_default_items = parsed("PLAYLIST_DEFAULT_ITEMS")
        .map(|value| value as usize)
        .unwrap_or(defaults.playlist_default_items)
        .clamp(1, playlist_max_items);
    let admission_timeout = parsed("ADMISSION_TIMEOUT_SECS")
        .map(Duration::from_secs)
        .unwrap_or(defaults.admission_timeout);
    let process_exit_timeout = parsed("PROCESS_EXIT_TIMEOUT_SECS")
        .map(Duration::from_secs)
        .unwrap_or(defaults.process_exit_timeout);
    let fetch_program = lookup("YT_DLP_BIN")
        .map(PathBuf::from)
        .unwrap_or(defaults.fetch_program);
    let encoder_program = lookup("FFMPEG_BIN")
        .map(PathBuf::from)
        .unwrap_or(defaults.encoder_program);
    let scratch_root = overrides
        .scratch_root
        .or_else(|| lookup("SCRATCH_ROOT").map(PathBuf::from));
    let allow_root = lookup("APSARAFLOW_ALLOW_ROOT")
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    GatewaySettings {
        host,
        port,
        max_concurrent_downloads,
        playlist_default_items,
        playlist_max_items,
        admission_timeout,
        process_exit_timeout,
        fetch_program,
        encoder_program,
        scratch_root,
        allow_root,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
