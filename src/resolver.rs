//! Turns a URL into a [`ResourceDescriptor`] through the metadata service.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tracing::{debug, info, warn};

use crate::descriptor::{RawInfo, ResourceDescriptor};
use crate::error::{GatewayError, GatewayResult};
use crate::pipe::ProcessChain;
use crate::toolchain::{FETCH_ENGINE, Toolchain};

/// Per-item lookups in flight at once during a detailed resolution.
const DETAIL_CONCURRENCY: usize = 4;
const METADATA_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything able to describe a URL the way `yt-dlp --dump-single-json` does.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// `flat` asks for collection entries without per-entry detail.
    async fn extract(&self, url: &str, flat: bool) -> GatewayResult<RawInfo>;
}

/// Metadata source backed by the fetch-engine executable.
#[derive(Debug, Clone)]
pub struct YtDlpMetadataSource {
    toolchain: Toolchain,
}

impl YtDlpMetadataSource {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }
}

#[async_trait]
impl MetadataSource for YtDlpMetadataSource {
    async fn extract(&self, url: &str, flat: bool) -> GatewayResult<RawInfo> {
        let command = self.toolchain.metadata_command(url, flat);
        let chain = ProcessChain::single(FETCH_ENGINE, command)?;
        let stdout = match chain.collect_stdout(METADATA_EXIT_TIMEOUT).await {
            Ok(stdout) => stdout,
            // The engine explains why a URL is unsupported on stderr; that is a
            // caller problem rather than a broken toolchain.
            Err(GatewayError::ToolchainFailure { diagnostics, .. }) => {
                return Err(GatewayError::resolution(diagnostics));
            }
            Err(other) => return Err(other),
        };
        serde_json::from_slice(&stdout).map_err(|err| {
            GatewayError::resolution(format!("unreadable metadata for {url}: {err}"))
        })
    }
}

/// How much detail a resolution gathers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveDepth {
    /// One metadata call; collection entries stay flat summaries.
    Shallow { limit: usize },
    /// Collection entries are each resolved with their own call.
    Detailed { limit: usize },
}

impl ResolveDepth {
    fn limit(self) -> usize {
        match self {
            Self::Shallow { limit } | Self::Detailed { limit } => limit.max(1),
        }
    }
}

pub struct ResourceResolver<S> {
    source: S,
}

impl<S: MetadataSource> ResourceResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn resolve(&self, url: &str, depth: ResolveDepth) -> GatewayResult<ResourceDescriptor> {
        let raw = self.source.extract(url, true).await?;
        if !raw.is_collection() {
            let descriptor = raw.into_single(url);
            debug!(id = %descriptor.id, formats = descriptor.formats.len(), "resolved single item");
            return Ok(descriptor);
        }

        let limit = depth.limit();
        let mut descriptor = raw.collection_header(url);
        let entries: Vec<RawInfo> = raw.entries.unwrap_or_default().into_iter().flatten().collect();
        let total = raw.playlist_count.unwrap_or(0).max(entries.len());
        descriptor.entry_count = Some(total);
        descriptor.truncated = total > limit;

        let capped: Vec<RawInfo> = entries.into_iter().take(limit).collect();
        descriptor.entries = match depth {
            ResolveDepth::Shallow { .. } => capped
                .into_iter()
                .filter_map(|entry| {
                    let url = entry.entry_url()?.to_string();
                    Some(entry.into_single(&url))
                })
                .collect(),
            ResolveDepth::Detailed { .. } => self.resolve_entries(capped).await,
        };

        info!(
            id = %descriptor.id,
            total,
            kept = descriptor.entries.len(),
            truncated = descriptor.truncated,
            "resolved collection"
        );
        Ok(descriptor)
    }

    async fn resolve_entries(&self, entries: Vec<RawInfo>) -> Vec<ResourceDescriptor> {
        stream::iter(entries)
            .map(|entry| async move {
                let url = entry.entry_url()?.to_string();
                match self.source.extract(&url, false).await {
                    Ok(detail) => Some(detail.into_single(&url)),
                    Err(err) => {
                        warn!(url = %url, error = %err, "skipping collection item");
                        None
                    }
                }
            })
            .buffered(DETAIL_CONCURRENCY)
            .filter_map(|resolved| async move { resolved })
            .collect()
            .await
    }
}
