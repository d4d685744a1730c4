//! Turns a pipeline result into a response body that cleans up after itself.
//!
//! Cleanup order is fixed: processes or open files first, then the workspace,
//! then the admission slot. It holds whether the body is read to the end or
//! dropped halfway by a disconnecting client.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs::File;
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gate::AdmissionToken;
use crate::pipe::{ProcessChain, stream_error};
use crate::workspace::ScratchWorkspace;

const CHUNK_SIZE: usize = 256 * 1024;

/// Outcome of a collection download, reported through response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSummary {
    pub items: usize,
    pub skipped: usize,
    pub truncated: bool,
}

pub enum PipelineOutput {
    /// Bytes come straight from the terminal process's stdout.
    Stream {
        chain: ProcessChain,
        content_type: String,
        content_length: Option<u64>,
        filename: String,
        exit_timeout: Duration,
    },
    /// A finished file inside a workspace.
    File {
        path: PathBuf,
        workspace: ScratchWorkspace,
        content_type: String,
        filename: String,
        summary: Option<CollectionSummary>,
    },
}

/// Response metadata plus a body stream owning every resource of the request.
pub struct Delivery {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub filename: String,
    pub summary: Option<CollectionSummary>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl PipelineOutput {
    /// For a process stream, waits for the first chunk so a process that fails
    /// before producing output is reported as an error instead of an empty
    /// body.
    pub async fn into_delivery(self, token: AdmissionToken) -> GatewayResult<Delivery> {
        match self {
            Self::Stream {
                mut chain,
                content_type,
                content_length,
                filename,
                exit_timeout,
            } => {
                let Some(stdout) = chain.take_stdout() else {
                    chain.shutdown().await;
                    return Err(GatewayError::internal("process output is not available"));
                };
                let mut reader = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
                let first = match reader.next().await {
                    Some(Ok(chunk)) => Some(chunk),
                    Some(Err(err)) => {
                        chain.shutdown().await;
                        return Err(GatewayError::Io(err));
                    }
                    None => {
                        chain.finish(exit_timeout).await?;
                        None
                    }
                };
                let transfer = ProcessTransfer {
                    first,
                    reader,
                    chain,
                    exit_timeout,
                    token,
                };
                Ok(Delivery {
                    content_type,
                    content_length,
                    filename,
                    summary: None,
                    body: transfer.into_stream(),
                })
            }
            Self::File {
                path,
                mut workspace,
                content_type,
                filename,
                summary,
            } => {
                let opened = match File::open(&path).await {
                    Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
                    Err(err) => Err(err),
                };
                let (file, length) = match opened {
                    Ok(opened) => opened,
                    Err(err) => {
                        workspace.release();
                        return Err(GatewayError::internal(format!(
                            "output {} could not be opened: {err}",
                            path.display()
                        )));
                    }
                };
                let transfer = FileTransfer {
                    reader: ReaderStream::with_capacity(file, CHUNK_SIZE),
                    workspace,
                    token,
                };
                Ok(Delivery {
                    content_type,
                    content_length: Some(length),
                    filename,
                    summary,
                    body: transfer.into_stream(),
                })
            }
        }
    }
}

// Field order is drop order.
struct ProcessTransfer {
    first: Option<Bytes>,
    reader: ReaderStream<ChildStdout>,
    chain: ProcessChain,
    exit_timeout: Duration,
    token: AdmissionToken,
}

impl ProcessTransfer {
    fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            if let Some(chunk) = state.first.take() {
                return Some((Ok(chunk), Some(state)));
            }
            match state.reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(state))),
                Some(Err(err)) => {
                    state.close().await;
                    Some((Err(err), None))
                }
                None => match state.complete().await {
                    Ok(()) => None,
                    Err(err) => Some((Err(stream_error(err)), None)),
                },
            }
        })
        .boxed()
    }

    async fn complete(mut self) -> GatewayResult<()> {
        let result = self.chain.finish(self.exit_timeout).await;
        if let Err(err) = &result {
            warn!(error = %err, "stream ended with a failed process");
        } else {
            debug!("stream delivered");
        }
        self.token.release();
        result
    }

    async fn close(mut self) {
        self.chain.shutdown().await;
        self.token.release();
    }
}

struct FileTransfer {
    reader: ReaderStream<File>,
    workspace: ScratchWorkspace,
    token: AdmissionToken,
}

impl FileTransfer {
    fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            match state.reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(state))),
                Some(Err(err)) => {
                    state.close();
                    Some((Err(err), None))
                }
                None => {
                    debug!(workspace = %state.workspace.path().display(), "file delivered");
                    state.close();
                    None
                }
            }
        })
        .boxed()
    }

    fn close(self) {
        let Self {
            reader,
            mut workspace,
            mut token,
        } = self;
        drop(reader);
        workspace.release();
        token.release();
    }
}
