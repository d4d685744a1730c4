//! Fetch engine stdout served as the response body.

use tracing::info;

use super::Pipeline;
use crate::delivery::PipelineOutput;
use crate::descriptor::ResourceDescriptor;
use crate::error::GatewayResult;
use crate::pipe::ProcessChain;
use crate::strategy::Plan;
use crate::toolchain::FETCH_ENGINE;

pub(super) fn run(
    pipeline: &Pipeline,
    descriptor: &ResourceDescriptor,
    plan: &Plan,
    filename: String,
) -> GatewayResult<PipelineOutput> {
    let mut command = pipeline.toolchain.fetch_command();
    command
        .arg("-f")
        .arg(&plan.fetch_selector)
        .arg("-o")
        .arg("-")
        .arg("--")
        .arg(&descriptor.source_url);

    let chain = ProcessChain::single(FETCH_ENGINE, command)?;
    info!(id = %descriptor.id, selector = %plan.fetch_selector, "streaming download started");
    Ok(PipelineOutput::Stream {
        chain,
        content_type: plan.content_type.clone(),
        content_length: plan.content_length,
        filename,
        exit_timeout: pipeline.exit_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::AdmissionGate;
    use crate::request::TransformRequest;
    use crate::strategy::select;
    use crate::test_support::install_script;
    use crate::toolchain::Toolchain;
    use crate::workspace::WorkspaceManager;
    use futures::StreamExt;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn streams_engine_stdout() {
        let dir = tempdir().unwrap();
        // Echoes the arguments it was given so the test can check them.
        let engine = install_script(dir.path(), "yt-dlp", r#"printf '%s ' "$@""#);
        let pipeline = Pipeline::new(
            Toolchain::new(engine, "ffmpeg"),
            WorkspaceManager::default(),
            Duration::from_secs(5),
        );
        let descriptor = crate::test_support::sample_single();
        let request = TransformRequest::default();
        let plan = select(&descriptor, &request).unwrap();

        let output = pipeline.execute(&descriptor, &plan, &request).await.unwrap();
        let gate = AdmissionGate::new(1);
        let token = gate.acquire(Duration::from_millis(10)).await.unwrap();
        let delivery = output.into_delivery(token).await.unwrap();
        assert_eq!(delivery.filename, "Sample_Clip.mp4");

        let chunks: Vec<_> = delivery.body.collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        let args = String::from_utf8(body).unwrap();
        assert!(args.contains("-f best -o - -- https://example.test/watch?v=abc"));
        assert_eq!(gate.in_flight(), 0);
    }
}
