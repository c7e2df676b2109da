use tracing::info;

use super::{AnalysisInput, FailurePolicy, ORCHESTRATION};
use crate::Runtime;

/// Build the orchestration input for an uploaded artifact.
pub fn build_input(blob_name: &str, bytes: &[u8], uploaded_at_ms: u64, policy: FailurePolicy) -> AnalysisInput {
    let size_kb = (bytes.len() as f64 / 1024.0 * 100.0).round() / 100.0;
    AnalysisInput {
        blob_name: blob_name.to_string(),
        blob_bytes: bytes.to_vec(),
        blob_size_kb: size_kb,
        uploaded_at_ms,
        policy,
    }
}

/// Upload hook: create an analysis instance and return its id once durably recorded.
pub async fn on_artifact_uploaded(
    rt: &Runtime,
    blob_name: &str,
    bytes: &[u8],
    uploaded_at_ms: u64,
) -> Result<String, String> {
    on_artifact_uploaded_with_policy(rt, blob_name, bytes, uploaded_at_ms, FailurePolicy::default()).await
}

pub async fn on_artifact_uploaded_with_policy(
    rt: &Runtime,
    blob_name: &str,
    bytes: &[u8],
    uploaded_at_ms: u64,
    policy: FailurePolicy,
) -> Result<String, String> {
    let input = build_input(blob_name, bytes, uploaded_at_ms, policy);
    info!(blob = blob_name, size_kb = input.blob_size_kb, "new artifact detected");
    let instance = rt.create_instance_typed(ORCHESTRATION, &input).await?;
    info!(blob = blob_name, instance = %instance, "analysis orchestration started");
    Ok(instance)
}
