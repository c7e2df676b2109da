use serde_json::{Value, json};

use super::{ANALYSES, AnalysisInput, FailurePolicy, GENERATE_REPORT, Report, ReportInput, STORE_RESULTS, StoredRecord};
use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};

/// Fan out the four analyses, fan in, then reduce and persist.
///
/// Failed analyses become `{"error": ...}` markers under `FailurePolicy::Degrade`
/// and fail the instance under `Strict`. Failures of the reduce and persist
/// steps always fail the instance.
pub async fn image_analyzer_orchestrator(ctx: OrchestrationContext, input: AnalysisInput) -> Result<StoredRecord, String> {
    ctx.trace_info(format!("analysis started for {}", input.blob_name));

    let fan_out = ANALYSES
        .iter()
        .map(|name| ctx.schedule_activity_typed(*name, &input))
        .collect();
    crate::durable_debug!(ctx, blob = %input.blob_name, analyses = ANALYSES.len(), "fan-out scheduled");
    let outcomes = ctx.join(fan_out).await;

    let mut results: Vec<Value> = Vec::with_capacity(ANALYSES.len());
    for (name, outcome) in ANALYSES.iter().zip(outcomes) {
        match outcome {
            Ok(raw) => results.push(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
            Err(e) if input.policy == FailurePolicy::Strict => return Err(format!("{name} failed: {e}")),
            Err(e) => {
                ctx.trace_warn(format!("{name} failed, continuing with error marker: {e}"));
                results.push(json!({ "error": e }));
            }
        }
    }
    let [colors, objects, text, metadata]: [Value; 4] = results
        .try_into()
        .map_err(|_| "fan-in returned an unexpected number of results".to_string())?;

    let report_input = ReportInput {
        blob_name: input.blob_name.clone(),
        uploaded_at_ms: input.uploaded_at_ms,
        colors,
        objects,
        text,
        metadata,
    };
    let report: Report = ctx
        .schedule_activity_typed(GENERATE_REPORT, &report_input)
        .into_activity_typed()
        .await
        .map_err(|e| format!("{GENERATE_REPORT} failed: {e}"))?;

    let stored: StoredRecord = ctx
        .schedule_activity_typed(STORE_RESULTS, &report)
        .into_activity_typed()
        .await
        .map_err(|e| format!("{STORE_RESULTS} failed: {e}"))?;

    ctx.trace_info(format!("analysis stored as {}", stored.id));
    Ok(stored)
}

/// String-boundary adapter used for registration.
pub async fn run(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let input: AnalysisInput = Json::decode(&input).map_err(|e| format!("invalid analysis input: {e}"))?;
    let out = image_analyzer_orchestrator(ctx, input).await?;
    Json::encode(&out)
}
