//! Image-analysis workflow built on the runtime: an upload fans out to four
//! analyses, the results are reduced into one report, and the report is
//! persisted to a partition/row keyed result table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};

pub mod activities;
pub mod orchestration;
pub mod results;
pub mod trigger;

pub use results::{InMemoryResultTable, ResultTable};

pub const ORCHESTRATION: &str = "image_analyzer_orchestrator";

pub const ANALYZE_COLORS: &str = "analyze_colors";
pub const ANALYZE_OBJECTS: &str = "analyze_objects";
pub const ANALYZE_TEXT: &str = "analyze_text";
pub const ANALYZE_METADATA: &str = "analyze_metadata";
pub const GENERATE_REPORT: &str = "generate_report";
pub const STORE_RESULTS: &str = "store_results";

/// Fan-out set in declaration order.
pub const ANALYSES: [&str; 4] = [ANALYZE_COLORS, ANALYZE_OBJECTS, ANALYZE_TEXT, ANALYZE_METADATA];

/// What happens when one of the four analyses fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Embed `{"error": ...}` in place of the failed result and continue.
    #[default]
    Degrade,
    /// Fail the instance on the first failed analysis.
    Strict,
}

/// Orchestration input produced by the upload trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisInput {
    pub blob_name: String,
    pub blob_bytes: Vec<u8>,
    pub blob_size_kb: f64,
    pub uploaded_at_ms: u64,
    #[serde(default)]
    pub policy: FailurePolicy,
}

/// Input of the reduce step: fan-in results in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportInput {
    pub blob_name: String,
    pub uploaded_at_ms: u64,
    pub colors: Value,
    pub objects: Value,
    pub text: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analyses {
    pub colors: Value,
    pub objects: Value,
    pub text: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub image_size: String,
    pub format: String,
    pub dominant_color: String,
    pub objects_detected: u64,
    pub has_text: bool,
    pub is_grayscale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub file_name: String,
    pub blob_path: String,
    pub analyzed_at: String,
    pub analyses: Analyses,
    pub summary: Summary,
}

/// Instance output: confirmation of the persisted report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: String,
    pub file_name: String,
    pub status: String,
    pub analyzed_at: String,
    pub summary: Summary,
}

/// Register the six workflow activities; `store_results` writes to `table`.
pub fn register_activities(builder: ActivityRegistryBuilder, table: Arc<dyn ResultTable>) -> ActivityRegistryBuilder {
    builder
        .register_typed(ANALYZE_COLORS, |input: AnalysisInput| async move {
            Ok(activities::analyze_colors(&input))
        })
        .register_typed(ANALYZE_OBJECTS, |input: AnalysisInput| async move {
            Ok(activities::analyze_objects(&input))
        })
        .register_typed(ANALYZE_TEXT, |input: AnalysisInput| async move {
            Ok(activities::analyze_text(&input))
        })
        .register_typed(ANALYZE_METADATA, |input: AnalysisInput| async move {
            Ok(activities::analyze_metadata(&input))
        })
        .register_typed(GENERATE_REPORT, |input: ReportInput| async move {
            activities::generate_report(&input)
        })
        .register_typed(STORE_RESULTS, move |report: Report| {
            let table = table.clone();
            async move { activities::store_results(table.as_ref(), &report).await }
        })
}

/// Register `image_analyzer_orchestrator` with the activities it schedules.
pub fn register_orchestration(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register_with_activities(
        ORCHESTRATION,
        &[
            ANALYZE_COLORS,
            ANALYZE_OBJECTS,
            ANALYZE_TEXT,
            ANALYZE_METADATA,
            GENERATE_REPORT,
            STORE_RESULTS,
        ],
        orchestration::run,
    )
}
